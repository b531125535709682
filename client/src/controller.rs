//! Live-round state machine.
//!
//! [`RoundController`] reconstructs the round, the user's bets, and the crash
//! history from server pushes. It performs no I/O: commands are queued on the
//! attached outbound channel and anything that must be awaited is returned to
//! the caller as a [`Followup`].

use crate::{config::BetLimits, notify::Notice, Error, NoticeKind, Notifier, Result};
use aviator_types::{
    api::CashoutView, Activity, Bet, BetStatus, CrashHistory, CrashHistoryEntry, Inbound,
    Outbound, Phase, RecentCashout, RecentCashouts, RoundState,
};
use serde::Serialize;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Transport status as seen by consumers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    /// Terminal until the session is restarted.
    Disconnected,
}

/// Work the driver must perform after a message has been applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Followup {
    None,
    RefreshBalance,
}

/// Immutable view of the controller published to consumers.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub state: RoundState,
    pub bets: Vec<Bet>,
    /// Crash points, most recent first.
    pub history: Vec<f64>,
    pub cashouts: Vec<RecentCashout>,
    pub status: ConnectionStatus,
}

impl Snapshot {
    pub fn bet(&self, id: u64) -> Option<&Bet> {
        self.bets.iter().find(|bet| bet.id == id)
    }

    pub fn active_bets(&self) -> impl Iterator<Item = &Bet> {
        self.bets.iter().filter(|bet| bet.is_active())
    }
}

pub struct RoundController {
    state: RoundState,
    bets: Vec<Bet>,
    history: CrashHistory,
    cashouts: RecentCashouts,
    status: ConnectionStatus,
    limits: BetLimits,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    notifier: Arc<dyn Notifier>,
    activity: broadcast::Sender<Activity>,
    /// Set by the first crash observed live; REST and `past_crashes` seeds are
    /// ignored afterwards.
    live_crash_seen: bool,
    /// Slots with a `place_bet` in flight this round, in submission order.
    /// The server answers bets in order, so a `bet_error` belongs to the front.
    pending_slots: VecDeque<u8>,
}

impl RoundController {
    pub fn new(
        limits: BetLimits,
        notifier: Arc<dyn Notifier>,
        activity: broadcast::Sender<Activity>,
    ) -> Self {
        Self {
            state: RoundState::default(),
            bets: Vec::new(),
            history: CrashHistory::default(),
            cashouts: RecentCashouts::default(),
            status: ConnectionStatus::Connecting,
            limits,
            outbound: None,
            notifier,
            activity,
            live_crash_seen: false,
            pending_slots: VecDeque::new(),
        }
    }

    /// Mark the transport open; commands are queued on `outbound`.
    pub fn attach(&mut self, outbound: mpsc::UnboundedSender<Outbound>) {
        self.outbound = Some(outbound);
        self.status = ConnectionStatus::Connected;
    }

    /// Mark the transport closed. Unacknowledged bets are forgotten.
    pub fn detach(&mut self) {
        self.outbound = None;
        self.pending_slots.clear();
    }

    pub fn is_open(&self) -> bool {
        self.outbound
            .as_ref()
            .is_some_and(|outbound| !outbound.is_closed())
    }

    pub fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
    }

    /// Reconnecting was abandoned.
    pub fn lost_connection(&mut self) {
        self.detach();
        self.status = ConnectionStatus::Disconnected;
        self.notifier.notify(Notice::new(
            NoticeKind::Warning,
            "Disconnected",
            "Lost connection to game server",
        ));
    }

    fn send(&self, command: Outbound) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(Error::NotConnected)?;
        outbound.send(command).map_err(|_| Error::NotConnected)
    }

    /// Ask the server for a full resync.
    pub fn request_state(&self) -> Result<()> {
        self.send(Outbound::GetGameState)
    }

    pub fn send_ping(&self) -> Result<()> {
        self.send(Outbound::Ping)
    }

    /// Queue a `place_bet` command. Nothing is added to local state until the
    /// server acknowledges with `bet_placed`.
    pub fn place_bet(
        &mut self,
        amount: f64,
        auto_cashout: Option<f64>,
        bet_number: u8,
    ) -> Result<()> {
        let result = self.try_place_bet(amount, auto_cashout, bet_number);
        if let Err(err) = &result {
            self.reject(err);
        }
        result
    }

    fn try_place_bet(
        &mut self,
        amount: f64,
        auto_cashout: Option<f64>,
        bet_number: u8,
    ) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }
        let round_id = self.state.round_id.ok_or(Error::NoActiveRound)?;
        if self.state.phase != Phase::Betting {
            return Err(Error::BettingClosed);
        }
        self.limits.check(amount, auto_cashout)?;
        if self.pending_slots.contains(&bet_number)
            || self.bets.iter().any(|bet| bet.bet_number == bet_number)
        {
            return Err(Error::DuplicateBet(bet_number));
        }

        self.send(Outbound::PlaceBet {
            round_id,
            amount,
            auto_cashout,
            bet_number,
        })?;
        self.pending_slots.push_back(bet_number);
        debug!(round_id, amount, bet_number, "bet submitted");
        Ok(())
    }

    /// Queue a `cashout` command for an active bet, carrying the multiplier
    /// observed now.
    pub fn cash_out(&mut self, bet_id: u64) -> Result<()> {
        let result = self.try_cash_out(bet_id);
        if let Err(err) = &result {
            self.reject(err);
        }
        result
    }

    fn try_cash_out(&mut self, bet_id: u64) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }
        let active = self
            .bets
            .iter()
            .any(|bet| bet.id == bet_id && bet.is_active());
        if !active {
            return Err(Error::BetNotActive(bet_id));
        }
        if self.state.phase != Phase::Flying {
            return Err(Error::NotFlying);
        }
        let multiplier = self.state.multiplier;
        self.send(Outbound::Cashout { bet_id, multiplier })?;
        debug!(bet_id, multiplier, "cashout submitted");
        Ok(())
    }

    fn reject(&self, err: &Error) {
        warn!(?err, "command rejected");
        let notice = match err {
            Error::NotConnected => Notice::new(
                NoticeKind::Error,
                "Connection Error",
                "Not connected to game server",
            ),
            Error::NoActiveRound => Notice::new(
                NoticeKind::Error,
                "No Active Round",
                "Wait for the next round to start",
            ),
            Error::BettingClosed => Notice::new(
                NoticeKind::Error,
                "Betting Phase Closed",
                "Bets can only be placed before the plane takes off",
            ),
            Error::InvalidBet(reason) => {
                Notice::new(NoticeKind::Error, "Invalid Bet", reason.clone())
            }
            Error::DuplicateBet(slot) => Notice::new(
                NoticeKind::Info,
                "Bet Already Placed",
                format!("Bet {slot} is already placed for this round"),
            ),
            Error::BetNotActive(_) => Notice::new(
                NoticeKind::Info,
                "No Active Bet",
                "There is no active bet to cash out",
            ),
            Error::NotFlying => Notice::new(
                NoticeKind::Info,
                "Cannot Cash Out",
                "Cash out is only possible while the plane is flying",
            ),
            other => Notice::new(NoticeKind::Error, "Error", other.to_string()),
        };
        self.notifier.notify(notice);
    }

    /// Apply one server message.
    pub fn handle(&mut self, message: Inbound) -> Followup {
        match message {
            Inbound::BettingOpen {
                round_id,
                countdown,
            } => {
                self.state = RoundState {
                    round_id: Some(round_id),
                    phase: Phase::Betting,
                    multiplier: 1.0,
                    countdown,
                    live_players: self.state.live_players,
                };
                self.bets.clear();
                self.pending_slots.clear();
                info!(round_id, countdown, "betting open");
            }
            Inbound::RoundStarted {
                round_id,
                multiplier,
            } => {
                if let Err(err) = self.advance(Phase::Flying) {
                    warn!(%err, "ignoring round_started");
                    return Followup::None;
                }
                if self.state.round_id.is_none() {
                    self.state.round_id = round_id;
                }
                self.state.multiplier = multiplier
                    .filter(|m| m.is_finite())
                    .unwrap_or(1.0)
                    .max(1.0);
                self.state.countdown = 0;
                info!(round_id = ?self.state.round_id, "round started");
            }
            Inbound::Multiplier {
                multiplier,
                live_players,
            } => {
                if self.state.phase != Phase::Flying {
                    debug!(
                        multiplier,
                        phase = self.state.phase.as_str(),
                        "ignoring multiplier outside flight"
                    );
                    return Followup::None;
                }
                if let Some(live_players) = live_players {
                    self.state.live_players = live_players;
                }
                if !multiplier.is_finite() || multiplier < self.state.multiplier {
                    warn!(
                        multiplier,
                        current = self.state.multiplier,
                        "ignoring regressing multiplier"
                    );
                    return Followup::None;
                }
                self.state.multiplier = multiplier;
            }
            Inbound::Crash { crash_multiplier } => {
                if !crash_multiplier.is_finite() || crash_multiplier < 1.0 {
                    let err = Error::Protocol(format!("crash at {crash_multiplier}"));
                    warn!(%err, "ignoring crash");
                    return Followup::None;
                }
                if let Err(err) = self.advance(Phase::Crashed) {
                    warn!(%err, "ignoring crash");
                    return Followup::None;
                }
                self.state.multiplier = crash_multiplier;
                self.history.push(CrashHistoryEntry {
                    multiplier: crash_multiplier,
                });
                self.live_crash_seen = true;
                self.pending_slots.clear();
                let mut lost = 0;
                for bet in self.bets.iter_mut().filter(|bet| bet.is_active()) {
                    bet.status = BetStatus::Lost;
                    lost += 1;
                }
                info!(round_id = ?self.state.round_id, crash_multiplier, lost, "round crashed");
                self.notifier.notify(Notice::new(
                    NoticeKind::Info,
                    "Round Ended",
                    format!("Plane crashed at {crash_multiplier:.2}x"),
                ));
            }
            Inbound::BetPlaced {
                bet_id,
                amount,
                auto_cashout,
                bet_number,
            } => {
                self.release_slot(bet_number);
                if self.bets.iter().any(|bet| bet.id == bet_id) {
                    debug!(bet_id, "duplicate bet acknowledgement");
                    return Followup::None;
                }
                if !self.record_bet(Bet::acknowledged(bet_id, amount, auto_cashout, bet_number)) {
                    return Followup::RefreshBalance;
                }
                info!(bet_id, amount, bet_number, "bet placed");
                self.notifier.notify(Notice::new(
                    NoticeKind::Success,
                    "Bet Placed",
                    format!("Bet of KES {amount} placed successfully"),
                ));
                return Followup::RefreshBalance;
            }
            Inbound::ManualCashoutSuccess {
                bet_id,
                multiplier,
                win_amount,
            } => {
                match self.bets.iter_mut().find(|bet| bet.id == bet_id) {
                    Some(bet) if bet.is_active() => {
                        bet.cash_out(multiplier, win_amount);
                        info!(bet_id, multiplier, win_amount, "cashed out");
                        self.notifier.notify(Notice::new(
                            NoticeKind::Success,
                            "Cashout Successful",
                            format!("Won KES {win_amount:.2} at {multiplier:.2}x"),
                        ));
                    }
                    Some(bet) => {
                        warn!(bet_id, status = ?bet.status, "cashout for settled bet");
                    }
                    None => warn!(bet_id, "cashout for unknown bet"),
                }
                return Followup::RefreshBalance;
            }
            Inbound::BetError { message } => {
                if let Some(slot) = self.pending_slots.pop_front() {
                    debug!(slot, "bet slot released");
                }
                self.server_error("bet_error", message);
            }
            Inbound::ManualCashoutError { message } => {
                self.server_error("manual_cashout_error", message);
            }
            Inbound::GameState {
                round_id,
                multiplier,
                is_active,
                live_players,
            } => {
                if round_id != self.state.round_id {
                    self.bets.clear();
                    self.pending_slots.clear();
                }
                let phase = if is_active { Phase::Flying } else { Phase::Betting };
                self.state = RoundState {
                    round_id,
                    phase,
                    multiplier: if is_active {
                        multiplier.filter(|m| m.is_finite()).unwrap_or(1.0).max(1.0)
                    } else {
                        1.0
                    },
                    countdown: if is_active { 0 } else { self.state.countdown },
                    live_players: live_players.unwrap_or(self.state.live_players),
                };
                info!(round_id = ?round_id, phase = phase.as_str(), "state resynced");
            }
            Inbound::Pong { server_time } => debug!(?server_time, "pong"),
            Inbound::PastCrashes { crashes } => {
                self.seed_history(crashes);
            }
            Inbound::YourBet {
                bet_id,
                amount,
                auto_cashout,
                bet_number,
            } => {
                self.release_slot(bet_number);
                if !self.bets.iter().any(|bet| bet.id == bet_id)
                    && self.record_bet(Bet::acknowledged(bet_id, amount, auto_cashout, bet_number))
                {
                    debug!(bet_id, "restored bet");
                }
            }
            Inbound::CashOut {
                username,
                multiplier,
                amount,
                win_amount,
            } => self.record_cashout(username, multiplier, amount, win_amount, false, None),
            Inbound::PlayerCashedOut { recent_cashouts } => {
                self.cashouts
                    .seed(recent_cashouts.into_iter().map(|view: CashoutView| RecentCashout {
                        username: view.username,
                        multiplier: view.multiplier,
                        amount: view.amount,
                        win_amount: view.win_amount,
                        is_bot: false,
                    }));
            }
            Inbound::BotBet {
                username,
                amount,
                auto_cashout,
                timestamp,
            } => self.publish(Activity::Bet {
                username,
                amount,
                auto_cashout,
                is_bot: true,
                timestamp,
            }),
            Inbound::BotCashout {
                username,
                multiplier,
                amount,
                win_amount,
                timestamp,
            } => self.record_cashout(username, multiplier, amount, win_amount, true, timestamp),
            Inbound::RoundSummary {} => debug!("round summary"),
            Inbound::Unknown => debug!("ignoring unknown message type"),
        }
        Followup::None
    }

    fn release_slot(&mut self, bet_number: u8) {
        if let Some(index) = self.pending_slots.iter().position(|slot| *slot == bet_number) {
            self.pending_slots.remove(index);
        }
    }

    /// Store an acknowledged bet. Once the round has crashed it can no longer
    /// win, so it is stored as lost; returns whether it is live.
    fn record_bet(&mut self, mut bet: Bet) -> bool {
        let live = self.state.phase != Phase::Crashed;
        if !live {
            warn!(bet_id = bet.id, "bet acknowledged after crash");
            bet.status = BetStatus::Lost;
        }
        self.bets.push(bet);
        live
    }

    fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.state.phase.can_advance_to(next) {
            return Err(Error::Protocol(format!(
                "{} -> {}",
                self.state.phase.as_str(),
                next.as_str()
            )));
        }
        self.state.phase = next;
        Ok(())
    }

    fn server_error(&self, kind: &str, message: Option<String>) {
        let message = message
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| "An error occurred".to_string());
        warn!(kind, err = %Error::Rejected(message.clone()), "server rejected command");
        self.notifier
            .notify(Notice::new(NoticeKind::Error, "Error", message));
    }

    fn record_cashout(
        &mut self,
        username: String,
        multiplier: f64,
        amount: Option<f64>,
        win_amount: f64,
        is_bot: bool,
        timestamp: Option<u64>,
    ) {
        self.cashouts.push(RecentCashout {
            username: username.clone(),
            multiplier,
            amount,
            win_amount,
            is_bot,
        });
        self.publish(Activity::Cashout {
            username,
            multiplier,
            amount,
            win_amount,
            is_bot,
            timestamp,
        });
    }

    fn publish(&self, activity: Activity) {
        // No subscribers is fine
        let _ = self.activity.send(activity);
    }

    /// Decrement the betting countdown; returns whether it changed.
    pub fn tick(&mut self) -> bool {
        if self.state.phase == Phase::Betting && self.state.countdown > 0 {
            self.state.countdown -= 1;
            return true;
        }
        false
    }

    /// Install crash points (most recent first) unless a crash has already been
    /// observed live. Returns whether the history was replaced.
    pub fn seed_history(&mut self, crashes: impl IntoIterator<Item = f64>) -> bool {
        if self.live_crash_seen {
            debug!("live history present, skipping seed");
            return false;
        }
        self.history.seed(
            crashes
                .into_iter()
                .filter(|multiplier| multiplier.is_finite())
                .map(|multiplier| CrashHistoryEntry { multiplier }),
        );
        true
    }

    pub fn state(&self) -> &RoundState {
        &self.state
    }

    pub fn bets(&self) -> &[Bet] {
        &self.bets
    }

    pub fn history(&self) -> &CrashHistory {
        &self.history
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state.clone(),
            bets: self.bets.clone(),
            history: self.history.iter().map(|entry| entry.multiplier).collect(),
            cashouts: self.cashouts.iter().cloned().collect(),
            status: self.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aviator_types::HISTORY_CAPACITY;
    use proptest::prelude::*;
    use serde_json::json;

    struct Harness {
        controller: RoundController,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        notices: mpsc::UnboundedReceiver<Notice>,
        activity: broadcast::Receiver<Activity>,
        sender: mpsc::UnboundedSender<Outbound>,
    }

    impl Harness {
        fn new() -> Self {
            let (notice_tx, notices) = mpsc::unbounded_channel();
            let (activity_tx, activity) = broadcast::channel(16);
            let (sender, outbound) = mpsc::unbounded_channel();
            let controller =
                RoundController::new(BetLimits::default(), Arc::new(notice_tx), activity_tx);
            Self {
                controller,
                outbound,
                notices,
                activity,
                sender,
            }
        }

        fn connected() -> Self {
            let mut harness = Self::new();
            harness.controller.attach(harness.sender.clone());
            harness
        }

        fn sent(&mut self) -> Vec<Outbound> {
            std::iter::from_fn(|| self.outbound.try_recv().ok()).collect()
        }

        fn notices(&mut self) -> Vec<Notice> {
            std::iter::from_fn(|| self.notices.try_recv().ok()).collect()
        }
    }

    fn betting_open(round_id: u64) -> Inbound {
        Inbound::BettingOpen {
            round_id,
            countdown: 5,
        }
    }

    fn started() -> Inbound {
        Inbound::RoundStarted {
            round_id: None,
            multiplier: Some(1.0),
        }
    }

    fn tick(multiplier: f64) -> Inbound {
        Inbound::Multiplier {
            multiplier,
            live_players: None,
        }
    }

    fn crash(crash_multiplier: f64) -> Inbound {
        Inbound::Crash { crash_multiplier }
    }

    fn placed(bet_id: u64, amount: f64, bet_number: u8) -> Inbound {
        Inbound::BetPlaced {
            bet_id,
            amount,
            auto_cashout: None,
            bet_number,
        }
    }

    #[test]
    fn test_round_lifecycle() {
        let mut h = Harness::connected();
        let c = &mut h.controller;

        c.handle(betting_open(7));
        assert_eq!(c.state().phase, Phase::Betting);
        assert_eq!(c.state().round_id, Some(7));
        assert_eq!(c.state().multiplier, 1.0);
        assert_eq!(c.state().countdown, 5);

        c.handle(started());
        assert_eq!(c.state().phase, Phase::Flying);
        assert_eq!(c.state().countdown, 0);

        c.handle(Inbound::Multiplier {
            multiplier: 2.35,
            live_players: Some(12),
        });
        assert_eq!(c.state().multiplier, 2.35);
        assert_eq!(c.state().live_players, 12);

        c.handle(crash(2.35));
        assert_eq!(c.state().phase, Phase::Crashed);
        assert_eq!(c.state().multiplier, 2.35);
        assert_eq!(c.history().latest().unwrap().multiplier, 2.35);

        let notices = h.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].title, "Round Ended");
        assert_eq!(notices[0].message, "Plane crashed at 2.35x");
    }

    #[test]
    fn test_place_bet_waits_for_ack() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));

        h.controller.place_bet(100.0, None, 1).unwrap();
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            serde_json::to_value(&sent[0]).unwrap(),
            json!({"action": "place_bet", "round_id": 7, "amount": 100.0, "bet_number": 1})
        );
        assert!(h.controller.bets().is_empty());

        let followup = h.controller.handle(placed(55, 100.0, 1));
        assert_eq!(followup, Followup::RefreshBalance);
        let bets = h.controller.bets();
        assert_eq!(bets.len(), 1);
        assert_eq!(bets[0].id, 55);
        assert_eq!(bets[0].amount, 100.0);
        assert_eq!(bets[0].status, BetStatus::Active);

        let notices = h.notices();
        assert_eq!(notices[0].title, "Bet Placed");
        assert_eq!(notices[0].message, "Bet of KES 100 placed successfully");
    }

    #[test]
    fn test_place_bet_without_transport() {
        let mut h = Harness::new();
        h.controller.handle(betting_open(7));

        let err = h.controller.place_bet(100.0, None, 1).unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(h.sent().is_empty());
        let notices = h.notices();
        assert_eq!(notices[0].kind, NoticeKind::Error);
        assert_eq!(notices[0].title, "Connection Error");

        // A closed queue counts as no transport
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));
        let Harness {
            mut controller,
            outbound,
            ..
        } = h;
        drop(outbound);
        assert!(matches!(
            controller.place_bet(100.0, None, 1),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_place_bet_before_betting_open() {
        let mut h = Harness::connected();
        let err = h.controller.place_bet(100.0, None, 1).unwrap_err();
        assert!(matches!(err, Error::NoActiveRound));
        assert!(h.sent().is_empty());
        assert_eq!(h.notices()[0].title, "No Active Round");
    }

    #[test]
    fn test_place_bet_validation() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));

        assert!(matches!(
            h.controller.place_bet(5.0, None, 1),
            Err(Error::InvalidBet(_))
        ));
        assert!(matches!(
            h.controller.place_bet(100.0, Some(1.0), 1),
            Err(Error::InvalidBet(_))
        ));
        assert!(h.sent().is_empty());

        h.controller.place_bet(100.0, Some(2.0), 1).unwrap();
        assert!(matches!(
            h.controller.place_bet(50.0, None, 1),
            Err(Error::DuplicateBet(1))
        ));
        h.controller.place_bet(50.0, None, 2).unwrap();
        assert_eq!(h.sent().len(), 2);

        h.controller.handle(started());
        assert!(matches!(
            h.controller.place_bet(100.0, None, 3),
            Err(Error::BettingClosed)
        ));
        assert!(h.sent().is_empty());

        let titles: Vec<String> = h.notices().into_iter().map(|n| n.title).collect();
        assert_eq!(
            titles,
            vec![
                "Invalid Bet",
                "Invalid Bet",
                "Bet Already Placed",
                "Betting Phase Closed"
            ]
        );
    }

    #[test]
    fn test_bet_error_frees_slot() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));
        h.controller.place_bet(100.0, None, 1).unwrap();
        h.controller.handle(Inbound::BetError {
            message: Some("Insufficient balance".to_string()),
        });
        assert!(h.controller.bets().is_empty());
        let notices = h.notices();
        assert_eq!(notices[0].kind, NoticeKind::Error);
        assert_eq!(notices[0].message, "Insufficient balance");

        h.controller.place_bet(100.0, None, 1).unwrap();
        assert_eq!(h.sent().len(), 2);
    }

    #[test]
    fn test_bet_error_releases_oldest_slot() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));
        h.controller.place_bet(100.0, None, 1).unwrap();
        h.controller.place_bet(50.0, None, 2).unwrap();
        h.sent();

        h.controller.handle(Inbound::BetError {
            message: Some("Insufficient balance".to_string()),
        });
        assert!(matches!(
            h.controller.place_bet(50.0, None, 2),
            Err(Error::DuplicateBet(2))
        ));
        h.controller.place_bet(100.0, None, 1).unwrap();
        assert_eq!(h.sent().len(), 1);

        // Acks still release their own slot regardless of order
        h.controller.handle(placed(56, 50.0, 2));
        h.controller.handle(Inbound::BetError { message: None });
        h.controller.place_bet(100.0, None, 1).unwrap();
    }

    #[test]
    fn test_unacknowledged_bet_dropped_on_detach() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));
        h.controller.place_bet(100.0, None, 1).unwrap();
        h.controller.detach();
        assert!(h.controller.bets().is_empty());

        h.controller.attach(h.sender.clone());
        h.controller.place_bet(100.0, None, 1).unwrap();
    }

    #[test]
    fn test_cash_out_server_multiplier_wins() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));
        h.controller.handle(placed(55, 100.0, 1));
        h.controller.handle(started());
        h.controller.handle(tick(3.10));
        h.sent();

        h.controller.cash_out(55).unwrap();
        assert_eq!(
            serde_json::to_value(&h.sent()[0]).unwrap(),
            json!({"action": "cashout", "bet_id": 55, "multiplier": 3.10})
        );
        assert_eq!(h.controller.bets()[0].status, BetStatus::Active);

        let followup = h.controller.handle(Inbound::ManualCashoutSuccess {
            bet_id: 55,
            multiplier: 3.12,
            win_amount: 312.0,
        });
        assert_eq!(followup, Followup::RefreshBalance);
        let bet = &h.controller.bets()[0];
        assert_eq!(bet.status, BetStatus::CashedOut);
        assert_eq!(bet.result_multiplier, Some(3.12));
        assert_eq!(bet.win_amount, Some(312.0));
        assert_eq!(h.notices().last().unwrap().message, "Won KES 312.00 at 3.12x");

        // Settled bets survive the crash untouched
        h.controller.handle(crash(4.0));
        assert_eq!(h.controller.bets()[0].status, BetStatus::CashedOut);
    }

    #[test]
    fn test_cash_out_inactive_bet_is_noop() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));
        h.controller.handle(placed(55, 100.0, 1));
        h.controller.handle(started());
        h.controller.handle(crash(1.5));
        h.sent();
        h.notices();

        assert!(matches!(
            h.controller.cash_out(55),
            Err(Error::BetNotActive(55))
        ));
        assert!(matches!(
            h.controller.cash_out(99),
            Err(Error::BetNotActive(99))
        ));
        assert!(h.sent().is_empty());
        let notices = h.notices();
        assert_eq!(notices[0].kind, NoticeKind::Info);
        assert_eq!(notices[0].title, "No Active Bet");

        // An acknowledged bet cannot be cashed out before take-off
        h.controller.handle(betting_open(8));
        h.controller.handle(placed(60, 100.0, 1));
        h.sent();
        h.notices();
        assert!(matches!(h.controller.cash_out(60), Err(Error::NotFlying)));
        assert!(h.sent().is_empty());
        let notices = h.notices();
        assert_eq!(notices[0].title, "Cannot Cash Out");
        assert_eq!(h.controller.bets()[0].status, BetStatus::Active);
    }

    #[test]
    fn test_cashout_error_keeps_bet_active() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));
        h.controller.handle(placed(55, 100.0, 1));
        h.controller.handle(started());
        h.controller.cash_out(55).unwrap();
        h.notices();

        h.controller
            .handle(Inbound::ManualCashoutError { message: None });
        assert_eq!(h.controller.bets()[0].status, BetStatus::Active);
        let notices = h.notices();
        assert_eq!(notices[0].title, "Error");
        assert_eq!(notices[0].message, "An error occurred");

        h.controller.handle(crash(1.2));
        assert_eq!(h.controller.bets()[0].status, BetStatus::Lost);
    }

    #[test]
    fn test_crash_loses_active_bets() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));
        h.controller.handle(placed(55, 100.0, 1));
        h.controller.handle(placed(56, 20.0, 2));
        h.controller.handle(started());
        h.controller.handle(crash(1.01));
        assert!(h
            .controller
            .bets()
            .iter()
            .all(|bet| bet.status == BetStatus::Lost));

        // A late success for a lost bet does not resurrect it
        h.controller.handle(Inbound::ManualCashoutSuccess {
            bet_id: 55,
            multiplier: 1.0,
            win_amount: 100.0,
        });
        assert_eq!(h.controller.bets()[0].status, BetStatus::Lost);

        h.controller.handle(betting_open(8));
        assert!(h.controller.bets().is_empty());
    }

    #[test]
    fn test_ack_after_crash_is_lost() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));
        h.controller.place_bet(100.0, None, 1).unwrap();
        h.controller.handle(started());
        h.controller.handle(crash(1.3));
        h.notices();

        let followup = h.controller.handle(placed(55, 100.0, 1));
        assert_eq!(followup, Followup::RefreshBalance);
        h.controller.handle(Inbound::YourBet {
            bet_id: 56,
            amount: 20.0,
            auto_cashout: Some(2.0),
            bet_number: 2,
        });
        let bets = h.controller.bets();
        assert_eq!(bets.len(), 2);
        assert!(bets.iter().all(|bet| bet.status == BetStatus::Lost));
        assert_eq!(h.controller.snapshot().active_bets().count(), 0);
        assert!(h.notices().is_empty());
        assert!(matches!(
            h.controller.cash_out(55),
            Err(Error::BetNotActive(55))
        ));
    }

    #[test]
    fn test_invalid_crash_multiplier_ignored() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));
        h.controller.handle(placed(55, 100.0, 1));
        h.controller.handle(started());
        h.controller.handle(tick(2.0));

        for value in [0.0, 0.5, -1.0, f64::NAN, f64::INFINITY] {
            h.controller.handle(crash(value));
        }
        assert_eq!(h.controller.state().phase, Phase::Flying);
        assert_eq!(h.controller.state().multiplier, 2.0);
        assert!(h.controller.history().is_empty());
        assert_eq!(h.controller.bets()[0].status, BetStatus::Active);

        h.controller.handle(crash(2.4));
        assert_eq!(h.controller.state().phase, Phase::Crashed);
        assert_eq!(h.controller.state().multiplier, 2.4);
    }

    #[test]
    fn test_out_of_order_messages_ignored() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));

        // Crash before flight
        h.controller.handle(crash(3.0));
        assert_eq!(h.controller.state().phase, Phase::Betting);
        assert!(h.controller.history().is_empty());

        // Multiplier before flight
        h.controller.handle(tick(2.0));
        assert_eq!(h.controller.state().multiplier, 1.0);

        h.controller.handle(started());
        h.controller.handle(tick(2.0));
        h.controller.handle(tick(1.5));
        assert_eq!(h.controller.state().multiplier, 2.0);

        // Second start while flying
        h.controller.handle(started());
        assert_eq!(h.controller.state().multiplier, 2.0);

        h.controller.handle(crash(2.1));
        h.controller.handle(crash(2.1));
        h.controller.handle(started());
        assert_eq!(h.controller.state().phase, Phase::Crashed);
        assert_eq!(h.controller.history().len(), 1);

        h.controller.handle(Inbound::Unknown);
        h.controller.handle(Inbound::RoundSummary {});
        assert_eq!(h.controller.state().phase, Phase::Crashed);
    }

    #[test]
    fn test_game_state_resync() {
        let mut h = Harness::connected();
        h.controller.handle(betting_open(7));
        h.controller.handle(placed(55, 100.0, 1));

        h.controller.handle(Inbound::GameState {
            round_id: Some(7),
            multiplier: Some(1.8),
            is_active: true,
            live_players: Some(40),
        });
        let state = h.controller.state();
        assert_eq!(state.phase, Phase::Flying);
        assert_eq!(state.multiplier, 1.8);
        assert_eq!(state.live_players, 40);
        assert_eq!(h.controller.bets().len(), 1);

        h.controller.handle(Inbound::GameState {
            round_id: Some(9),
            multiplier: None,
            is_active: false,
            live_players: None,
        });
        let state = h.controller.state();
        assert_eq!(state.round_id, Some(9));
        assert_eq!(state.phase, Phase::Betting);
        assert_eq!(state.multiplier, 1.0);
        assert_eq!(state.live_players, 40);
        assert!(h.controller.bets().is_empty());

        h.controller.handle(Inbound::YourBet {
            bet_id: 70,
            amount: 25.0,
            auto_cashout: Some(2.0),
            bet_number: 1,
        });
        assert_eq!(h.controller.bets()[0].id, 70);
        assert!(matches!(
            h.controller.place_bet(25.0, None, 1),
            Err(Error::DuplicateBet(1))
        ));
    }

    #[test]
    fn test_history_seeding() {
        let mut h = Harness::connected();
        assert!(h.controller.seed_history((0..30).map(|i| 2.0 + i as f64)));
        assert_eq!(h.controller.history().len(), HISTORY_CAPACITY);
        assert_eq!(h.controller.history().latest().unwrap().multiplier, 2.0);

        h.controller.handle(Inbound::PastCrashes {
            crashes: vec![5.0, 1.2],
        });
        assert_eq!(h.controller.snapshot().history, vec![5.0, 1.2]);

        h.controller.handle(betting_open(1));
        h.controller.handle(started());
        h.controller.handle(crash(3.3));
        assert!(!h.controller.seed_history(vec![9.9]));
        assert_eq!(h.controller.snapshot().history, vec![3.3, 5.0, 1.2]);
    }

    #[test]
    fn test_countdown_tick() {
        let mut h = Harness::connected();
        h.controller.handle(Inbound::BettingOpen {
            round_id: 1,
            countdown: 2,
        });
        assert!(h.controller.tick());
        assert!(h.controller.tick());
        assert!(!h.controller.tick());
        assert_eq!(h.controller.state().countdown, 0);

        h.controller.handle(betting_open(2));
        h.controller.handle(started());
        assert!(!h.controller.tick());
    }

    #[test]
    fn test_activity_feed() {
        let mut h = Harness::connected();
        h.controller.handle(Inbound::BotBet {
            username: "bot_7".to_string(),
            amount: 40.0,
            auto_cashout: Some(1.5),
            timestamp: Some(1),
        });
        h.controller.handle(Inbound::CashOut {
            username: "jane".to_string(),
            multiplier: 2.0,
            amount: Some(50.0),
            win_amount: 100.0,
        });
        h.controller.handle(Inbound::BotCashout {
            username: "bot_7".to_string(),
            multiplier: 1.5,
            amount: Some(40.0),
            win_amount: 60.0,
            timestamp: Some(2),
        });

        assert!(matches!(
            h.activity.try_recv().unwrap(),
            Activity::Bet { is_bot: true, .. }
        ));
        assert!(matches!(
            h.activity.try_recv().unwrap(),
            Activity::Cashout { is_bot: false, .. }
        ));
        assert!(matches!(
            h.activity.try_recv().unwrap(),
            Activity::Cashout { is_bot: true, .. }
        ));

        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.cashouts.len(), 2);
        assert_eq!(snapshot.cashouts[0].username, "bot_7");

        h.controller.handle(Inbound::PlayerCashedOut {
            recent_cashouts: vec![CashoutView {
                username: "sam".to_string(),
                multiplier: 3.0,
                amount: None,
                win_amount: 30.0,
            }],
        });
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.cashouts.len(), 1);
        assert_eq!(snapshot.cashouts[0].username, "sam");
    }

    #[test]
    fn test_lost_connection() {
        let mut h = Harness::connected();
        assert_eq!(h.controller.status(), ConnectionStatus::Connected);
        h.controller.lost_connection();
        assert_eq!(h.controller.status(), ConnectionStatus::Disconnected);
        assert!(!h.controller.is_open());
        assert_eq!(h.notices()[0].kind, NoticeKind::Warning);
        assert!(matches!(
            h.controller.request_state(),
            Err(Error::NotConnected)
        ));
    }

    fn arb_message() -> impl Strategy<Value = Inbound> {
        prop_oneof![
            (1u64..4, 0u32..6).prop_map(|(round_id, countdown)| Inbound::BettingOpen {
                round_id,
                countdown
            }),
            Just(started()),
            (1.0f64..20.0).prop_map(tick),
            (-5.0f64..20.0).prop_map(crash),
            (1u64..6, 10.0f64..100.0, 1u8..3)
                .prop_map(|(bet_id, amount, slot)| placed(bet_id, amount, slot)),
            Just(Inbound::Unknown),
        ]
    }

    proptest! {
        /// Phases only follow the round cycle, flight multipliers never
        /// decrease, and crashes settle every active bet.
        #[test]
        fn prop_round_invariants(messages in prop::collection::vec(arb_message(), 1..120)) {
            let mut h = Harness::connected();
            for message in messages {
                let before = h.controller.state().clone();
                let crashed_now = before.phase == Phase::Flying
                    && matches!(
                        message,
                        Inbound::Crash { crash_multiplier } if crash_multiplier >= 1.0
                    );
                h.controller.handle(message);
                let after = h.controller.state();

                prop_assert!(
                    before.phase == after.phase || before.phase.can_advance_to(after.phase)
                );
                prop_assert!(after.multiplier >= 1.0);
                if before.phase == Phase::Flying && after.phase == Phase::Flying {
                    prop_assert!(after.multiplier >= before.multiplier);
                }
                if crashed_now {
                    prop_assert_eq!(after.phase, Phase::Crashed);
                }
                if after.phase == Phase::Crashed {
                    prop_assert!(h.controller.bets().iter().all(|bet| !bet.is_active()));
                }
                prop_assert!(h.controller.history().len() <= HISTORY_CAPACITY);
            }
            let history = h.controller.snapshot().history;
            prop_assert!(history.len() <= HISTORY_CAPACITY);
        }
    }
}
