//! Round model reconstructed from server pushes.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of crash points kept in [`CrashHistory`].
pub const HISTORY_CAPACITY: usize = 20;

/// Maximum number of cash-outs kept in [`RecentCashouts`].
pub const CASHOUT_FEED_CAPACITY: usize = 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Betting,
    Flying,
    Crashed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Betting => "betting",
            Phase::Flying => "flying",
            Phase::Crashed => "crashed",
        }
    }

    /// Whether `next` directly follows `self` in a round.
    ///
    /// `Betting` opens a new round and is reachable from every phase.
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (_, Phase::Betting) | (Phase::Betting, Phase::Flying) | (Phase::Flying, Phase::Crashed)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoundState {
    pub round_id: Option<u64>,
    pub phase: Phase,
    pub multiplier: f64,
    /// Seconds until flight; only meaningful while betting.
    pub countdown: u32,
    pub live_players: u32,
}

impl Default for RoundState {
    fn default() -> Self {
        Self {
            round_id: None,
            phase: Phase::Betting,
            multiplier: 1.0,
            countdown: 0,
            live_players: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    PendingAck,
    Active,
    CashedOut,
    Lost,
}

impl BetStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BetStatus::CashedOut | BetStatus::Lost)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Bet {
    pub id: u64,
    pub amount: f64,
    pub auto_cashout: Option<f64>,
    pub bet_number: u8,
    pub status: BetStatus,
    /// Set once the bet is cashed out.
    pub result_multiplier: Option<f64>,
    pub win_amount: Option<f64>,
}

impl Bet {
    /// A bet the server has acknowledged.
    pub fn acknowledged(id: u64, amount: f64, auto_cashout: Option<f64>, bet_number: u8) -> Self {
        Self {
            id,
            amount,
            auto_cashout,
            bet_number,
            status: BetStatus::Active,
            result_multiplier: None,
            win_amount: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == BetStatus::Active
    }

    pub fn cash_out(&mut self, multiplier: f64, win_amount: f64) {
        self.status = BetStatus::CashedOut;
        self.result_multiplier = Some(multiplier);
        self.win_amount = Some(win_amount);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CrashHistoryEntry {
    pub multiplier: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecentCashout {
    pub username: String,
    pub multiplier: f64,
    pub amount: Option<f64>,
    pub win_amount: f64,
    pub is_bot: bool,
}

/// Bounded most-recent-first sequence; the oldest entry falls off when full.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Recent<T, const N: usize> {
    entries: VecDeque<T>,
}

impl<T, const N: usize> Default for Recent<T, N> {
    fn default() -> Self {
        Self {
            entries: VecDeque::with_capacity(N),
        }
    }
}

impl<T, const N: usize> Recent<T, N> {
    pub fn push(&mut self, entry: T) {
        self.entries.push_front(entry);
        self.entries.truncate(N);
    }

    /// Replace the contents with `entries`, given most-recent-first.
    pub fn seed(&mut self, entries: impl IntoIterator<Item = T>) {
        self.entries.clear();
        self.entries.extend(entries.into_iter().take(N));
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type CrashHistory = Recent<CrashHistoryEntry, HISTORY_CAPACITY>;

pub type RecentCashouts = Recent<RecentCashout, CASHOUT_FEED_CAPACITY>;

/// Live activity from other players (including house bots).
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activity {
    Bet {
        username: String,
        amount: f64,
        auto_cashout: Option<f64>,
        is_bot: bool,
        timestamp: Option<u64>,
    },
    Cashout {
        username: String,
        multiplier: f64,
        amount: Option<f64>,
        win_amount: f64,
        is_bot: bool,
        timestamp: Option<u64>,
    },
}
