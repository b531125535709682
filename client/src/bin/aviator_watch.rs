use anyhow::{Context, Result};
use aviator_client::{
    Api, Collaborators, Config, ConnectionStatus, Notice, NoticeKind, Session, Snapshot,
};
use aviator_types::{Activity, Phase};
use clap::Parser;
use std::{collections::HashSet, path::PathBuf, sync::Arc};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Follow live aviator rounds and optionally play them")]
struct Args {
    /// YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    ws_url: Option<String>,

    /// REST base URL for history and wallet balance
    #[arg(long)]
    api_url: Option<String>,

    /// Bearer token (falls back to AVIATOR_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Stake to place on every round
    #[arg(long)]
    bet: Option<f64>,

    /// Server-side auto cash-out multiplier for placed bets
    #[arg(long)]
    auto_cashout: Option<f64>,

    /// Cash out manually once the multiplier reaches this value
    #[arg(long)]
    cash_out_at: Option<f64>,

    /// Stop after this many crashes
    #[arg(short, long)]
    rounds: Option<u32>,

    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("load config {}", path.display()))?,
            None => Config::default().with_env(),
        };
        if let Some(ws_url) = &self.ws_url {
            config.ws_url = ws_url.clone();
        }
        if let Some(api_url) = &self.api_url {
            config.api_url = Some(api_url.clone());
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        Ok(config)
    }
}

/// Per-round betting decisions.
#[derive(Default)]
struct Player {
    bet_round: Option<u64>,
    cashout_requested: HashSet<u64>,
    crashes: u32,
    last_phase: Option<Phase>,
}

fn log_notice(notice: &Notice) {
    match notice.kind {
        NoticeKind::Success | NoticeKind::Info => {
            info!(title = %notice.title, "{}", notice.message)
        }
        NoticeKind::Warning => warn!(title = %notice.title, "{}", notice.message),
        NoticeKind::Error => error!(title = %notice.title, "{}", notice.message),
    }
}

fn log_activity(activity: &Activity) {
    match activity {
        Activity::Bet {
            username,
            amount,
            is_bot,
            ..
        } => debug!(%username, amount, is_bot, "bet"),
        Activity::Cashout {
            username,
            multiplier,
            win_amount,
            is_bot,
            ..
        } => debug!(%username, multiplier, win_amount, is_bot, "cashout"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.config()?;

    let level: tracing::Level = config
        .log_level
        .parse()
        .with_context(|| format!("invalid log level {}", config.log_level))?;
    tracing_subscriber::fmt().with_max_level(level).init();

    let (notices_tx, mut notices) = mpsc::unbounded_channel();
    let mut collaborators = Collaborators::new(Arc::new(notices_tx));
    let mut balance = None;
    if let Some(api_url) = &config.api_url {
        let api = Arc::new(Api::new(api_url, config.token.clone())?);
        balance = Some(api.balance_updates());
        collaborators = collaborators
            .with_wallet(api.clone())
            .with_history(api);
    }

    let handle = Session::start(config, collaborators)?;
    let mut state = handle.subscribe();
    let mut activity = handle.activity();
    let mut player = Player::default();

    info!(rounds = ?args.rounds, bet = ?args.bet, "watching");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            Some(notice) = notices.recv() => log_notice(&notice),
            changed = state.changed() => {
                if changed.is_err() {
                    warn!("session ended");
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                if snapshot.status == ConnectionStatus::Disconnected {
                    warn!("disconnected from game server");
                    break;
                }
                if !player.observe(&snapshot, &args, &handle).await {
                    break;
                }
            }
            event = activity.recv() => match event {
                Ok(event) => log_activity(&event),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "activity lagged"),
                Err(RecvError::Closed) => {}
            },
            Some(()) = async {
                match balance.as_mut() {
                    Some(balance) => balance.changed().await.ok(),
                    None => None,
                }
            } => {
                if let Some(balance) = balance.as_ref().and_then(|balance| *balance.borrow()) {
                    info!(balance, "wallet balance");
                }
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

impl Player {
    /// React to a new snapshot. Returns `false` once enough rounds were seen.
    async fn observe(
        &mut self,
        snapshot: &Snapshot,
        args: &Args,
        handle: &aviator_client::SessionHandle,
    ) -> bool {
        let round = &snapshot.state;
        let entered = self.last_phase != Some(round.phase);
        self.last_phase = Some(round.phase);

        match round.phase {
            Phase::Betting => {
                if entered {
                    info!(round_id = ?round.round_id, countdown = round.countdown, "betting open");
                }
                if let (Some(amount), Some(round_id)) = (args.bet, round.round_id) {
                    if self.bet_round != Some(round_id) {
                        self.bet_round = Some(round_id);
                        if let Err(err) = handle.place_bet(amount, args.auto_cashout, 1).await {
                            warn!(%err, round_id, "bet not placed");
                        }
                    }
                }
            }
            Phase::Flying => {
                if entered {
                    info!(round_id = ?round.round_id, "flying");
                }
                if let Some(target) = args.cash_out_at {
                    if round.multiplier >= target {
                        let due: Vec<u64> = snapshot
                            .active_bets()
                            .map(|bet| bet.id)
                            .filter(|id| !self.cashout_requested.contains(id))
                            .collect();
                        for bet_id in due {
                            self.cashout_requested.insert(bet_id);
                            if let Err(err) = handle.cash_out(bet_id).await {
                                warn!(%err, bet_id, "cashout not sent");
                            }
                        }
                    }
                }
            }
            Phase::Crashed => {
                if entered {
                    self.crashes += 1;
                    self.cashout_requested.clear();
                    info!(
                        round_id = ?round.round_id,
                        crash = round.multiplier,
                        history = ?snapshot.history.iter().take(5).collect::<Vec<_>>(),
                        "crashed"
                    );
                    if args.rounds.is_some_and(|rounds| self.crashes >= rounds) {
                        return false;
                    }
                }
            }
        }
        true
    }
}
