pub mod api;
pub mod backoff;
pub mod config;
pub mod controller;
pub mod notify;
pub mod session;

pub use api::{Api, BalanceRefresher, HistorySource};
pub use backoff::{Backoff, ReconnectPolicy};
pub use config::{BetLimits, Config};
pub use controller::{ConnectionStatus, Followup, RoundController, Snapshot};
pub use notify::{LogNotifier, Notice, NoticeKind, Notifier};
pub use session::{Collaborators, Session, SessionHandle};
use thiserror::Error;

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not connected to game server")]
    NotConnected,
    #[error("no active round")]
    NoActiveRound,
    #[error("betting is closed for this round")]
    BettingClosed,
    #[error("invalid bet: {0}")]
    InvalidBet(String),
    #[error("bet slot {0} already used this round")]
    DuplicateBet(u8),
    #[error("bet {0} is not active")]
    BetNotActive(u64),
    #[error("cash out is only possible while flying")]
    NotFlying,
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed: {0}")]
    Failed(reqwest::StatusCode),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("session closed")]
    SessionClosed,
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {got} (expected {expected})")]
    InvalidScheme {
        got: String,
        expected: &'static str,
    },
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
