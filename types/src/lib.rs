pub mod api;
pub use api::{Inbound, Outbound, RoundSummary, WalletBalance};
pub mod round;
pub use round::{
    Activity, Bet, BetStatus, CrashHistory, CrashHistoryEntry, Phase, Recent, RecentCashout,
    RecentCashouts, RoundState, HISTORY_CAPACITY,
};

/// Close code sent by a peer that is intentionally ending the session.
pub const CLOSE_NORMAL: u16 = 1000;
