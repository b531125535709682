//! JSON messages exchanged with the aviator game server.
//!
//! Inbound messages are discriminated by `type`, outbound commands by `action`.

use serde::{Deserialize, Serialize};

/// Countdown assumed when `betting_open` omits one.
pub const DEFAULT_COUNTDOWN_SECS: u32 = 5;

fn default_countdown() -> u32 {
    DEFAULT_COUNTDOWN_SECS
}

fn default_bet_number() -> u8 {
    1
}

/// A cash-out reported by the server for some other player.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CashoutView {
    pub username: String,
    pub multiplier: f64,
    #[serde(default)]
    pub amount: Option<f64>,
    pub win_amount: f64,
}

/// Messages pushed by the game server.
///
/// Types the client does not understand decode to [`Inbound::Unknown`]; a known
/// type with a malformed body is a decode error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    BettingOpen {
        round_id: u64,
        #[serde(default = "default_countdown")]
        countdown: u32,
    },
    RoundStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multiplier: Option<f64>,
    },
    Multiplier {
        multiplier: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        live_players: Option<u32>,
    },
    Crash {
        crash_multiplier: f64,
    },
    BetPlaced {
        bet_id: u64,
        amount: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_cashout: Option<f64>,
        #[serde(default = "default_bet_number")]
        bet_number: u8,
    },
    ManualCashoutSuccess {
        bet_id: u64,
        multiplier: f64,
        win_amount: f64,
    },
    BetError {
        #[serde(default)]
        message: Option<String>,
    },
    ManualCashoutError {
        #[serde(default)]
        message: Option<String>,
    },
    GameState {
        #[serde(default)]
        round_id: Option<u64>,
        #[serde(default)]
        multiplier: Option<f64>,
        #[serde(default)]
        is_active: bool,
        #[serde(default)]
        live_players: Option<u32>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_time: Option<u64>,
    },
    PastCrashes {
        crashes: Vec<f64>,
    },
    /// The user's own bet, re-announced by the server after a resync.
    YourBet {
        bet_id: u64,
        amount: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_cashout: Option<f64>,
        #[serde(default = "default_bet_number")]
        bet_number: u8,
    },
    CashOut {
        username: String,
        multiplier: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        amount: Option<f64>,
        win_amount: f64,
    },
    PlayerCashedOut {
        #[serde(default)]
        recent_cashouts: Vec<CashoutView>,
    },
    BotBet {
        username: String,
        amount: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_cashout: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    BotCashout {
        username: String,
        multiplier: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        amount: Option<f64>,
        win_amount: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    RoundSummary {},
    #[serde(other)]
    Unknown,
}

impl Inbound {
    /// Decode a text frame.
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::BettingOpen { .. } => "betting_open",
            Inbound::RoundStarted { .. } => "round_started",
            Inbound::Multiplier { .. } => "multiplier",
            Inbound::Crash { .. } => "crash",
            Inbound::BetPlaced { .. } => "bet_placed",
            Inbound::ManualCashoutSuccess { .. } => "manual_cashout_success",
            Inbound::BetError { .. } => "bet_error",
            Inbound::ManualCashoutError { .. } => "manual_cashout_error",
            Inbound::GameState { .. } => "game_state",
            Inbound::Pong { .. } => "pong",
            Inbound::PastCrashes { .. } => "past_crashes",
            Inbound::YourBet { .. } => "your_bet",
            Inbound::CashOut { .. } => "cash_out",
            Inbound::PlayerCashedOut { .. } => "player_cashed_out",
            Inbound::BotBet { .. } => "bot_bet",
            Inbound::BotCashout { .. } => "bot_cashout",
            Inbound::RoundSummary {} => "round_summary",
            Inbound::Unknown => "unknown",
        }
    }

    /// Extract the raw `type` of a frame without decoding its body.
    pub fn peek_type(text: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type")]
            kind: String,
        }

        serde_json::from_str::<Envelope>(text)
            .ok()
            .map(|envelope| envelope.kind)
    }
}

/// Commands sent by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Outbound {
    GetGameState,
    PlaceBet {
        round_id: u64,
        amount: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_cashout: Option<f64>,
        bet_number: u8,
    },
    Cashout {
        bet_id: u64,
        /// Multiplier observed locally when the command was issued. Advisory only.
        multiplier: f64,
    },
    Ping,
}

impl Outbound {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// One finished round as returned by `GET /history`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub id: u64,
    pub crash_multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub balance: f64,
}
