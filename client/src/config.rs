use crate::{backoff::ReconnectPolicy, Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use url::Url;

/// Environment variable consulted when the config carries no token.
pub const TOKEN_ENV: &str = "AVIATOR_TOKEN";

/// Client-side limits checked before a bet is sent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BetLimits {
    pub min_bet: f64,
    pub max_bet: f64,
    pub min_auto_cashout: f64,
}

impl Default for BetLimits {
    fn default() -> Self {
        Self {
            min_bet: 10.0,
            max_bet: 10_000.0,
            min_auto_cashout: 1.01,
        }
    }
}

impl BetLimits {
    pub fn check(&self, amount: f64, auto_cashout: Option<f64>) -> Result<()> {
        if !amount.is_finite() || amount < self.min_bet || amount > self.max_bet {
            return Err(Error::InvalidBet(format!(
                "bet must be between {} and {}",
                self.min_bet, self.max_bet
            )));
        }
        if let Some(target) = auto_cashout {
            if !target.is_finite() || target < self.min_auto_cashout {
                return Err(Error::InvalidBet(format!(
                    "auto cashout must be at least {:.2}x",
                    self.min_auto_cashout
                )));
            }
        }
        Ok(())
    }
}

/// Client configuration (YAML).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ws_url: String,
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub log_level: String,
    pub reconnect: ReconnectPolicy,
    pub ping_interval_ms: u64,
    pub stale_after_ms: u64,
    pub sync_check_ms: u64,
    pub limits: BetLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8000/ws/aviator/".to_string(),
            api_url: None,
            token: None,
            log_level: "info".to_string(),
            reconnect: ReconnectPolicy::default(),
            ping_interval_ms: 30_000,
            stale_after_ms: 10_000,
            sync_check_ms: 5_000,
            limits: BetLimits::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        Ok(config.with_env())
    }

    /// Fill the token from [`TOKEN_ENV`] if none is configured.
    pub fn with_env(mut self) -> Self {
        if self.token.is_none() {
            self.token = std::env::var(TOKEN_ENV)
                .ok()
                .filter(|token| !token.is_empty());
        }
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// WebSocket endpoint with the bearer token attached.
    pub fn ws_endpoint(&self, token: &str) -> Result<Url> {
        let mut url = Url::parse(&self.ws_url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::InvalidScheme {
                    got: other.to_string(),
                    expected: "ws or wss",
                })
            }
        }
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn sync_check(&self) -> Duration {
        Duration::from_millis(self.sync_check_ms.max(1))
    }
}
