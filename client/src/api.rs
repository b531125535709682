//! REST collaborators: round history and wallet balance.

use crate::{Error, Result};
use aviator_types::{RoundSummary, WalletBalance};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

/// Refreshes the wallet balance after a balance-affecting event.
pub trait BalanceRefresher: Send + Sync + 'static {
    fn refresh_balance(&self) -> BoxFuture<'_, Result<()>>;
}

/// Source of recently finished rounds, most recent first.
pub trait HistorySource: Send + Sync + 'static {
    fn recent_rounds(&self) -> BoxFuture<'_, Result<Vec<RoundSummary>>>;
}

/// HTTP client for the game REST API.
#[derive(Clone)]
pub struct Api {
    pub base_url: Url,
    pub http_client: reqwest::Client,
    token: Option<String>,
    balance: Arc<watch::Sender<Option<f64>>>,
}

impl Api {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        // Relative joins need a trailing slash
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::InvalidScheme {
                    got: other.to_string(),
                    expected: "http or https",
                })
            }
        }
        let (balance, _) = watch::channel(None);
        Ok(Self {
            base_url,
            http_client: reqwest::Client::new(),
            token,
            balance: Arc::new(balance),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path)?;
        let mut request = self.http_client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Failed(response.status()));
        }
        Ok(response.json::<T>().await?)
    }

    pub async fn history(&self) -> Result<Vec<RoundSummary>> {
        self.get_json("history").await
    }

    pub async fn balance(&self) -> Result<f64> {
        let wallet: WalletBalance = self.get_json("wallet/balance").await?;
        Ok(wallet.balance)
    }

    /// Latest balance fetched by [`BalanceRefresher::refresh_balance`].
    pub fn balance_updates(&self) -> watch::Receiver<Option<f64>> {
        self.balance.subscribe()
    }
}

impl BalanceRefresher for Api {
    fn refresh_balance(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let balance = self.balance().await?;
            debug!(balance, "wallet balance refreshed");
            self.balance.send_replace(Some(balance));
            Ok(())
        })
    }
}

impl HistorySource for Api {
    fn recent_rounds(&self) -> BoxFuture<'_, Result<Vec<RoundSummary>>> {
        Box::pin(self.history())
    }
}
