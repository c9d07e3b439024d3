//! HTTP quote service integration.
//!
//! Fetches one quote per work item from a JSON endpoint:
//!
//! API: `GET {base_url}/quotes/{work_item_id}`
//! Auth: optional bearer token (env var named in `oracle.api_key_env`).
//! Response: `{"price": f64, "difficulty": f64, "volatility_pct": f64?, "timestamp": RFC3339?}`

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::MarketOracle;
use crate::types::Quote;

const PROVIDER_NAME: &str = "http";

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    price: f64,
    difficulty: f64,
    #[serde(default)]
    volatility_pct: f64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl QuoteResponse {
    fn into_quote(self, work_item_id: &str) -> Quote {
        Quote {
            work_item_id: work_item_id.to_string(),
            price: self.price,
            difficulty: self.difficulty,
            volatility_pct: self.volatility_pct,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpQuoteOracle {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpQuoteOracle {
    /// Build a client for `base_url`. The per-request timeout is enforced by
    /// the engine; the client-level timeout only bounds stuck connections.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("RIGWARDEN/0.1.0 (fleet-scheduler)")
            .build()
            .context("Failed to build HTTP client for quote service")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(SecretString::new),
        })
    }

    fn quote_url(&self, work_item_id: &str) -> String {
        format!(
            "{}/quotes/{}",
            self.base_url,
            urlencoding::encode(work_item_id)
        )
    }
}

#[async_trait]
impl MarketOracle for HttpQuoteOracle {
    async fn get_quote(&self, work_item_id: &str) -> Result<Quote> {
        let url = self.quote_url(work_item_id);
        let mut request = self.http.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("Quote request failed: {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Quote service returned {status} for {work_item_id}: {body}");
        }

        let parsed: QuoteResponse = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse quote for {work_item_id}"))?;

        debug!(work_item_id, price = parsed.price, difficulty = parsed.difficulty, "Quote fetched");
        Ok(parsed.into_quote(work_item_id))
    }

    fn name(&self) -> &str {
        PROVIDER_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
