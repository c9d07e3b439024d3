//! Fixed quote board.
//!
//! An in-memory `MarketOracle` whose quotes are set by the caller. Used for
//! dry runs (quotes from `config.toml`) and for driving the engine
//! deterministically in tests. Individual work items can be made to fail or
//! stall to exercise degraded cycles.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::MarketOracle;
use crate::types::Quote;

#[derive(Debug, Clone)]
enum Entry {
    Quote(Quote),
    Fail(String),
    Stall(Duration),
}

/// A controllable in-memory quote source.
///
/// Cloning shares the underlying board, so tests can keep a handle while the
/// engine owns another.
#[derive(Debug, Clone, Default)]
pub struct FixedQuoteOracle {
    board: Arc<Mutex<HashMap<String, Entry>>>,
}

impl FixedQuoteOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a board from a list of quotes.
    pub fn with_quotes(quotes: impl IntoIterator<Item = Quote>) -> Self {
        let oracle = Self::new();
        for q in quotes {
            oracle.put(q);
        }
        oracle
    }

    fn board(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.board.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a full quote.
    pub fn put(&self, quote: Quote) {
        self.board()
            .insert(quote.work_item_id.clone(), Entry::Quote(quote));
    }

    /// Insert or replace a quote stamped now.
    pub fn set(&self, work_item_id: &str, price: f64, difficulty: f64) {
        self.put(Quote {
            work_item_id: work_item_id.to_string(),
            price,
            difficulty,
            volatility_pct: 0.0,
            timestamp: Utc::now(),
        });
    }

    /// Make every request for this work item fail.
    pub fn fail(&self, work_item_id: &str, message: &str) {
        self.board()
            .insert(work_item_id.to_string(), Entry::Fail(message.to_string()));
    }

    /// Make every request for this work item wait before answering.
    pub fn stall(&self, work_item_id: &str, delay: Duration) {
        self.board()
            .insert(work_item_id.to_string(), Entry::Stall(delay));
    }

    /// Drop a work item from the board (requests then fail as unknown).
    pub fn remove(&self, work_item_id: &str) {
        self.board().remove(work_item_id);
    }
}

#[async_trait]
impl MarketOracle for FixedQuoteOracle {
    async fn get_quote(&self, work_item_id: &str) -> Result<Quote> {
        let entry = self.board().get(work_item_id).cloned();
        match entry {
            Some(Entry::Quote(mut quote)) => {
                quote.timestamp = Utc::now();
                Ok(quote)
            }
            Some(Entry::Fail(message)) => Err(anyhow!(message)),
            Some(Entry::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Err(anyhow!("stalled quote for {work_item_id}"))
            }
            None => Err(anyhow!("no quote listed for {work_item_id}")),
        }
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
