//! Market data integration.
//!
//! Defines the `MarketOracle` trait and provides implementations for:
//! - a fixed in-memory quote board (dry runs, tests)
//! - an HTTP quote service
//!
//! The core only ever asks for one quote per work item per cycle. Fetches
//! run concurrently, each bounded by a timeout; a timed-out or failed fetch
//! behaves exactly like a missing quote.

pub mod fixed;
pub mod http;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::{FleetError, Quote, WorkItem};

/// Abstraction over market data providers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketOracle: Send + Sync {
    /// Current quote for one work item.
    async fn get_quote(&self, work_item_id: &str) -> Result<Quote>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Quote book
// ---------------------------------------------------------------------------

/// Quotes gathered for one cycle.
#[derive(Debug, Default)]
pub struct QuoteBook {
    /// Valid quotes keyed by work item id.
    pub quotes: BTreeMap<String, Quote>,
    /// Work items the oracle could not serve (error or timeout).
    pub unreachable: Vec<FleetError>,
    /// Work items served with unusable data.
    pub invalid: Vec<FleetError>,
}

impl QuoteBook {
    /// True when the oracle failed for every requested work item.
    pub fn is_total_outage(&self, requested: usize) -> bool {
        requested > 0 && self.unreachable.len() == requested
    }

    /// All per-work-item problems as human-readable warnings.
    pub fn warnings(&self) -> Vec<String> {
        self.unreachable
            .iter()
            .chain(self.invalid.iter())
            .map(ToString::to_string)
            .collect()
    }
}

/// Check a quote for values the profit model cannot use.
pub fn validate_quote(work_item_id: &str, quote: &Quote) -> Result<(), FleetError> {
    let invalid = |reason: String| FleetError::InvalidQuote {
        work_item_id: work_item_id.to_string(),
        reason,
    };

    if quote.work_item_id != work_item_id {
        return Err(invalid(format!(
            "quote is for {} instead",
            quote.work_item_id
        )));
    }
    if !quote.price.is_finite() || quote.price < 0.0 {
        return Err(invalid(format!("price {} is not a valid amount", quote.price)));
    }
    if !quote.difficulty.is_finite() || quote.difficulty <= 0.0 {
        return Err(invalid(format!("difficulty {} must be positive", quote.difficulty)));
    }
    Ok(())
}

/// Fetch one quote per work item, concurrently, each bounded by `timeout`.
pub async fn fetch_quotes(
    oracle: &dyn MarketOracle,
    work_items: &[WorkItem],
    timeout: Duration,
) -> QuoteBook {
    let requests = work_items.iter().map(|item| async move {
        let outcome = tokio::time::timeout(timeout, oracle.get_quote(&item.id)).await;
        (item.id.as_str(), outcome)
    });

    let mut book = QuoteBook::default();
    for (work_item_id, outcome) in join_all(requests).await {
        match outcome {
            Ok(Ok(quote)) => match validate_quote(work_item_id, &quote) {
                Ok(()) => {
                    debug!(work_item_id, quote = %quote, "Quote received");
                    book.quotes.insert(work_item_id.to_string(), quote);
                }
                Err(e) => {
                    warn!(work_item_id, error = %e, "Quote rejected; work item excluded this cycle");
                    book.invalid.push(e);
                }
            },
            Ok(Err(e)) => {
                warn!(
                    work_item_id,
                    oracle = oracle.name(),
                    error = %e,
                    "Quote fetch failed; work item excluded this cycle"
                );
                book.unreachable.push(FleetError::QuoteUnavailable {
                    work_item_id: work_item_id.to_string(),
                    reason: format!("{e:#}"),
                });
            }
            Err(_) => {
                warn!(
                    work_item_id,
                    oracle = oracle.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Quote fetch timed out; work item excluded this cycle"
                );
                book.unreachable.push(FleetError::QuoteTimeout {
                    work_item_id: work_item_id.to_string(),
                    timeout,
                });
            }
        }
    }
    book
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
