//! Scripted market oracle for integration testing.
//!
//! Quotes are laid out as a sequence of rounds. Tests move the round
//! pointer between ticks; every work item missing from the current round
//! answers with an error, like an unreachable upstream.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rigwarden::market::MarketOracle;
use rigwarden::storage::Ledger;
use rigwarden::types::{CycleSummary, Quote};

/// (price, difficulty) per work item for one round.
pub type Round = HashMap<String, (f64, f64)>;

pub fn round(entries: &[(&str, f64, f64)]) -> Round {
    entries
        .iter()
        .map(|(id, price, difficulty)| (id.to_string(), (*price, *difficulty)))
        .collect()
}

#[derive(Clone)]
pub struct ScriptedOracle {
    rounds: Arc<Mutex<Vec<Round>>>,
    current: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedOracle {
    pub fn new(rounds: Vec<Round>) -> Self {
        Self {
            rounds: Arc::new(Mutex::new(rounds)),
            current: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Jump to a round. Past the end, the last round repeats.
    pub fn goto(&self, round: usize) {
        self.current.store(round, Ordering::SeqCst);
    }

    pub fn push(&self, round: Round) {
        self.rounds.lock().unwrap().push(round);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketOracle for ScriptedOracle {
    async fn get_quote(&self, work_item_id: &str) -> Result<Quote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rounds = self.rounds.lock().unwrap();
        let idx = self.current.load(Ordering::SeqCst).min(rounds.len().saturating_sub(1));
        let (price, difficulty) = rounds
            .get(idx)
            .and_then(|r| r.get(work_item_id))
            .copied()
            .ok_or_else(|| anyhow!("scripted outage for {work_item_id}"))?;

        Ok(Quote {
            work_item_id: work_item_id.to_string(),
            price,
            difficulty,
            volatility_pct: 0.0,
            timestamp: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Ledger that rejects every write.
pub struct BrokenLedger {
    pub attempts: AtomicUsize,
}

impl BrokenLedger {
    pub fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Ledger for BrokenLedger {
    async fn record_cycle(&self, _summary: &CycleSummary) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("ledger volume read-only"))
    }
}
