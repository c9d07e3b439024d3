//! Persistence layer.
//!
//! The engine hands every completed cycle to a [`Ledger`] exactly once.
//! Two sinks ship with the crate: an append-only JSON-lines file for
//! production and an in-memory log for tests and embedding.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::types::CycleSummary;

/// Append-only sink for cycle summaries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Persist one committed cycle. Called once per cycle, never retried.
    async fn record_cycle(&self, summary: &CycleSummary) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JSON-lines file
// ---------------------------------------------------------------------------

/// One JSON object per line, appended in cycle order.
pub struct JsonLinesLedger {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!(path = %path.display(), "Ledger file");
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Read every recorded cycle back, oldest first.
    /// A missing file is an empty ledger.
    pub async fn read_all(&self) -> Result<Vec<CycleSummary>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read ledger {}", self.path.display()))?;

        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("Failed to parse ledger {} line {}", self.path.display(), n + 1)
                })
            })
            .collect()
    }
}

#[async_trait]
impl Ledger for JsonLinesLedger {
    async fn record_cycle(&self, summary: &CycleSummary) -> Result<()> {
        let mut line =
            serde_json::to_string(summary).context("Failed to serialise cycle summary")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open ledger {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to append to ledger {}", self.path.display()))?;
        file.flush().await?;

        debug!(cycle = summary.cycle_number, path = %self.path.display(), "Cycle recorded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Shared in-memory ledger. Clones see the same entries.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    entries: Arc<Mutex<Vec<CycleSummary>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<CycleSummary> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn record_cycle(&self, summary: &CycleSummary) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(summary.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
