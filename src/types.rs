//! Shared types for the RIGWARDEN fleet core.
//!
//! These types form the data model used across all modules.
//! They are kept free of behaviour that depends on configuration so that
//! market, strategy, engine and storage modules can depend on them without
//! circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Portfolio bucket holding capital not backing any active unit.
///
/// Reserved: no catalog work item may use this id.
pub const IDLE_BUCKET: &str = "_idle";

// ---------------------------------------------------------------------------
// Unit (rig)
// ---------------------------------------------------------------------------

/// Lifecycle state of a unit within the core.
///
/// ```text
/// Provisioned ──► Active ──► Parked ──► Active ...
///                   │
///                   └──► Failed ──► BackedUp | Stranded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitStatus {
    /// Loaded from the roster, never assigned a work item.
    Provisioned,
    /// Running its assigned work item.
    Active,
    /// Soft-parked for lack of capital; configuration kept.
    Parked,
    /// Failure threshold breached, waiting for a backup search.
    Failed,
    /// Failed and replaced by a promoted standby.
    BackedUp,
    /// Failed with no compatible standby available.
    Stranded,
}

impl UnitStatus {
    /// Whether the unit may be considered by the allocator.
    pub fn is_schedulable(&self) -> bool {
        matches!(
            self,
            UnitStatus::Provisioned | UnitStatus::Active | UnitStatus::Parked
        )
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Provisioned => write!(f, "PROVISIONED"),
            UnitStatus::Active => write!(f, "ACTIVE"),
            UnitStatus::Parked => write!(f, "PARKED"),
            UnitStatus::Failed => write!(f, "FAILED"),
            UnitStatus::BackedUp => write!(f, "BACKED_UP"),
            UnitStatus::Stranded => write!(f, "STRANDED"),
        }
    }
}

/// A schedulable compute unit ("rig").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    /// Hardware class, matched against `WorkItem::compatible_unit_kinds`.
    pub kind: String,
    /// Raw output rate (hashes or compute units per second).
    pub base_output_rate: f64,
    pub power_consumption_w: f64,
    pub efficiency_factor: f64,
    pub assigned_work_item: Option<String>,
    /// Work item held before the most recent switch.
    pub previous_work_item_id: Option<String>,
    pub status: UnitStatus,
    pub consecutive_failures: u32,
    /// True until the unit is first given a work item.
    pub never_assigned: bool,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}) on {} | {:.0}W | failures={}",
            self.status,
            self.id,
            self.kind,
            self.assigned_work_item.as_deref().unwrap_or("-"),
            self.power_consumption_w,
            self.consecutive_failures,
        )
    }
}

impl Unit {
    /// A freshly provisioned unit with no assignment.
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        base_output_rate: f64,
        power_consumption_w: f64,
        efficiency_factor: f64,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            base_output_rate,
            power_consumption_w,
            efficiency_factor,
            assigned_work_item: None,
            previous_work_item_id: None,
            status: UnitStatus::Provisioned,
            consecutive_failures: 0,
            never_assigned: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == UnitStatus::Active
    }

    /// Inactive, never assigned, and not failed: eligible for promotion
    /// during failover.
    pub fn is_standby(&self) -> bool {
        !self.is_active() && self.never_assigned && self.status.is_schedulable()
    }

    /// Power draw in kilowatts.
    pub fn power_kw(&self) -> f64 {
        self.power_consumption_w / 1000.0
    }

    /// Put the unit on a work item. Records the prior item and clears the
    /// never-assigned flag.
    pub fn assign(&mut self, work_item_id: &str) {
        if self.assigned_work_item.as_deref() != Some(work_item_id) {
            self.previous_work_item_id = self.assigned_work_item.take();
            self.assigned_work_item = Some(work_item_id.to_string());
        }
        self.never_assigned = false;
    }
}

// ---------------------------------------------------------------------------
// Work item catalog
// ---------------------------------------------------------------------------

/// An assignable unit of work (algorithm/coin).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub difficulty_class: String,
    pub compatible_unit_kinds: BTreeSet<String>,
}

impl WorkItem {
    pub fn new<I, S>(id: impl Into<String>, difficulty_class: impl Into<String>, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            difficulty_class: difficulty_class.into(),
            compatible_unit_kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether units of `kind` can run this work item.
    pub fn supports(&self, kind: &str) -> bool {
        self.compatible_unit_kinds.contains(kind)
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Price/difficulty snapshot for one work item. Superseded every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub work_item_id: String,
    /// Reward value per unit of output, in CHF.
    pub price: f64,
    pub difficulty: f64,
    pub volatility_pct: f64,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: price={:.6} difficulty={:.3e} vol={:.1}%",
            self.work_item_id, self.price, self.difficulty, self.volatility_pct
        )
    }
}

// ---------------------------------------------------------------------------
// Allocation & portfolio
// ---------------------------------------------------------------------------

/// One unit placed on one work item for the current cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub unit_id: String,
    pub work_item_id: String,
    pub expected_hourly_profit: f64,
    /// Hourly profit per kW of power draw.
    pub roi: f64,
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} (profit={:.4}/h, roi={:.4})",
            self.unit_id, self.work_item_id, self.expected_hourly_profit, self.roi
        )
    }
}

/// Capital and its split across work items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub capital: Decimal,
    /// CHF backing each work item. Unbacked capital sits in [`IDLE_BUCKET`].
    pub allocation_by_work_item: BTreeMap<String, Decimal>,
    /// Reference point for stop-loss drawdown.
    pub baseline_capital: Decimal,
}

impl Portfolio {
    /// A portfolio with all capital idle.
    pub fn new(capital: Decimal) -> Self {
        let mut allocation_by_work_item = BTreeMap::new();
        allocation_by_work_item.insert(IDLE_BUCKET.to_string(), capital);
        Self {
            capital,
            allocation_by_work_item,
            baseline_capital: capital,
        }
    }

    /// Sum of every bucket, idle included.
    pub fn allocated_total(&self) -> Decimal {
        self.allocation_by_work_item.values().copied().sum()
    }

    /// Capital not backing any unit.
    pub fn idle(&self) -> Decimal {
        self.allocation_by_work_item
            .get(IDLE_BUCKET)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Change since baseline as a percentage (negative = loss).
    pub fn change_pct(&self) -> Option<f64> {
        use rust_decimal::prelude::ToPrimitive;
        if self.baseline_capital <= Decimal::ZERO {
            return None;
        }
        ((self.capital - self.baseline_capital) / self.baseline_capital * Decimal::ONE_HUNDRED)
            .to_f64()
    }
}

impl fmt::Display for Portfolio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "capital=CHF {:.2} | baseline=CHF {:.2} | idle=CHF {:.2} | buckets={}",
            self.capital,
            self.baseline_capital,
            self.idle(),
            self.allocation_by_work_item.len(),
        )
    }
}

// ---------------------------------------------------------------------------
// Switch log & risk state
// ---------------------------------------------------------------------------

/// Append-only record of a work item change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub unit_id: String,
    pub from_work_item: String,
    pub to_work_item: String,
    pub timestamp: DateTime<Utc>,
    /// `None` when the previous work item had no quote to compare against.
    pub improvement_pct: Option<f64>,
}

impl fmt::Display for SwitchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.improvement_pct {
            Some(pct) => write!(
                f,
                "{}: {} -> {} (+{:.1}%)",
                self.unit_id, self.from_work_item, self.to_work_item, pct
            ),
            None => write!(
                f,
                "{}: {} -> {} (previous unquoted)",
                self.unit_id, self.from_work_item, self.to_work_item
            ),
        }
    }
}

/// Process-wide risk status. The emergency stop is cleared only by an operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub emergency_stop: bool,
    pub last_assessment: Option<DateTime<Utc>>,
    pub active_warnings: Vec<String>,
    /// When the stop-loss latch tripped.
    pub latched_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Cycle summary
// ---------------------------------------------------------------------------

/// Everything that happened in one committed tick. Sent to the ledger once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub capital_before: Decimal,
    pub capital_after: Decimal,
    pub realized_profit: Decimal,
    pub allocations: Vec<Allocation>,
    pub switches: Vec<SwitchRecord>,
    pub risk_warnings: Vec<String>,
    /// Non-fatal degradations (missing quotes, unit failures, ...).
    pub warnings: Vec<String>,
    /// True when the stop-loss latch suppressed allocation this cycle.
    pub halted: bool,
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cycle #{}: units={} switches={} profit=CHF {:.4} capital=CHF {:.2} -> {:.2}{}",
            self.cycle_number,
            self.allocations.len(),
            self.switches.len(),
            self.realized_profit,
            self.capital_before,
            self.capital_after,
            if self.halted { " [HALTED]" } else { "" },
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for the fleet core.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Invalid quote ({work_item_id}): {reason}")]
    InvalidQuote { work_item_id: String, reason: String },

    #[error("Invalid unit ({unit_id}): {reason}")]
    InvalidUnit { unit_id: String, reason: String },

    #[error("No eligible units for allocation")]
    NoEligibleUnits,

    #[error("No backup available for unit {unit_id} (kind {kind})")]
    NoBackupAvailable { unit_id: String, kind: String },

    #[error("Emergency stop active since {since}: new allocations are blocked")]
    EmergencyStopActive { since: String },

    #[error("Quote unavailable ({work_item_id}): {reason}")]
    QuoteUnavailable { work_item_id: String, reason: String },

    #[error("Quote request timed out ({work_item_id}) after {timeout:?}")]
    QuoteTimeout { work_item_id: String, timeout: Duration },

    #[error("Market data outage: all {work_items} work items unreachable")]
    MarketDataOutage { work_items: usize },

    #[error("Unknown unit: {0}")]
    UnknownUnit(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
