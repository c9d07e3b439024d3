//! Algorithm switcher.
//!
//! A hysteresis gate between the allocator's best candidate and a unit's
//! current work item. A switch needs both:
//!
//! 1. ROI improvement of at least `switch_threshold_pct`, and
//! 2. at least `min_switch_interval` since the unit's last switch.
//!
//! The two conditions are independent. Noisy ROI estimates therefore cannot
//! make a unit oscillate between work items.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

use crate::config::SchedulingConfig;
use crate::types::{Allocation, SwitchRecord, Unit};

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SwitchReason {
    /// Unit has no work item yet; placement is not a switch.
    InitialPlacement,
    /// Candidate is the current work item.
    AlreadyAssigned,
    /// Improvement cleared the threshold and the cooldown has elapsed.
    Improved { improvement_pct: f64 },
    /// Current work item has no quote this cycle; only the cooldown applies.
    CurrentUnquoted,
    BelowThreshold { improvement_pct: f64, threshold_pct: f64 },
    CoolingDown { remaining: Duration },
}

impl fmt::Display for SwitchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchReason::InitialPlacement => write!(f, "initial placement"),
            SwitchReason::AlreadyAssigned => write!(f, "already on best work item"),
            SwitchReason::Improved { improvement_pct } => {
                write!(f, "ROI improved {improvement_pct:.1}%")
            }
            SwitchReason::CurrentUnquoted => write!(f, "current work item unquoted"),
            SwitchReason::BelowThreshold {
                improvement_pct,
                threshold_pct,
            } => write!(
                f,
                "improvement {improvement_pct:.1}% below {threshold_pct:.1}% threshold"
            ),
            SwitchReason::CoolingDown { remaining } => {
                write!(f, "cooldown, {}s remaining", remaining.num_seconds())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchDecision {
    pub switch: bool,
    pub reason: SwitchReason,
}

impl SwitchDecision {
    fn go(reason: SwitchReason) -> Self {
        Self { switch: true, reason }
    }

    fn hold(reason: SwitchReason) -> Self {
        Self { switch: false, reason }
    }
}

/// ROI improvement of `candidate` over `current`, in percent.
///
/// A non-positive current ROI is compared against its magnitude so that a
/// move from a losing to a winning work item reads as an improvement; a
/// current ROI of exactly zero makes any gain infinite.
pub fn improvement_pct(current: f64, candidate: f64) -> f64 {
    let delta = candidate - current;
    if current == 0.0 {
        return if delta > 0.0 {
            f64::INFINITY
        } else if delta < 0.0 {
            f64::NEG_INFINITY
        } else {
            0.0
        };
    }
    delta / current.abs() * 100.0
}

// ---------------------------------------------------------------------------
// Switcher
// ---------------------------------------------------------------------------

pub struct AlgorithmSwitcher {
    threshold_pct: f64,
    min_interval: Duration,
    /// When false the gate always opens (explicit operator opt-out).
    enabled: bool,
    last_switch: HashMap<String, DateTime<Utc>>,
    log: Vec<SwitchRecord>,
}

impl AlgorithmSwitcher {
    pub fn new(config: &SchedulingConfig, enabled: bool) -> Self {
        Self {
            threshold_pct: config.switch_threshold_pct,
            min_interval: config.min_switch_interval(),
            enabled,
            last_switch: HashMap::new(),
            log: Vec::new(),
        }
    }

    /// Decide whether `unit` should move to `candidate`. Pure: no state
    /// changes. `current_roi` is the unit's ROI on its current work item this
    /// cycle, or `None` if that work item is unquoted.
    pub fn should_switch(
        &self,
        unit: &Unit,
        candidate: &Allocation,
        current_roi: Option<f64>,
        now: DateTime<Utc>,
    ) -> SwitchDecision {
        let Some(current) = unit.assigned_work_item.as_deref() else {
            return SwitchDecision::go(SwitchReason::InitialPlacement);
        };
        if current == candidate.work_item_id {
            return SwitchDecision::hold(SwitchReason::AlreadyAssigned);
        }

        let reason = match current_roi {
            Some(roi) => {
                let pct = improvement_pct(roi, candidate.roi);
                if self.enabled && !(pct >= self.threshold_pct) {
                    return SwitchDecision::hold(SwitchReason::BelowThreshold {
                        improvement_pct: pct,
                        threshold_pct: self.threshold_pct,
                    });
                }
                SwitchReason::Improved { improvement_pct: pct }
            }
            None => SwitchReason::CurrentUnquoted,
        };

        if self.enabled {
            if let Some(last) = self.last_switch.get(&unit.id) {
                let elapsed = now - *last;
                if elapsed < self.min_interval {
                    return SwitchDecision::hold(SwitchReason::CoolingDown {
                        remaining: self.min_interval - elapsed,
                    });
                }
            }
        }

        SwitchDecision::go(reason)
    }

    /// Record an executed switch: appends to the log and restarts the
    /// unit's cooldown.
    pub fn record_switch(
        &mut self,
        unit_id: &str,
        from: &str,
        to: &str,
        improvement_pct: Option<f64>,
        now: DateTime<Utc>,
    ) -> SwitchRecord {
        let record = SwitchRecord {
            unit_id: unit_id.to_string(),
            from_work_item: from.to_string(),
            to_work_item: to.to_string(),
            timestamp: now,
            improvement_pct: improvement_pct.filter(|p| p.is_finite()),
        };
        self.last_switch.insert(unit_id.to_string(), now);
        self.log.push(record.clone());
        info!(switch = %record, "Work item switched");
        record
    }

    /// Gate and, if it opens, apply the switch to `unit`.
    /// Returns the record when a switch (not an initial placement) happened.
    pub fn apply(
        &mut self,
        unit: &mut Unit,
        candidate: &Allocation,
        current_roi: Option<f64>,
        now: DateTime<Utc>,
    ) -> (SwitchDecision, Option<SwitchRecord>) {
        let decision = self.should_switch(unit, candidate, current_roi, now);
        if !decision.switch {
            debug!(unit_id = %unit.id, reason = %decision.reason, "Switch declined");
            return (decision, None);
        }

        let record = match (&decision.reason, unit.assigned_work_item.clone()) {
            (SwitchReason::InitialPlacement, _) | (_, None) => None,
            (reason, Some(from)) => {
                let pct = match reason {
                    SwitchReason::Improved { improvement_pct } => Some(*improvement_pct),
                    _ => None,
                };
                Some(self.record_switch(&unit.id, &from, &candidate.work_item_id, pct, now))
            }
        };
        unit.assign(&candidate.work_item_id);
        (decision, record)
    }

    /// Most recent switch of a unit.
    pub fn last_switch(&self, unit_id: &str) -> Option<DateTime<Utc>> {
        self.last_switch.get(unit_id).copied()
    }

    /// Full append-only switch log.
    pub fn log(&self) -> &[SwitchRecord] {
        &self.log
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
