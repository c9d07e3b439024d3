//! Risk manager.
//!
//! Three independent checks, run every cycle in this order:
//!
//! 1. **Stop-loss**: drawdown from baseline capital at or beyond the
//!    threshold latches the emergency stop. The latch is one-way; only
//!    [`RiskManager::clear_emergency_stop`] resets it.
//! 2. **Diversification**: work items holding more than the allowed share
//!    of capital produce a warning and a proportional rebalancing suggestion
//!    for the next allocation pass. Advisory only.
//! 3. **Failover**: units at the consecutive-failure limit are deactivated
//!    and replaced by a standby of the same kind, when one exists.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use crate::config::{RiskConfig, SafetyCheck};
use crate::types::{FleetError, Portfolio, RiskState, Unit, UnitStatus, IDLE_BUCKET};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Proportional reductions for over-allocated work items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebalanceSuggestion {
    /// Work item → multiplier in (0, 1) bringing it back to the cap.
    pub reductions: BTreeMap<String, f64>,
}

impl RebalanceSuggestion {
    pub fn is_empty(&self) -> bool {
        self.reductions.is_empty()
    }
}

/// A standby promoted in place of a failed unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub failed_unit_id: String,
    pub backup_unit_id: String,
    pub work_item_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailoverOutcome {
    /// Units deactivated this cycle.
    pub deactivated: Vec<String>,
    pub promotions: Vec<Promotion>,
    /// Failed units left without a replacement.
    pub stranded: Vec<String>,
    pub warnings: Vec<String>,
}

/// Combined result of one risk pass.
#[derive(Debug, Clone, Default)]
pub struct RiskAssessment {
    pub emergency_stop: bool,
    /// The latch tripped during this pass.
    pub newly_latched: bool,
    pub rebalance: RebalanceSuggestion,
    pub failover: FailoverOutcome,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Risk manager
// ---------------------------------------------------------------------------

pub struct RiskManager {
    config: RiskConfig,
    state: RiskState,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            state: RiskState::default(),
        }
    }

    /// Snapshot of the process-wide risk state.
    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn is_halted(&self) -> bool {
        self.state.emergency_stop
    }

    /// Gate for any new allocation.
    pub fn ensure_can_allocate(&self) -> Result<(), FleetError> {
        if self.state.emergency_stop {
            let since = self
                .state
                .latched_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(FleetError::EmergencyStopActive { since });
        }
        Ok(())
    }

    /// Operator reset of the stop-loss latch. Returns whether it was set.
    pub fn clear_emergency_stop(&mut self) -> bool {
        let was_set = self.state.emergency_stop;
        self.state.emergency_stop = false;
        self.state.latched_at = None;
        if was_set {
            info!("Emergency stop cleared by operator");
        }
        was_set
    }

    /// Run all checks in order and refresh the risk state.
    pub fn assess(
        &mut self,
        portfolio: &Portfolio,
        units: &mut [Unit],
        now: DateTime<Utc>,
    ) -> RiskAssessment {
        let mut assessment = RiskAssessment::default();

        // 1. Stop-loss
        let was_halted = self.state.emergency_stop;
        if let Some(w) = self.check_stop_loss(portfolio, now) {
            assessment.warnings.push(w);
        }
        assessment.emergency_stop = self.state.emergency_stop;
        assessment.newly_latched = !was_halted && self.state.emergency_stop;

        // 2. Diversification
        let (warnings, rebalance) = self.check_diversification(portfolio);
        assessment.warnings.extend(warnings);
        assessment.rebalance = rebalance;

        // 3. Failover (promotion counts as a new allocation)
        let failover = self.check_failover(units, !self.state.emergency_stop);
        assessment.warnings.extend(failover.warnings.iter().cloned());
        assessment.failover = failover;

        self.state.last_assessment = Some(now);
        self.state.active_warnings = assessment.warnings.clone();
        assessment
    }

    /// Latch the emergency stop when drawdown reaches the threshold.
    /// Returns a warning while the latch is set.
    pub fn check_stop_loss(&mut self, portfolio: &Portfolio, now: DateTime<Utc>) -> Option<String> {
        if !self.config.is_enabled(SafetyCheck::StopLoss) {
            return None;
        }
        if self.state.emergency_stop {
            return Some("Emergency stop active: allocation halted until operator clears it".to_string());
        }

        let Some(change_pct) = portfolio.change_pct() else {
            warn!(baseline = %portfolio.baseline_capital, "Baseline capital not positive; stop-loss skipped");
            return None;
        };

        if change_pct <= -self.config.stop_loss_threshold_pct {
            self.state.emergency_stop = true;
            self.state.latched_at = Some(now);
            error!(
                capital = %portfolio.capital,
                baseline = %portfolio.baseline_capital,
                change = format!("{change_pct:.2}%"),
                threshold = format!("-{:.2}%", self.config.stop_loss_threshold_pct),
                "Stop-loss triggered; emergency stop latched"
            );
            return Some(format!(
                "Stop-loss triggered: capital {change_pct:.2}% vs baseline (limit -{:.2}%)",
                self.config.stop_loss_threshold_pct
            ));
        }
        None
    }

    /// Flag work items above the single-item cap and suggest reductions.
    pub fn check_diversification(&self, portfolio: &Portfolio) -> (Vec<String>, RebalanceSuggestion) {
        let mut warnings = Vec::new();
        let mut suggestion = RebalanceSuggestion::default();

        if !self.config.is_enabled(SafetyCheck::Diversification)
            || portfolio.capital <= Decimal::ZERO
        {
            return (warnings, suggestion);
        }

        let cap = self.config.max_single_work_item_allocation_pct;
        for (work_item_id, amount) in &portfolio.allocation_by_work_item {
            if work_item_id == IDLE_BUCKET {
                continue;
            }
            let Some(pct) = (*amount / portfolio.capital * Decimal::ONE_HUNDRED).to_f64() else {
                continue;
            };
            if pct > cap {
                warn!(
                    work_item_id = %work_item_id,
                    allocation = format!("{pct:.1}%"),
                    cap = format!("{cap:.1}%"),
                    "Diversification cap exceeded"
                );
                warnings.push(format!(
                    "{work_item_id} holds {pct:.1}% of capital (cap {cap:.1}%)"
                ));
                suggestion.reductions.insert(work_item_id.clone(), cap / pct);
            }
        }
        (warnings, suggestion)
    }

    /// Deactivate units at the failure limit and promote standbys.
    ///
    /// Only a unit that was running hands its work item to a standby; a
    /// parked or provisioned unit holds no capital slot, so it is stranded
    /// without promotion. Units already in `Failed` from an earlier pass
    /// (promotion was blocked by the emergency stop) are retried when
    /// `allow_promotion` is true.
    pub fn check_failover(&self, units: &mut [Unit], allow_promotion: bool) -> FailoverOutcome {
        let mut outcome = FailoverOutcome::default();
        if !self.config.is_enabled(SafetyCheck::Failover) {
            return outcome;
        }
        let limit = self.config.max_consecutive_failures;

        for unit in units.iter_mut() {
            if unit.status.is_schedulable() && unit.consecutive_failures >= limit {
                warn!(
                    unit_id = %unit.id,
                    failures = unit.consecutive_failures,
                    limit,
                    "Unit failure limit reached; deactivating"
                );
                outcome.deactivated.push(unit.id.clone());
                if unit.is_active() {
                    unit.status = UnitStatus::Failed;
                } else {
                    unit.status = UnitStatus::Stranded;
                    outcome.stranded.push(unit.id.clone());
                    outcome
                        .warnings
                        .push(format!("Unit {} failed while idle; no work to hand over", unit.id));
                }
            }
        }

        if !allow_promotion {
            return outcome;
        }

        let awaiting: Vec<usize> = (0..units.len())
            .filter(|&i| units[i].status == UnitStatus::Failed)
            .collect();

        for i in awaiting {
            let kind = units[i].kind.clone();
            let failed_id = units[i].id.clone();

            let Some(work_item_id) = units[i].assigned_work_item.clone() else {
                units[i].status = UnitStatus::Stranded;
                outcome.stranded.push(failed_id.clone());
                outcome
                    .warnings
                    .push(format!("Unit {failed_id} failed with no work item to hand over"));
                continue;
            };

            let backup = (0..units.len())
                .filter(|&j| j != i && units[j].kind == kind && units[j].is_standby())
                .min_by(|&a, &b| units[a].id.cmp(&units[b].id));

            match backup {
                Some(j) => {
                    units[j].assign(&work_item_id);
                    units[j].status = UnitStatus::Active;
                    units[i].status = UnitStatus::BackedUp;
                    info!(
                        failed = %failed_id,
                        backup = %units[j].id,
                        work_item_id = %work_item_id,
                        "Standby promoted"
                    );
                    outcome.promotions.push(Promotion {
                        failed_unit_id: failed_id,
                        backup_unit_id: units[j].id.clone(),
                        work_item_id,
                    });
                }
                None => {
                    units[i].status = UnitStatus::Stranded;
                    let err = FleetError::NoBackupAvailable {
                        unit_id: failed_id.clone(),
                        kind,
                    };
                    warn!(error = %err, "Fleet operating short-handed");
                    outcome.stranded.push(failed_id);
                    outcome.warnings.push(err.to_string());
                }
            }
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
