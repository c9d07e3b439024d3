//! Accountant — realized profit and portfolio commit.
//!
//! Turns each active unit's hourly profit into CHF for the elapsed tick,
//! folds it into capital, and rebuilds the per-work-item split so that
//! every bucket (idle included) sums to capital exactly.

use rust_decimal::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::strategy::profit::ProfitModel;
use crate::types::{FleetError, Portfolio, Quote, Unit, IDLE_BUCKET};

/// Decimal places kept on realized amounts.
const MONEY_DP: u32 = 8;

// ---------------------------------------------------------------------------
// Realization
// ---------------------------------------------------------------------------

/// Profit realized by the fleet over one tick.
#[derive(Debug, Clone, Default)]
pub struct Realization {
    pub total: Decimal,
    /// Per-unit CHF, for active units that produced a number.
    pub by_unit: BTreeMap<String, Decimal>,
    /// Units whose profit could not be computed.
    pub failures: Vec<String>,
}

/// Outcome of a commit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommitReport {
    pub capital_before: Decimal,
    pub capital_after: Decimal,
    /// CHF backing each active unit.
    pub stake_per_unit: Decimal,
}

pub struct Accountant;

impl Accountant {
    /// Realize profit for every active unit on its assigned work item.
    ///
    /// A failed estimate increments the unit's `consecutive_failures`; a
    /// successful one resets it. Units on an unquoted work item realize
    /// nothing and keep their counter.
    pub fn realize(
        units: &mut [Unit],
        quotes: &BTreeMap<String, Quote>,
        model: &ProfitModel,
        hours: f64,
    ) -> Realization {
        let mut out = Realization::default();

        for unit in units.iter_mut().filter(|u| u.is_active()) {
            let Some(work_item_id) = unit.assigned_work_item.as_deref() else {
                continue;
            };
            let Some(quote) = quotes.get(work_item_id) else {
                debug!(unit_id = %unit.id, work_item_id, "Work item unquoted; no profit realized");
                continue;
            };

            let realized = model.estimate_profit(unit, quote).and_then(|hourly| {
                let chf = hourly * hours;
                Decimal::from_f64(chf).ok_or_else(|| FleetError::InvalidUnit {
                    unit_id: unit.id.clone(),
                    reason: format!("realized profit {chf:e} CHF is out of range"),
                })
            });

            match realized {
                Ok(amount) => {
                    unit.consecutive_failures = 0;
                    let amount = amount.round_dp(MONEY_DP);
                    out.total += amount;
                    out.by_unit.insert(unit.id.clone(), amount);
                }
                Err(e) => {
                    unit.consecutive_failures += 1;
                    warn!(
                        unit_id = %unit.id,
                        failures = unit.consecutive_failures,
                        error = %e,
                        "Profit computation failed"
                    );
                    out.failures.push(format!("{e} (failure #{})", unit.consecutive_failures));
                }
            }
        }
        out
    }

    /// Apply realized profit and rebuild the allocation split.
    ///
    /// Each active, assigned unit is backed by `min(threshold, capital / n)`;
    /// whatever is left sits in the idle bucket. Non-positive capital backs
    /// nothing.
    pub fn commit(
        portfolio: &mut Portfolio,
        units: &[Unit],
        realized: Decimal,
        scaling_threshold: Decimal,
    ) -> CommitReport {
        let capital_before = portfolio.capital;
        let capital = capital_before + realized;

        let backed: Vec<&str> = units
            .iter()
            .filter(|u| u.is_active())
            .filter_map(|u| u.assigned_work_item.as_deref())
            .collect();

        let stake = if capital <= Decimal::ZERO || backed.is_empty() {
            Decimal::ZERO
        } else {
            let even = (capital / Decimal::from(backed.len()))
                .round_dp_with_strategy(MONEY_DP, RoundingStrategy::ToZero);
            even.min(scaling_threshold)
        };

        let mut split: BTreeMap<String, Decimal> = BTreeMap::new();
        if stake > Decimal::ZERO {
            for work_item_id in &backed {
                *split.entry(work_item_id.to_string()).or_insert(Decimal::ZERO) += stake;
            }
        }
        let allocated: Decimal = split.values().copied().sum();
        split.insert(IDLE_BUCKET.to_string(), capital - allocated);

        portfolio.capital = capital;
        portfolio.allocation_by_work_item = split;

        info!(
            capital_before = %capital_before,
            capital_after = %capital,
            realized = %realized,
            backed_units = backed.len(),
            stake = %stake,
            "Portfolio committed"
        );

        CommitReport {
            capital_before,
            capital_after: capital,
            stake_per_unit: stake,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
