//! Fleet allocator.
//!
//! Ranks every schedulable unit by the best ROI it can reach on any
//! compatible, quoted work item, then admits units in descending order until
//! the capital-limited slot count is filled.
//!
//! ```text
//! units × quoted work items ──► best ROI per unit ──► sort desc ──► admit ≤ floor(capital / threshold)
//! ```
//!
//! # Invariants
//! - Work items without a quote this cycle are never chosen
//! - Ties on ROI go to the lowest work item id, then the lowest unit id
//! - Non-admitted units are parked, never removed, and keep their assignment
//! - Zero eligible units is an empty plan, not an error

use rust_decimal::prelude::*;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::profit::{ProfitEstimate, ProfitModel};
use super::risk::RebalanceSuggestion;
use crate::types::{Allocation, FleetError, Quote, Unit, UnitStatus, WorkItem};

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Result of one allocation pass.
#[derive(Debug, Clone, Default)]
pub struct AllocationPlan {
    /// Admitted units with their best work item, in admission order.
    pub allocations: Vec<Allocation>,
    /// Active units that could not be scored and keep their assignment.
    pub held: Vec<String>,
    /// Schedulable units left out this cycle.
    pub parked: Vec<String>,
    /// Catalog entries without a usable quote this cycle.
    pub excluded_work_items: Vec<String>,
    /// Per-unit scoring failures.
    pub unit_errors: Vec<String>,
    /// Active slots granted by capital.
    pub slots: usize,
    estimates: BTreeMap<(String, String), ProfitEstimate>,
}

impl AllocationPlan {
    /// Profit/ROI of a unit on a specific work item, if it was scored.
    pub fn estimate(&self, unit_id: &str, work_item_id: &str) -> Option<ProfitEstimate> {
        self.estimates
            .get(&(unit_id.to_string(), work_item_id.to_string()))
            .copied()
    }

    pub fn is_admitted(&self, unit_id: &str) -> bool {
        self.allocations.iter().any(|a| a.unit_id == unit_id)
    }
}

/// A unit's best candidate before admission.
#[derive(Debug, Clone)]
struct Candidate {
    allocation: Allocation,
    /// ROI after any diversification penalty.
    score: f64,
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

pub struct FleetAllocator {
    scaling_threshold: Decimal,
    model: ProfitModel,
    /// Ranking multipliers from last cycle's diversification check.
    penalties: BTreeMap<String, f64>,
}

impl FleetAllocator {
    pub fn new(scaling_threshold: Decimal, model: ProfitModel) -> Self {
        Self {
            scaling_threshold,
            model,
            penalties: BTreeMap::new(),
        }
    }

    pub fn model(&self) -> &ProfitModel {
        &self.model
    }

    /// Replace the ranking penalties with a fresh suggestion. Each factor is
    /// clamped to (0, 1]; work items absent from the suggestion carry none.
    pub fn apply_rebalance(&mut self, suggestion: &RebalanceSuggestion) {
        self.penalties = suggestion
            .reductions
            .iter()
            .filter(|(_, f)| f.is_finite() && **f > 0.0)
            .map(|(id, f)| (id.clone(), f.min(1.0)))
            .collect();
        if !self.penalties.is_empty() {
            info!(penalised = ?self.penalties, "Diversification penalties applied to ranking");
        }
    }

    /// Ranking multiplier currently applied to a work item.
    pub fn penalty(&self, work_item_id: &str) -> f64 {
        self.penalties.get(work_item_id).copied().unwrap_or(1.0)
    }

    /// Number of units capital can back: `floor(capital / threshold)`,
    /// capped at fleet size.
    pub fn active_slots(&self, capital: Decimal, fleet_size: usize) -> usize {
        if capital <= Decimal::ZERO || self.scaling_threshold <= Decimal::ZERO {
            return 0;
        }
        (capital / self.scaling_threshold)
            .floor()
            .to_usize()
            .unwrap_or(usize::MAX)
            .min(fleet_size)
    }

    fn score(&self, work_item_id: &str, roi: f64) -> f64 {
        let factor = self.penalty(work_item_id);
        roi - roi.abs() * (1.0 - factor)
    }

    /// Rank and admit units for this cycle.
    ///
    /// Parks schedulable units that are not admitted. Admitted units are
    /// returned with their best candidate; putting them on it is left to the
    /// caller so the switch gate can intervene.
    pub fn allocate(
        &self,
        units: &mut [Unit],
        work_items: &[WorkItem],
        quotes: &BTreeMap<String, Quote>,
        capital: Decimal,
    ) -> AllocationPlan {
        let mut plan = AllocationPlan {
            slots: self.active_slots(capital, units.len()),
            ..Default::default()
        };

        let mut catalog: Vec<&WorkItem> = work_items.iter().collect();
        catalog.sort_by(|a, b| a.id.cmp(&b.id));
        for item in &catalog {
            if !quotes.contains_key(&item.id) {
                info!(work_item_id = %item.id, "No quote this cycle; work item excluded");
                plan.excluded_work_items.push(item.id.clone());
            }
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut held: Vec<String> = Vec::new();

        for unit in units.iter().filter(|u| u.status.is_schedulable()) {
            match self.best_candidate(unit, &catalog, quotes, &mut plan) {
                Ok(Some(c)) if c.allocation.expected_hourly_profit > 0.0 => candidates.push(c),
                Ok(Some(c)) => {
                    debug!(
                        unit_id = %unit.id,
                        work_item_id = %c.allocation.work_item_id,
                        profit = c.allocation.expected_hourly_profit,
                        "Best candidate unprofitable; not admitted"
                    );
                }
                Ok(None) if unit.is_active() => held.push(unit.id.clone()),
                Ok(None) => debug!(unit_id = %unit.id, "No quoted work item for this unit"),
                Err(e) => {
                    plan.unit_errors.push(e.to_string());
                    if unit.is_active() {
                        held.push(unit.id.clone());
                    }
                }
            }
        }

        if candidates.is_empty() && held.is_empty() {
            info!(reason = %FleetError::NoEligibleUnits, "Empty allocation");
        }

        // Held units occupy slots first, by id.
        held.sort();
        let held_slots = held.len().min(plan.slots);
        plan.held = held[..held_slots].to_vec();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.allocation.unit_id.cmp(&b.allocation.unit_id))
        });
        let open = plan.slots - held_slots;
        for c in candidates.into_iter().take(open) {
            debug!(allocation = %c.allocation, score = c.score, "Unit admitted");
            plan.allocations.push(c.allocation);
        }

        for unit in units.iter_mut().filter(|u| u.status.is_schedulable()) {
            if plan.is_admitted(&unit.id) || plan.held.contains(&unit.id) {
                continue;
            }
            if unit.status == UnitStatus::Active {
                unit.status = UnitStatus::Parked;
                info!(unit_id = %unit.id, "Unit parked");
            }
            plan.parked.push(unit.id.clone());
        }

        info!(
            slots = plan.slots,
            admitted = plan.allocations.len(),
            held = plan.held.len(),
            parked = plan.parked.len(),
            excluded = plan.excluded_work_items.len(),
            "Allocation complete"
        );
        plan
    }

    /// Best-scoring compatible work item for one unit, recording every
    /// estimate on the plan. `Ok(None)` when nothing compatible is quoted.
    fn best_candidate(
        &self,
        unit: &Unit,
        catalog: &[&WorkItem],
        quotes: &BTreeMap<String, Quote>,
        plan: &mut AllocationPlan,
    ) -> Result<Option<Candidate>, FleetError> {
        let mut best: Option<Candidate> = None;

        for item in catalog.iter().filter(|w| w.supports(&unit.kind)) {
            let Some(quote) = quotes.get(&item.id) else {
                continue;
            };
            let est = match self.model.evaluate(unit, quote) {
                Ok(est) => est,
                Err(e @ FleetError::InvalidUnit { .. }) => return Err(e),
                Err(e) => {
                    debug!(unit_id = %unit.id, error = %e, "Estimate skipped");
                    continue;
                }
            };
            plan.estimates
                .insert((unit.id.clone(), item.id.clone()), est);

            let score = self.score(&item.id, est.roi);
            // Catalog is sorted by id, so strict > keeps the lowest id on ties.
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(Candidate {
                    allocation: Allocation {
                        unit_id: unit.id.clone(),
                        work_item_id: item.id.clone(),
                        expected_hourly_profit: est.hourly_profit,
                        roi: est.roi,
                    },
                    score,
                });
            }
        }
        Ok(best)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
