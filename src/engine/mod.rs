//! Cycle engine — the fetch → allocate → switch → risk → realize → commit loop.
//!
//! One call to [`CycleEngine::tick`] runs a full cycle. Quotes are the only
//! thing awaited before the commit; everything from allocation to the
//! portfolio update runs synchronously on a working copy of the roster, so
//! dropping a tick mid-fetch leaves no trace. The ledger write happens after
//! the commit and its failure never undoes it.

pub mod accountant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{FleetConfig, SafetyCheck};
use crate::market::{fetch_quotes, MarketOracle};
use crate::storage::Ledger;
use crate::strategy::allocator::FleetAllocator;
use crate::strategy::profit::ProfitModel;
use crate::strategy::risk::RiskManager;
use crate::strategy::switcher::AlgorithmSwitcher;
use crate::types::{
    Allocation, CycleSummary, FleetError, Portfolio, Quote, RiskState, SwitchRecord, Unit,
    UnitStatus, WorkItem,
};

use accountant::Accountant;

pub struct CycleEngine {
    config: FleetConfig,
    catalog: Vec<WorkItem>,
    units: Vec<Unit>,
    portfolio: Portfolio,
    allocator: FleetAllocator,
    switcher: AlgorithmSwitcher,
    risk: RiskManager,
    oracle: Arc<dyn MarketOracle>,
    ledger: Arc<dyn Ledger>,
    history: VecDeque<CycleSummary>,
    cycle_count: u64,
}

impl CycleEngine {
    pub fn new(
        config: FleetConfig,
        catalog: Vec<WorkItem>,
        units: Vec<Unit>,
        initial_capital: Decimal,
        oracle: Arc<dyn MarketOracle>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        let model = ProfitModel::new(config.power.electricity_rate_chf_per_kwh);
        let allocator = FleetAllocator::new(config.scheduling.scaling_threshold_chf, model);
        let switcher = AlgorithmSwitcher::new(
            &config.scheduling,
            config.risk.is_enabled(SafetyCheck::SwitchHysteresis),
        );
        let risk = RiskManager::new(config.risk.clone());

        info!(
            units = units.len(),
            work_items = catalog.len(),
            capital = %initial_capital,
            oracle = oracle.name(),
            "Cycle engine ready"
        );

        Self {
            config,
            catalog,
            units,
            portfolio: Portfolio::new(initial_capital),
            allocator,
            switcher,
            risk,
            oracle,
            ledger,
            history: VecDeque::new(),
            cycle_count: 0,
        }
    }

    /// Run one cycle stamped with the current time.
    pub async fn tick(&mut self) -> Result<CycleSummary, FleetError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one cycle at an explicit instant. Cooldowns and latch timestamps
    /// use `now`, which lets callers drive simulated time.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<CycleSummary, FleetError> {
        let cycle_number = self.cycle_count + 1;
        info!(cycle = cycle_number, "Starting cycle");

        // 1. Quotes
        let book = fetch_quotes(self.oracle.as_ref(), &self.catalog, self.config.quote_timeout).await;
        if book.is_total_outage(self.catalog.len()) {
            let err = FleetError::MarketDataOutage {
                work_items: self.catalog.len(),
            };
            error!(cycle = cycle_number, error = %err, "Cycle aborted");
            return Err(err);
        }

        // Nothing below awaits until the commit is done.
        let mut units = self.units.clone();
        let mut warnings = book.warnings();
        let mut switches: Vec<SwitchRecord> = Vec::new();
        let halted = self.risk.is_halted();

        // 2–3. Allocate and gate switches
        match self.risk.ensure_can_allocate() {
            Ok(()) => {
                let plan = self.allocator.allocate(
                    &mut units,
                    &self.catalog,
                    &book.quotes,
                    self.portfolio.capital,
                );
                warnings.extend(plan.unit_errors.iter().cloned());

                for candidate in &plan.allocations {
                    let Some(unit) = units.iter_mut().find(|u| u.id == candidate.unit_id) else {
                        continue;
                    };
                    let current_roi = unit
                        .assigned_work_item
                        .as_deref()
                        .and_then(|w| plan.estimate(&unit.id, w))
                        .map(|e| e.roi);
                    let (_, record) = self.switcher.apply(unit, candidate, current_roi, now);
                    unit.status = UnitStatus::Active;
                    switches.extend(record);
                }
            }
            Err(e) => {
                warn!(cycle = cycle_number, error = %e, "Allocation skipped");
                warnings.push(e.to_string());
            }
        }

        // 4. Risk checks against the last committed portfolio
        let assessment = self.risk.assess(&self.portfolio, &mut units, now);
        self.allocator.apply_rebalance(&assessment.rebalance);

        // 5. Realized profit
        let realization = Accountant::realize(
            &mut units,
            &book.quotes,
            self.allocator.model(),
            self.config.realization_hours,
        );
        warnings.extend(realization.failures.iter().cloned());

        // 6. Commit
        let commit = Accountant::commit(
            &mut self.portfolio,
            &units,
            realization.total,
            self.config.scheduling.scaling_threshold_chf,
        );
        let allocations = running_allocations(&units, &book.quotes, self.allocator.model());
        self.units = units;
        self.cycle_count = cycle_number;

        let summary = CycleSummary {
            cycle_number,
            timestamp: now,
            capital_before: commit.capital_before,
            capital_after: commit.capital_after,
            realized_profit: realization.total,
            allocations,
            switches,
            risk_warnings: assessment.warnings,
            warnings,
            halted: halted || assessment.emergency_stop,
        };
        self.history.push_back(summary.clone());
        while self.history.len() > self.config.history_limit.max(1) {
            self.history.pop_front();
        }

        info!(summary = %summary, "Cycle complete");

        // 7. Ledger
        if let Err(e) = self.ledger.record_cycle(&summary).await {
            error!(cycle = cycle_number, error = %e, "Ledger write failed; cycle stays committed");
        }

        Ok(summary)
    }

    /// Operator reset of the stop-loss latch. Capital at the time of the
    /// reset becomes the new drawdown baseline.
    pub fn clear_emergency_stop(&mut self) -> bool {
        let cleared = self.risk.clear_emergency_stop();
        if cleared {
            self.portfolio.baseline_capital = self.portfolio.capital;
            info!(baseline = %self.portfolio.baseline_capital, "Stop-loss baseline rebased");
        }
        cleared
    }

    /// Count an externally observed fault (health probe, telemetry) against
    /// a unit. Faults add to `consecutive_failures` and are acted on by the
    /// next cycle's failover check; a successful realization resets them.
    pub fn report_unit_fault(&mut self, unit_id: &str, reason: &str) -> Result<u32, FleetError> {
        let unit = self
            .units
            .iter_mut()
            .find(|u| u.id == unit_id)
            .ok_or_else(|| FleetError::UnknownUnit(unit_id.to_string()))?;
        unit.consecutive_failures += 1;
        warn!(
            unit_id,
            reason,
            failures = unit.consecutive_failures,
            "Unit fault reported"
        );
        Ok(unit.consecutive_failures)
    }

    pub fn risk_state(&self) -> RiskState {
        self.risk.state().clone()
    }

    pub fn portfolio(&self) -> Portfolio {
        self.portfolio.clone()
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn unit(&self, unit_id: &str) -> Result<&Unit, FleetError> {
        self.units
            .iter()
            .find(|u| u.id == unit_id)
            .ok_or_else(|| FleetError::UnknownUnit(unit_id.to_string()))
    }

    pub fn catalog(&self) -> &[WorkItem] {
        &self.catalog
    }

    /// Recent cycle summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &CycleSummary> {
        self.history.iter()
    }

    pub fn switch_log(&self) -> &[SwitchRecord] {
        self.switcher.log()
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }
}

/// What every running unit is expected to earn on its current work item.
fn running_allocations(
    units: &[Unit],
    quotes: &BTreeMap<String, Quote>,
    model: &ProfitModel,
) -> Vec<Allocation> {
    units
        .iter()
        .filter(|u| u.is_active())
        .filter_map(|u| {
            let work_item_id = u.assigned_work_item.as_deref()?;
            let est = quotes
                .get(work_item_id)
                .and_then(|q| model.evaluate(u, q).ok());
            Some(Allocation {
                unit_id: u.id.clone(),
                work_item_id: work_item_id.to_string(),
                expected_hourly_profit: est.map_or(0.0, |e| e.hourly_profit),
                roi: est.map_or(0.0, |e| e.roi),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
