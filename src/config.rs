//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every scheduling and risk threshold is a required key: a missing value
//! is a parse error, and a zero value is rejected by [`AppConfig::validate`]
//! unless the matching check is listed in `risk.opt_out`.
//! Secrets (the oracle API key) are referenced by env-var name and
//! resolved at runtime via `std::env::var`.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::time::Duration;
use tracing::warn;

use crate::types::{Quote, Unit, WorkItem, IDLE_BUCKET};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub scheduling: SchedulingConfig,
    pub risk: RiskConfig,
    pub power: PowerConfig,
    pub oracle: OracleConfig,
    pub ledger: LedgerConfig,
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub work_items: Vec<WorkItemConfig>,
    #[serde(default)]
    pub units: Vec<UnitConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub tick_interval_secs: u64,
    pub initial_capital: Decimal,
    pub currency: String,
    pub quote_timeout_secs: u64,
    /// Completed cycles kept in memory for the operator API.
    pub history_limit: usize,
}

/// Allocation and switching thresholds.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SchedulingConfig {
    /// Capital required per active unit.
    pub scaling_threshold_chf: Decimal,
    /// Minimum ROI improvement (percent) before a unit changes work item.
    pub switch_threshold_pct: f64,
    /// Minimum time between two switches of the same unit.
    pub min_switch_interval_minutes: i64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            scaling_threshold_chf: dec!(150),
            switch_threshold_pct: 15.0,
            min_switch_interval_minutes: 30,
        }
    }
}

impl SchedulingConfig {
    pub fn min_switch_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.min_switch_interval_minutes)
    }
}

/// Safety checks that may be disabled explicitly.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCheck {
    StopLoss,
    Diversification,
    Failover,
    SwitchHysteresis,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RiskConfig {
    /// Drawdown from baseline (percent) that latches the emergency stop.
    pub stop_loss_threshold_pct: f64,
    pub max_single_work_item_allocation_pct: f64,
    pub max_consecutive_failures: u32,
    /// Checks the operator has deliberately switched off.
    #[serde(default)]
    pub opt_out: BTreeSet<SafetyCheck>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_threshold_pct: 5.0,
            max_single_work_item_allocation_pct: 40.0,
            max_consecutive_failures: 3,
            opt_out: BTreeSet::new(),
        }
    }
}

impl RiskConfig {
    pub fn is_enabled(&self, check: SafetyCheck) -> bool {
        !self.opt_out.contains(&check)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PowerConfig {
    pub electricity_rate_chf_per_kwh: f64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            electricity_rate_chf_per_kwh: 0.20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    /// "static" (quotes from this file) or "http".
    pub provider: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub static_quotes: Vec<StaticQuoteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StaticQuoteConfig {
    pub work_item_id: String,
    pub price: f64,
    pub difficulty: f64,
    #[serde(default)]
    pub volatility_pct: f64,
}

impl StaticQuoteConfig {
    pub fn to_quote(&self) -> Quote {
        Quote {
            work_item_id: self.work_item_id.clone(),
            price: self.price,
            difficulty: self.difficulty,
            volatility_pct: self.volatility_pct,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkItemConfig {
    pub id: String,
    pub difficulty_class: String,
    pub compatible_unit_kinds: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UnitConfig {
    pub id: String,
    pub kind: String,
    pub base_output_rate: f64,
    pub power_consumption_w: f64,
    #[serde(default = "default_efficiency")]
    pub efficiency_factor: f64,
}

fn default_efficiency() -> f64 {
    1.0
}

/// Thresholds consumed by the engine, detached from file layout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetConfig {
    pub scheduling: SchedulingConfig,
    pub risk: RiskConfig,
    pub power: PowerConfig,
    /// Hours of operation realized per tick.
    pub realization_hours: f64,
    pub quote_timeout: Duration,
    pub history_limit: usize,
}

impl FleetConfig {
    /// Defaults with a one-hour tick, for tests and embedding.
    pub fn hourly() -> Self {
        Self {
            realization_hours: 1.0,
            quote_timeout: Duration::from_secs(10),
            history_limit: 500,
            ..Default::default()
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject thresholds that would silently disable a safety check.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduling;
        let r = &self.risk;

        if s.scaling_threshold_chf <= Decimal::ZERO {
            bail!("scheduling.scaling_threshold_chf must be positive");
        }
        if self.agent.initial_capital < Decimal::ZERO {
            bail!("agent.initial_capital must not be negative");
        }
        if self.agent.tick_interval_secs == 0 {
            bail!("agent.tick_interval_secs must be positive");
        }
        if self.agent.quote_timeout_secs == 0 {
            bail!("agent.quote_timeout_secs must be positive");
        }
        if !self.power.electricity_rate_chf_per_kwh.is_finite()
            || self.power.electricity_rate_chf_per_kwh < 0.0
        {
            bail!("power.electricity_rate_chf_per_kwh must be a non-negative number");
        }

        if r.is_enabled(SafetyCheck::SwitchHysteresis)
            && (s.switch_threshold_pct <= 0.0 || s.min_switch_interval_minutes <= 0)
        {
            bail!(
                "switch_threshold_pct and min_switch_interval_minutes must be positive \
                 (add \"switch_hysteresis\" to risk.opt_out to disable the gate)"
            );
        }
        if r.is_enabled(SafetyCheck::StopLoss) && r.stop_loss_threshold_pct <= 0.0 {
            bail!(
                "risk.stop_loss_threshold_pct must be positive \
                 (add \"stop_loss\" to risk.opt_out to disable it)"
            );
        }
        if r.is_enabled(SafetyCheck::Diversification)
            && (r.max_single_work_item_allocation_pct <= 0.0
                || r.max_single_work_item_allocation_pct > 100.0)
        {
            bail!(
                "risk.max_single_work_item_allocation_pct must be in (0, 100] \
                 (add \"diversification\" to risk.opt_out to disable it)"
            );
        }
        if r.is_enabled(SafetyCheck::Failover) && r.max_consecutive_failures == 0 {
            bail!(
                "risk.max_consecutive_failures must be positive \
                 (add \"failover\" to risk.opt_out to disable it)"
            );
        }

        let mut seen = HashSet::new();
        for item in &self.work_items {
            if item.id == IDLE_BUCKET {
                bail!("work item id {IDLE_BUCKET} is reserved");
            }
            if !seen.insert(item.id.as_str()) {
                bail!("duplicate work item id: {}", item.id);
            }
        }

        let mut seen = HashSet::new();
        for unit in &self.units {
            if !seen.insert(unit.id.as_str()) {
                bail!("duplicate unit id: {}", unit.id);
            }
            let runnable = self
                .work_items
                .iter()
                .any(|w| w.compatible_unit_kinds.iter().any(|k| k == &unit.kind));
            if !runnable {
                warn!(unit_id = %unit.id, kind = %unit.kind, "No work item supports this unit kind");
            }
        }

        Ok(())
    }

    /// Immutable work item catalog.
    pub fn catalog(&self) -> Vec<WorkItem> {
        self.work_items
            .iter()
            .map(|w| WorkItem::new(&w.id, &w.difficulty_class, w.compatible_unit_kinds.iter().cloned()))
            .collect()
    }

    /// Fleet roster with every unit freshly provisioned.
    pub fn roster(&self) -> Vec<Unit> {
        self.units
            .iter()
            .map(|u| {
                Unit::new(
                    &u.id,
                    &u.kind,
                    u.base_output_rate,
                    u.power_consumption_w,
                    u.efficiency_factor,
                )
            })
            .collect()
    }

    /// Engine thresholds derived from this file.
    pub fn fleet(&self) -> FleetConfig {
        FleetConfig {
            scheduling: self.scheduling.clone(),
            risk: self.risk.clone(),
            power: self.power.clone(),
            realization_hours: self.agent.tick_interval_secs as f64 / 3600.0,
            quote_timeout: Duration::from_secs(self.agent.quote_timeout_secs),
            history_limit: self.agent.history_limit,
        }
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
