//! Multi-cycle simulation harness.
//!
//! Drives the cycle engine through scripted markets and checks the
//! properties that must hold on every committed cycle: capital fully
//! accounted for, capital-limited admission, switching hysteresis, the
//! stop-loss latch, and failover.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rigwarden::config::{AppConfig, FleetConfig};
use rigwarden::engine::CycleEngine;
use rigwarden::market::fixed::FixedQuoteOracle;
use rigwarden::storage::MemoryLedger;
use rigwarden::types::{FleetError, Unit, UnitStatus, WorkItem};

use crate::mock_oracle::{round, BrokenLedger, Round, ScriptedOracle};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

fn at(minutes: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(minutes)
}

fn gpu_catalog() -> Vec<WorkItem> {
    vec![
        WorkItem::new("ethash", "mid", ["gpu"]),
        WorkItem::new("kawpow", "mid", ["gpu"]),
    ]
}

fn build(
    config: FleetConfig,
    catalog: Vec<WorkItem>,
    units: Vec<Unit>,
    capital: Decimal,
    oracle: &ScriptedOracle,
) -> (CycleEngine, MemoryLedger) {
    let ledger = MemoryLedger::new();
    let engine = CycleEngine::new(
        config,
        catalog,
        units,
        capital,
        Arc::new(oracle.clone()),
        Arc::new(ledger.clone()),
    );
    (engine, ledger)
}

// ---------------------------------------------------------------------------
// Invariants over a long run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_six_hour_run_holds_invariants() {
    let rounds: Vec<Round> = (0..36)
        .map(|i| {
            let x = i as f64;
            round(&[
                ("ethash", 1.0 + 0.5 * (x * 0.7).sin(), 10.0),
                ("kawpow", 1.0 + 0.5 * (x * 0.5).cos(), 10.0),
                ("sha256", 0.5 + 0.2 * (x * 0.3).sin(), 1.0),
            ])
        })
        .collect();
    let oracle = ScriptedOracle::new(rounds);

    let mut catalog = gpu_catalog();
    catalog.push(WorkItem::new("sha256", "high", ["asic"]));
    let units = vec![
        Unit::new("g1", "gpu", 60.0, 300.0, 1.0),
        Unit::new("g2", "gpu", 60.0, 300.0, 0.95),
        Unit::new("g3", "gpu", 55.0, 280.0, 1.0),
        Unit::new("g4", "gpu", 50.0, 300.0, 1.0),
        Unit::new("a1", "asic", 100.0, 3000.0, 1.0),
        Unit::new("a2", "asic", 100.0, 3000.0, 0.9),
    ];

    let mut config = FleetConfig::hourly();
    config.realization_hours = 10.0 / 60.0;
    let threshold = config.scheduling.scaling_threshold_chf;
    let (mut engine, ledger) = build(config, catalog, units, dec!(700), &oracle);

    for i in 0..36 {
        oracle.goto(i);
        let summary = engine.tick_at(at(10 * i as i64)).await.unwrap();
        let portfolio = engine.portfolio();

        assert_eq!(
            portfolio.allocated_total(),
            portfolio.capital,
            "cycle {} lost track of capital",
            summary.cycle_number
        );
        assert_eq!(summary.capital_after, portfolio.capital);

        let slots = (summary.capital_before / threshold)
            .floor()
            .to_usize()
            .unwrap_or(0);
        assert!(
            summary.allocations.len() <= slots,
            "cycle {}: {} units running on {} slots",
            summary.cycle_number,
            summary.allocations.len(),
            slots
        );

        for switch in &summary.switches {
            if let Some(pct) = switch.improvement_pct {
                assert!(pct >= 15.0, "switch below threshold: {switch:?}");
            }
        }
        assert!(!summary.halted);
    }

    // Every quote is profitable, so capital only grows.
    assert!(engine.portfolio().capital > dec!(700));
    assert_eq!(oracle.calls(), 36 * 3);

    // Cooldown: no unit switches twice within 30 minutes.
    let mut by_unit: HashMap<&str, Vec<DateTime<Utc>>> = HashMap::new();
    for record in engine.switch_log() {
        by_unit.entry(record.unit_id.as_str()).or_default().push(record.timestamp);
    }
    assert!(!by_unit.is_empty(), "oscillating prices should cause switches");
    for (unit_id, stamps) in by_unit {
        for pair in stamps.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::minutes(30),
                "{unit_id} switched twice within the cooldown"
            );
        }
    }

    let entries = ledger.entries();
    assert_eq!(entries.len(), 36);
    assert!(entries
        .iter()
        .enumerate()
        .all(|(i, s)| s.cycle_number == i as u64 + 1));
}

// ---------------------------------------------------------------------------
// Stop-loss
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_losses_during_cooldown_latch_stop_loss() {
    // One 1 MW unit: 200 CHF/h of power at 0.20 CHF/kWh.
    let oracle = ScriptedOracle::new(vec![
        round(&[("ethash", 0.21, 1.0)]),
        round(&[("ethash", 0.21, 1.0), ("kawpow", 0.5, 1.0)]),
        round(&[("ethash", 0.21, 1.0), ("kawpow", 0.0, 1.0)]),
    ]);
    let units = vec![Unit::new("big", "gpu", 1000.0, 1_000_000.0, 1.0)];
    let (mut engine, ledger) =
        build(FleetConfig::hourly(), gpu_catalog(), units, dec!(1000), &oracle);

    // Placed on ethash, then moved to kawpow while it pays.
    engine.tick_at(at(0)).await.unwrap();
    oracle.goto(1);
    let s = engine.tick_at(at(10)).await.unwrap();
    assert_eq!(s.switches.len(), 1);

    // Kawpow collapses; the cooldown keeps the unit there for two ticks.
    oracle.goto(2);
    let s = engine.tick_at(at(20)).await.unwrap();
    assert!(s.switches.is_empty());
    assert!(s.realized_profit < Decimal::ZERO);
    let s = engine.tick_at(at(30)).await.unwrap();
    assert!(s.switches.is_empty());
    assert!(engine.portfolio().capital < dec!(950));
    assert!(!engine.risk_state().emergency_stop);

    // The next risk pass sees the drawdown and latches.
    let s = engine.tick_at(at(40)).await.unwrap();
    assert!(s.halted);
    assert!(engine.risk_state().emergency_stop);
    assert!(s.risk_warnings.iter().any(|w| w.contains("Stop-loss")));

    // Latched: a far better market changes nothing.
    oracle.push(round(&[("ethash", 0.21, 1.0), ("kawpow", 5.0, 1.0)]));
    oracle.goto(3);
    for minutes in [50, 60, 120] {
        let s = engine.tick_at(at(minutes)).await.unwrap();
        assert!(s.halted);
        assert!(s.switches.is_empty());
        assert!(s.warnings.iter().any(|w| w.contains("Emergency stop")));
        assert!(engine.risk_state().emergency_stop);
    }
    let before_clear = engine.switch_log().len();

    // Operator clears; allocation resumes against a rebased baseline.
    assert!(engine.clear_emergency_stop());
    let p = engine.portfolio();
    assert_eq!(p.baseline_capital, p.capital);
    let s = engine.tick_at(at(130)).await.unwrap();
    assert!(!s.halted);
    assert_eq!(s.switches.len(), 1);
    assert_eq!(s.switches[0].to_work_item, "kawpow");
    assert_eq!(engine.switch_log().len(), before_clear + 1);

    let halted: Vec<bool> = ledger.entries().iter().map(|s| s.halted).collect();
    assert_eq!(
        halted,
        vec![false, false, false, false, true, true, true, true, false]
    );
}

// ---------------------------------------------------------------------------
// Failover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failover_then_short_handed() {
    let oracle = ScriptedOracle::new(vec![round(&[("sha256", 0.5, 1.0)])]);
    let catalog = vec![WorkItem::new("sha256", "high", ["asic"])];
    let units = vec![
        Unit::new("a1", "asic", 100.0, 3000.0, 1.0),
        Unit::new("a2", "asic", 100.0, 3000.0, 1.0),
        Unit::new("a3", "asic", 100.0, 3000.0, 1.0),
    ];
    // 300 CHF backs two units; a3 waits as standby.
    let (mut engine, _) = build(FleetConfig::hourly(), catalog, units, dec!(300), &oracle);

    engine.tick_at(at(0)).await.unwrap();
    assert!(engine.unit("a1").unwrap().is_active());
    assert!(engine.unit("a2").unwrap().is_active());
    assert!(engine.unit("a3").unwrap().is_standby());

    for _ in 0..3 {
        engine.report_unit_fault("a1", "hashboard offline").unwrap();
    }
    let s = engine.tick_at(at(10)).await.unwrap();
    assert_eq!(engine.unit("a1").unwrap().status, UnitStatus::BackedUp);
    let a3 = engine.unit("a3").unwrap();
    assert!(a3.is_active());
    assert_eq!(a3.assigned_work_item.as_deref(), Some("sha256"));
    assert_eq!(s.allocations.len(), 2);

    // Second failure: no standby left.
    for _ in 0..3 {
        engine.report_unit_fault("a2", "psu tripped").unwrap();
    }
    let s = engine.tick_at(at(20)).await.unwrap();
    assert_eq!(engine.unit("a2").unwrap().status, UnitStatus::Stranded);
    assert!(s
        .risk_warnings
        .iter()
        .any(|w| w.contains("No backup available for unit a2")));
    assert_eq!(s.allocations.len(), 1);

    // Deactivation happens once; the fleet keeps running short-handed.
    let s = engine.tick_at(at(30)).await.unwrap();
    assert!(!s.risk_warnings.iter().any(|w| w.contains("No backup")));
    assert!(engine.unit("a3").unwrap().is_active());
    assert!(s.realized_profit > Decimal::ZERO);
}

// ---------------------------------------------------------------------------
// Degraded inputs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_total_outage_then_recovery() {
    let oracle = ScriptedOracle::new(vec![
        round(&[("ethash", 1.0, 10.0), ("kawpow", 1.0, 10.0)]),
        round(&[]),
        round(&[("kawpow", 1.0, 10.0)]),
    ]);
    let units = vec![Unit::new("g1", "gpu", 60.0, 300.0, 1.0)];
    let (mut engine, ledger) =
        build(FleetConfig::hourly(), gpu_catalog(), units, dec!(500), &oracle);

    engine.tick_at(at(0)).await.unwrap();
    let capital = engine.portfolio().capital;

    oracle.goto(1);
    let err = engine.tick_at(at(10)).await.unwrap_err();
    assert!(matches!(err, FleetError::MarketDataOutage { work_items: 2 }));
    assert_eq!(engine.portfolio().capital, capital);
    assert_eq!(ledger.len(), 1);

    // Partial data is a normal cycle with a warning.
    oracle.goto(2);
    let s = engine.tick_at(at(20)).await.unwrap();
    assert_eq!(s.cycle_number, 2);
    assert!(s.warnings.iter().any(|w| w.contains("ethash")));
    assert_eq!(ledger.len(), 2);
}

#[tokio::test]
async fn test_broken_ledger_never_blocks_or_retries() {
    let oracle = ScriptedOracle::new(vec![round(&[("ethash", 1.0, 10.0)])]);
    let ledger = Arc::new(BrokenLedger::new());
    let mut engine = CycleEngine::new(
        FleetConfig::hourly(),
        gpu_catalog(),
        vec![Unit::new("g1", "gpu", 60.0, 300.0, 1.0)],
        dec!(500),
        Arc::new(oracle),
        ledger.clone(),
    );

    for i in 0..4 {
        engine.tick_at(at(10 * i)).await.unwrap();
    }
    assert_eq!(engine.cycle_count(), 4);
    assert_eq!(ledger.attempts.load(Ordering::SeqCst), 4);
    assert!(engine.portfolio().capital > dec!(500));
}

#[tokio::test]
async fn test_capital_below_threshold_runs_nothing() {
    let oracle = ScriptedOracle::new(vec![round(&[("ethash", 1.0, 10.0)])]);
    let units = vec![Unit::new("g1", "gpu", 60.0, 300.0, 1.0)];
    let (mut engine, _) = build(FleetConfig::hourly(), gpu_catalog(), units, dec!(100), &oracle);

    let s = engine.tick_at(at(0)).await.unwrap();
    assert!(s.allocations.is_empty());
    assert_eq!(s.realized_profit, Decimal::ZERO);
    assert_eq!(engine.portfolio().idle(), dec!(100));
    assert_eq!(engine.unit("g1").unwrap().status, UnitStatus::Provisioned);
}

// ---------------------------------------------------------------------------
// Configuration to engine
// ---------------------------------------------------------------------------

const CONFIG: &str = r#"
    [agent]
    name = "RIGWARDEN-IT"
    tick_interval_secs = 900
    initial_capital = 450.0
    currency = "CHF"
    quote_timeout_secs = 2
    history_limit = 10

    [scheduling]
    scaling_threshold_chf = 150.0
    switch_threshold_pct = 15.0
    min_switch_interval_minutes = 30

    [risk]
    stop_loss_threshold_pct = 5.0
    max_single_work_item_allocation_pct = 40.0
    max_consecutive_failures = 3

    [power]
    electricity_rate_chf_per_kwh = 0.25

    [oracle]
    provider = "static"

    [[oracle.static_quotes]]
    work_item_id = "sha256"
    price = 0.5
    difficulty = 1.0

    [[oracle.static_quotes]]
    work_item_id = "kawpow"
    price = 1.0
    difficulty = 10.0

    [ledger]
    path = "unused.jsonl"

    [dashboard]
    enabled = false
    port = 0

    [[work_items]]
    id = "sha256"
    difficulty_class = "high"
    compatible_unit_kinds = ["asic"]

    [[work_items]]
    id = "kawpow"
    difficulty_class = "mid"
    compatible_unit_kinds = ["gpu"]

    [[units]]
    id = "asic-01"
    kind = "asic"
    base_output_rate = 100.0
    power_consumption_w = 3000.0

    [[units]]
    id = "gpu-01"
    kind = "gpu"
    base_output_rate = 60.0
    power_consumption_w = 300.0
"#;

#[tokio::test]
async fn test_engine_from_config() {
    let cfg = AppConfig::parse(CONFIG).unwrap();
    let fleet = cfg.fleet();
    assert!((fleet.realization_hours - 0.25).abs() < 1e-12);

    let oracle = FixedQuoteOracle::with_quotes(cfg.oracle.static_quotes.iter().map(|q| q.to_quote()));
    let ledger = MemoryLedger::new();
    let mut engine = CycleEngine::new(
        fleet,
        cfg.catalog(),
        cfg.roster(),
        cfg.agent.initial_capital,
        Arc::new(oracle),
        Arc::new(ledger.clone()),
    );

    let s = engine.tick().await.unwrap();
    assert_eq!(s.allocations.len(), 2);
    // asic: (50 − 0.75) × 0.25 h; gpu: (6 − 0.075) × 0.25 h
    let expected = dec!(12.3125) + dec!(1.48125);
    assert!((s.realized_profit - expected).abs() < dec!(0.000001));
    assert_eq!(ledger.len(), 1);
}
