//! RIGWARDEN — risk-managed fleet allocation and scheduling core
//!
//! Entry point. Loads configuration, initialises structured logging,
//! builds the oracle, ledger and cycle engine, and runs the tick loop
//! with graceful shutdown.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use rigwarden::config::AppConfig;
use rigwarden::dashboard;
use rigwarden::engine::CycleEngine;
use rigwarden::market::fixed::FixedQuoteOracle;
use rigwarden::market::http::HttpQuoteOracle;
use rigwarden::market::MarketOracle;
use rigwarden::storage::JsonLinesLedger;
use rigwarden::types::{CycleSummary, FleetError};

const BANNER: &str = r#"
 ____  ___ ______        ___    ____  ____  _____ _   _
|  _ \|_ _/ ___\ \      / / \  |  _ \|  _ \| ____| \ | |
| |_) || | |  _ \ \ /\ / / _ \ | |_) | | | |  _| |  \| |
|  _ < | | |_| | \ V  V / ___ \|  _ <| |_| | |___| |\  |
|_| \_\___\____|  \_/\_/_/   \_\_| \_\____/|_____|_| \_|

  Risk-managed fleet allocation and scheduling
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("RIGWARDEN_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        tick_interval_secs = cfg.agent.tick_interval_secs,
        initial_capital = %cfg.agent.initial_capital,
        currency = %cfg.agent.currency,
        units = cfg.units.len(),
        work_items = cfg.work_items.len(),
        "RIGWARDEN starting up"
    );

    // -- Initialise components -------------------------------------------

    let oracle = build_oracle(&cfg)?;
    let ledger = Arc::new(JsonLinesLedger::new(&cfg.ledger.path));

    let engine = Arc::new(Mutex::new(CycleEngine::new(
        cfg.fleet(),
        cfg.catalog(),
        cfg.roster(),
        cfg.agent.initial_capital,
        oracle,
        ledger,
    )));

    if cfg.dashboard.enabled {
        dashboard::spawn_dashboard(engine.clone(), cfg.dashboard.port).await?;
    }

    // -- Main loop -------------------------------------------------------

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.agent.tick_interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.agent.tick_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let mut engine = engine.lock().await;
                match engine.tick().await {
                    Ok(summary) => log_cycle_summary(&summary),
                    Err(e @ FleetError::MarketDataOutage { .. }) => {
                        warn!(error = %e, "No market data this cycle; continuing to next");
                    }
                    Err(e) => {
                        error!(error = %e, "Cycle failed; continuing to next");
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    let engine = engine.lock().await;
    let portfolio = engine.portfolio();
    info!(
        capital = format!("CHF {:.2}", portfolio.capital),
        cycles = engine.cycle_count(),
        switches = engine.switch_log().len(),
        emergency_stop = engine.risk_state().emergency_stop,
        "RIGWARDEN shut down cleanly."
    );

    Ok(())
}

/// Build the market data provider named in the config.
fn build_oracle(cfg: &AppConfig) -> Result<Arc<dyn MarketOracle>> {
    match cfg.oracle.provider.as_str() {
        "static" => {
            if cfg.oracle.static_quotes.is_empty() {
                warn!("Static oracle has no quotes; every cycle will be an outage");
            }
            info!(quotes = cfg.oracle.static_quotes.len(), "Using static quote board");
            Ok(Arc::new(FixedQuoteOracle::with_quotes(
                cfg.oracle.static_quotes.iter().map(|q| q.to_quote()),
            )))
        }
        "http" => {
            let Some(base_url) = cfg.oracle.base_url.as_deref() else {
                return Err(FleetError::Config(
                    "oracle.base_url is required for the http provider".into(),
                )
                .into());
            };
            let api_key = match cfg.oracle.api_key_env.as_deref() {
                Some(env) => match AppConfig::resolve_env(env) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(error = %e, "Quote service key missing; calling without auth");
                        None
                    }
                },
                None => None,
            };
            info!(base_url, "Using HTTP quote service");
            Ok(Arc::new(HttpQuoteOracle::new(base_url, api_key)?))
        }
        other => Err(FleetError::Config(format!("unknown oracle provider: {other}")).into()),
    }
}

/// Log a human-readable cycle summary.
fn log_cycle_summary(summary: &CycleSummary) {
    info!(
        cycle = summary.cycle_number,
        units = summary.allocations.len(),
        switches = summary.switches.len(),
        profit = format!("CHF {:.4}", summary.realized_profit),
        capital = format!("CHF {:.2}", summary.capital_after),
        risk_warnings = summary.risk_warnings.len(),
        warnings = summary.warnings.len(),
        halted = summary.halted,
        "Cycle complete"
    );
    for w in &summary.risk_warnings {
        warn!(cycle = summary.cycle_number, warning = %w, "Risk");
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rigwarden=info"));

    let json_logging = std::env::var("RIGWARDEN_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
