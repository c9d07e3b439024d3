//! Operator API route handlers.
//!
//! All endpoints return JSON. Handlers lock the shared engine, so they wait
//! for an in-flight cycle to commit before answering.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::engine::CycleEngine;
use crate::types::{CycleSummary, FleetError, Portfolio, RiskState, SwitchRecord, Unit};

/// Shared engine handle.
pub type AppState = Arc<Mutex<CycleEngine>>;

/// Cycles returned by `/api/cycles`.
const MAX_CYCLES: usize = 100;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ClearResponse {
    /// Whether the latch was set before the call.
    pub cleared: bool,
    pub baseline_capital: f64,
    pub cleared_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FaultReport {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaultResponse {
    pub unit_id: String,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetResponse {
    pub cycle_count: u64,
    pub active: usize,
    pub units: Vec<Unit>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/risk
pub async fn get_risk(State(state): State<AppState>) -> Json<RiskState> {
    let engine = state.lock().await;
    Json(engine.risk_state())
}

/// POST /api/risk/clear
pub async fn clear_emergency_stop(State(state): State<AppState>) -> Json<ClearResponse> {
    let mut engine = state.lock().await;
    let cleared = engine.clear_emergency_stop();
    let baseline = engine.portfolio().baseline_capital;
    info!(cleared, "Operator cleared emergency stop via API");

    Json(ClearResponse {
        cleared,
        baseline_capital: baseline.to_f64().unwrap_or(0.0),
        cleared_at: Utc::now(),
    })
}

/// GET /api/portfolio
pub async fn get_portfolio(State(state): State<AppState>) -> Json<Portfolio> {
    let engine = state.lock().await;
    Json(engine.portfolio())
}

/// GET /api/fleet
pub async fn get_fleet(State(state): State<AppState>) -> Json<FleetResponse> {
    let engine = state.lock().await;
    let units = engine.units().to_vec();
    Json(FleetResponse {
        cycle_count: engine.cycle_count(),
        active: units.iter().filter(|u| u.is_active()).count(),
        units,
    })
}

/// POST /api/units/:id/fault
pub async fn report_fault(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
    Json(report): Json<FaultReport>,
) -> Result<Json<FaultResponse>, (StatusCode, String)> {
    let mut engine = state.lock().await;
    match engine.report_unit_fault(&unit_id, &report.reason) {
        Ok(consecutive_failures) => Ok(Json(FaultResponse {
            unit_id,
            consecutive_failures,
        })),
        Err(e @ FleetError::UnknownUnit(_)) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// GET /api/cycles
pub async fn get_cycles(State(state): State<AppState>) -> Json<Vec<CycleSummary>> {
    let engine = state.lock().await;
    let all: Vec<CycleSummary> = engine.history().cloned().collect();
    let start = all.len().saturating_sub(MAX_CYCLES);
    Json(all[start..].to_vec())
}

/// GET /api/switches
pub async fn get_switches(State(state): State<AppState>) -> Json<Vec<SwitchRecord>> {
    let engine = state.lock().await;
    Json(engine.switch_log().to_vec())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
