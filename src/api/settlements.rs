//! Settlement API Endpoints
//!
//! Read-only operator view over settlement records.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

use crate::chain::RequestId;
use crate::consensus::{AggregatorStatsSnapshot, ConsensusAggregator};
use crate::settlement::{SettlementRecord, SettlementState, SettlementStore};

/// API state for settlement endpoints
#[derive(Clone)]
pub struct SettlementApiState {
    pub store: Arc<dyn SettlementStore>,
    pub aggregator: Arc<ConsensusAggregator>,
}

// Response types

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cursor: Option<u64>,
    pub open_rounds: usize,
    pub failed_rounds: usize,
    pub scoring: AggregatorStatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct SettlementSummary {
    pub request_id: String,
    pub state: &'static str,
    pub detected_block: u64,
    pub verifiers: usize,
    pub excluded: usize,
    pub aggregate_score: Option<u8>,
    pub distributed: Option<u128>,
    pub outstanding_payouts: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<&SettlementRecord> for SettlementSummary {
    fn from(record: &SettlementRecord) -> Self {
        Self {
            request_id: record.request_id.to_string(),
            state: record.state.name(),
            detected_block: record.detected_block,
            verifiers: record.verifiers.len(),
            excluded: record.excluded.len(),
            aggregate_score: record.aggregate_score,
            distributed: record.allocation.as_ref().map(|a| a.distributed()),
            outstanding_payouts: record.outstanding_payouts(),
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SettlementListResponse {
    pub total: usize,
    pub settlements: Vec<SettlementSummary>,
}

#[derive(Debug, Serialize)]
pub struct FailedSettlement {
    pub request_id: String,
    pub stage: String,
    pub reason: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct FailedListResponse {
    pub total: usize,
    pub failed: Vec<FailedSettlement>,
}

fn internal_error(e: anyhow::Error) -> (StatusCode, String) {
    error!(error = %e, "Settlement store error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Settlement store unavailable".to_string(),
    )
}

// Handlers

/// Liveness plus a coarse view of the pipeline
pub async fn health(
    State(state): State<SettlementApiState>,
) -> Result<Json<HealthResponse>, (StatusCode, String)> {
    let cursor = state.store.load_cursor().await.map_err(internal_error)?;
    let open = state.store.list_open().await.map_err(internal_error)?;
    let failed = state.store.list_failed().await.map_err(internal_error)?;

    Ok(Json(HealthResponse {
        status: "ok",
        cursor,
        open_rounds: open.len(),
        failed_rounds: failed.len(),
        scoring: state.aggregator.stats(),
    }))
}

pub async fn list_settlements(
    State(state): State<SettlementApiState>,
) -> Result<Json<SettlementListResponse>, (StatusCode, String)> {
    let records = state.store.list().await.map_err(internal_error)?;
    let settlements: Vec<SettlementSummary> = records.iter().map(SettlementSummary::from).collect();

    Ok(Json(SettlementListResponse {
        total: settlements.len(),
        settlements,
    }))
}

/// Rounds that need operator attention
pub async fn list_failed(
    State(state): State<SettlementApiState>,
) -> Result<Json<FailedListResponse>, (StatusCode, String)> {
    let records = state.store.list_failed().await.map_err(internal_error)?;
    let failed: Vec<FailedSettlement> = records
        .iter()
        .filter_map(|record| match &record.state {
            SettlementState::Failed { stage, reason } => Some(FailedSettlement {
                request_id: record.request_id.to_string(),
                stage: stage.to_string(),
                reason: reason.clone(),
                updated_at: record.updated_at,
            }),
            _ => None,
        })
        .collect();

    Ok(Json(FailedListResponse {
        total: failed.len(),
        failed,
    }))
}

pub async fn get_settlement(
    State(state): State<SettlementApiState>,
    Path(request_id): Path<String>,
) -> Result<Json<SettlementRecord>, (StatusCode, String)> {
    let request_id = RequestId::parse(&request_id)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid request id: {}", e)))?;

    match state.store.load(&request_id).await.map_err(internal_error)? {
        Some(record) => Ok(Json(record)),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("No settlement for request {}", request_id),
        )),
    }
}

/// Create the settlement API router
pub fn create_settlement_router(state: SettlementApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/settlements", get(list_settlements))
        .route("/settlements/failed", get(list_failed))
        .route("/settlements/{request_id}", get(get_settlement))
        .with_state(state)
}
