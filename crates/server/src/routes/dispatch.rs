use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use shared::{DispatchRequest, EnqueueResponse, MessageLog, QuotaDecision};

use crate::{error::AppError, state::AppState};

const MAX_LOG_PAGE: usize = 500;

/// Queue a single, bulk, or scheduled send
/// POST /dispatch
pub async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    let job_id = state.dispatcher.enqueue_dispatch(request).await?;
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id })))
}

/// GET /quota/:owner
pub async fn check_quota(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> Result<Json<QuotaDecision>, AppError> {
    Ok(Json(state.quota.check_quota(&owner_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

/// Most recent message log rows for an owner
/// GET /messages/:owner?limit=N
pub async fn list_messages(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<MessageLog>>, AppError> {
    let limit = query.limit.unwrap_or(100).clamp(1, MAX_LOG_PAGE);
    Ok(Json(state.logs.logs_for_owner(&owner_id, limit).await?))
}
