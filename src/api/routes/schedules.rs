use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::error::DocSweepError;
use crate::schedules::{Schedule, ScheduleParams};

use super::state::AppState;
use super::{api_error, ApiError};

/// Request body for toggling schedule enabled status
#[derive(Debug, Deserialize)]
pub struct ToggleScheduleRequest {
    pub enabled: bool,
}

fn schedule_error(e: DocSweepError) -> ApiError {
    match e {
        DocSweepError::ScheduleConflict(_) => api_error(StatusCode::CONFLICT, e),
        DocSweepError::InvalidSchedule(_) => api_error(StatusCode::BAD_REQUEST, e),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other),
    }
}

fn not_found(schedule_id: i64) -> ApiError {
    api_error(StatusCode::NOT_FOUND, format!("Schedule {} not found", schedule_id))
}

/// GET /api/schedules
pub async fn list_schedules(State(state): State<AppState>) -> Result<Json<Vec<Schedule>>, ApiError> {
    state.schedules.list().map(Json).map_err(schedule_error)
}

/// POST /api/schedules
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(params): Json<ScheduleParams>,
) -> Result<(StatusCode, Json<Schedule>), ApiError> {
    let schedule = state.schedules.create(params).map_err(schedule_error)?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /api/schedules/{id}
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<i64>,
) -> Result<Json<Schedule>, ApiError> {
    state
        .schedules
        .get(schedule_id)
        .map_err(schedule_error)?
        .map(Json)
        .ok_or_else(|| not_found(schedule_id))
}

/// PUT /api/schedules/{id}
/// Replace the definition; use PATCH .../toggle for enable/disable
pub async fn update_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<i64>,
    Json(params): Json<ScheduleParams>,
) -> Result<Json<Schedule>, ApiError> {
    state
        .schedules
        .update(schedule_id, params)
        .map_err(schedule_error)?
        .map(Json)
        .ok_or_else(|| not_found(schedule_id))
}

/// DELETE /api/schedules/{id}
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    match state.schedules.delete(schedule_id).map_err(schedule_error)? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(not_found(schedule_id)),
    }
}

/// PATCH /api/schedules/{id}/toggle
pub async fn toggle_schedule(
    State(state): State<AppState>,
    Path(schedule_id): Path<i64>,
    Json(request): Json<ToggleScheduleRequest>,
) -> Result<Json<Schedule>, ApiError> {
    state
        .schedules
        .set_enabled(schedule_id, request.enabled)
        .map_err(schedule_error)?
        .map(Json)
        .ok_or_else(|| not_found(schedule_id))
}
