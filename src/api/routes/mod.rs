use std::fmt::Display;

use axum::{http::StatusCode, Json};
use serde_json::{json, Value};

pub mod endpoints;
pub mod scans;
pub mod schedules;
pub mod state;

/// Status plus `{"error": message}`
pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, message: impl Display) -> ApiError {
    if status.is_server_error() {
        log::error!("API error: {}", message);
    } else {
        log::debug!("API rejection ({}): {}", status, message);
    }
    (status, Json(json!({ "error": message.to_string() })))
}
