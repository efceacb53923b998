use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use rusqlite::ErrorCode;
use serde::Deserialize;

use crate::endpoints::{Endpoint, EndpointView};
use crate::error::DocSweepError;

use super::state::AppState;
use super::{api_error, ApiError};

/// Request body for registering an endpoint by hand
#[derive(Debug, Deserialize)]
pub struct CreateEndpointRequest {
    pub address: String,
    pub label: String,
    pub hostname: String,
}

fn is_unique_violation(e: &DocSweepError) -> bool {
    matches!(
        e,
        DocSweepError::DatabaseError(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation
    )
}

/// GET /api/endpoints
pub async fn list_endpoints(State(state): State<AppState>) -> Result<Json<Vec<EndpointView>>, ApiError> {
    let conn = state
        .db
        .get_connection()
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    let now = Utc::now().timestamp();

    let endpoints = Endpoint::list(&conn).map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(endpoints.into_iter().map(|e| e.view(now)).collect()))
}

/// POST /api/endpoints
pub async fn create_endpoint(
    State(state): State<AppState>,
    Json(request): Json<CreateEndpointRequest>,
) -> Result<(StatusCode, Json<EndpointView>), ApiError> {
    let address = request.address.trim();
    let hostname = request.hostname.trim();
    if address.is_empty() || hostname.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "address and hostname are required"));
    }
    let label = match request.label.trim() {
        "" => hostname,
        label => label,
    };

    let conn = state
        .db
        .get_connection()
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    match Endpoint::create(&conn, address, label, hostname) {
        Ok(endpoint) => {
            log::info!("Registered endpoint '{}' at {}", endpoint.hostname, endpoint.address);
            Ok((StatusCode::CREATED, Json(endpoint.view(Utc::now().timestamp()))))
        }
        Err(e) if is_unique_violation(&e) => Err(api_error(
            StatusCode::CONFLICT,
            format!("An endpoint named '{}' already exists", hostname),
        )),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::state::tests::test_state;

    fn request(hostname: &str) -> Json<CreateEndpointRequest> {
        Json(CreateEndpointRequest {
            address: "10.1.2.3".to_string(),
            label: String::new(),
            hostname: hostname.to_string(),
        })
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _ids) = test_state(dir.path(), &["PC1"]);

        let (status, Json(view)) = create_endpoint(State(state.clone()), request("RECEPTION"))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(view.endpoint.label, "RECEPTION");
        assert!(!view.online);

        let (status, _) = create_endpoint(State(state.clone()), request("reception"))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = create_endpoint(State(state.clone()), request("  "))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let Json(all) = list_endpoints(State(state)).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
