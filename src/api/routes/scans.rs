use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::orchestrator::{ScanStatus, StartRejected, StopAck};

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartScanRequest {
    pub endpoint_ids: Vec<i64>,
}

/// POST /api/scans/start
/// Start a run over the requested endpoints; the run continues in the background
pub async fn start_scan(
    State(state): State<AppState>,
    Json(request): Json<StartScanRequest>,
) -> (StatusCode, Json<Value>) {
    match state.orchestrator.start(&request.endpoint_ids) {
        Ok(_) => (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))),
        Err(rejected) => {
            let status = match rejected {
                StartRejected::AlreadyInProgress => StatusCode::CONFLICT,
                StartRejected::NoEndpoints | StartRejected::UnknownEndpoints(_) => StatusCode::BAD_REQUEST,
                StartRejected::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            log::info!("Scan start rejected: {}", rejected);
            (
                status,
                Json(json!({ "accepted": false, "reason": rejected.to_string() })),
            )
        }
    }
}

/// GET /api/scans/status
pub async fn get_scan_status(State(state): State<AppState>) -> Json<ScanStatus> {
    Json(state.orchestrator.status())
}

/// POST /api/scans/stop
pub async fn stop_scan(State(state): State<AppState>) -> Json<StopAck> {
    Json(state.orchestrator.stop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::state::tests::test_state;
    use crate::orchestrator::RunPhase;
    use std::time::Duration;

    async fn wait_idle(state: &AppState) {
        for _ in 0..200 {
            if !state.orchestrator.is_active() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("run never finished");
    }

    #[tokio::test]
    async fn test_start_rejections_are_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _ids) = test_state(dir.path(), &["PC1"]);

        let (status, Json(body)) = start_scan(
            State(state.clone()),
            Json(StartScanRequest { endpoint_ids: vec![] }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["accepted"], json!(false));

        let (status, Json(body)) = start_scan(
            State(state),
            Json(StartScanRequest { endpoint_ids: vec![404] }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["reason"].as_str().unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_start_status_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (state, ids) = test_state(dir.path(), &["PC1", "PC2"]);

        let (status, Json(body)) = start_scan(
            State(state.clone()),
            Json(StartScanRequest { endpoint_ids: ids }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, json!({ "accepted": true }));

        wait_idle(&state).await;

        let Json(status) = get_scan_status(State(state.clone())).await;
        assert_eq!(status.state, RunPhase::Idle);

        let Json(ack) = stop_scan(State(state)).await;
        assert!(ack.acknowledged);
        assert!(!ack.was_running);
    }
}
