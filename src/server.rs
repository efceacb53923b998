use axum::{
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState};
use crate::config::{Config, SourceMode};
use crate::database::Database;
use crate::endpoints::EndpointMetricsRecorder;
use crate::error::DocSweepError;
use crate::matcher::DocumentMatcher;
use crate::orchestrator::ScanOrchestrator;
use crate::relay::client::{MetricsSink, RelayClient};
use crate::scanner::EndpointScanner;
use crate::schedules::{ScheduleEngine, SchedulePoller};
use crate::sources::{platform_mounter, EndpointSource, RelaySource, ShareSource};

/// How long background tasks get to wind down after the listener closes
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// The controller: relay client, scan orchestrator, schedule poller and HTTP API
pub struct ControllerServer {
    config: Config,
    data_dir: PathBuf,
}

impl ControllerServer {
    pub fn new(config: Config, data_dir: PathBuf) -> Self {
        Self { config, data_dir }
    }

    pub async fn start(&self) -> Result<(), DocSweepError> {
        let db = Database::open(&self.data_dir)?;

        let recorder: Arc<dyn MetricsSink> = Arc::new(EndpointMetricsRecorder::new(db.clone()));
        let relay = RelayClient::new(self.config.controller.clone(), Some(recorder));
        let relay_task = relay.spawn();

        let scan = &self.config.scan;
        let source: Arc<dyn EndpointSource> = match scan.source_mode() {
            SourceMode::Share => Arc::new(ShareSource::new(scan, platform_mounter())),
            SourceMode::Relay => Arc::new(RelaySource::new(
                relay.clone(),
                Handle::current(),
                self.data_dir.join("staging"),
            )),
        };
        log::info!("Scans read endpoints through the '{}' source", scan.source);

        let tz = self.config.schedule.tz();
        let matcher = Arc::new(DocumentMatcher::with_lopdf(tz));
        let scanner = EndpointScanner::new(scan, source, matcher);
        let orchestrator = ScanOrchestrator::new(db.clone(), scanner, scan.workers);
        let engine = ScheduleEngine::new(db.clone(), tz);

        let shutdown = CancellationToken::new();
        let poller = SchedulePoller::new(
            engine.clone(),
            orchestrator.clone(),
            Duration::from_secs(self.config.schedule.poll_interval_secs),
        );
        let poller_task = tokio::spawn(poller.run(shutdown.clone()));

        let app = create_router(AppState::new(db, orchestrator.clone(), engine));

        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| DocSweepError::Error(format!("Invalid address: {}", e)))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DocSweepError::Error(format!("Failed to bind to {}: {}", addr, e)))?;

        println!("docsweep controller listening on http://{}", addr);
        log::info!("Server ready to handle requests");

        let stop_relay = relay.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                log::info!("Shutdown signal received, stopping background tasks...");
                println!("\nShutdown signal received - stopping server gracefully...");

                orchestrator.stop();
                shutdown.cancel();
                stop_relay.shutdown();
            })
            .await
            .map_err(|e| DocSweepError::Error(format!("Server error: {}", e)))?;

        if tokio::time::timeout(SHUTDOWN_GRACE, poller_task).await.is_err() {
            log::warn!("Schedule poller still busy at shutdown");
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, relay_task).await.is_err() {
            log::warn!("Relay client did not disconnect in time");
        }

        log::info!("Server shutdown complete");
        println!("   Server stopped");
        Ok(())
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Endpoints
        .route(
            "/api/endpoints",
            get(api::endpoints::list_endpoints).post(api::endpoints::create_endpoint),
        )
        // Scans
        .route("/api/scans/start", post(api::scans::start_scan))
        .route("/api/scans/status", get(api::scans::get_scan_status))
        .route("/api/scans/stop", post(api::scans::stop_scan))
        // Schedules
        .route(
            "/api/schedules",
            get(api::schedules::list_schedules).post(api::schedules::create_schedule),
        )
        .route(
            "/api/schedules/{id}",
            get(api::schedules::get_schedule)
                .put(api::schedules::update_schedule)
                .delete(api::schedules::delete_schedule),
        )
        .route("/api/schedules/{id}/toggle", patch(api::schedules::toggle_schedule))
        .with_state(state)
}

async fn health_check() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })),
    )
}

/// Resolves on Ctrl+C, or SIGTERM on unix
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            log::info!("Received SIGTERM");
        },
    }
}
