use crate::database::Database;
use crate::orchestrator::ScanOrchestrator;
use crate::schedules::ScheduleEngine;

/// Shared application state passed to all Axum handlers via `.with_state()`.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub orchestrator: ScanOrchestrator,
    pub schedules: ScheduleEngine,
}

impl AppState {
    pub fn new(db: Database, orchestrator: ScanOrchestrator, schedules: ScheduleEngine) -> Self {
        Self {
            db,
            orchestrator,
            schedules,
        }
    }
}
