//! Runs scans across endpoint fleets: one run at a time, a bounded number of
//! endpoints in flight, and per-endpoint failures that never sink the run.

use std::any::Any;
use std::cmp;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::bounded;
use log::{debug, error, info, warn};
use serde::Serialize;
use strum_macros::Display;
use threadpool::ThreadPool;
use tokio::sync::oneshot;

use crate::database::Database;
use crate::endpoints::Endpoint;
use crate::error::DocSweepError;
use crate::scanner::{EndpointReport, EndpointScanner};

/// Why `start` refused to begin a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartRejected {
    AlreadyInProgress,
    NoEndpoints,
    UnknownEndpoints(Vec<i64>),
    Unavailable(String),
}

impl fmt::Display for StartRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartRejected::AlreadyInProgress => write!(f, "A scan is already in progress"),
            StartRejected::NoEndpoints => write!(f, "No endpoints were requested"),
            StartRejected::UnknownEndpoints(ids) => {
                let ids: Vec<String> = ids.iter().map(i64::to_string).collect();
                write!(f, "Unknown endpoint ids: {}", ids.join(", "))
            }
            StartRejected::Unavailable(reason) => write!(f, "Scan could not start: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EndpointState {
    Queued,
    Scanning,
    Completed,
    Failed,
    /// Never dispatched because the run was stopped
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointProgress {
    pub endpoint_id: i64,
    pub hostname: String,
    pub state: EndpointState,
    #[serde(flatten)]
    pub report: EndpointReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final result of a run, delivered on the receiver returned by `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub successful: bool,
    pub processed: usize,
    pub failed: usize,
    pub stopped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub state: RunPhase,
    pub total: usize,
    pub completed: usize,
    pub progress_percent: f64,
    pub eta_seconds: Option<u64>,
    pub estimated_completion: Option<String>,
    pub failed_endpoints: Vec<String>,
    pub endpoints: Vec<EndpointProgress>,
    pub retry_attempts: BTreeMap<String, u32>,
    pub started_at: Option<String>,
    pub stopping: bool,
}

impl ScanStatus {
    fn idle() -> Self {
        ScanStatus {
            state: RunPhase::Idle,
            total: 0,
            completed: 0,
            progress_percent: 0.0,
            eta_seconds: None,
            estimated_completion: None,
            failed_endpoints: Vec::new(),
            endpoints: Vec::new(),
            retry_attempts: BTreeMap::new(),
            started_at: None,
            stopping: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopAck {
    pub acknowledged: bool,
    pub was_running: bool,
}

struct ScanRun {
    total: usize,
    completed: usize,
    endpoints: BTreeMap<i64, EndpointProgress>,
    failed_endpoints: Vec<String>,
    retry_attempts: BTreeMap<String, u32>,
    started_at: DateTime<Utc>,
    started: Instant,
    estimated_completion: Option<DateTime<Utc>>,
    cancel: Arc<AtomicBool>,
}

impl ScanRun {
    fn new(endpoints: &[Endpoint], cancel: Arc<AtomicBool>) -> Self {
        let progress = endpoints
            .iter()
            .map(|e| {
                (
                    e.endpoint_id,
                    EndpointProgress {
                        endpoint_id: e.endpoint_id,
                        hostname: e.hostname.clone(),
                        state: EndpointState::Queued,
                        report: EndpointReport::default(),
                        error: None,
                    },
                )
            })
            .collect();

        ScanRun {
            total: endpoints.len(),
            completed: 0,
            endpoints: progress,
            failed_endpoints: Vec::new(),
            retry_attempts: BTreeMap::new(),
            started_at: Utc::now(),
            started: Instant::now(),
            estimated_completion: None,
            cancel,
        }
    }

    fn set_state(&mut self, endpoint_id: i64, state: EndpointState) {
        if let Some(progress) = self.endpoints.get_mut(&endpoint_id) {
            progress.state = state;
        }
    }

    fn record(&mut self, endpoint_id: i64, result: Result<EndpointReport, DocSweepError>) {
        self.completed += 1;

        if let Some(progress) = self.endpoints.get_mut(&endpoint_id) {
            match result {
                Ok(report) => {
                    if report.credential_attempts > 0 {
                        self.retry_attempts
                            .insert(progress.hostname.clone(), report.credential_attempts);
                    }
                    progress.state = EndpointState::Completed;
                    progress.report = report;
                }
                Err(e) => {
                    progress.state = EndpointState::Failed;
                    progress.error = Some(e.to_string());
                    self.failed_endpoints.push(progress.hostname.clone());
                }
            }
        }

        // remaining time extrapolated from the average so far
        let remaining = self.total.saturating_sub(self.completed) as u32;
        let per_endpoint = self.started.elapsed() / self.completed.max(1) as u32;
        let estimate = per_endpoint * remaining;
        self.estimated_completion =
            Some(Utc::now() + chrono::Duration::from_std(estimate).unwrap_or_else(|_| chrono::Duration::zero()));
    }

    fn status(&self) -> ScanStatus {
        let now = Utc::now();
        let progress_percent = if self.total == 0 {
            0.0
        } else {
            (self.completed as f64 / self.total as f64 * 1000.0).round() / 10.0
        };

        ScanStatus {
            state: RunPhase::Running,
            total: self.total,
            completed: self.completed,
            progress_percent,
            eta_seconds: self
                .estimated_completion
                .map(|eta| (eta - now).num_seconds().max(0) as u64),
            estimated_completion: self
                .estimated_completion
                .map(|eta| eta.to_rfc3339_opts(SecondsFormat::Secs, true)),
            failed_endpoints: self.failed_endpoints.clone(),
            endpoints: self.endpoints.values().cloned().collect(),
            retry_attempts: self.retry_attempts.clone(),
            started_at: Some(self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            stopping: self.cancel.load(Ordering::Acquire),
        }
    }

    fn outcome(&self, aborted: bool) -> RunOutcome {
        let failed = self.failed_endpoints.len();
        RunOutcome {
            successful: !aborted && self.completed == self.total && failed == 0,
            processed: self.completed,
            failed,
            stopped: self.cancel.load(Ordering::Acquire),
        }
    }
}

enum RunState {
    Idle,
    Active(ScanRun),
}

struct OrchestratorInner {
    db: Database,
    scanner: EndpointScanner,
    workers: usize,
    state: Mutex<RunState>,
}

#[derive(Clone)]
pub struct ScanOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl ScanOrchestrator {
    pub fn new(db: Database, scanner: EndpointScanner, workers: usize) -> Self {
        ScanOrchestrator {
            inner: Arc::new(OrchestratorInner {
                db,
                scanner,
                workers: workers.max(1),
                state: Mutex::new(RunState::Idle),
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.inner.lock_state(), RunState::Active(_))
    }

    /// Begin a run over `endpoint_ids`. The receiver yields the outcome once
    /// the run has finished and the orchestrator is idle again.
    pub fn start(&self, endpoint_ids: &[i64]) -> Result<oneshot::Receiver<RunOutcome>, StartRejected> {
        let mut ids: Vec<i64> = Vec::with_capacity(endpoint_ids.len());
        for id in endpoint_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        if ids.is_empty() {
            return Err(StartRejected::NoEndpoints);
        }

        // Held until the run is installed, so concurrent starts serialize here
        let mut state = self.inner.lock_state();
        if let RunState::Active(_) = *state {
            return Err(StartRejected::AlreadyInProgress);
        }

        let (endpoints, missing) = self
            .inner
            .db
            .get_connection()
            .and_then(|conn| Endpoint::get_many(&conn, &ids))
            .map_err(|e| StartRejected::Unavailable(e.to_string()))?;
        if !missing.is_empty() {
            return Err(StartRejected::UnknownEndpoints(missing));
        }

        let cancel = Arc::new(AtomicBool::new(false));
        *state = RunState::Active(ScanRun::new(&endpoints, Arc::clone(&cancel)));

        let (reply_tx, reply_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("scan-run".to_string())
            .spawn(move || OrchestratorInner::drive(inner, endpoints, cancel, reply_tx));

        if let Err(e) = spawned {
            *state = RunState::Idle;
            return Err(StartRejected::Unavailable(e.to_string()));
        }

        info!("[SCAN] Run started over {} endpoints", ids.len());
        Ok(reply_rx)
    }

    pub fn status(&self) -> ScanStatus {
        match &*self.inner.lock_state() {
            RunState::Idle => ScanStatus::idle(),
            RunState::Active(run) => run.status(),
        }
    }

    /// Ask the active run to stop dispatching endpoints. In-flight endpoints finish.
    pub fn stop(&self) -> StopAck {
        match &*self.inner.lock_state() {
            RunState::Active(run) => {
                run.cancel.store(true, Ordering::Release);
                info!("[SCAN] Stop requested");
                StopAck {
                    acknowledged: true,
                    was_running: true,
                }
            }
            RunState::Idle => StopAck {
                acknowledged: true,
                was_running: false,
            },
        }
    }
}

impl OrchestratorInner {
    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        // A panic while holding the lock leaves a state that is still consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update<F: FnOnce(&mut ScanRun)>(&self, f: F) {
        if let RunState::Active(run) = &mut *self.lock_state() {
            f(run);
        }
    }

    fn drive(
        inner: Arc<OrchestratorInner>,
        endpoints: Vec<Endpoint>,
        cancel: Arc<AtomicBool>,
        reply: oneshot::Sender<RunOutcome>,
    ) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| inner.run_pool(endpoints, &cancel)));
        let outcome = inner.settle(result);

        info!(
            "[SCAN] Run finished: processed {}, failed {}, stopped {}, successful {}",
            outcome.processed, outcome.failed, outcome.stopped, outcome.successful
        );
        // API-started runs drop the receiver
        if reply.send(outcome).is_err() {
            debug!("[SCAN] Nobody was waiting for the run outcome");
        }
    }

    /// Close out the active run and return the slot to Idle
    fn settle(&self, result: thread::Result<Result<(), DocSweepError>>) -> RunOutcome {
        let aborted = match result {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!("[SCAN] Run aborted: {}", e);
                true
            }
            Err(panic) => {
                error!("[SCAN] Run aborted: {}", panic_message(panic.as_ref()));
                true
            }
        };

        let mut state = self.lock_state();
        let outcome = match &*state {
            RunState::Active(run) => run.outcome(aborted),
            RunState::Idle => RunOutcome {
                successful: false,
                processed: 0,
                failed: 0,
                stopped: false,
            },
        };
        *state = RunState::Idle;
        outcome
    }

    fn run_pool(self: &Arc<Self>, endpoints: Vec<Endpoint>, cancel: &Arc<AtomicBool>) -> Result<(), DocSweepError> {
        let num_threads = cmp::min(endpoints.len(), self.workers).max(1);
        let pool = ThreadPool::new(num_threads);

        // Rendezvous: an endpoint is handed over only when a worker is free
        let (sender, receiver) = bounded::<Endpoint>(0);

        for _ in 0..num_threads {
            let receiver = receiver.clone();
            let inner = Arc::clone(self);
            pool.execute(move || {
                while let Ok(endpoint) = receiver.recv() {
                    inner.process_endpoint(endpoint);
                }
            });
        }
        drop(receiver);

        let mut pending = endpoints.into_iter();
        for endpoint in pending.by_ref() {
            if cancel.load(Ordering::Acquire) {
                self.update(|run| run.set_state(endpoint.endpoint_id, EndpointState::Skipped));
                break;
            }
            sender
                .send(endpoint)
                .map_err(|_| DocSweepError::Error("scan workers exited early".to_string()))?;
        }
        for endpoint in pending {
            self.update(|run| run.set_state(endpoint.endpoint_id, EndpointState::Skipped));
        }

        drop(sender);
        pool.join();
        Ok(())
    }

    fn process_endpoint(&self, endpoint: Endpoint) {
        let endpoint_id = endpoint.endpoint_id;
        self.update(|run| run.set_state(endpoint_id, EndpointState::Scanning));

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.scanner.scan_endpoint(&endpoint)))
            .unwrap_or_else(|panic| {
                Err(DocSweepError::endpoint(
                    &endpoint.hostname,
                    format!("worker panicked: {}", panic_message(panic.as_ref())),
                ))
            });

        match &result {
            Ok(_) => {
                let touched = self
                    .db
                    .get_connection()
                    .and_then(|conn| Endpoint::touch(&conn, &endpoint.hostname));
                if let Err(e) = touched {
                    warn!("[SCAN] {}: could not update last_seen: {}", endpoint.hostname, e);
                }
            }
            Err(e) => warn!("[SCAN] {}", e),
        }
        self.update(|run| run.record(endpoint_id, result));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
