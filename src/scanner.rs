use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, Level};
use logging_timer::timer;
use serde::Serialize;

use crate::config::ScanConfig;
use crate::endpoints::Endpoint;
use crate::error::DocSweepError;
use crate::matcher::{Classification, DocumentKind, DocumentMatcher};
use crate::relay::protocol::RemoteFileEntry;
use crate::sources::{EndpointSource, OpenedSession};

/// What happened on one endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointReport {
    pub candidates: usize,
    pub imported: usize,
    pub duplicates: usize,
    /// Unreadable, unclassifiable or nameless candidates
    pub skipped: usize,
    pub credential_attempts: u32,
}

/// Runs the collection pipeline against one endpoint at a time
pub struct EndpointScanner {
    source: Arc<dyn EndpointSource>,
    matcher: Arc<DocumentMatcher>,
    destination: PathBuf,
    user_folders: Vec<String>,
    max_depth: usize,
}

impl EndpointScanner {
    pub fn new(config: &ScanConfig, source: Arc<dyn EndpointSource>, matcher: Arc<DocumentMatcher>) -> Self {
        EndpointScanner {
            source,
            matcher,
            destination: config.destination.clone(),
            user_folders: config.user_folders.clone(),
            max_depth: config.max_depth,
        }
    }

    /// Per-endpoint collection directory
    pub fn partition(&self, endpoint: &Endpoint) -> PathBuf {
        self.destination.join(&endpoint.hostname)
    }

    pub fn scan_endpoint(&self, endpoint: &Endpoint) -> Result<EndpointReport, DocSweepError> {
        let _tmr = timer!(Level::Trace; "scan_endpoint", "{}", endpoint.hostname);
        let hostname = endpoint.hostname.as_str();

        let mut opened = self.source.open(endpoint)?;
        let mut report = EndpointReport {
            credential_attempts: opened.credential_attempts(),
            ..EndpointReport::default()
        };

        let candidates = opened
            .candidates(&self.user_folders, self.max_depth)
            .map_err(|e| DocSweepError::endpoint(hostname, format!("enumeration failed: {}", e)))?;
        report.candidates = candidates.len();
        info!("[SCAN] {}: {} candidate files", hostname, candidates.len());

        let partition = self.partition(endpoint);
        for entry in candidates {
            self.process_candidate(hostname, &mut opened, &entry, &partition, &mut report)
                .map_err(|e| DocSweepError::endpoint(hostname, e.to_string()))?;
        }

        opened
            .release()
            .map_err(|e| DocSweepError::endpoint(hostname, format!("release failed: {}", e)))?;

        info!(
            "[SCAN] {}: imported {}, duplicates {}, skipped {}",
            hostname, report.imported, report.duplicates, report.skipped
        );
        Ok(report)
    }

    fn process_candidate(
        &self,
        hostname: &str,
        opened: &mut OpenedSession,
        entry: &RemoteFileEntry,
        partition: &Path,
        report: &mut EndpointReport,
    ) -> Result<(), DocSweepError> {
        let _tmr = timer!(Level::Trace; "process_candidate", "{}", entry.path);

        // Cheap name check before reading anything from the endpoint
        if DocumentKind::infer(Path::new(&entry.name)).is_none() {
            report.skipped += 1;
            return Ok(());
        }

        let local = match opened.session().materialize(entry)? {
            Some(local) => local,
            None => {
                debug!("[SCAN] {}: {} is not readable", hostname, entry.path);
                report.skipped += 1;
                return Ok(());
            }
        };

        let modified = Self::modified_time(entry, &local);
        let mut record = match self.matcher.classify(&local, modified, partition) {
            Ok(Classification::Accepted(record)) => record,
            Ok(Classification::NoIdentity(kind)) => {
                debug!("[SCAN] {}: no {} identity in {}", hostname, kind.long_name(), entry.path);
                report.skipped += 1;
                return Ok(());
            }
            Ok(Classification::Unclassified) => {
                report.skipped += 1;
                return Ok(());
            }
            Err(e) => {
                debug!("[SCAN] {}: could not read {}: {}", hostname, entry.path, e);
                report.skipped += 1;
                return Ok(());
            }
        };
        record.source_path = PathBuf::from(&entry.path);

        if let Some(existing) = self.matcher.find_duplicate(&record)? {
            info!(
                "[SCAN] {}: {} already collected as {}",
                hostname,
                entry.path,
                existing.display()
            );
            report.duplicates += 1;
            return Ok(());
        }

        fs::create_dir_all(partition)?;
        fs::copy(&local, &record.destination_path)?;
        info!(
            "[SCAN] {}: collected {} as {}",
            hostname,
            entry.path,
            record.file_name()
        );
        report.imported += 1;
        Ok(())
    }

    fn modified_time(entry: &RemoteFileEntry, local: &Path) -> SystemTime {
        match entry.modified {
            Some(secs) if secs >= 0 => UNIX_EPOCH + Duration::from_secs(secs as u64),
            _ => fs::metadata(local)
                .and_then(|m| m.modified())
                .unwrap_or_else(|_| SystemTime::now()),
        }
    }
}
