use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::DocSweepError;
use crate::relay::client::MetricsSink;
use crate::relay::protocol::MetricsSnapshot;

/// An endpoint counts as online if it was seen, or reported metrics, this recently
pub const ONLINE_THRESHOLD_SECS: i64 = 30 * 60;

/// A remote computer targeted for scanning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub endpoint_id: i64,
    pub address: String,
    pub label: String,
    pub hostname: String,
    pub last_seen: Option<i64>,
    pub last_metrics_update: Option<i64>,
    pub metrics: Option<MetricsSnapshot>,
}

/// Endpoint plus the derived `online` flag, as returned by the API
#[derive(Debug, Clone, Serialize)]
pub struct EndpointView {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub online: bool,
}

impl Endpoint {
    /// Either timestamp within the threshold of `now` (Unix seconds)
    pub fn is_online(&self, now: i64) -> bool {
        let recent = |ts: Option<i64>| ts.is_some_and(|t| now - t <= ONLINE_THRESHOLD_SECS);
        recent(self.last_seen) || recent(self.last_metrics_update)
    }

    pub fn view(self, now: i64) -> EndpointView {
        let online = self.is_online(now);
        EndpointView {
            endpoint: self,
            online,
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let metrics_json: Option<String> = row.get(6)?;
        Ok(Endpoint {
            endpoint_id: row.get(0)?,
            address: row.get(1)?,
            label: row.get(2)?,
            hostname: row.get(3)?,
            last_seen: row.get(4)?,
            last_metrics_update: row.get(5)?,
            metrics: metrics_json.and_then(|json| serde_json::from_str(&json).ok()),
        })
    }

    const SELECT: &str = "SELECT endpoint_id, address, label, hostname, last_seen, last_metrics_update, metrics FROM endpoints";

    pub fn create(
        conn: &Connection,
        address: &str,
        label: &str,
        hostname: &str,
    ) -> Result<Self, DocSweepError> {
        conn.execute(
            "INSERT INTO endpoints (address, label, hostname) VALUES (?, ?, ?)",
            params![address, label, hostname],
        )?;
        let endpoint_id = conn.last_insert_rowid();
        Self::get_by_id(conn, endpoint_id)?
            .ok_or_else(|| DocSweepError::Error("Endpoint vanished after insert".to_string()))
    }

    pub fn get_by_id(conn: &Connection, endpoint_id: i64) -> Result<Option<Self>, DocSweepError> {
        let sql = format!("{} WHERE endpoint_id = ?", Self::SELECT);
        Ok(conn
            .query_row(&sql, [endpoint_id], Self::from_row)
            .optional()?)
    }

    pub fn get_by_hostname(conn: &Connection, hostname: &str) -> Result<Option<Self>, DocSweepError> {
        let sql = format!("{} WHERE hostname = ? COLLATE NOCASE", Self::SELECT);
        Ok(conn.query_row(&sql, [hostname], Self::from_row).optional()?)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, DocSweepError> {
        let sql = format!("{} ORDER BY label, hostname", Self::SELECT);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Resolve every id, reporting the ones that don't exist
    pub fn get_many(conn: &Connection, ids: &[i64]) -> Result<(Vec<Self>, Vec<i64>), DocSweepError> {
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for &id in ids {
            match Self::get_by_id(conn, id)? {
                Some(endpoint) => found.push(endpoint),
                None => missing.push(id),
            }
        }
        Ok((found, missing))
    }

    /// Record a metrics report, creating the endpoint the first time its agent reports
    pub fn upsert_metrics(
        conn: &Connection,
        hostname: &str,
        address: Option<&str>,
        metrics: &MetricsSnapshot,
    ) -> Result<(), DocSweepError> {
        let now = Utc::now().timestamp();
        let metrics_json = serde_json::to_string(metrics)?;

        let updated = conn.execute(
            "UPDATE endpoints SET last_seen = ?, last_metrics_update = ?, metrics = ? WHERE hostname = ? COLLATE NOCASE",
            params![now, now, metrics_json, hostname],
        )?;

        if updated == 0 {
            conn.execute(
                "INSERT INTO endpoints (address, label, hostname, last_seen, last_metrics_update, metrics)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![address.unwrap_or(hostname), hostname, hostname, now, now, metrics_json],
            )?;
            log::info!("Registered new endpoint '{}' from its first metrics report", hostname);
        }

        Ok(())
    }

    /// Mark an endpoint as seen without new metrics (e.g. it was just scanned)
    pub fn touch(conn: &Connection, hostname: &str) -> Result<(), DocSweepError> {
        conn.execute(
            "UPDATE endpoints SET last_seen = ? WHERE hostname = ? COLLATE NOCASE",
            params![Utc::now().timestamp(), hostname],
        )?;
        Ok(())
    }
}

/// Persists metrics the controller receives from the hub
pub struct EndpointMetricsRecorder {
    db: Database,
}

impl EndpointMetricsRecorder {
    pub fn new(db: Database) -> Self {
        EndpointMetricsRecorder { db }
    }
}

impl MetricsSink for EndpointMetricsRecorder {
    fn record(&self, hostname: &str, snapshot: &MetricsSnapshot) {
        let result = self
            .db
            .get_connection()
            .and_then(|conn| Endpoint::upsert_metrics(&conn, hostname, None, snapshot));
        if let Err(e) = result {
            log::warn!("Dropping metrics from '{}': {}", hostname, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn test_online_threshold() {
        let now = 1_000_000;
        let mut endpoint = Endpoint {
            endpoint_id: 1,
            address: "10.0.0.5".to_string(),
            label: "Front desk".to_string(),
            hostname: "PC1".to_string(),
            last_seen: None,
            last_metrics_update: None,
            metrics: None,
        };
        assert!(!endpoint.is_online(now));

        endpoint.last_seen = Some(now - ONLINE_THRESHOLD_SECS - 1);
        assert!(!endpoint.is_online(now));

        endpoint.last_metrics_update = Some(now - 60);
        assert!(endpoint.is_online(now));
    }

    #[test]
    fn test_upsert_metrics_creates_then_updates() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let metrics = MetricsSnapshot::default();

        Endpoint::upsert_metrics(&conn, "PC1", Some("10.0.0.7"), &metrics).unwrap();
        let created = Endpoint::get_by_hostname(&conn, "pc1").unwrap().unwrap();
        assert_eq!(created.address, "10.0.0.7");
        assert!(created.last_metrics_update.is_some());
        assert_eq!(created.metrics, Some(MetricsSnapshot::default()));

        Endpoint::upsert_metrics(&conn, "PC1", None, &metrics).unwrap();
        assert_eq!(Endpoint::list(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_recorder_registers_reporting_agent() {
        let (_dir, db) = test_db();
        let recorder = EndpointMetricsRecorder::new(db.clone());

        recorder.record("LAPTOP-7", &MetricsSnapshot::default());

        let conn = db.get_connection().unwrap();
        let endpoint = Endpoint::get_by_hostname(&conn, "laptop-7").unwrap().unwrap();
        assert_eq!(endpoint.address, "LAPTOP-7");
        assert!(endpoint.is_online(Utc::now().timestamp()));
    }

    #[test]
    fn test_get_many_reports_missing() {
        let (_dir, db) = test_db();
        let conn = db.get_connection().unwrap();
        let a = Endpoint::create(&conn, "10.0.0.1", "A", "PC-A").unwrap();

        let (found, missing) = Endpoint::get_many(&conn, &[a.endpoint_id, 42]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(missing, vec![42]);
    }
}
