use std::time::Duration;

use chrono::{DateTime, Datelike, Days, LocalResult, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::database::Database;
use crate::error::DocSweepError;
use crate::orchestrator::{ScanOrchestrator, StartRejected};

/// A computed run never lands closer to now than this
pub const MIN_LEAD_SECS: i64 = 120;

/// Schedule type: Daily, Weekly, or Monthly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum ScheduleType {
    Daily = 0,
    Weekly = 1,
    Monthly = 2,
}

impl ScheduleType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Daily),
            1 => Some(Self::Weekly),
            2 => Some(Self::Monthly),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    fn label(self) -> &'static str {
        match self {
            Self::Daily => "Daily",
            Self::Weekly => "Weekly",
            Self::Monthly => "Monthly",
        }
    }
}

/// When a schedule fires, independent of storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    Daily { time: NaiveTime },
    /// Weekdays numbered 0 = Monday .. 6 = Sunday
    Weekly { time: NaiveTime, days: Vec<u8> },
    Monthly { time: NaiveTime, day: u32 },
}

/// Next firing instant after `now`, evaluated in `tz`.
///
/// Local times that fall in a DST gap move forward an hour; ambiguous local
/// times take the earlier instant. The result is never sooner than
/// `now + MIN_LEAD_SECS`.
pub fn next_run(recurrence: &Recurrence, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let today = now.with_timezone(&tz).date_naive();

    let candidate = match recurrence {
        Recurrence::Daily { time } => {
            let at_today = resolve_local(tz, today, *time);
            if at_today > now {
                at_today
            } else {
                resolve_local(tz, add_days(today, 1), *time)
            }
        }
        Recurrence::Weekly { time, days } => (0..=7)
            .map(|offset| add_days(today, offset))
            .filter(|date| days.contains(&(date.weekday().num_days_from_monday() as u8)))
            .map(|date| resolve_local(tz, date, *time))
            .find(|at| *at > now)
            // validated schedules always have a day; fall back to a week out
            .unwrap_or_else(|| resolve_local(tz, add_days(today, 7), *time)),
        Recurrence::Monthly { time, day } => (0..=2)
            .filter_map(|offset| first_of_month(today).checked_add_months(Months::new(offset)))
            .map(|month| resolve_local(tz, clamp_day(month, *day), *time))
            .find(|at| *at > now)
            .unwrap_or_else(|| resolve_local(tz, add_days(today, 31), *time)),
    };

    let floor = now + chrono::Duration::seconds(MIN_LEAD_SECS);
    candidate.max(floor)
}

fn add_days(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_add_days(Days::new(days)).unwrap_or(date)
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// `day` in the month of `month_start`, clamped to the month's last day
fn clamp_day(month_start: NaiveDate, day: u32) -> NaiveDate {
    let last = month_start
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28);
    month_start.with_day(day.clamp(1, last)).unwrap_or(month_start)
}

fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = NaiveDateTime::new(date, time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(at) => at.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = naive + chrono::Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&shifted))
        }
    }
}

/// Parse `HH:MM` (24-hour)
pub fn parse_time_of_day(time: &str) -> Result<NaiveTime, DocSweepError> {
    let invalid = || DocSweepError::InvalidSchedule(format!("time must be HH:MM, got '{}'", time));

    let (hours, minutes) = time.trim().split_once(':').ok_or_else(invalid)?;
    if hours.is_empty() || hours.len() > 2 || minutes.len() != 2 {
        return Err(invalid());
    }
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;

    NaiveTime::from_hms_opt(hours, minutes, 0).ok_or_else(invalid)
}

/// Schedule fields as supplied by an operator
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleParams {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    pub time: String,
    #[serde(default)]
    pub selected_days: Option<Vec<u8>>,
    #[serde(default)]
    pub monthly_date: Option<u32>,
    pub endpoint_ids: Vec<i64>,
    #[serde(default)]
    pub email_recipients: Vec<String>,
}

impl ScheduleParams {
    /// Validated, normalized schedule body (id and timestamps left at zero)
    fn into_schedule(self) -> Result<Schedule, DocSweepError> {
        let time = parse_time_of_day(&self.time)?;

        let (days_of_week, day_of_month) = match self.schedule_type {
            ScheduleType::Daily => (Vec::new(), None),
            ScheduleType::Weekly => {
                let mut days = self.selected_days.unwrap_or_default();
                if days.is_empty() {
                    return Err(DocSweepError::InvalidSchedule(
                        "weekly schedules need at least one day".to_string(),
                    ));
                }
                if let Some(bad) = days.iter().find(|d| **d > 6) {
                    return Err(DocSweepError::InvalidSchedule(format!(
                        "weekday must be 0 (Monday) to 6 (Sunday), got {}",
                        bad
                    )));
                }
                days.sort_unstable();
                days.dedup();
                (days, None)
            }
            ScheduleType::Monthly => match self.monthly_date {
                Some(day) if (1..=31).contains(&day) => (Vec::new(), Some(day)),
                Some(day) => {
                    return Err(DocSweepError::InvalidSchedule(format!(
                        "day of month must be 1-31, got {}",
                        day
                    )))
                }
                None => {
                    return Err(DocSweepError::InvalidSchedule(
                        "monthly schedules need a day of month".to_string(),
                    ))
                }
            },
        };

        if self.endpoint_ids.is_empty() {
            return Err(DocSweepError::InvalidSchedule(
                "a schedule needs at least one endpoint".to_string(),
            ));
        }

        let time_of_day = time.format("%H:%M").to_string();
        let schedule_name = self
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("{} at {}", self.schedule_type.label(), time_of_day));

        Ok(Schedule {
            schedule_id: 0,
            schedule_name,
            schedule_type: self.schedule_type,
            time_of_day,
            days_of_week,
            day_of_month,
            enabled: true,
            endpoint_ids: self.endpoint_ids,
            email_recipients: self.email_recipients,
            last_run: None,
            next_run: None,
            created_at: 0,
            updated_at: 0,
        })
    }
}

/// A recurring scan over a set of endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub schedule_id: i64,
    pub schedule_name: String,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    /// 'HH:MM' in the reference zone
    pub time_of_day: String,
    /// 0 = Monday .. 6 = Sunday; weekly only
    pub days_of_week: Vec<u8>,
    pub day_of_month: Option<u32>,
    pub enabled: bool,
    pub endpoint_ids: Vec<i64>,
    pub email_recipients: Vec<String>,
    pub last_run: Option<i64>,
    pub next_run: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Schedule {
    const SELECT: &'static str = "SELECT schedule_id, schedule_name, schedule_type, time_of_day, days_of_week,
        day_of_month, enabled, endpoint_ids, email_recipients, last_run, next_run, created_at, updated_at
        FROM schedules";

    pub fn recurrence(&self) -> Result<Recurrence, DocSweepError> {
        let time = parse_time_of_day(&self.time_of_day)?;
        Ok(match self.schedule_type {
            ScheduleType::Daily => Recurrence::Daily { time },
            ScheduleType::Weekly => Recurrence::Weekly {
                time,
                days: self.days_of_week.clone(),
            },
            ScheduleType::Monthly => Recurrence::Monthly {
                time,
                day: self.day_of_month.ok_or_else(|| {
                    DocSweepError::InvalidSchedule("monthly schedule without a day".to_string())
                })?,
            },
        })
    }

    fn compute_next_run(&self, now: DateTime<Utc>, tz: Tz) -> Result<i64, DocSweepError> {
        Ok(next_run(&self.recurrence()?, now, tz).timestamp())
    }

    /// Whether two schedules can fire on the same day at the same time
    pub fn collides_with(&self, other: &Schedule) -> bool {
        if self.time_of_day != other.time_of_day {
            return false;
        }
        match (self.schedule_type, other.schedule_type) {
            (ScheduleType::Daily, _) | (_, ScheduleType::Daily) => true,
            (ScheduleType::Weekly, ScheduleType::Weekly) => self
                .days_of_week
                .iter()
                .any(|d| other.days_of_week.contains(d)),
            (ScheduleType::Monthly, ScheduleType::Monthly) => self.day_of_month == other.day_of_month,
            // any month day eventually lands on any weekday
            (ScheduleType::Weekly, ScheduleType::Monthly) | (ScheduleType::Monthly, ScheduleType::Weekly) => true,
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        fn json_col<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
            let text: String = row.get(idx)?;
            serde_json::from_str(&text).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            })
        }

        Ok(Schedule {
            schedule_id: row.get(0)?,
            schedule_name: row.get(1)?,
            schedule_type: ScheduleType::from_i32(row.get(2)?).ok_or_else(|| {
                rusqlite::Error::InvalidColumnType(2, "schedule_type".to_string(), rusqlite::types::Type::Integer)
            })?,
            time_of_day: row.get(3)?,
            days_of_week: match row.get::<_, Option<String>>(4)? {
                Some(_) => json_col(row, 4)?,
                None => Vec::new(),
            },
            day_of_month: row.get(5)?,
            enabled: row.get(6)?,
            endpoint_ids: json_col(row, 7)?,
            email_recipients: json_col(row, 8)?,
            last_run: row.get(9)?,
            next_run: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    pub fn get_by_id(conn: &Connection, schedule_id: i64) -> Result<Option<Self>, DocSweepError> {
        let sql = format!("{} WHERE schedule_id = ?", Self::SELECT);
        Ok(conn.query_row(&sql, [schedule_id], Self::from_row).optional()?)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, DocSweepError> {
        let sql = format!("{} ORDER BY schedule_id", Self::SELECT);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Enabled schedules whose next run is at or before `now`, oldest first
    pub fn due(conn: &Connection, now: i64) -> Result<Vec<Self>, DocSweepError> {
        let sql = format!(
            "{} WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ? ORDER BY next_run",
            Self::SELECT
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([now], Self::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// First enabled schedule, other than `exclude`, that collides with `candidate`
    fn find_conflict(conn: &Connection, candidate: &Schedule, exclude: Option<i64>) -> Result<Option<Self>, DocSweepError> {
        Ok(Self::list(conn)?
            .into_iter()
            .filter(|s| s.enabled && Some(s.schedule_id) != exclude)
            .find(|s| s.collides_with(candidate)))
    }

    fn ensure_no_conflict(conn: &Connection, candidate: &Schedule, exclude: Option<i64>) -> Result<(), DocSweepError> {
        match Self::find_conflict(conn, candidate, exclude)? {
            Some(existing) => Err(DocSweepError::ScheduleConflict(format!(
                "'{}' already runs at {} on an overlapping day",
                existing.schedule_name, existing.time_of_day
            ))),
            None => Ok(()),
        }
    }

    /// Insert a new enabled schedule.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn create(conn: &Connection, params: ScheduleParams, now: DateTime<Utc>, tz: Tz) -> Result<Self, DocSweepError> {
        let mut schedule = params.into_schedule()?;
        Self::ensure_no_conflict(conn, &schedule, None)?;

        schedule.next_run = Some(schedule.compute_next_run(now, tz)?);
        schedule.created_at = now.timestamp();
        schedule.updated_at = now.timestamp();

        schedule.schedule_id = conn.query_row(
            "INSERT INTO schedules (
                schedule_name, schedule_type, time_of_day, days_of_week, day_of_month,
                enabled, endpoint_ids, email_recipients, last_run, next_run, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?)
            RETURNING schedule_id",
            params![
                schedule.schedule_name,
                schedule.schedule_type.as_i32(),
                schedule.time_of_day,
                serde_json::to_string(&schedule.days_of_week)?,
                schedule.day_of_month,
                schedule.enabled,
                serde_json::to_string(&schedule.endpoint_ids)?,
                serde_json::to_string(&schedule.email_recipients)?,
                schedule.next_run,
                schedule.created_at,
                schedule.updated_at,
            ],
            |row| row.get(0),
        )?;

        Ok(schedule)
    }

    /// Replace a schedule's definition, keeping its enabled flag and history.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn update(
        conn: &Connection,
        schedule_id: i64,
        params: ScheduleParams,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<Option<Self>, DocSweepError> {
        let existing = match Self::get_by_id(conn, schedule_id)? {
            Some(existing) => existing,
            None => return Ok(None),
        };

        let mut schedule = params.into_schedule()?;
        schedule.schedule_id = schedule_id;
        schedule.enabled = existing.enabled;
        schedule.last_run = existing.last_run;
        schedule.created_at = existing.created_at;
        schedule.updated_at = now.timestamp();

        if schedule.enabled {
            Self::ensure_no_conflict(conn, &schedule, Some(schedule_id))?;
            schedule.next_run = Some(schedule.compute_next_run(now, tz)?);
        }

        conn.execute(
            "UPDATE schedules SET
                schedule_name = ?, schedule_type = ?, time_of_day = ?, days_of_week = ?,
                day_of_month = ?, endpoint_ids = ?, email_recipients = ?, next_run = ?, updated_at = ?
            WHERE schedule_id = ?",
            params![
                schedule.schedule_name,
                schedule.schedule_type.as_i32(),
                schedule.time_of_day,
                serde_json::to_string(&schedule.days_of_week)?,
                schedule.day_of_month,
                serde_json::to_string(&schedule.endpoint_ids)?,
                serde_json::to_string(&schedule.email_recipients)?,
                schedule.next_run,
                schedule.updated_at,
                schedule_id,
            ],
        )?;

        Ok(Some(schedule))
    }

    /// Enabling recomputes next_run (and re-checks conflicts); disabling clears it
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn set_enabled(
        conn: &Connection,
        schedule_id: i64,
        enabled: bool,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<Option<Self>, DocSweepError> {
        let mut schedule = match Self::get_by_id(conn, schedule_id)? {
            Some(schedule) => schedule,
            None => return Ok(None),
        };

        if enabled {
            Self::ensure_no_conflict(conn, &schedule, Some(schedule_id))?;
            schedule.next_run = Some(schedule.compute_next_run(now, tz)?);
        } else {
            schedule.next_run = None;
        }
        schedule.enabled = enabled;
        schedule.updated_at = now.timestamp();

        conn.execute(
            "UPDATE schedules SET enabled = ?, next_run = ?, updated_at = ? WHERE schedule_id = ?",
            params![enabled, schedule.next_run, schedule.updated_at, schedule_id],
        )?;
        Ok(Some(schedule))
    }

    pub fn delete(conn: &Connection, schedule_id: i64) -> Result<bool, DocSweepError> {
        let rows = conn.execute("DELETE FROM schedules WHERE schedule_id = ?", [schedule_id])?;
        Ok(rows > 0)
    }

    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn record_successful_run(
        conn: &Connection,
        schedule_id: i64,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Result<Option<Self>, DocSweepError> {
        let mut schedule = match Self::get_by_id(conn, schedule_id)? {
            Some(schedule) => schedule,
            None => return Ok(None),
        };

        schedule.last_run = Some(now.timestamp());
        if schedule.enabled {
            schedule.next_run = Some(schedule.compute_next_run(now, tz)?);
        }

        conn.execute(
            "UPDATE schedules SET last_run = ?, next_run = ? WHERE schedule_id = ?",
            params![schedule.last_run, schedule.next_run, schedule_id],
        )?;
        Ok(Some(schedule))
    }
}

/// Schedule operations against the database, each in its own transaction
#[derive(Clone)]
pub struct ScheduleEngine {
    db: Database,
    tz: Tz,
}

impl ScheduleEngine {
    pub fn new(db: Database, tz: Tz) -> Self {
        ScheduleEngine { db, tz }
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn create(&self, params: ScheduleParams) -> Result<Schedule, DocSweepError> {
        let conn = self.db.get_connection()?;
        let schedule = Database::immediate_transaction(&conn, |c| Schedule::create(c, params, Utc::now(), self.tz))?;
        info!(
            "Created schedule {} '{}' (next run {:?})",
            schedule.schedule_id, schedule.schedule_name, schedule.next_run
        );
        Ok(schedule)
    }

    pub fn get(&self, schedule_id: i64) -> Result<Option<Schedule>, DocSweepError> {
        let conn = self.db.get_connection()?;
        Schedule::get_by_id(&conn, schedule_id)
    }

    pub fn list(&self) -> Result<Vec<Schedule>, DocSweepError> {
        let conn = self.db.get_connection()?;
        Schedule::list(&conn)
    }

    pub fn update(&self, schedule_id: i64, params: ScheduleParams) -> Result<Option<Schedule>, DocSweepError> {
        let conn = self.db.get_connection()?;
        Database::immediate_transaction(&conn, |c| Schedule::update(c, schedule_id, params, Utc::now(), self.tz))
    }

    pub fn delete(&self, schedule_id: i64) -> Result<bool, DocSweepError> {
        let conn = self.db.get_connection()?;
        Database::immediate_transaction(&conn, |c| Schedule::delete(c, schedule_id))
    }

    pub fn set_enabled(&self, schedule_id: i64, enabled: bool) -> Result<Option<Schedule>, DocSweepError> {
        let conn = self.db.get_connection()?;
        Database::immediate_transaction(&conn, |c| {
            Schedule::set_enabled(c, schedule_id, enabled, Utc::now(), self.tz)
        })
    }

    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, DocSweepError> {
        let conn = self.db.get_connection()?;
        Schedule::due(&conn, now.timestamp())
    }

    pub fn record_successful_run(&self, schedule_id: i64, now: DateTime<Utc>) -> Result<Option<Schedule>, DocSweepError> {
        let conn = self.db.get_connection()?;
        Database::immediate_transaction(&conn, |c| Schedule::record_successful_run(c, schedule_id, now, self.tz))
    }
}

/// Starts due schedules and advances them once their run fully succeeds
pub struct SchedulePoller {
    engine: ScheduleEngine,
    orchestrator: ScanOrchestrator,
    interval: Duration,
}

impl SchedulePoller {
    pub fn new(engine: ScheduleEngine, orchestrator: ScanOrchestrator, interval: Duration) -> Self {
        SchedulePoller {
            engine,
            orchestrator,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        info!("[SCHEDULE] Poller running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(Utc::now()).await {
                        warn!("[SCHEDULE] Poll failed: {}", e);
                    }
                }
            }
        }
        info!("[SCHEDULE] Poller stopped");
    }

    /// Run every schedule due at `now`, one after another. Returns how many
    /// schedules were advanced.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize, DocSweepError> {
        let due = self.engine.due(now)?;
        let mut advanced = 0;

        for schedule in due {
            let receiver = match self.orchestrator.start(&schedule.endpoint_ids) {
                Ok(receiver) => receiver,
                Err(StartRejected::AlreadyInProgress) => {
                    debug!("[SCHEDULE] '{}' waits for the current run", schedule.schedule_name);
                    break;
                }
                Err(reason) => {
                    warn!("[SCHEDULE] '{}' could not start: {}", schedule.schedule_name, reason);
                    continue;
                }
            };

            info!("[SCHEDULE] '{}' started", schedule.schedule_name);
            let outcome = match receiver.await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("[SCHEDULE] '{}' ended without an outcome", schedule.schedule_name);
                    continue;
                }
            };

            if !schedule.email_recipients.is_empty() {
                info!(
                    "[SCHEDULE] '{}' digest recipients: {}",
                    schedule.schedule_name,
                    schedule.email_recipients.join(", ")
                );
            }

            if outcome.successful {
                if let Some(updated) = self.engine.record_successful_run(schedule.schedule_id, Utc::now())? {
                    info!(
                        "[SCHEDULE] '{}' completed, next run at {:?}",
                        updated.schedule_name, updated.next_run
                    );
                    advanced += 1;
                }
            } else {
                warn!(
                    "[SCHEDULE] '{}' not advanced: processed {}, failed {}, stopped {}",
                    schedule.schedule_name, outcome.processed, outcome.failed, outcome.stopped
                );
            }
        }

        Ok(advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn paris() -> Tz {
        chrono_tz::Europe::Paris
    }

    fn paris_time(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        paris()
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    // Base time for most tests: Wednesday, January 15, 2025, 10:30:00 Paris time
    fn base_time() -> DateTime<Utc> {
        paris_time(2025, 1, 15, 10, 30)
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn params(schedule_type: ScheduleType, time: &str) -> ScheduleParams {
        ScheduleParams {
            name: None,
            schedule_type,
            time: time.to_string(),
            selected_days: None,
            monthly_date: None,
            endpoint_ids: vec![1],
            email_recipients: Vec::new(),
        }
    }

    fn weekly(time: &str, days: &[u8]) -> ScheduleParams {
        ScheduleParams {
            selected_days: Some(days.to_vec()),
            ..params(ScheduleType::Weekly, time)
        }
    }

    fn monthly(time: &str, day: u32) -> ScheduleParams {
        ScheduleParams {
            monthly_date: Some(day),
            ..params(ScheduleType::Monthly, time)
        }
    }

    #[test]
    fn test_daily_time_not_passed() {
        let next = next_run(&Recurrence::Daily { time: at(14, 0) }, base_time(), paris());
        assert_eq!(next, paris_time(2025, 1, 15, 14, 0));
    }

    #[test]
    fn test_daily_time_passed() {
        let next = next_run(&Recurrence::Daily { time: at(9, 0) }, base_time(), paris());
        assert_eq!(next, paris_time(2025, 1, 16, 9, 0));
    }

    #[test]
    fn test_weekly_created_wednesday_morning() {
        // Mon/Wed/Fri at 09:00, created Wednesday 10:00
        let recurrence = Recurrence::Weekly {
            time: at(9, 0),
            days: vec![0, 2, 4],
        };
        let next = next_run(&recurrence, paris_time(2025, 1, 15, 10, 0), paris());
        assert_eq!(next, paris_time(2025, 1, 17, 9, 0));
    }

    #[test]
    fn test_weekly_today_and_wraparound() {
        let today = Recurrence::Weekly {
            time: at(14, 0),
            days: vec![2],
        };
        assert_eq!(next_run(&today, base_time(), paris()), paris_time(2025, 1, 15, 14, 0));

        let next_week = Recurrence::Weekly {
            time: at(9, 0),
            days: vec![2],
        };
        assert_eq!(next_run(&next_week, base_time(), paris()), paris_time(2025, 1, 22, 9, 0));
    }

    #[test]
    fn test_monthly_clamps_to_month_end() {
        let day_31 = Recurrence::Monthly { time: at(9, 0), day: 31 };
        // April has 30 days
        assert_eq!(
            next_run(&day_31, paris_time(2025, 4, 10, 12, 0), paris()),
            paris_time(2025, 4, 30, 9, 0)
        );
        // February 2025 has 28
        assert_eq!(
            next_run(&day_31, paris_time(2025, 2, 1, 12, 0), paris()),
            paris_time(2025, 2, 28, 9, 0)
        );
    }

    #[test]
    fn test_monthly_rolls_into_next_year() {
        let day_5 = Recurrence::Monthly { time: at(9, 0), day: 5 };
        assert_eq!(
            next_run(&day_5, paris_time(2025, 12, 20, 12, 0), paris()),
            paris_time(2026, 1, 5, 9, 0)
        );

        let day_15 = Recurrence::Monthly { time: at(9, 0), day: 15 };
        assert_eq!(next_run(&day_15, base_time(), paris()), paris_time(2025, 2, 15, 9, 0));
    }

    #[test]
    fn test_minimum_lead_time() {
        let next = next_run(&Recurrence::Daily { time: at(10, 31) }, base_time(), paris());
        assert_eq!(next, base_time() + chrono::Duration::seconds(MIN_LEAD_SECS));
    }

    #[test]
    fn test_dst_gap_and_overlap() {
        // 02:30 does not exist on 2025-03-30 in Paris
        let gap = next_run(
            &Recurrence::Daily { time: at(2, 30) },
            paris_time(2025, 3, 29, 12, 0),
            paris(),
        );
        assert_eq!(gap, Utc.with_ymd_and_hms(2025, 3, 30, 1, 30, 0).unwrap());

        // 02:30 happens twice on 2025-10-26; the first is still CEST
        let overlap = next_run(
            &Recurrence::Daily { time: at(2, 30) },
            paris_time(2025, 10, 25, 12, 0),
            paris(),
        );
        assert_eq!(overlap, Utc.with_ymd_and_hms(2025, 10, 26, 0, 30, 0).unwrap());
    }

    #[test]
    fn test_reference_zone_not_host_zone() {
        // 23:30 UTC on the 14th is already the 15th in Paris
        let now = Utc.with_ymd_and_hms(2025, 1, 14, 23, 30, 0).unwrap();
        let next = next_run(&Recurrence::Daily { time: at(9, 0) }, now, paris());
        assert_eq!(next, paris_time(2025, 1, 15, 9, 0));
    }

    fn recurrence_strategy() -> impl Strategy<Value = Recurrence> {
        let time = (0u32..24, 0u32..60).prop_map(|(h, m)| NaiveTime::from_hms_opt(h, m, 0).unwrap());
        prop_oneof![
            time.clone().prop_map(|time| Recurrence::Daily { time }),
            (time.clone(), prop::collection::vec(0u8..7, 1..7))
                .prop_map(|(time, days)| Recurrence::Weekly { time, days }),
            (time, 1u32..=31).prop_map(|(time, day)| Recurrence::Monthly { time, day }),
        ]
    }

    proptest! {
        #[test]
        fn prop_next_run_has_minimum_lead(
            recurrence in recurrence_strategy(),
            offset in 0i64..(4 * 365 * 86400),
        ) {
            let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(offset);
            let next = next_run(&recurrence, now, paris());
            prop_assert!(next >= now + chrono::Duration::seconds(MIN_LEAD_SECS));
            prop_assert!(next <= now + chrono::Duration::days(32));
        }
    }

    #[test]
    fn test_validation() {
        assert!(params(ScheduleType::Daily, "9:05").into_schedule().is_ok());
        assert!(params(ScheduleType::Daily, "24:00").into_schedule().is_err());
        assert!(params(ScheduleType::Daily, "12:5").into_schedule().is_err());
        assert!(params(ScheduleType::Daily, "noon").into_schedule().is_err());
        assert!(weekly("09:00", &[]).into_schedule().is_err());
        assert!(weekly("09:00", &[7]).into_schedule().is_err());
        assert!(monthly("09:00", 0).into_schedule().is_err());
        assert!(monthly("09:00", 32).into_schedule().is_err());
        assert!(params(ScheduleType::Monthly, "09:00").into_schedule().is_err());

        let no_endpoints = ScheduleParams {
            endpoint_ids: Vec::new(),
            ..params(ScheduleType::Daily, "09:00")
        };
        assert!(no_endpoints.into_schedule().is_err());

        let schedule = weekly("9:00", &[4, 0, 4]).into_schedule().unwrap();
        assert_eq!(schedule.time_of_day, "09:00");
        assert_eq!(schedule.days_of_week, vec![0, 4]);
        assert_eq!(schedule.schedule_name, "Weekly at 09:00");
    }

    #[test]
    fn test_collisions() {
        let daily = params(ScheduleType::Daily, "09:00").into_schedule().unwrap();
        let mon = weekly("09:00", &[0]).into_schedule().unwrap();
        let tue = weekly("09:00", &[1]).into_schedule().unwrap();
        let mon_fri = weekly("09:00", &[0, 4]).into_schedule().unwrap();
        let fifth = monthly("09:00", 5).into_schedule().unwrap();
        let sixth = monthly("09:00", 6).into_schedule().unwrap();
        let later = params(ScheduleType::Daily, "10:00").into_schedule().unwrap();

        assert!(daily.collides_with(&tue));
        assert!(fifth.collides_with(&daily));
        assert!(!mon.collides_with(&tue));
        assert!(mon.collides_with(&mon_fri));
        assert!(!fifth.collides_with(&sixth));
        assert!(fifth.collides_with(&fifth.clone()));
        assert!(tue.collides_with(&sixth));
        assert!(!daily.collides_with(&later));
    }

    fn test_engine() -> (tempfile::TempDir, ScheduleEngine) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        (dir, ScheduleEngine::new(db, paris()))
    }

    #[test]
    fn test_crud_round_trip() {
        let (_dir, engine) = test_engine();

        let created = engine.create(weekly("09:00", &[0, 2])).unwrap();
        assert!(created.next_run.unwrap() >= Utc::now().timestamp() + MIN_LEAD_SECS);
        assert_eq!(engine.get(created.schedule_id).unwrap().unwrap(), created);
        assert_eq!(engine.list().unwrap().len(), 1);

        let updated = engine
            .update(created.schedule_id, monthly("18:15", 12))
            .unwrap()
            .unwrap();
        assert_eq!(updated.schedule_type, ScheduleType::Monthly);
        assert_eq!(updated.day_of_month, Some(12));
        assert_eq!(updated.created_at, created.created_at);

        let disabled = engine.set_enabled(created.schedule_id, false).unwrap().unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.next_run, None);
        assert!(engine.due(Utc::now() + chrono::Duration::days(400)).unwrap().is_empty());

        let enabled = engine.set_enabled(created.schedule_id, true).unwrap().unwrap();
        assert!(enabled.next_run.is_some());

        assert!(engine.update(999, monthly("18:15", 12)).unwrap().is_none());
        assert!(engine.set_enabled(999, true).unwrap().is_none());

        assert!(engine.delete(created.schedule_id).unwrap());
        assert!(!engine.delete(created.schedule_id).unwrap());
        assert!(engine.get(created.schedule_id).unwrap().is_none());
    }

    #[test]
    fn test_conflicts_reject_and_persist_nothing() {
        let (_dir, engine) = test_engine();
        let daily = engine.create(params(ScheduleType::Daily, "09:00")).unwrap();

        match engine.create(weekly("09:00", &[3])) {
            Err(DocSweepError::ScheduleConflict(_)) => {}
            other => panic!("expected a conflict, got {:?}", other),
        }
        assert_eq!(engine.list().unwrap().len(), 1);

        // updating a schedule never conflicts with itself
        assert!(engine.update(daily.schedule_id, params(ScheduleType::Daily, "09:00")).is_ok());

        // disabled schedules do not block
        engine.set_enabled(daily.schedule_id, false).unwrap();
        let weekly_one = engine.create(weekly("09:00", &[3])).unwrap();
        match engine.set_enabled(daily.schedule_id, true) {
            Err(DocSweepError::ScheduleConflict(_)) => {}
            other => panic!("expected a conflict, got {:?}", other),
        }
        assert!(engine.create(weekly("09:00", &[4])).is_ok());
        assert!(engine.get(weekly_one.schedule_id).unwrap().unwrap().enabled);
    }

    #[test]
    fn test_due_and_record_successful_run() {
        let (_dir, engine) = test_engine();
        let schedule = engine.create(params(ScheduleType::Daily, "09:00")).unwrap();
        let next = schedule.next_run.unwrap();

        let before = DateTime::<Utc>::from_timestamp(next - 1, 0).unwrap();
        let after = DateTime::<Utc>::from_timestamp(next + 1, 0).unwrap();
        assert!(engine.due(before).unwrap().is_empty());
        assert_eq!(engine.due(after).unwrap().len(), 1);

        let advanced = engine
            .record_successful_run(schedule.schedule_id, after)
            .unwrap()
            .unwrap();
        assert_eq!(advanced.last_run, Some(after.timestamp()));
        assert!(advanced.next_run.unwrap() > next);
        assert!(engine.due(after).unwrap().is_empty());
    }

    mod poller {
        use super::*;
        use pretty_assertions::assert_eq;
        use crate::orchestrator::tests::{scan_config, seed_endpoints, share_fleet, test_matcher};
        use crate::scanner::EndpointScanner;
        use crate::sources::ShareSource;
        use std::sync::Arc;

        fn fleet_poller(broken: &[&str]) -> (tempfile::TempDir, ScheduleEngine, SchedulePoller, Schedule) {
            let dir = tempfile::tempdir().unwrap();
            let hosts = ["PC1", "PC2", "PC3", "PC4", "PC5"];
            let mounter = share_fleet(dir.path(), &hosts, broken);
            let config = scan_config(&dir.path().join("collected"));
            let source = Arc::new(ShareSource::new(&config, mounter));
            let scanner = EndpointScanner::new(&config, source, test_matcher());
            let db = Database::open(&dir.path().join("db")).unwrap();
            let orchestrator = ScanOrchestrator::new(db.clone(), scanner, 3);
            let ids = seed_endpoints(&db, &hosts);

            let engine = ScheduleEngine::new(db, paris());
            let schedule = engine
                .create(ScheduleParams {
                    endpoint_ids: ids,
                    email_recipients: vec!["it@example.com".to_string()],
                    ..params(ScheduleType::Daily, "09:00")
                })
                .unwrap();
            let poller = SchedulePoller::new(engine.clone(), orchestrator, Duration::from_secs(30));
            (dir, engine, poller, schedule)
        }

        #[tokio::test]
        async fn test_failed_endpoint_keeps_schedule_due() {
            let (_dir, engine, poller, schedule) = fleet_poller(&["PC2"]);
            let due_at = DateTime::<Utc>::from_timestamp(schedule.next_run.unwrap() + 1, 0).unwrap();

            assert_eq!(poller.poll_once(due_at).await.unwrap(), 0);

            let after = engine.get(schedule.schedule_id).unwrap().unwrap();
            assert_eq!(after.last_run, None);
            assert_eq!(after.next_run, schedule.next_run);
        }

        #[tokio::test]
        async fn test_successful_run_advances_schedule() {
            let (_dir, engine, poller, schedule) = fleet_poller(&[]);
            let due_at = DateTime::<Utc>::from_timestamp(schedule.next_run.unwrap() + 1, 0).unwrap();

            assert_eq!(poller.poll_once(due_at).await.unwrap(), 1);

            let after = engine.get(schedule.schedule_id).unwrap().unwrap();
            assert!(after.last_run.is_some());
            assert!(after.next_run.unwrap() >= after.last_run.unwrap() + MIN_LEAD_SECS);
        }
    }
}
