use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::{
    db::{configure, init_db},
    error::{Result, SchedulerError},
    types::{
        ConcurrencyPolicy, FireInstance, FireOutcome, JobDefinition, RegisterMode, RegisterOutcome,
        Schedule, Trigger, TriggerSpec, TriggerState,
    },
};

/// What a recovery pass found and repaired.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Triggers whose claim expired; they are due again.
    pub recovered_triggers: Vec<String>,
    /// Instances that stopped checking in.
    pub lost_instances: Vec<String>,
    /// Running fires of lost instances, now marked failed.
    pub failed_fires: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.recovered_triggers.is_empty() && self.lost_instances.is_empty() && self.failed_fires == 0
    }
}

/// Durable home of jobs, triggers and fire instances.
///
/// `claim_due_triggers` is the only serialization point between scheduler
/// instances sharing a store: an implementation must guarantee that a
/// trigger is handed to at most one claimant until it is released or
/// recovered.
pub trait JobStore: Send + Sync {
    fn register_job(&self, job: &JobDefinition, mode: RegisterMode) -> Result<RegisterOutcome>;

    /// Rejects triggers whose job does not exist.
    fn register_trigger(&self, trigger: &Trigger, mode: RegisterMode) -> Result<RegisterOutcome>;

    fn get_job(&self, id: &str) -> Result<Option<JobDefinition>>;
    fn get_trigger(&self, id: &str) -> Result<Option<Trigger>>;
    fn list_jobs(&self) -> Result<Vec<JobDefinition>>;
    fn list_triggers(&self, job_id: Option<&str>) -> Result<Vec<Trigger>>;

    /// Removes the job and, with it, all of its triggers.
    fn remove_job(&self, id: &str) -> Result<()>;
    fn remove_trigger(&self, id: &str) -> Result<()>;

    fn set_trigger_paused(&self, id: &str, paused: bool, now: DateTime<Utc>) -> Result<()>;
    /// Pause or resume every trigger of a job. Returns how many changed.
    fn set_job_paused(&self, job_id: &str, paused: bool, now: DateTime<Utc>) -> Result<usize>;

    /// Atomically claim up to `max_batch` waiting triggers due by
    /// `window_end`, ordered by fire time, then priority (high first), then id.
    fn claim_due_triggers(
        &self,
        instance_id: &str,
        window_end: DateTime<Utc>,
        max_batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Trigger>>;

    /// Hand a claimed trigger back with its next fire time. `fired_at` is set
    /// when the occurrence was actually fired. Fails with `ClaimConflict` if
    /// the caller no longer holds the claim.
    fn release_trigger(
        &self,
        instance_id: &str,
        trigger_id: &str,
        next_fire_at: Option<DateTime<Utc>>,
        fired_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Insert `fire` as pending, or as vetoed when `concurrency` forbids
    /// overlap and another fire of the same job is still active.
    fn begin_fire(&self, fire: &FireInstance, concurrency: ConcurrencyPolicy) -> Result<FireOutcome>;

    /// A pending fire got a worker slot.
    fn mark_running(&self, fire_id: &str) -> Result<()>;

    /// Insert an already-finished fire (misfire skips, unresolvable jobs).
    fn record_fire(&self, fire: &FireInstance) -> Result<()>;

    /// Finalise an active fire. A fire that already has a final outcome is
    /// left untouched.
    fn complete_fire(
        &self,
        fire_id: &str,
        outcome: FireOutcome,
        error: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<()>;

    fn get_fire(&self, fire_id: &str) -> Result<Option<FireInstance>>;

    /// Most recent fires first.
    fn fire_history(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<FireInstance>>;

    fn check_in(&self, instance_id: &str, now: DateTime<Utc>) -> Result<()>;
    fn check_out(&self, instance_id: &str) -> Result<()>;

    /// Return expired claims to `waiting` and fail fires of dead instances.
    fn recover(&self, now: DateTime<Utc>, acquired_timeout: Duration, instance_timeout: Duration) -> Result<RecoveryReport>;
}

/// SQLite-backed [`JobStore`].
///
/// Several `SqliteStore`s (in one or many processes) may open the same file;
/// writes go through `BEGIN IMMEDIATE` so claims are serialized by SQLite's
/// write lock.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const JOB_COLUMNS: &str =
    "id, job_type, concurrency, description, max_runtime_secs, created_at, updated_at";

const TRIGGER_COLUMNS: &str = "id, job_id, schedule, start_at, end_at, max_fires, priority,
     misfire_policy, next_fire_at, prev_fire_at, fire_count, state, acquired_by, acquired_at,
     created_at, updated_at";

const FIRE_COLUMNS: &str =
    "id, trigger_id, job_id, instance_id, scheduled_at, fired_at, finished_at, outcome, error";

impl SqliteStore {
    pub fn new(conn: Connection) -> Result<Self> {
        configure(&conn)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    /// Private in-memory database; not shareable between stores.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("store connection poisoned".to_string()))
    }
}

impl JobStore for SqliteStore {
    fn register_job(&self, job: &JobDefinition, mode: RegisterMode) -> Result<RegisterOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE id = ?1)",
            [&job.id],
            |row| row.get(0),
        )?;

        let outcome = match (exists, mode) {
            (false, _) => {
                tx.execute(
                    "INSERT INTO jobs
                     (id, job_type, concurrency, description, max_runtime_secs, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        job.id,
                        job.job_type,
                        job.concurrency.as_str(),
                        job.description,
                        job.max_runtime_secs.map(|s| s as i64),
                        ms(job.created_at),
                        ms(job.updated_at),
                    ],
                )?;
                write_job_data(&tx, &job.id, &job.data)?;
                RegisterOutcome::Created
            }
            (true, RegisterMode::Overwrite) => {
                // UPDATE rather than REPLACE: a REPLACE would cascade-delete the triggers.
                tx.execute(
                    "UPDATE jobs SET job_type = ?2, concurrency = ?3, description = ?4,
                     max_runtime_secs = ?5, updated_at = ?6
                     WHERE id = ?1",
                    params![
                        job.id,
                        job.job_type,
                        job.concurrency.as_str(),
                        job.description,
                        job.max_runtime_secs.map(|s| s as i64),
                        ms(job.updated_at),
                    ],
                )?;
                tx.execute("DELETE FROM job_data WHERE job_id = ?1", [&job.id])?;
                write_job_data(&tx, &job.id, &job.data)?;
                RegisterOutcome::Replaced
            }
            (true, RegisterMode::Ignore) => RegisterOutcome::Skipped,
            (true, RegisterMode::Reject) => {
                return Err(SchedulerError::Configuration(format!(
                    "job {} is already registered",
                    job.id
                )));
            }
        };

        tx.commit()?;
        debug!(job_id = %job.id, ?outcome, "job registered");
        Ok(outcome)
    }

    fn register_trigger(&self, trigger: &Trigger, mode: RegisterMode) -> Result<RegisterOutcome> {
        let spec = &trigger.spec;
        let schedule_json = serde_json::to_string(&spec.schedule)
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE id = ?1)",
            [&spec.job_id],
            |row| row.get(0),
        )?;
        if !job_exists {
            return Err(SchedulerError::Configuration(format!(
                "trigger {} references unknown job {}",
                spec.id, spec.job_id
            )));
        }

        let existing_state: Option<String> = tx
            .query_row("SELECT state FROM triggers WHERE id = ?1", [&spec.id], |row| row.get(0))
            .optional()?;

        let outcome = match (existing_state, mode) {
            (None, _) => {
                tx.execute(
                    "INSERT INTO triggers
                     (id, job_id, schedule, start_at, end_at, max_fires, priority, misfire_policy,
                      next_fire_at, prev_fire_at, fire_count, state, acquired_by, acquired_at,
                      created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, NULL, ?13, ?14)",
                    params![
                        spec.id,
                        spec.job_id,
                        schedule_json,
                        spec.start_at.map(ms),
                        spec.end_at.map(ms),
                        spec.max_fires,
                        spec.priority,
                        spec.misfire_policy.as_str(),
                        trigger.next_fire_at.map(ms),
                        trigger.prev_fire_at.map(ms),
                        trigger.fire_count,
                        trigger.state.as_str(),
                        ms(trigger.created_at),
                        ms(trigger.updated_at),
                    ],
                )?;
                RegisterOutcome::Created
            }
            (Some(current), RegisterMode::Overwrite) => {
                // A paused trigger stays paused; any outstanding claim is dropped
                // and the claimant's release will report a conflict.
                let state = if current == TriggerState::Paused.as_str() {
                    TriggerState::Paused
                } else {
                    trigger.state
                };
                tx.execute(
                    "UPDATE triggers SET job_id = ?2, schedule = ?3, start_at = ?4, end_at = ?5,
                     max_fires = ?6, priority = ?7, misfire_policy = ?8, next_fire_at = ?9,
                     prev_fire_at = NULL, fire_count = 0, state = ?10, acquired_by = NULL,
                     acquired_at = NULL, updated_at = ?11
                     WHERE id = ?1",
                    params![
                        spec.id,
                        spec.job_id,
                        schedule_json,
                        spec.start_at.map(ms),
                        spec.end_at.map(ms),
                        spec.max_fires,
                        spec.priority,
                        spec.misfire_policy.as_str(),
                        trigger.next_fire_at.map(ms),
                        state.as_str(),
                        ms(trigger.updated_at),
                    ],
                )?;
                RegisterOutcome::Replaced
            }
            (Some(_), RegisterMode::Ignore) => RegisterOutcome::Skipped,
            (Some(_), RegisterMode::Reject) => {
                return Err(SchedulerError::Configuration(format!(
                    "trigger {} is already registered",
                    spec.id
                )));
            }
        };

        tx.commit()?;
        debug!(trigger_id = %spec.id, job_id = %spec.job_id, ?outcome, "trigger registered");
        Ok(outcome)
    }

    fn get_job(&self, id: &str) -> Result<Option<JobDefinition>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?;
        match job {
            Some(mut job) => {
                job.data = read_job_data(&conn, &job.id)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    fn get_trigger(&self, id: &str) -> Result<Option<Trigger>> {
        let conn = self.conn()?;
        let trigger = conn
            .query_row(
                &format!("SELECT {TRIGGER_COLUMNS} FROM triggers WHERE id = ?1"),
                [id],
                row_to_trigger,
            )
            .optional()?;
        Ok(trigger)
    }

    fn list_jobs(&self) -> Result<Vec<JobDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id"))?;
        let mut jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for job in &mut jobs {
            job.data = read_job_data(&conn, &job.id)?;
        }
        Ok(jobs)
    }

    fn list_triggers(&self, job_id: Option<&str>) -> Result<Vec<Trigger>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers
             WHERE (?1 IS NULL OR job_id = ?1)
             ORDER BY job_id, id"
        ))?;
        let triggers = stmt
            .query_map([job_id], row_to_trigger)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(triggers)
    }

    fn remove_job(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "job removed");
        Ok(())
    }

    fn remove_trigger(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM triggers WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::TriggerNotFound { id: id.to_string() });
        }
        info!(trigger_id = %id, "trigger removed");
        Ok(())
    }

    fn set_trigger_paused(&self, id: &str, paused: bool, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM triggers WHERE id = ?1)",
            [id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(SchedulerError::TriggerNotFound { id: id.to_string() });
        }
        let n = if paused {
            pause_sql(&conn, "id = ?1", id, now)?
        } else {
            resume_sql(&conn, "id = ?1", id, now)?
        };
        debug!(trigger_id = %id, paused, changed = n, "trigger pause state updated");
        Ok(())
    }

    fn set_job_paused(&self, job_id: &str, paused: bool, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE id = ?1)",
            [job_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(SchedulerError::JobNotFound { id: job_id.to_string() });
        }
        let n = if paused {
            pause_sql(&conn, "job_id = ?1", job_id, now)?
        } else {
            resume_sql(&conn, "job_id = ?1", job_id, now)?
        };
        info!(job_id = %job_id, paused, triggers = n, "job pause state updated");
        Ok(n)
    }

    fn claim_due_triggers(
        &self,
        instance_id: &str,
        window_end: DateTime<Utc>,
        max_batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Trigger>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Collect eagerly so `stmt` is dropped before the UPDATEs below. A row
        // that fails to decode is kept apart so it cannot fail the whole poll.
        let rows: Vec<(String, rusqlite::Result<Trigger>)> = {
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {TRIGGER_COLUMNS} FROM triggers
                 WHERE state = 'waiting' AND next_fire_at IS NOT NULL AND next_fire_at <= ?1
                 ORDER BY next_fire_at ASC, priority DESC, id ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![ms(window_end), max_batch as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row_to_trigger(row)))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut candidates = Vec::with_capacity(rows.len());
        for (id, decoded) in rows {
            match decoded {
                Ok(trigger) => candidates.push(trigger),
                Err(e) => {
                    // Parked until re-registered in overwrite mode.
                    tx.execute(
                        "UPDATE triggers SET state = 'error', updated_at = ?2
                         WHERE id = ?1 AND state = 'waiting'",
                        params![id, ms(now)],
                    )?;
                    warn!(trigger_id = %id, error = %e, "unreadable trigger moved to error state");
                }
            }
        }

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut trigger in candidates {
            // Compare-and-swap on the state column.
            let n = tx.execute(
                "UPDATE triggers SET state = 'acquired', acquired_by = ?1, acquired_at = ?2,
                 updated_at = ?2
                 WHERE id = ?3 AND state = 'waiting'",
                params![instance_id, ms(now), trigger.spec.id],
            )?;
            if n != 1 {
                debug!(trigger_id = %trigger.spec.id, "claim conflict, leaving for next poll");
                continue;
            }
            trigger.state = TriggerState::Acquired;
            trigger.acquired_by = Some(instance_id.to_string());
            trigger.acquired_at = Some(now);
            trigger.updated_at = now;
            claimed.push(trigger);
        }

        tx.commit()?;
        Ok(claimed)
    }

    fn release_trigger(
        &self,
        instance_id: &str,
        trigger_id: &str,
        next_fire_at: Option<DateTime<Utc>>,
        fired_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE triggers SET
                next_fire_at = ?3,
                prev_fire_at = COALESCE(?4, prev_fire_at),
                fire_count = fire_count + (CASE WHEN ?4 IS NULL THEN 0 ELSE 1 END),
                state = CASE
                    WHEN state = 'paused' THEN 'paused'
                    WHEN ?3 IS NULL THEN 'complete'
                    ELSE 'waiting'
                END,
                acquired_by = NULL,
                acquired_at = NULL,
                updated_at = ?5
             WHERE id = ?1 AND acquired_by = ?2 AND state IN ('acquired', 'paused')",
            params![
                trigger_id,
                instance_id,
                next_fire_at.map(ms),
                fired_at.map(ms),
                ms(now)
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::ClaimConflict {
                trigger_id: trigger_id.to_string(),
            });
        }
        if next_fire_at.is_none() {
            info!(trigger_id = %trigger_id, "trigger schedule exhausted");
        }
        Ok(())
    }

    fn begin_fire(&self, fire: &FireInstance, concurrency: ConcurrencyPolicy) -> Result<FireOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let outcome = match concurrency {
            ConcurrencyPolicy::Allow => FireOutcome::Pending,
            ConcurrencyPolicy::Forbid => {
                let active: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM fire_instances
                     WHERE job_id = ?1 AND outcome IN ('pending', 'running')",
                    [&fire.job_id],
                    |row| row.get(0),
                )?;
                if active > 0 {
                    FireOutcome::Vetoed
                } else {
                    FireOutcome::Pending
                }
            }
        };

        let (finished_at, error) = match outcome {
            FireOutcome::Vetoed => (
                Some(fire.fired_at),
                Some("previous fire of this job is still running".to_string()),
            ),
            _ => (None, None),
        };
        insert_fire(
            &tx,
            &FireInstance {
                outcome,
                finished_at,
                error,
                ..fire.clone()
            },
        )?;

        tx.commit()?;
        Ok(outcome)
    }

    fn mark_running(&self, fire_id: &str) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE fire_instances SET outcome = 'running' WHERE id = ?1 AND outcome = 'pending'",
            [fire_id],
        )?;
        if n == 0 {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM fire_instances WHERE id = ?1)",
                [fire_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(SchedulerError::FireNotFound {
                    id: fire_id.to_string(),
                });
            }
        }
        Ok(())
    }

    fn record_fire(&self, fire: &FireInstance) -> Result<()> {
        let conn = self.conn()?;
        insert_fire(&conn, fire)
    }

    fn complete_fire(
        &self,
        fire_id: &str,
        outcome: FireOutcome,
        error: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE fire_instances SET outcome = ?2, error = ?3, finished_at = ?4
             WHERE id = ?1 AND outcome IN ('pending', 'running')",
            params![fire_id, outcome.as_str(), error, ms(finished_at)],
        )?;
        if n == 0 {
            let current: Option<String> = conn
                .query_row(
                    "SELECT outcome FROM fire_instances WHERE id = ?1",
                    [fire_id],
                    |row| row.get(0),
                )
                .optional()?;
            match current {
                Some(current) => {
                    debug!(fire_id = %fire_id, %current, attempted = %outcome, "fire already finalised");
                }
                None => {
                    return Err(SchedulerError::FireNotFound {
                        id: fire_id.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn get_fire(&self, fire_id: &str) -> Result<Option<FireInstance>> {
        let conn = self.conn()?;
        let fire = conn
            .query_row(
                &format!("SELECT {FIRE_COLUMNS} FROM fire_instances WHERE id = ?1"),
                [fire_id],
                row_to_fire,
            )
            .optional()?;
        Ok(fire)
    }

    fn fire_history(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<FireInstance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FIRE_COLUMNS} FROM fire_instances
             WHERE (?1 IS NULL OR job_id = ?1)
             ORDER BY fired_at DESC, id DESC
             LIMIT ?2"
        ))?;
        let fires = stmt
            .query_map(params![job_id, limit as i64], row_to_fire)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(fires)
    }

    fn check_in(&self, instance_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scheduler_instances (instance_id, last_checkin) VALUES (?1, ?2)
             ON CONFLICT (instance_id) DO UPDATE SET last_checkin = excluded.last_checkin",
            params![instance_id, ms(now)],
        )?;
        Ok(())
    }

    fn check_out(&self, instance_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM scheduler_instances WHERE instance_id = ?1",
            [instance_id],
        )?;
        Ok(())
    }

    fn recover(&self, now: DateTime<Utc>, acquired_timeout: Duration, instance_timeout: Duration) -> Result<RecoveryReport> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut report = RecoveryReport::default();
        let now_ms = ms(now);

        // Expired claims: due again at their original fire time.
        let acquired_cutoff = now_ms - acquired_timeout.as_millis() as i64;
        let stale: Vec<(String, String, Option<String>, Option<i64>)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id, job_id, acquired_by, next_fire_at FROM triggers
                 WHERE state = 'acquired' AND acquired_at < ?1",
            )?;
            let rows = stmt
                .query_map([acquired_cutoff], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for (trigger_id, job_id, holder, next_fire_at) in stale {
            let n = tx.execute(
                "UPDATE triggers SET
                    state = CASE WHEN next_fire_at IS NULL THEN 'complete' ELSE 'waiting' END,
                    acquired_by = NULL, acquired_at = NULL, updated_at = ?2
                 WHERE id = ?1 AND state = 'acquired'",
                params![trigger_id, now_ms],
            )?;
            if n == 0 {
                continue;
            }
            let holder = holder.unwrap_or_else(|| "unknown".to_string());
            insert_fire(
                &tx,
                &FireInstance {
                    id: uuid::Uuid::now_v7().to_string(),
                    trigger_id: trigger_id.clone(),
                    job_id,
                    instance_id: holder.clone(),
                    scheduled_at: next_fire_at.map(from_ms_lossy).unwrap_or(now),
                    fired_at: now,
                    finished_at: Some(now),
                    outcome: FireOutcome::Failed,
                    error: Some(format!("claim held by instance {holder} expired")),
                },
            )?;
            warn!(trigger_id = %trigger_id, instance = %holder, "expired trigger claim recovered");
            report.recovered_triggers.push(trigger_id);
        }

        // Instances that stopped checking in: their running fires will never report.
        let instance_cutoff = now_ms - instance_timeout.as_millis() as i64;
        let lost: Vec<String> = {
            let mut stmt = tx.prepare_cached(
                "SELECT instance_id FROM scheduler_instances WHERE last_checkin < ?1",
            )?;
            let rows = stmt
                .query_map([instance_cutoff], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for instance in lost {
            let failed = tx.execute(
                "UPDATE fire_instances SET outcome = 'failed', error = ?2, finished_at = ?3
                 WHERE instance_id = ?1 AND outcome IN ('pending', 'running')",
                params![
                    instance,
                    format!("scheduler instance {instance} stopped checking in"),
                    now_ms
                ],
            )?;
            tx.execute(
                "DELETE FROM scheduler_instances WHERE instance_id = ?1",
                [&instance],
            )?;
            warn!(instance = %instance, failed_fires = failed, "lost scheduler instance cleaned up");
            report.failed_fires += failed;
            report.lost_instances.push(instance);
        }

        tx.commit()?;
        Ok(report)
    }
}

// --- row mapping helpers -------------------------------------------------

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms_lossy(v: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(v).unwrap_or_default()
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let v: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(v)
        .ok_or_else(|| conversion_error(idx, format!("timestamp {v} out of range")))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => ts(row, idx).map(Some),
        None => Ok(None),
    }
}

fn parse_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_error(idx, e))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobDefinition> {
    Ok(JobDefinition {
        id: row.get(0)?,
        job_type: row.get(1)?,
        data: BTreeMap::new(),
        concurrency: parse_col(row, 2)?,
        description: row.get(3)?,
        max_runtime_secs: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        created_at: ts(row, 5)?,
        updated_at: ts(row, 6)?,
    })
}

fn row_to_trigger(row: &Row<'_>) -> rusqlite::Result<Trigger> {
    let schedule_json: String = row.get(2)?;
    let schedule: Schedule =
        serde_json::from_str(&schedule_json).map_err(|e| conversion_error(2, e.to_string()))?;
    Ok(Trigger {
        spec: TriggerSpec {
            id: row.get(0)?,
            job_id: row.get(1)?,
            schedule,
            start_at: opt_ts(row, 3)?,
            end_at: opt_ts(row, 4)?,
            max_fires: row.get(5)?,
            priority: row.get(6)?,
            misfire_policy: parse_col(row, 7)?,
        },
        next_fire_at: opt_ts(row, 8)?,
        prev_fire_at: opt_ts(row, 9)?,
        fire_count: row.get(10)?,
        state: parse_col(row, 11)?,
        acquired_by: row.get(12)?,
        acquired_at: opt_ts(row, 13)?,
        created_at: ts(row, 14)?,
        updated_at: ts(row, 15)?,
    })
}

fn row_to_fire(row: &Row<'_>) -> rusqlite::Result<FireInstance> {
    Ok(FireInstance {
        id: row.get(0)?,
        trigger_id: row.get(1)?,
        job_id: row.get(2)?,
        instance_id: row.get(3)?,
        scheduled_at: ts(row, 4)?,
        fired_at: ts(row, 5)?,
        finished_at: opt_ts(row, 6)?,
        outcome: parse_col(row, 7)?,
        error: row.get(8)?,
    })
}

fn read_job_data(conn: &Connection, job_id: &str) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare_cached("SELECT key, value FROM job_data WHERE job_id = ?1")?;
    let data = stmt
        .query_map([job_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<BTreeMap<String, String>>>()?;
    Ok(data)
}

fn write_job_data(conn: &Connection, job_id: &str, data: &BTreeMap<String, String>) -> Result<()> {
    let mut stmt =
        conn.prepare_cached("INSERT INTO job_data (job_id, key, value) VALUES (?1, ?2, ?3)")?;
    for (key, value) in data {
        stmt.execute(params![job_id, key, value])?;
    }
    Ok(())
}

fn insert_fire(conn: &Connection, fire: &FireInstance) -> Result<()> {
    conn.execute(
        "INSERT INTO fire_instances
         (id, trigger_id, job_id, instance_id, scheduled_at, fired_at, finished_at, outcome, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            fire.id,
            fire.trigger_id,
            fire.job_id,
            fire.instance_id,
            ms(fire.scheduled_at),
            ms(fire.fired_at),
            fire.finished_at.map(ms),
            fire.outcome.as_str(),
            fire.error,
        ],
    )?;
    Ok(())
}

fn pause_sql(conn: &Connection, filter: &str, key: &str, now: DateTime<Utc>) -> Result<usize> {
    // An acquired trigger keeps its claim holder so the pending release
    // still matches; release preserves the paused state.
    let n = conn.execute(
        &format!(
            "UPDATE triggers SET state = 'paused', updated_at = ?2
             WHERE {filter} AND state IN ('waiting', 'acquired')"
        ),
        params![key, ms(now)],
    )?;
    Ok(n)
}

fn resume_sql(conn: &Connection, filter: &str, key: &str, now: DateTime<Utc>) -> Result<usize> {
    let n = conn.execute(
        &format!(
            "UPDATE triggers SET
                state = CASE
                    WHEN acquired_by IS NOT NULL THEN 'acquired'
                    WHEN next_fire_at IS NULL THEN 'complete'
                    ELSE 'waiting'
                END,
                updated_at = ?2
             WHERE {filter} AND state = 'paused'"
        ),
        params![key, ms(now)],
    )?;
    Ok(n)
}
