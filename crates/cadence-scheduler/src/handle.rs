use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::{
    engine::Shared,
    error::{Result, SchedulerError},
    schedule::{next_fire_time, validate},
    types::{
        FireInstance, JobDefinition, RegisterMode, RegisterOutcome, Schedule, Trigger, TriggerSpec,
        TriggerState,
    },
};

/// Priority given to ad-hoc "run now" triggers so they jump the queue.
const TRIGGER_NOW_PRIORITY: i32 = 1_000;

/// Result of scheduling a trigger.
#[derive(Debug, Clone)]
pub struct Scheduled {
    pub outcome: RegisterOutcome,
    /// The stored trigger; for [`RegisterOutcome::Skipped`] this is the
    /// pre-existing record, not the one submitted.
    pub trigger: Trigger,
}

/// Registration and query API of a [`SchedulerEngine`](crate::SchedulerEngine).
///
/// Cheap to clone. Works whether or not the engine is running; changes made
/// while it runs wake the loop so they take effect without waiting a tick.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Duplicate policy applied by [`add_job`](Self::add_job) and
    /// [`schedule`](Self::schedule).
    pub fn register_mode(&self) -> RegisterMode {
        self.shared.register_mode
    }

    /// Register a job definition. Its `job_type` must be known to this
    /// instance's registry.
    pub fn add_job(&self, job: JobDefinition) -> Result<RegisterOutcome> {
        self.add_job_with(job, self.shared.register_mode)
    }

    pub fn add_job_with(&self, mut job: JobDefinition, mode: RegisterMode) -> Result<RegisterOutcome> {
        if job.id.trim().is_empty() {
            return Err(SchedulerError::Configuration("job id must not be empty".to_string()));
        }
        if !self.shared.registry.contains(&job.job_type) {
            return Err(SchedulerError::Configuration(format!(
                "job {}: no executable registered for job type '{}'",
                job.id, job.job_type
            )));
        }
        job.updated_at = self.shared.clock.now();
        let outcome = self.shared.store.register_job(&job, mode)?;
        info!(job_id = %job.id, job_type = %job.job_type, ?outcome, "job registered");
        Ok(outcome)
    }

    /// Validate `spec`, compute its first fire time and store it.
    ///
    /// A trigger that can never fire (a window that has already closed, for
    /// instance) is rejected rather than stored as complete.
    pub fn schedule(&self, spec: TriggerSpec) -> Result<Scheduled> {
        self.schedule_with(spec, self.shared.register_mode)
    }

    pub fn schedule_with(&self, spec: TriggerSpec, mode: RegisterMode) -> Result<Scheduled> {
        if spec.id.trim().is_empty() {
            return Err(SchedulerError::Configuration("trigger id must not be empty".to_string()));
        }
        validate(&spec)?;

        let now = self.shared.clock.now();
        let first = first_fire_time(&spec, now).ok_or_else(|| {
            SchedulerError::Configuration(format!("trigger {} would never fire", spec.id))
        })?;

        let trigger = Trigger {
            spec,
            next_fire_at: Some(first),
            prev_fire_at: None,
            fire_count: 0,
            state: TriggerState::Waiting,
            acquired_by: None,
            acquired_at: None,
            created_at: now,
            updated_at: now,
        };
        let outcome = self.shared.store.register_trigger(&trigger, mode)?;
        let stored = match outcome {
            RegisterOutcome::Skipped => self.get_trigger(trigger.id())?,
            _ => trigger,
        };

        info!(
            trigger_id = %stored.id(),
            job_id = %stored.job_id(),
            next_fire_at = ?stored.next_fire_at,
            ?outcome,
            "trigger scheduled"
        );
        self.shared.wake.notify_one();
        Ok(Scheduled {
            outcome,
            trigger: stored,
        })
    }

    /// Replace a trigger's schedule. Its fire count starts over and the next
    /// fire is computed from now, which may move it earlier.
    pub fn reschedule(&self, trigger_id: &str, schedule: Schedule) -> Result<Option<DateTime<Utc>>> {
        let current = self.get_trigger(trigger_id)?;
        let spec = TriggerSpec {
            schedule,
            ..current.spec
        };
        let scheduled = self.schedule_with(spec, RegisterMode::Overwrite)?;
        Ok(scheduled.trigger.next_fire_at)
    }

    /// Fire a job as soon as possible through a one-shot trigger. Returns the
    /// trigger id.
    pub fn trigger_now(&self, job_id: &str) -> Result<String> {
        self.get_job(job_id)?;
        let now = self.shared.clock.now();
        let trigger_id = format!("{job_id}.now.{}", Uuid::new_v4().simple());
        let spec = TriggerSpec::new(&trigger_id, job_id, Schedule::once(now))
            .with_priority(TRIGGER_NOW_PRIORITY);
        self.schedule_with(spec, RegisterMode::Reject)?;
        Ok(trigger_id)
    }

    pub fn remove_job(&self, job_id: &str) -> Result<()> {
        self.shared.store.remove_job(job_id)
    }

    pub fn remove_trigger(&self, trigger_id: &str) -> Result<()> {
        self.shared.store.remove_trigger(trigger_id)
    }

    pub fn pause_trigger(&self, trigger_id: &str) -> Result<()> {
        self.shared
            .store
            .set_trigger_paused(trigger_id, true, self.shared.clock.now())
    }

    pub fn resume_trigger(&self, trigger_id: &str) -> Result<()> {
        self.shared
            .store
            .set_trigger_paused(trigger_id, false, self.shared.clock.now())?;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Pause every trigger of a job. Returns how many were paused.
    pub fn pause_job(&self, job_id: &str) -> Result<usize> {
        self.shared
            .store
            .set_job_paused(job_id, true, self.shared.clock.now())
    }

    pub fn resume_job(&self, job_id: &str) -> Result<usize> {
        let n = self
            .shared
            .store
            .set_job_paused(job_id, false, self.shared.clock.now())?;
        self.shared.wake.notify_one();
        Ok(n)
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobDefinition> {
        self.shared
            .store
            .get_job(job_id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: job_id.to_string() })
    }

    pub fn get_trigger(&self, trigger_id: &str) -> Result<Trigger> {
        self.shared
            .store
            .get_trigger(trigger_id)?
            .ok_or_else(|| SchedulerError::TriggerNotFound {
                id: trigger_id.to_string(),
            })
    }

    pub fn list_jobs(&self) -> Result<Vec<JobDefinition>> {
        self.shared.store.list_jobs()
    }

    pub fn list_triggers(&self, job_id: Option<&str>) -> Result<Vec<Trigger>> {
        self.shared.store.list_triggers(job_id)
    }

    /// Most recent fires first.
    pub fn history(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<FireInstance>> {
        self.shared.store.fire_history(job_id, limit)
    }
}

/// A one-shot instant already in the past is still due: it fires on the next
/// poll and the misfire policy decides what happens.
fn first_fire_time(spec: &TriggerSpec, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match &spec.schedule {
        Schedule::Once { at } if *at <= now => match spec.end_at {
            Some(end) if *at > end => None,
            _ => Some(*at),
        },
        _ => next_fire_time(spec, now, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::{Job, JobContext, JobResult};
    use crate::registry::JobRegistry;
    use crate::store::SqliteStore;
    use crate::SchedulerEngine;
    use async_trait::async_trait;
    use cadence_core::SchedulerConfig;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        async fn run(&self, _ctx: JobContext) -> JobResult {
            Ok(())
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn engine(config: SchedulerConfig) -> SchedulerEngine {
        let registry = Arc::new(JobRegistry::new());
        registry.register("noop", Arc::new(Noop));
        SchedulerEngine::new(
            config,
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            registry,
            Arc::new(ManualClock::new(at("2024-01-01T00:00:00Z"))),
        )
    }

    #[test]
    fn unknown_job_type_is_a_configuration_error() {
        let handle = engine(SchedulerConfig::default()).handle();
        let err = handle.add_job(JobDefinition::new("j1", "email")).unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn orphan_and_invalid_triggers_never_reach_the_store() {
        let handle = engine(SchedulerConfig::default()).handle();
        handle.add_job(JobDefinition::new("j1", "noop")).unwrap();

        let orphan = TriggerSpec::new("t1", "missing", Schedule::every_secs(60));
        assert_eq!(handle.schedule(orphan).unwrap_err().code(), "CONFIGURATION_ERROR");

        let bad = TriggerSpec::new("t2", "j1", Schedule::cron("61 * * * *"));
        assert_eq!(handle.schedule(bad).unwrap_err().code(), "CONFIGURATION_ERROR");

        let closed = TriggerSpec::new("t3", "j1", Schedule::every_secs(60))
            .ending_at(at("2023-12-31T00:00:00Z"));
        assert!(handle.schedule(closed).is_err());

        assert!(handle.list_triggers(None).unwrap().is_empty());
    }

    #[test]
    fn first_fire_is_computed_from_now() {
        let handle = engine(SchedulerConfig::default()).handle();
        handle.add_job(JobDefinition::new("j1", "noop")).unwrap();
        let s = handle
            .schedule(TriggerSpec::new("t1", "j1", Schedule::cron("0 0 * * *")))
            .unwrap();
        assert_eq!(s.outcome, RegisterOutcome::Created);
        assert_eq!(s.trigger.next_fire_at, Some(at("2024-01-02T00:00:00Z")));

        let past = handle
            .schedule(TriggerSpec::new("t2", "j1", Schedule::once(at("2023-06-01T00:00:00Z"))))
            .unwrap();
        assert_eq!(past.trigger.next_fire_at, Some(at("2023-06-01T00:00:00Z")));
    }

    #[test]
    fn duplicate_trigger_follows_configured_mode() {
        let config = SchedulerConfig {
            overwrite_existing_on_register: false,
            ignore_duplicate_registration: true,
            ..SchedulerConfig::default()
        };
        let handle = engine(config).handle();
        handle.add_job(JobDefinition::new("j1", "noop")).unwrap();
        handle
            .schedule(TriggerSpec::new("t1", "j1", Schedule::every_secs(60)))
            .unwrap();
        let again = handle
            .schedule(TriggerSpec::new("t1", "j1", Schedule::every_secs(5)))
            .unwrap();
        assert_eq!(again.outcome, RegisterOutcome::Skipped);
        assert_eq!(again.trigger.spec.schedule, Schedule::every_secs(60));
    }

    #[test]
    fn reschedule_replaces_schedule() {
        let handle = engine(SchedulerConfig::default()).handle();
        handle.add_job(JobDefinition::new("j1", "noop")).unwrap();
        handle
            .schedule(TriggerSpec::new("t1", "j1", Schedule::cron("@daily")))
            .unwrap();
        let next = handle.reschedule("t1", Schedule::every_secs(30)).unwrap();
        assert_eq!(next, Some(at("2024-01-01T00:00:30Z")));
        assert!(matches!(
            handle.reschedule("nope", Schedule::every_secs(30)),
            Err(SchedulerError::TriggerNotFound { .. })
        ));
    }

    #[test]
    fn trigger_now_adds_due_one_shot() {
        let handle = engine(SchedulerConfig::default()).handle();
        handle.add_job(JobDefinition::new("j1", "noop")).unwrap();
        let id = handle.trigger_now("j1").unwrap();
        let t = handle.get_trigger(&id).unwrap();
        assert_eq!(t.next_fire_at, Some(at("2024-01-01T00:00:00Z")));
        assert_eq!(t.spec.priority, TRIGGER_NOW_PRIORITY);
        assert!(handle.trigger_now("missing").is_err());
    }

    #[test]
    fn pause_and_resume_job() {
        let handle = engine(SchedulerConfig::default()).handle();
        handle.add_job(JobDefinition::new("j1", "noop")).unwrap();
        for id in ["t1", "t2"] {
            handle
                .schedule(TriggerSpec::new(id, "j1", Schedule::every_secs(60)))
                .unwrap();
        }
        assert_eq!(handle.pause_job("j1").unwrap(), 2);
        assert!(handle
            .list_triggers(Some("j1"))
            .unwrap()
            .iter()
            .all(|t| t.state == TriggerState::Paused));
        assert_eq!(handle.resume_job("j1").unwrap(), 2);
        assert_eq!(handle.get_trigger("t1").unwrap().state, TriggerState::Waiting);
    }
}
