//! Data-driven job declarations.
//!
//! A declaration set describes jobs and their triggers as plain data (the
//! daemon reads it from TOML). [`apply`] feeds it through the same
//! [`SchedulerHandle`] registration calls used for dynamic jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::{Result, SchedulerError},
    handle::SchedulerHandle,
    types::{
        ConcurrencyPolicy, JobDefinition, MisfirePolicy, RegisterOutcome, Schedule, TriggerSpec,
    },
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Declarations {
    #[serde(default)]
    pub jobs: Vec<JobDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDeclaration {
    pub id: String,
    pub job_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub triggers: Vec<TriggerDeclaration>,
}

/// Exactly one of `cron`, `every_secs` and `at` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDeclaration {
    pub id: String,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub every_secs: Option<u64>,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_fires: Option<u32>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
}

impl JobDeclaration {
    pub fn to_definition(&self) -> JobDefinition {
        let mut job = JobDefinition::new(&self.id, &self.job_type).with_concurrency(self.concurrency);
        job.data = self.data.clone();
        job.description = self.description.clone();
        job.max_runtime_secs = self.max_runtime_secs;
        job
    }
}

impl TriggerDeclaration {
    pub fn to_spec(&self, job_id: &str) -> Result<TriggerSpec> {
        let schedule = match (&self.cron, self.every_secs, self.at) {
            (Some(expr), None, None) => Schedule::cron(expr.clone()),
            (None, Some(secs), None) => Schedule::every_secs(secs),
            (None, None, Some(at)) => Schedule::once(at),
            _ => {
                return Err(SchedulerError::Configuration(format!(
                    "trigger {}: set exactly one of cron, every_secs or at",
                    self.id
                )))
            }
        };
        Ok(TriggerSpec {
            id: self.id.clone(),
            job_id: job_id.to_string(),
            schedule,
            start_at: self.start_at,
            end_at: self.end_at,
            max_fires: self.max_fires,
            priority: self.priority,
            misfire_policy: self.misfire_policy,
        })
    }
}

/// Counts from one [`apply`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub jobs_created: usize,
    pub jobs_replaced: usize,
    pub triggers_created: usize,
    pub triggers_replaced: usize,
    pub skipped: usize,
    /// Per-entry failures tolerated because `fail_on_error` was false.
    pub errors: Vec<String>,
}

impl ApplyReport {
    fn count_job(&mut self, outcome: RegisterOutcome) {
        match outcome {
            RegisterOutcome::Created => self.jobs_created += 1,
            RegisterOutcome::Replaced => self.jobs_replaced += 1,
            RegisterOutcome::Skipped => self.skipped += 1,
        }
    }

    fn count_trigger(&mut self, outcome: RegisterOutcome) {
        match outcome {
            RegisterOutcome::Created => self.triggers_created += 1,
            RegisterOutcome::Replaced => self.triggers_replaced += 1,
            RegisterOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Register every declared job and trigger.
///
/// With `fail_on_error` the first bad entry aborts the pass (entries before
/// it stay registered). Otherwise bad entries are logged, collected in the
/// report and skipped; a job that fails takes its triggers with it.
pub fn apply(handle: &SchedulerHandle, decls: &Declarations, fail_on_error: bool) -> Result<ApplyReport> {
    let mut report = ApplyReport::default();

    for decl in &decls.jobs {
        match handle.add_job(decl.to_definition()) {
            Ok(outcome) => report.count_job(outcome),
            Err(e) if !fail_on_error => {
                warn!(job_id = %decl.id, error = %e, "skipping declared job");
                report.errors.push(format!("job {}: {e}", decl.id));
                continue;
            }
            Err(e) => return Err(e),
        }

        for trigger in &decl.triggers {
            let result = trigger
                .to_spec(&decl.id)
                .and_then(|spec| handle.schedule(spec));
            match result {
                Ok(scheduled) => report.count_trigger(scheduled.outcome),
                Err(e) if !fail_on_error => {
                    warn!(job_id = %decl.id, trigger_id = %trigger.id, error = %e, "skipping declared trigger");
                    report.errors.push(format!("trigger {}: {e}", trigger.id));
                }
                Err(e) => return Err(e),
            }
        }
    }

    info!(
        jobs_created = report.jobs_created,
        jobs_replaced = report.jobs_replaced,
        triggers_created = report.triggers_created,
        triggers_replaced = report.triggers_replaced,
        skipped = report.skipped,
        errors = report.errors.len(),
        "declarations applied"
    );
    Ok(report)
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
    use std::sync::Arc;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        async fn run(&self, _ctx: JobContext) -> JobResult {
            Ok(())
        }
    }

    fn handle() -> SchedulerHandle {
        let registry = Arc::new(JobRegistry::new());
        registry.register("log", Arc::new(Noop));
        SchedulerEngine::new(
            SchedulerConfig::default(),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            registry,
            Arc::new(ManualClock::new(Utc::now())),
        )
        .handle()
    }

    fn trigger(id: &str) -> TriggerDeclaration {
        TriggerDeclaration {
            id: id.to_string(),
            cron: None,
            every_secs: Some(60),
            at: None,
            start_at: None,
            end_at: None,
            max_fires: None,
            priority: 0,
            misfire_policy: MisfirePolicy::default(),
        }
    }

    fn job(id: &str, job_type: &str, triggers: Vec<TriggerDeclaration>) -> JobDeclaration {
        JobDeclaration {
            id: id.to_string(),
            job_type: job_type.to_string(),
            description: None,
            concurrency: ConcurrencyPolicy::Forbid,
            max_runtime_secs: None,
            data: BTreeMap::from([("message".to_string(), "hello".to_string())]),
            triggers,
        }
    }

    #[test]
    fn schedule_kind_must_be_unambiguous() {
        let mut t = trigger("t1");
        t.cron = Some("@hourly".into());
        assert!(t.to_spec("j1").is_err());
        t.every_secs = None;
        assert_eq!(t.to_spec("j1").unwrap().schedule, Schedule::cron("@hourly"));
    }

    #[test]
    fn apply_registers_and_reapply_overwrites() {
        let h = handle();
        let decls = Declarations {
            jobs: vec![job("j1", "log", vec![trigger("t1"), trigger("t2")])],
        };
        let first = apply(&h, &decls, true).unwrap();
        assert_eq!((first.jobs_created, first.triggers_created), (1, 2));

        let second = apply(&h, &decls, true).unwrap();
        assert_eq!((second.jobs_replaced, second.triggers_replaced), (1, 2));

        let stored = h.get_job("j1").unwrap();
        assert_eq!(stored.concurrency, ConcurrencyPolicy::Forbid);
        assert_eq!(stored.data["message"], "hello");
    }

    #[test]
    fn lenient_apply_skips_bad_entries() {
        let h = handle();
        let mut bad_trigger = trigger("t-bad");
        bad_trigger.every_secs = Some(0);
        let decls = Declarations {
            jobs: vec![
                job("unknown", "sendgrid", vec![trigger("t0")]),
                job("j1", "log", vec![bad_trigger, trigger("t1")]),
            ],
        };

        assert!(apply(&h, &decls, true).is_err());

        let report = apply(&h, &decls, false).unwrap();
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.triggers_created, 1);
        assert!(h.get_trigger("t0").is_err());
        assert!(h.get_trigger("t1").is_ok());
    }
}
