use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    job::{Job, JobContext, JobError},
    store::JobStore,
    types::{ConcurrencyPolicy, FireInstance, FireOutcome, JobDefinition},
};

/// Result of handing a fire to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The job is running in a worker slot.
    Started,
    /// Not started: the job forbids overlap and a previous fire is active.
    Vetoed,
}

/// What happened to in-flight work on shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight execution finished within the timeout.
    pub completed: bool,
    /// Fire ids still running when the timeout elapsed.
    pub abandoned: Vec<String>,
}

/// Snapshot of one in-flight execution.
#[derive(Debug, Clone)]
pub struct RunningFire {
    pub fire_id: String,
    pub job_id: String,
    pub trigger_id: String,
    pub running_for: Duration,
}

struct Slot {
    job_id: String,
    trigger_id: String,
    started: Instant,
    cancel: CancellationToken,
}

/// Bounded worker pool.
///
/// Each submission takes one of `pool_size` slots for as long as the job body
/// actually runs, including past a timeout: a job that ignores cancellation
/// keeps its slot until it returns.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    pool_size: usize,
    default_max_runtime: Option<Duration>,
    slots: Arc<Semaphore>,
    running: Arc<DashMap<String, Slot>>,
    tracker: TaskTracker,
    /// Parent of every job's cancellation token.
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        instance_id: impl Into<String>,
        pool_size: usize,
        default_max_runtime: Option<Duration>,
    ) -> Self {
        Self {
            store,
            clock,
            instance_id: instance_id.into(),
            pool_size,
            default_max_runtime,
            slots: Arc::new(Semaphore::new(pool_size)),
            running: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    pub fn is_accepting(&self) -> bool {
        !self.slots.is_closed()
    }

    /// In-flight executions, longest running first.
    pub fn running(&self) -> Vec<RunningFire> {
        let mut fires: Vec<RunningFire> = self
            .running
            .iter()
            .map(|entry| RunningFire {
                fire_id: entry.key().clone(),
                job_id: entry.job_id.clone(),
                trigger_id: entry.trigger_id.clone(),
                running_for: entry.started.elapsed(),
            })
            .collect();
        fires.sort_by(|a, b| b.running_for.cmp(&a.running_for));
        fires
    }

    /// Refuse new submissions. A submit waiting for a slot gives up and its
    /// fire is recorded as abandoned; running jobs are not touched.
    pub fn close(&self) {
        if !self.slots.is_closed() {
            debug!(instance = %self.instance_id, "dispatcher closed to new fires");
        }
        self.slots.close();
    }

    /// Ask a running fire to stop. Returns false if it is not running here.
    pub fn cancel(&self, fire_id: &str) -> bool {
        match self.running.get(fire_id) {
            Some(slot) => {
                slot.cancel.cancel();
                info!(fire_id, job_id = %slot.job_id, "fire cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Record `fire` and run `executable` in a worker slot.
    ///
    /// Waits for a free slot when the pool is saturated. The overlap check
    /// happens before waiting, so a vetoed fire never queues. A forbid job
    /// is vetoed while any earlier fire of it still runs here, including one
    /// past its timeout. Fails with [`SchedulerError::Shutdown`] once
    /// [`close`](Self::close) or [`shutdown`](Self::shutdown) has been called;
    /// the fire is then recorded as abandoned.
    pub async fn submit(
        &self,
        fire: FireInstance,
        job: &JobDefinition,
        executable: Arc<dyn Job>,
    ) -> Result<SubmitOutcome> {
        if self.slots.is_closed() {
            let now = self.clock.now();
            self.store.record_fire(&fire.finish(
                FireOutcome::Abandoned,
                Some("scheduler stopped before the fire could start".to_string()),
                now,
            ))?;
            return Err(SchedulerError::Shutdown);
        }

        if job.concurrency == ConcurrencyPolicy::Forbid && self.is_running_job(&fire.job_id) {
            info!(
                job_id = %fire.job_id,
                trigger_id = %fire.trigger_id,
                fire_id = %fire.id,
                "fire vetoed: previous run still executing on this instance"
            );
            let now = self.clock.now();
            self.store.record_fire(&fire.finish(
                FireOutcome::Vetoed,
                Some("previous fire of this job is still running".to_string()),
                now,
            ))?;
            return Ok(SubmitOutcome::Vetoed);
        }

        if self.store.begin_fire(&fire, job.concurrency)? == FireOutcome::Vetoed {
            info!(
                job_id = %fire.job_id,
                trigger_id = %fire.trigger_id,
                fire_id = %fire.id,
                "fire vetoed: previous run still active"
            );
            return Ok(SubmitOutcome::Vetoed);
        }

        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.store.complete_fire(
                    &fire.id,
                    FireOutcome::Abandoned,
                    Some("scheduler stopped before a worker slot was free"),
                    self.clock.now(),
                )?;
                return Err(SchedulerError::Shutdown);
            }
        };

        if let Err(e) = self.store.mark_running(&fire.id) {
            // The permit drops here; the fire stays pending until recovery.
            error!(fire_id = %fire.id, error = %e, "could not mark fire running");
            return Err(e);
        }

        let token = self.cancel.child_token();
        self.running.insert(
            fire.id.clone(),
            Slot {
                job_id: fire.job_id.clone(),
                trigger_id: fire.trigger_id.clone(),
                started: Instant::now(),
                cancel: token.clone(),
            },
        );

        let ctx = JobContext::new(
            fire.job_id.clone(),
            fire.trigger_id.clone(),
            fire.id.clone(),
            fire.scheduled_at,
            fire.fired_at,
            job.data.clone(),
            token.clone(),
        );
        let max_runtime = job
            .max_runtime_secs
            .map(Duration::from_secs)
            .or(self.default_max_runtime);

        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let running = Arc::clone(&self.running);
        let fire_id = fire.id;
        let job_id = fire.job_id;

        debug!(fire_id = %fire_id, job_id = %job_id, "fire started");

        self.tracker.spawn(async move {
            let _permit = permit;
            let started = Instant::now();

            let body = AssertUnwindSafe(async move { executable.run(ctx).await }).catch_unwind();
            tokio::pin!(body);

            let result = match max_runtime {
                Some(limit) => match tokio::time::timeout(limit, &mut body).await {
                    Ok(result) => result,
                    Err(_) => {
                        token.cancel();
                        warn!(
                            fire_id = %fire_id,
                            job_id = %job_id,
                            limit_secs = limit.as_secs_f64(),
                            "fire exceeded max runtime, cancellation requested"
                        );
                        // The fire stays `running` and keeps its slot until
                        // the body returns, so no-overlap still holds.
                        let _ = body.await;
                        debug!(
                            fire_id = %fire_id,
                            runtime_ms = started.elapsed().as_millis() as u64,
                            "timed-out fire returned"
                        );
                        finish(
                            store.as_ref(),
                            &fire_id,
                            FireOutcome::TimedOut,
                            Some(format!("exceeded max runtime of {:?}", limit)),
                            clock.now(),
                        );
                        running.remove(&fire_id);
                        return;
                    }
                },
                None => body.await,
            };

            let (outcome, detail) = match result {
                Ok(Ok(())) => (FireOutcome::Succeeded, None),
                Ok(Err(JobError::Cancelled)) => {
                    (FireOutcome::Failed, Some("cancelled".to_string()))
                }
                Ok(Err(e)) => (FireOutcome::Failed, Some(e.to_string())),
                Err(panic) => (
                    FireOutcome::Failed,
                    Some(format!("job panicked: {}", panic_message(panic.as_ref()))),
                ),
            };

            match outcome {
                FireOutcome::Succeeded => info!(
                    fire_id = %fire_id,
                    job_id = %job_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "fire succeeded"
                ),
                _ => warn!(
                    fire_id = %fire_id,
                    job_id = %job_id,
                    error = detail.as_deref().unwrap_or_default(),
                    "fire failed"
                ),
            }

            finish(store.as_ref(), &fire_id, outcome, detail, clock.now());
            running.remove(&fire_id);
        });

        Ok(SubmitOutcome::Started)
    }

    fn is_running_job(&self, job_id: &str) -> bool {
        self.running.iter().any(|slot| slot.job_id == job_id)
    }

    /// Stop accepting work and wait up to `timeout` for in-flight executions.
    ///
    /// Anything still running afterwards is recorded as abandoned and sent a
    /// cancellation signal; it is not killed.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.close();
        self.tracker.close();

        info!(in_flight = self.in_flight(), timeout_secs = timeout.as_secs_f64(), "dispatcher draining");

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            info!("dispatcher drained");
            return ShutdownReport {
                completed: true,
                abandoned: Vec::new(),
            };
        }

        let now = self.clock.now();
        let mut abandoned: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        abandoned.sort();
        for fire_id in &abandoned {
            finish(
                self.store.as_ref(),
                fire_id,
                FireOutcome::Abandoned,
                Some("still running when shutdown timed out".to_string()),
                now,
            );
        }
        self.cancel.cancel();

        warn!(abandoned = abandoned.len(), "dispatcher shutdown timed out");
        ShutdownReport {
            completed: false,
            abandoned,
        }
    }
}

/// Outcome writes from worker tasks have nowhere to propagate to.
fn finish(
    store: &dyn JobStore,
    fire_id: &str,
    outcome: FireOutcome,
    detail: Option<String>,
    at: chrono::DateTime<chrono::Utc>,
) {
    if let Err(e) = store.complete_fire(fire_id, outcome, detail.as_deref(), at) {
        error!(fire_id, %outcome, error = %e, "failed to record fire outcome");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::job::JobResult;
    use crate::store::SqliteStore;
    use crate::types::{ConcurrencyPolicy, Schedule, Trigger, TriggerSpec, TriggerState};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Sleep(Duration);

    #[async_trait]
    impl Job for Sleep {
        async fn run(&self, _ctx: JobContext) -> JobResult {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl Job for Fail {
        async fn run(&self, _ctx: JobContext) -> JobResult {
            Err(JobError::Failed("smtp relay refused".into()))
        }
    }

    struct Panic;

    #[async_trait]
    impl Job for Panic {
        async fn run(&self, _ctx: JobContext) -> JobResult {
            panic!("boom");
        }
    }

    /// Sleeps until cancelled, counting how many saw the signal.
    struct Cooperative(Arc<AtomicUsize>);

    #[async_trait]
    impl Job for Cooperative {
        async fn run(&self, ctx: JobContext) -> JobResult {
            tokio::select! {
                _ = ctx.cancelled() => {
                    self.0.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::Cancelled)
                }
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
            }
        }
    }

    /// Ignores cancellation and sleeps its full duration.
    struct Stubborn(Duration);

    #[async_trait]
    impl Job for Stubborn {
        async fn run(&self, _ctx: JobContext) -> JobResult {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    fn setup(pool: usize) -> (Arc<SqliteStore>, Dispatcher) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(SystemClock), "test", pool, None);
        (store, dispatcher)
    }

    fn fire(job_id: &str) -> FireInstance {
        let now = Utc::now();
        let trigger = Trigger {
            spec: TriggerSpec::new("t1", job_id, Schedule::every_secs(60)),
            next_fire_at: Some(now),
            prev_fire_at: None,
            fire_count: 0,
            state: TriggerState::Acquired,
            acquired_by: Some("test".into()),
            acquired_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        FireInstance::new(&trigger, "test", now, now)
    }

    async fn outcome_of(store: &SqliteStore, fire_id: &str) -> FireOutcome {
        store.get_fire(fire_id).unwrap().unwrap().outcome
    }

    #[tokio::test]
    async fn failures_are_recorded_and_isolated() {
        let (store, dispatcher) = setup(4);
        let job = JobDefinition::new("j1", "x");

        let ok = fire("j1");
        let failed = fire("j1");
        let panicked = fire("j1");
        dispatcher
            .submit(ok.clone(), &job, Arc::new(Sleep(Duration::from_millis(10))))
            .await
            .unwrap();
        dispatcher.submit(failed.clone(), &job, Arc::new(Fail)).await.unwrap();
        dispatcher.submit(panicked.clone(), &job, Arc::new(Panic)).await.unwrap();

        let report = dispatcher.shutdown(Duration::from_secs(5)).await;
        assert!(report.completed);

        assert_eq!(outcome_of(&store, &ok.id).await, FireOutcome::Succeeded);
        let f = store.get_fire(&failed.id).unwrap().unwrap();
        assert_eq!(f.outcome, FireOutcome::Failed);
        assert_eq!(f.error.as_deref(), Some("smtp relay refused"));
        let p = store.get_fire(&panicked.id).unwrap().unwrap();
        assert_eq!(p.outcome, FireOutcome::Failed);
        assert_eq!(p.error.as_deref(), Some("job panicked: boom"));
    }

    #[tokio::test]
    async fn forbid_overlap_vetoes_while_running() {
        let (store, dispatcher) = setup(4);
        let job = JobDefinition::new("j1", "x").with_concurrency(ConcurrencyPolicy::Forbid);

        let first = fire("j1");
        let second = fire("j1");
        let exec: Arc<dyn Job> = Arc::new(Sleep(Duration::from_millis(200)));
        assert_eq!(
            dispatcher.submit(first.clone(), &job, exec.clone()).await.unwrap(),
            SubmitOutcome::Started
        );
        assert_eq!(
            dispatcher.submit(second.clone(), &job, exec.clone()).await.unwrap(),
            SubmitOutcome::Vetoed
        );

        dispatcher.shutdown(Duration::from_secs(5)).await;
        assert_eq!(outcome_of(&store, &first.id).await, FireOutcome::Succeeded);
        assert_eq!(outcome_of(&store, &second.id).await, FireOutcome::Vetoed);
    }

    #[tokio::test]
    async fn submit_blocks_when_pool_is_full() {
        let (_store, dispatcher) = setup(1);
        let job = JobDefinition::new("j1", "x");
        let exec: Arc<dyn Job> = Arc::new(Sleep(Duration::from_millis(300)));

        let started = Instant::now();
        dispatcher.submit(fire("j1"), &job, exec.clone()).await.unwrap();
        assert_eq!(dispatcher.available_slots(), 0);
        dispatcher.submit(fire("j1"), &job, exec.clone()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));

        dispatcher.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn timeout_marks_fire_and_signals_cancel() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(SystemClock),
            "test",
            2,
            Some(Duration::from_millis(50)),
        );
        let seen = Arc::new(AtomicUsize::new(0));
        let f = fire("j1");
        dispatcher
            .submit(f.clone(), &JobDefinition::new("j1", "x"), Arc::new(Cooperative(seen.clone())))
            .await
            .unwrap();

        let report = dispatcher.shutdown(Duration::from_secs(5)).await;
        assert!(report.completed);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let stored = store.get_fire(&f.id).unwrap().unwrap();
        assert_eq!(stored.outcome, FireOutcome::TimedOut);
    }

    #[tokio::test]
    async fn shutdown_timeout_abandons_stragglers() {
        let (store, dispatcher) = setup(2);
        let seen = Arc::new(AtomicUsize::new(0));
        let f = fire("j1");
        dispatcher
            .submit(f.clone(), &JobDefinition::new("j1", "x"), Arc::new(Cooperative(seen.clone())))
            .await
            .unwrap();
        assert_eq!(dispatcher.in_flight(), 1);

        let report = dispatcher.shutdown(Duration::from_millis(100)).await;
        assert!(!report.completed);
        assert_eq!(report.abandoned, vec![f.id.clone()]);
        assert_eq!(outcome_of(&store, &f.id).await, FireOutcome::Abandoned);

        assert!(matches!(
            dispatcher
                .submit(fire("j1"), &JobDefinition::new("j1", "x"), Arc::new(Fail))
                .await,
            Err(SchedulerError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn cancel_reaches_running_job() {
        let (store, dispatcher) = setup(1);
        let seen = Arc::new(AtomicUsize::new(0));
        let f = fire("j1");
        dispatcher
            .submit(f.clone(), &JobDefinition::new("j1", "x"), Arc::new(Cooperative(seen.clone())))
            .await
            .unwrap();

        assert_eq!(dispatcher.running()[0].fire_id, f.id);
        assert!(dispatcher.cancel(&f.id));
        assert!(!dispatcher.cancel("nope"));

        dispatcher.shutdown(Duration::from_secs(5)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let stored = store.get_fire(&f.id).unwrap().unwrap();
        assert_eq!(stored.outcome, FireOutcome::Failed);
        assert_eq!(stored.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn overrunning_forbid_job_still_blocks_next_fire() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(SystemClock),
            "test",
            4,
            Some(Duration::from_millis(50)),
        );
        let job = JobDefinition::new("j1", "x").with_concurrency(ConcurrencyPolicy::Forbid);
        let exec: Arc<dyn Job> = Arc::new(Stubborn(Duration::from_millis(400)));

        let first = fire("j1");
        dispatcher.submit(first.clone(), &job, exec.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Past its limit but still executing: the row stays active.
        assert_eq!(outcome_of(&store, &first.id).await, FireOutcome::Running);
        assert_eq!(dispatcher.in_flight(), 1);

        let second = fire("j1");
        assert_eq!(
            dispatcher.submit(second.clone(), &job, exec.clone()).await.unwrap(),
            SubmitOutcome::Vetoed
        );

        assert!(dispatcher.shutdown(Duration::from_secs(5)).await.completed);
        let stored = store.get_fire(&first.id).unwrap().unwrap();
        assert_eq!(stored.outcome, FireOutcome::TimedOut);
        assert!(stored.finished_at.unwrap() - stored.fired_at >= chrono::Duration::milliseconds(350));
        assert_eq!(outcome_of(&store, &second.id).await, FireOutcome::Vetoed);
    }

    #[tokio::test]
    async fn forbid_veto_uses_local_running_set() {
        let (store, dispatcher) = setup(4);
        let job = JobDefinition::new("j1", "x").with_concurrency(ConcurrencyPolicy::Forbid);

        let first = fire("j1");
        dispatcher
            .submit(first.clone(), &job, Arc::new(Stubborn(Duration::from_millis(300))))
            .await
            .unwrap();
        // Another instance finalised the row (e.g. recovery); the body still runs here.
        store
            .complete_fire(&first.id, FireOutcome::Failed, Some("recovered"), Utc::now())
            .unwrap();

        let second = fire("j1");
        assert_eq!(
            dispatcher.submit(second.clone(), &job, Arc::new(Fail)).await.unwrap(),
            SubmitOutcome::Vetoed
        );
        let vetoed = store.get_fire(&second.id).unwrap().unwrap();
        assert_eq!(vetoed.outcome, FireOutcome::Vetoed);
        assert!(vetoed.finished_at.is_some());

        dispatcher.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn close_releases_submit_waiting_for_slot() {
        let (store, dispatcher) = setup(1);
        let dispatcher = Arc::new(dispatcher);
        let job = JobDefinition::new("j1", "x");

        dispatcher
            .submit(fire("j1"), &job, Arc::new(Stubborn(Duration::from_secs(2))))
            .await
            .unwrap();

        let queued = fire("j1");
        let waiting = {
            let dispatcher = Arc::clone(&dispatcher);
            let queued = queued.clone();
            let job = job.clone();
            tokio::spawn(async move { dispatcher.submit(queued, &job, Arc::new(Fail)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        let started = Instant::now();
        dispatcher.close();
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(SchedulerError::Shutdown)));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(outcome_of(&store, &queued.id).await, FireOutcome::Abandoned);
        assert!(!dispatcher.is_accepting());

        dispatcher.shutdown(Duration::from_millis(50)).await;
    }
}
