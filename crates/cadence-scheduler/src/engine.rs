use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::SchedulerConfig;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    dispatcher::{Dispatcher, RunningFire, ShutdownReport, SubmitOutcome},
    error::{Result, SchedulerError},
    handle::SchedulerHandle,
    registry::JobRegistry,
    schedule::next_fire_time,
    store::{JobStore, RecoveryReport},
    types::{FireInstance, FireOutcome, MisfirePolicy, RegisterMode, Trigger},
};

/// Upper bound on the retry delay while the store is unavailable.
const BACKOFF_MAX: Duration = Duration::from_secs(300);
/// Jitter fraction applied to each retry delay (up to +10 %).
const JITTER_FRACTION: f64 = 0.10;

/// Lifecycle of one scheduler instance.
///
/// `Stopped -> Starting -> Running <-> Paused -> Stopping -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerState::Stopped => "stopped",
            SchedulerState::Starting => "starting",
            SchedulerState::Running => "running",
            SchedulerState::Paused => "paused",
            SchedulerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// What one poll did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub started: usize,
    pub vetoed: usize,
    /// Occurrences skipped under the `skip` misfire policy.
    pub misfired: usize,
    /// Fires recorded as failed without running (no executable, job gone).
    pub unresolved: usize,
    /// Claimed triggers handed back untouched because the loop is stopping.
    pub returned: usize,
    pub recovery: RecoveryReport,
}

/// State shared between the engine, its loop task and every handle.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) instance_id: String,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) register_mode: RegisterMode,
    pub(crate) wake: Notify,
    state: watch::Sender<SchedulerState>,
}

struct Active {
    dispatcher: Arc<Dispatcher>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// One scheduler instance: a polling loop feeding a [`Dispatcher`].
///
/// Any number of engines may share a store, in one process or many; they
/// coordinate only through [`JobStore::claim_due_triggers`].
pub struct SchedulerEngine {
    shared: Arc<Shared>,
    /// Present between a successful `start` and the matching `stop`.
    active: Mutex<Option<Active>>,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("cadence-{}", Uuid::new_v4().simple()));
        let register_mode = RegisterMode::from_flags(
            config.overwrite_existing_on_register,
            config.ignore_duplicate_registration,
        );
        let (state, _) = watch::channel(SchedulerState::Stopped);
        Self {
            shared: Arc::new(Shared {
                config,
                instance_id,
                store,
                registry,
                clock,
                register_mode,
                wake: Notify::new(),
                state,
            }),
            active: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    pub fn state(&self) -> SchedulerState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.shared.state.subscribe()
    }

    /// Registration and query API bound to this instance's store.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(Arc::clone(&self.shared))
    }

    /// Poll now instead of waiting for the next tick.
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    /// Check in, recover anything left behind by dead instances and start
    /// polling. Only legal from `Stopped`.
    pub async fn start(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if !self.transition(&[SchedulerState::Stopped], SchedulerState::Starting) {
            return Err(SchedulerError::InvalidState(format!(
                "cannot start a scheduler that is {}",
                self.state()
            )));
        }

        let shared = &self.shared;
        if let Err(e) = shared.config.validate() {
            shared.state.send_replace(SchedulerState::Stopped);
            return Err(SchedulerError::Configuration(e.to_string()));
        }
        let now = shared.clock.now();
        let startup = shared.store.check_in(&shared.instance_id, now).and_then(|_| {
            shared.store.recover(
                now,
                shared.config.acquired_timeout(),
                shared.config.instance_timeout(),
            )
        });
        let recovery = match startup {
            Ok(report) => report,
            Err(e) => {
                self.shared.state.send_replace(SchedulerState::Stopped);
                return Err(e);
            }
        };
        if !recovery.is_empty() {
            warn!(
                recovered = recovery.recovered_triggers.len(),
                lost_instances = recovery.lost_instances.len(),
                failed_fires = recovery.failed_fires,
                "recovered state left by other instances"
            );
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&shared.store),
            Arc::clone(&shared.clock),
            shared.instance_id.clone(),
            shared.config.worker_pool_size,
            shared.config.default_max_runtime_secs.map(Duration::from_secs),
        ));
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            Arc::clone(shared),
            Arc::clone(&dispatcher),
            stop.clone(),
        ));
        *active = Some(Active {
            dispatcher,
            stop,
            task,
        });

        shared.state.send_replace(SchedulerState::Running);
        info!(
            instance = %shared.instance_id,
            pool = shared.config.worker_pool_size,
            poll_ms = shared.config.poll_interval_ms,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop claiming triggers. Running jobs are not affected.
    pub fn pause(&self) -> Result<()> {
        if !self.transition(&[SchedulerState::Running], SchedulerState::Paused) {
            return Err(SchedulerError::InvalidState(format!(
                "cannot pause a scheduler that is {}",
                self.state()
            )));
        }
        info!(instance = %self.shared.instance_id, "scheduler paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        if !self.transition(&[SchedulerState::Paused], SchedulerState::Running) {
            return Err(SchedulerError::InvalidState(format!(
                "cannot resume a scheduler that is {}",
                self.state()
            )));
        }
        self.wake();
        info!(instance = %self.shared.instance_id, "scheduler resumed");
        Ok(())
    }

    /// Stop the loop, then give in-flight jobs up to `shutdown_timeout` to
    /// finish. A fire still waiting for a worker slot is recorded as
    /// abandoned. Stopping a stopped scheduler is a no-op.
    pub async fn stop(&self) -> Result<ShutdownReport> {
        let mut active = self.active.lock().await;
        let Some(Active {
            dispatcher,
            stop,
            task,
        }) = active.take()
        else {
            return Ok(ShutdownReport {
                completed: true,
                abandoned: Vec::new(),
            });
        };

        self.shared.state.send_replace(SchedulerState::Stopping);
        info!(instance = %self.shared.instance_id, "scheduler stopping");

        stop.cancel();
        // A loop parked on a full pool would otherwise hold stop until a
        // running job finished.
        dispatcher.close();
        if let Err(e) = task.await {
            error!(error = %e, "scheduler loop task failed");
        }

        let report = dispatcher
            .shutdown(self.shared.config.shutdown_timeout())
            .await;

        if let Err(e) = self.shared.store.check_out(&self.shared.instance_id) {
            warn!(error = %e, "could not check out of the store");
        }
        self.shared.state.send_replace(SchedulerState::Stopped);
        info!(
            instance = %self.shared.instance_id,
            completed = report.completed,
            abandoned = report.abandoned.len(),
            "scheduler stopped"
        );
        Ok(report)
    }

    /// Run one poll immediately. The background loop does the same on every
    /// tick; this is for callers driving time themselves.
    pub async fn tick(&self) -> Result<TickReport> {
        let (dispatcher, stop) = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(a) => (Arc::clone(&a.dispatcher), a.stop.clone()),
                None => {
                    return Err(SchedulerError::InvalidState(
                        "scheduler is not started".to_string(),
                    ))
                }
            }
        };
        if self.state() != SchedulerState::Running {
            return Err(SchedulerError::InvalidState(format!(
                "cannot poll while {}",
                self.state()
            )));
        }
        poll(&self.shared, &dispatcher, &stop).await
    }

    /// In-flight executions on this instance.
    pub async fn running_fires(&self) -> Vec<RunningFire> {
        match self.active.lock().await.as_ref() {
            Some(a) => a.dispatcher.running(),
            None => Vec::new(),
        }
    }

    /// Ask a fire running on this instance to cancel.
    pub async fn cancel_fire(&self, fire_id: &str) -> bool {
        match self.active.lock().await.as_ref() {
            Some(a) => a.dispatcher.cancel(fire_id),
            None => false,
        }
    }

    fn transition(&self, from: &[SchedulerState], to: SchedulerState) -> bool {
        self.shared.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

// --- loop ------------------------------------------------------------------

async fn run_loop(shared: Arc<Shared>, dispatcher: Arc<Dispatcher>, stop: CancellationToken) {
    let mut state_rx = shared.state.subscribe();
    let mut failures: u32 = 0;

    loop {
        let delay = if failures == 0 {
            shared.config.poll_interval()
        } else {
            backoff_delay(shared.config.store_retry(), failures)
        };

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
            _ = shared.wake.notified() => {}
        }

        if *state_rx.borrow_and_update() == SchedulerState::Paused {
            // Sleep through the pause; a resume or stop wakes us.
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = state_rx.changed() => {}
            }
            continue;
        }
        if stop.is_cancelled() {
            break;
        }

        match poll(&shared, &dispatcher, &stop).await {
            Ok(report) => {
                if failures > 0 {
                    info!(after_failures = failures, "store reachable again, polling resumed");
                    failures = 0;
                }
                if report.claimed > 0 {
                    debug!(
                        claimed = report.claimed,
                        started = report.started,
                        vetoed = report.vetoed,
                        misfired = report.misfired,
                        "poll complete"
                    );
                }
            }
            Err(e) if e.is_retryable() => {
                failures = failures.saturating_add(1);
                warn!(
                    error = %e,
                    attempt = failures,
                    retry_after_ms = backoff_delay(shared.config.store_retry(), failures).as_millis() as u64,
                    "store unavailable, backing off"
                );
            }
            Err(e) => {
                error!(error = %e, code = e.code(), "scheduler poll failed");
            }
        }
    }

    debug!(instance = %shared.instance_id, "scheduler loop exited");
}

/// One poll: check in, recover, claim, then fire each claimed trigger.
async fn poll(shared: &Shared, dispatcher: &Dispatcher, stop: &CancellationToken) -> Result<TickReport> {
    let store = shared.store.as_ref();
    let now = shared.clock.now();

    store.check_in(&shared.instance_id, now)?;
    let recovery = store.recover(
        now,
        shared.config.acquired_timeout(),
        shared.config.instance_timeout(),
    )?;

    let window_end = now + to_chrono(shared.config.max_lookahead());
    let claimed = store.claim_due_triggers(
        &shared.instance_id,
        window_end,
        shared.config.max_batch,
        now,
    )?;

    let mut report = TickReport {
        claimed: claimed.len(),
        recovery,
        ..TickReport::default()
    };

    let mut claimed = claimed.into_iter();
    while let Some(trigger) = claimed.next() {
        if stop.is_cancelled() {
            hand_back(shared, &trigger);
            report.returned += 1;
            for rest in claimed.by_ref() {
                hand_back(shared, &rest);
                report.returned += 1;
            }
            break;
        }
        fire_trigger(shared, dispatcher, stop, trigger, &mut report).await;
    }

    Ok(report)
}

/// Release a claimed trigger with its fire time unchanged.
fn hand_back(shared: &Shared, trigger: &Trigger) {
    let now = shared.clock.now();
    if let Err(e) = shared.store.release_trigger(
        &shared.instance_id,
        trigger.id(),
        trigger.next_fire_at,
        None,
        now,
    ) {
        warn!(trigger_id = %trigger.id(), error = %e, "could not hand back claimed trigger");
    }
}

/// Fire one claimed trigger. Problems are logged and recorded, never
/// propagated: one bad trigger must not stop the rest of the batch.
async fn fire_trigger(
    shared: &Shared,
    dispatcher: &Dispatcher,
    stop: &CancellationToken,
    trigger: Trigger,
    report: &mut TickReport,
) {
    let store = shared.store.as_ref();
    let Some(scheduled) = trigger.next_fire_at else {
        hand_back(shared, &trigger);
        return;
    };

    // Claimed ahead of time through the lookahead window.
    if let Some(wait) = (scheduled - shared.clock.now()).to_std().ok().filter(|d| !d.is_zero()) {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop.cancelled() => {
                hand_back(shared, &trigger);
                report.returned += 1;
                return;
            }
        }
    }

    let now = shared.clock.now();
    let lateness = (now - scheduled).to_std().unwrap_or_default();
    let misfired = lateness > shared.config.misfire_threshold();
    let policy = trigger.spec.misfire_policy;

    // `anchor` is the instant the next occurrence is computed from.
    let (fires, anchor) = match (misfired, policy) {
        (false, _) | (true, MisfirePolicy::FireNow) => (true, scheduled),
        (true, MisfirePolicy::FireOnce) => (true, now),
        (true, MisfirePolicy::Skip) => (false, now),
    };
    if misfired {
        info!(
            trigger_id = %trigger.id(),
            %policy,
            late_secs = lateness.as_secs(),
            "trigger misfired"
        );
    }

    let fired = trigger.fire_count + u32::from(fires);
    let next = next_fire_time(&trigger.spec, anchor, fired);

    match store.release_trigger(
        &shared.instance_id,
        trigger.id(),
        next,
        fires.then_some(now),
        now,
    ) {
        Ok(()) => {}
        Err(SchedulerError::ClaimConflict { .. }) => {
            // Removed, rescheduled or recovered while we held it.
            debug!(trigger_id = %trigger.id(), "claim lost before release, skipping fire");
            return;
        }
        Err(e) => {
            error!(trigger_id = %trigger.id(), error = %e, "failed to release trigger");
            return;
        }
    }

    let fire = FireInstance::new(&trigger, &shared.instance_id, scheduled, now);

    if !fires {
        record(store, fire.finish(FireOutcome::Misfired, None, now));
        report.misfired += 1;
        return;
    }

    let job = match store.get_job(trigger.job_id()) {
        Ok(Some(job)) => job,
        Ok(None) => {
            record(
                store,
                fire.finish(FireOutcome::Failed, Some(format!("job {} no longer exists", trigger.job_id())), now),
            );
            report.unresolved += 1;
            return;
        }
        Err(e) => {
            error!(trigger_id = %trigger.id(), error = %e, "failed to load job");
            record(store, fire.finish(FireOutcome::Failed, Some(e.to_string()), now));
            report.unresolved += 1;
            return;
        }
    };

    let Some(executable) = shared.registry.get(&job.job_type) else {
        warn!(job_id = %job.id, job_type = %job.job_type, "no executable registered for job type");
        record(
            store,
            fire.finish(
                FireOutcome::Failed,
                Some(format!("no executable registered for job type '{}'", job.job_type)),
                now,
            ),
        );
        report.unresolved += 1;
        return;
    };

    debug!(
        trigger_id = %trigger.id(),
        job_id = %job.id,
        scheduled = %scheduled,
        next = ?next,
        "firing trigger"
    );

    match dispatcher.submit(fire, &job, executable).await {
        Ok(SubmitOutcome::Started) => report.started += 1,
        Ok(SubmitOutcome::Vetoed) => report.vetoed += 1,
        Err(SchedulerError::Shutdown) => {
            debug!(trigger_id = %trigger.id(), "dispatcher closed before fire could start");
        }
        Err(e) => {
            error!(trigger_id = %trigger.id(), job_id = %job.id, error = %e, "failed to submit fire");
        }
    }
}

fn record(store: &dyn JobStore, fire: FireInstance) {
    if let Err(e) = store.record_fire(&fire) {
        error!(fire_id = %fire.id, outcome = %fire.outcome, error = %e, "failed to record fire");
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Exponential backoff from `base`, doubling per consecutive failure, capped
/// at [`BACKOFF_MAX`], plus up to 10 % jitter.
fn backoff_delay(base: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1 << exp).min(BACKOFF_MAX.max(base));
    delay + jitter(delay)
}

/// Cheap jitter from the sub-second clock; no rand dependency.
fn jitter(delay: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let max_jitter = (delay.as_millis() as f64 * JITTER_FRACTION) as u64;
    if max_jitter == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(nanos as u64 % max_jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(15);
        let first = backoff_delay(base, 1);
        assert!(first >= base && first <= base + base / 10);
        let third = backoff_delay(base, 3);
        assert!(third >= Duration::from_secs(60) && third <= Duration::from_secs(66));
        let capped = backoff_delay(base, 30);
        assert!(capped >= BACKOFF_MAX && capped <= BACKOFF_MAX + BACKOFF_MAX / 10);
    }

    #[test]
    fn state_names() {
        assert_eq!(SchedulerState::Paused.to_string(), "paused");
        assert_eq!(SchedulerState::Stopping.to_string(), "stopping");
    }
}
