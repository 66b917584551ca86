//! `cadence-scheduler`: persistent job scheduler on Tokio and SQLite.
//!
//! # Overview
//!
//! Jobs and their triggers live in a [`store::JobStore`] (SQLite by default).
//! A [`SchedulerEngine`] polls the store, atomically claims due triggers,
//! computes their next fire time and hands each fire to a bounded
//! [`dispatcher::Dispatcher`], which runs the job body resolved from the
//! [`JobRegistry`] and records the outcome back in the store.
//!
//! Several engines may share one store file; the claim is the only point
//! where they coordinate.
//!
//! # Schedule variants
//!
//! | Variant    | Behaviour                                      |
//! |------------|------------------------------------------------|
//! | `Once`     | Single fire at an absolute UTC instant         |
//! | `Interval` | Repeat every N seconds                         |
//! | `Cron`     | 5/6-field cron expression, evaluated in UTC    |
//!
//! # Misfires
//!
//! A trigger claimed more than `misfire_threshold` after its fire time is
//! handled by its [`MisfirePolicy`]: `fire_now` replays every missed
//! occurrence, `fire_once` fires a single catch-up run, `skip` records the
//! occurrence as misfired and moves on.

pub mod clock;
pub mod cron;
pub mod db;
pub mod declare;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handle;
pub mod job;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{ShutdownReport, SubmitOutcome};
pub use engine::{SchedulerEngine, SchedulerState, TickReport};
pub use error::{Result, SchedulerError};
pub use handle::{Scheduled, SchedulerHandle};
pub use job::{Job, JobContext, JobError, JobResult};
pub use registry::JobRegistry;
pub use store::{JobStore, SqliteStore};
pub use types::{
    ConcurrencyPolicy, FireInstance, FireOutcome, JobDefinition, MisfirePolicy, RegisterMode,
    RegisterOutcome, Schedule, Trigger, TriggerSpec, TriggerState,
};
