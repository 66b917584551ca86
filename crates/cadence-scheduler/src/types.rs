use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Defines when and how often a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },

    /// Fire repeatedly with a fixed interval in seconds.
    Interval { every_secs: u64 },

    /// Fire according to a cron expression, evaluated in UTC.
    Cron { expression: String },
}

impl Schedule {
    pub fn cron(expression: impl Into<String>) -> Self {
        Schedule::Cron {
            expression: expression.into(),
        }
    }

    pub fn every_secs(every_secs: u64) -> Self {
        Schedule::Interval { every_secs }
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        Schedule::Once { at }
    }
}

/// Whether two fires of the same job may run at the same time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    #[default]
    Allow,
    /// A fire that finds a previous one still running is vetoed.
    Forbid,
}

/// What to do with a fire that is claimed later than the misfire threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Fire now and keep the schedule anchored to the missed time, so every
    /// missed occurrence fires in turn.
    FireNow,
    /// Do not fire; continue with the first occurrence after now.
    Skip,
    /// Fire once now; missed occurrences are folded into this one.
    #[default]
    FireOnce,
}

/// Persisted lifecycle of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Waiting for `next_fire_at`.
    Waiting,
    /// Claimed by a scheduler instance and being fired.
    Acquired,
    /// Excluded from claims until resumed.
    Paused,
    /// Schedule exhausted; will never fire again.
    Complete,
    /// Left aside after an unrecoverable problem (e.g. corrupt schedule).
    Error,
}

/// Outcome of a single fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireOutcome {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Not started because a previous fire of a no-overlap job was running.
    Vetoed,
    /// Exceeded its max runtime; the job may still be finishing.
    TimedOut,
    /// Skipped under the `skip` misfire policy.
    Misfired,
    /// Still running when shutdown gave up waiting.
    Abandoned,
}

impl FireOutcome {
    /// Pending and running fires count against the no-overlap rule.
    pub fn is_active(self) -> bool {
        matches!(self, FireOutcome::Pending | FireOutcome::Running)
    }
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($ty), ": {}"), other)),
                }
            }
        }
    };
}

string_enum!(ConcurrencyPolicy { Allow => "allow", Forbid => "forbid" });
string_enum!(MisfirePolicy { FireNow => "fire_now", Skip => "skip", FireOnce => "fire_once" });
string_enum!(TriggerState {
    Waiting => "waiting",
    Acquired => "acquired",
    Paused => "paused",
    Complete => "complete",
    Error => "error",
});
string_enum!(FireOutcome {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Vetoed => "vetoed",
    TimedOut => "timed_out",
    Misfired => "misfired",
    Abandoned => "abandoned",
});

/// A registered unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique job id, the primary key.
    pub id: String,
    /// Key into the [`JobRegistry`](crate::registry::JobRegistry).
    pub job_type: String,
    /// Parameters handed to the job. Values are always strings.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    #[serde(default)]
    pub description: Option<String>,
    /// Execution limit; falls back to the scheduler default when unset.
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, job_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            job_type: job_type.into(),
            data: BTreeMap::new(),
            concurrency: ConcurrencyPolicy::Allow,
            description: None,
            max_runtime_secs: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyPolicy) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_runtime_secs(mut self, secs: u64) -> Self {
        self.max_runtime_secs = Some(secs);
        self
    }
}

/// The user-supplied part of a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub id: String,
    pub job_id: String,
    pub schedule: Schedule,
    /// No fire before this instant.
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    /// No fire after this instant.
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    /// Stop after this many fires.
    #[serde(default)]
    pub max_fires: Option<u32>,
    /// Higher fires first when two triggers share a fire time.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
}

impl TriggerSpec {
    pub fn new(id: impl Into<String>, job_id: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            id: id.into(),
            job_id: job_id.into(),
            schedule,
            start_at: None,
            end_at: None,
            max_fires: None,
            priority: 0,
            misfire_policy: MisfirePolicy::default(),
        }
    }

    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = Some(at);
        self
    }

    pub fn ending_at(mut self, at: DateTime<Utc>) -> Self {
        self.end_at = Some(at);
        self
    }

    pub fn with_max_fires(mut self, n: u32) -> Self {
        self.max_fires = Some(n);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }
}

/// A persisted trigger: its spec plus runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(flatten)]
    pub spec: TriggerSpec,
    /// `None` once the schedule is exhausted.
    pub next_fire_at: Option<DateTime<Utc>>,
    pub prev_fire_at: Option<DateTime<Utc>>,
    pub fire_count: u32,
    pub state: TriggerState,
    /// Instance holding the claim while `state` is `acquired`.
    pub acquired_by: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn job_id(&self) -> &str {
        &self.spec.job_id
    }
}

/// One concrete occurrence of a trigger becoming due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireInstance {
    /// UUID v7 string; sorts by creation time.
    pub id: String,
    pub trigger_id: String,
    pub job_id: String,
    /// Scheduler instance that fired it.
    pub instance_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: FireOutcome,
    /// Captured failure detail.
    pub error: Option<String>,
}

impl FireInstance {
    pub fn new(
        trigger: &Trigger,
        instance_id: &str,
        scheduled_at: DateTime<Utc>,
        fired_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            trigger_id: trigger.spec.id.clone(),
            job_id: trigger.spec.job_id.clone(),
            instance_id: instance_id.to_string(),
            scheduled_at,
            fired_at,
            finished_at: None,
            outcome: FireOutcome::Pending,
            error: None,
        }
    }

    /// Mark as finished with `outcome`.
    pub fn finish(mut self, outcome: FireOutcome, error: Option<String>, at: DateTime<Utc>) -> Self {
        self.outcome = outcome;
        self.error = error;
        self.finished_at = Some(at);
        self
    }
}

/// How a duplicate id is handled at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// Replace the stored record.
    Overwrite,
    /// Keep the stored record and report [`RegisterOutcome::Skipped`].
    Ignore,
    /// Reject with a configuration error.
    Reject,
}

impl RegisterMode {
    /// Overwrite wins when both flags are set.
    pub fn from_flags(overwrite_existing: bool, ignore_duplicates: bool) -> Self {
        if overwrite_existing {
            RegisterMode::Overwrite
        } else if ignore_duplicates {
            RegisterMode::Ignore
        } else {
            RegisterMode::Reject
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOutcome {
    Created,
    Replaced,
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_strings_round_trip() {
        for outcome in [
            FireOutcome::Pending,
            FireOutcome::Running,
            FireOutcome::Succeeded,
            FireOutcome::Failed,
            FireOutcome::Vetoed,
            FireOutcome::TimedOut,
            FireOutcome::Misfired,
            FireOutcome::Abandoned,
        ] {
            assert_eq!(outcome.as_str().parse::<FireOutcome>().unwrap(), outcome);
        }
        assert_eq!("paused".parse::<TriggerState>().unwrap(), TriggerState::Paused);
        assert!("sleeping".parse::<TriggerState>().is_err());
    }

    #[test]
    fn serde_names_match_store_strings() {
        let json = serde_json::to_string(&MisfirePolicy::FireNow).unwrap();
        assert_eq!(json, format!("\"{}\"", MisfirePolicy::FireNow.as_str()));
        let json = serde_json::to_string(&FireOutcome::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
    }

    #[test]
    fn schedule_is_tagged_by_kind() {
        let json = serde_json::to_string(&Schedule::every_secs(60)).unwrap();
        assert_eq!(json, r#"{"kind":"interval","every_secs":60}"#);
        let back: Schedule = serde_json::from_str(r#"{"kind":"cron","expression":"@daily"}"#).unwrap();
        assert_eq!(back, Schedule::cron("@daily"));
    }

    #[test]
    fn register_mode_prefers_overwrite() {
        assert_eq!(RegisterMode::from_flags(true, true), RegisterMode::Overwrite);
        assert_eq!(RegisterMode::from_flags(false, true), RegisterMode::Ignore);
        assert_eq!(RegisterMode::from_flags(false, false), RegisterMode::Reject);
    }

    #[test]
    fn active_outcomes() {
        assert!(FireOutcome::Running.is_active());
        assert!(FireOutcome::Pending.is_active());
        assert!(!FireOutcome::TimedOut.is_active());
    }
}
