use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_LOOKAHEAD_MS: u64 = 0;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 10;
pub const DEFAULT_MAX_BATCH: usize = 32;
pub const DEFAULT_MISFIRE_THRESHOLD_SECS: u64 = 60;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ACQUIRED_TIMEOUT_SECS: u64 = 300; // 5 min before a claim counts as lost
pub const DEFAULT_INSTANCE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_STORE_RETRY_SECS: u64 = 15;
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
///
/// Nested keys are separated by a double underscore in the environment, e.g.
/// `CADENCE_SCHEDULER__WORKER_POOL_SIZE=4`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub declarations: DeclarationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tuning knobs for one scheduler instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Stable name for this instance. A random one is generated when unset.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// How often the loop checks the store for due triggers.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How far past "now" a poll may claim triggers.
    #[serde(default = "default_max_lookahead_ms")]
    pub max_lookahead_ms: u64,
    /// Upper bound on triggers claimed per poll.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Number of concurrent execution slots.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Lateness after which a fire counts as misfired.
    #[serde(default = "default_misfire_threshold_secs")]
    pub misfire_threshold_secs: u64,
    /// Max wait for in-flight jobs when stopping.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// A trigger held in `acquired` longer than this is recovered.
    #[serde(default = "default_acquired_timeout_secs")]
    pub acquired_timeout_secs: u64,
    /// An instance that has not checked in for this long is presumed dead.
    #[serde(default = "default_instance_timeout_secs")]
    pub instance_timeout_secs: u64,
    /// Base delay before polling again after the store became unavailable.
    #[serde(default = "default_store_retry_secs")]
    pub store_retry_secs: u64,
    /// Execution limit for jobs that do not declare their own.
    #[serde(default)]
    pub default_max_runtime_secs: Option<u64>,
    /// Replace stored jobs/triggers when one with the same id is registered.
    #[serde(default = "bool_true")]
    pub overwrite_existing_on_register: bool,
    /// Keep the stored record instead of failing on a duplicate id.
    #[serde(default = "bool_true")]
    pub ignore_duplicate_registration: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_lookahead_ms: DEFAULT_MAX_LOOKAHEAD_MS,
            max_batch: DEFAULT_MAX_BATCH,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            misfire_threshold_secs: DEFAULT_MISFIRE_THRESHOLD_SECS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            acquired_timeout_secs: DEFAULT_ACQUIRED_TIMEOUT_SECS,
            instance_timeout_secs: DEFAULT_INSTANCE_TIMEOUT_SECS,
            store_retry_secs: DEFAULT_STORE_RETRY_SECS,
            default_max_runtime_secs: None,
            overwrite_existing_on_register: true,
            ignore_duplicate_registration: true,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_lookahead(&self) -> Duration {
        Duration::from_millis(self.max_lookahead_ms)
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_secs(self.misfire_threshold_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn acquired_timeout(&self) -> Duration {
        Duration::from_secs(self.acquired_timeout_secs)
    }

    pub fn instance_timeout(&self) -> Duration {
        Duration::from_secs(self.instance_timeout_secs)
    }

    pub fn store_retry(&self) -> Duration {
        Duration::from_secs(self.store_retry_secs)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(CoreError::invalid("scheduler.worker_pool_size", "must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(CoreError::invalid("scheduler.poll_interval_ms", "must be greater than 0"));
        }
        if self.max_batch == 0 {
            return Err(CoreError::invalid("scheduler.max_batch", "must be at least 1"));
        }
        if self.acquired_timeout_secs == 0 {
            return Err(CoreError::invalid("scheduler.acquired_timeout_secs", "must be greater than 0"));
        }
        if self.instance_timeout_secs == 0 {
            return Err(CoreError::invalid("scheduler.instance_timeout_secs", "must be greater than 0"));
        }
        // A claim is held while waiting out the lookahead; peers must not
        // mistake that wait for a crashed holder.
        if self.max_lookahead_ms >= self.acquired_timeout_secs.saturating_mul(1_000) {
            return Err(CoreError::invalid(
                "scheduler.max_lookahead_ms",
                format!(
                    "must be shorter than acquired_timeout_secs ({}s)",
                    self.acquired_timeout_secs
                ),
            ));
        }
        Ok(())
    }
}

/// Where the declarative job file lives and how it is watched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclarationsConfig {
    /// TOML file with `[[jobs]]` entries. Nothing is loaded when unset.
    #[serde(default)]
    pub path: Option<String>,
    /// Re-read the file this often; 0 disables rescanning.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "bool_true")]
    pub fail_on_missing_file: bool,
    #[serde(default = "bool_true")]
    pub fail_on_scheduling_error: bool,
}

impl Default for DeclarationsConfig {
    fn default() -> Self {
        Self {
            path: None,
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            fail_on_missing_file: true,
            fail_on_scheduling_error: true,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_max_lookahead_ms() -> u64 {
    DEFAULT_MAX_LOOKAHEAD_MS
}
fn default_max_batch() -> usize {
    DEFAULT_MAX_BATCH
}
fn default_worker_pool_size() -> usize {
    DEFAULT_WORKER_POOL_SIZE
}
fn default_misfire_threshold_secs() -> u64 {
    DEFAULT_MISFIRE_THRESHOLD_SECS
}
fn default_shutdown_timeout_secs() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}
fn default_acquired_timeout_secs() -> u64 {
    DEFAULT_ACQUIRED_TIMEOUT_SECS
}
fn default_instance_timeout_secs() -> u64 {
    DEFAULT_INSTANCE_TIMEOUT_SECS
}
fn default_store_retry_secs() -> u64 {
    DEFAULT_STORE_RETRY_SECS
}
fn default_scan_interval_secs() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.scheduler.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn defaults_match_constants() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
        assert_eq!(cfg.worker_pool_size, DEFAULT_WORKER_POOL_SIZE);
        assert!(cfg.overwrite_existing_on_register);
        assert!(cfg.ignore_duplicate_registration);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = CadenceConfig::load(Some("/nonexistent/cadence.toml")).unwrap();
        assert_eq!(cfg.scheduler.max_batch, DEFAULT_MAX_BATCH);
        assert!(cfg.declarations.path.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let file = write_config(
            r#"
            [database]
            path = "/tmp/jobs.db"

            [scheduler]
            worker_pool_size = 3
            misfire_threshold_secs = 5
            overwrite_existing_on_register = false

            [declarations]
            path = "jobs.toml"
            scan_interval_secs = 0
            "#,
        );
        let cfg = CadenceConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.database.path, "/tmp/jobs.db");
        assert_eq!(cfg.scheduler.worker_pool_size, 3);
        assert_eq!(cfg.scheduler.misfire_threshold(), Duration::from_secs(5));
        assert!(!cfg.scheduler.overwrite_existing_on_register);
        assert!(cfg.scheduler.ignore_duplicate_registration);
        assert_eq!(cfg.declarations.path.as_deref(), Some("jobs.toml"));
        assert_eq!(cfg.declarations.scan_interval_secs, 0);
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let file = write_config("[scheduler]\nworker_pool_size = 0\n");
        let err = CadenceConfig::load(file.path().to_str()).unwrap_err();
        assert_eq!(err.code(), "INVALID_SETTING");
        assert!(err.to_string().contains("worker_pool_size"));
    }

    #[test]
    fn lookahead_must_be_shorter_than_claim_timeout() {
        let cfg = SchedulerConfig {
            max_lookahead_ms: 30_000,
            acquired_timeout_secs: 30,
            ..SchedulerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_SETTING");
        assert!(err.to_string().contains("max_lookahead_ms"));

        let cfg = SchedulerConfig {
            max_lookahead_ms: 29_999,
            ..cfg
        };
        assert!(cfg.validate().is_ok());
    }
}
