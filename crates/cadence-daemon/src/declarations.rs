//! Declarative job file: loaded at startup, re-applied when it changes.
//!
//! ```toml
//! [[jobs]]
//! id = "nightly-report"
//! job_type = "http_post"
//! concurrency = "forbid"
//! data = { url = "https://hooks.example.com/report", to = "ops@example.com" }
//!
//! [[jobs.triggers]]
//! id = "nightly"
//! cron = "0 30 2 * * *"
//! misfire_policy = "fire_once"
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context};
use cadence_core::DeclarationsConfig;
use cadence_scheduler::{
    declare::{apply, ApplyReport, Declarations},
    SchedulerHandle,
};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub fn parse_file(path: &Path) -> anyhow::Result<Declarations> {
    Figment::new()
        .merge(Toml::file(path))
        .extract()
        .with_context(|| format!("invalid declarations file {}", path.display()))
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Loads the configured file and keeps it applied.
pub struct DeclarationsLoader {
    path: PathBuf,
    config: DeclarationsConfig,
    handle: SchedulerHandle,
    last_modified: Option<SystemTime>,
}

impl DeclarationsLoader {
    /// `None` when no declarations file is configured.
    pub fn new(config: &DeclarationsConfig, handle: SchedulerHandle) -> Option<Self> {
        let path = PathBuf::from(config.path.as_ref()?);
        Some(Self {
            path,
            config: config.clone(),
            handle,
            last_modified: None,
        })
    }

    /// First load. Honours `fail_on_missing_file` and
    /// `fail_on_scheduling_error`.
    pub fn load_initial(&mut self) -> anyhow::Result<Option<ApplyReport>> {
        if !self.path.exists() {
            if self.config.fail_on_missing_file {
                bail!("declarations file {} not found", self.path.display());
            }
            warn!(path = %self.path.display(), "declarations file not found, continuing without it");
            return Ok(None);
        }
        self.last_modified = modified(&self.path);
        let decls = parse_file(&self.path)?;
        let report = apply(&self.handle, &decls, self.config.fail_on_scheduling_error)
            .context("declared schedule rejected")?;
        info!(path = %self.path.display(), jobs = decls.jobs.len(), "declarations loaded");
        Ok(Some(report))
    }

    /// Re-apply if the file changed since the last load. Errors are logged;
    /// a bad edit must not take a running daemon down.
    pub fn rescan(&mut self) -> Option<ApplyReport> {
        let current = modified(&self.path);
        if current.is_none() || current == self.last_modified {
            return None;
        }
        self.last_modified = current;
        debug!(path = %self.path.display(), "declarations file changed");

        let decls = match parse_file(&self.path) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable declarations file");
                return None;
            }
        };
        match apply(&self.handle, &decls, false) {
            Ok(report) => {
                info!(path = %self.path.display(), "declarations re-applied");
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "declarations re-apply failed");
                None
            }
        }
    }

    /// Rescan every `scan_interval_secs` until `stop` fires. Returns `None`
    /// when rescanning is disabled.
    pub fn spawn_rescan(mut self, stop: CancellationToken) -> Option<JoinHandle<()>> {
        if self.config.scan_interval_secs == 0 {
            return None;
        }
        let every = Duration::from_secs(self.config.scan_interval_secs);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.rescan();
                    }
                    _ = stop.cancelled() => break,
                }
            }
        }))
    }
}
