use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid schedule, orphan trigger, unknown job type or rejected
    /// duplicate. Raised at registration, before anything reaches the store.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The store could not be reached or a transaction failed.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Another instance won the race for a trigger.
    #[error("Claim conflict on trigger {trigger_id}")]
    ClaimConflict { trigger_id: String },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// No trigger with the given ID exists in the store.
    #[error("Trigger not found: {id}")]
    TriggerNotFound { id: String },

    /// No fire instance with the given ID exists in the store.
    #[error("Fire instance not found: {id}")]
    FireNotFound { id: String },

    /// Illegal lifecycle transition (e.g. resuming a stopped engine).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The dispatcher no longer accepts work.
    #[error("Scheduler is shutting down")]
    Shutdown,
}

impl SchedulerError {
    /// Short error code string for CLI output and logs.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Configuration(_) => "CONFIGURATION_ERROR",
            SchedulerError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            SchedulerError::ClaimConflict { .. } => "CLAIM_CONFLICT",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::TriggerNotFound { .. } => "TRIGGER_NOT_FOUND",
            SchedulerError::FireNotFound { .. } => "FIRE_NOT_FOUND",
            SchedulerError::InvalidState(_) => "INVALID_STATE",
            SchedulerError::Shutdown => "SHUTDOWN",
        }
    }

    /// Whether the loop should back off and retry rather than give up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::StoreUnavailable(_))
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::StoreUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
