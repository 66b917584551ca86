use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}

impl CoreError {
    /// Short machine-readable code, used in CLI output and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::InvalidSetting { .. } => "INVALID_SETTING",
        }
    }

    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        CoreError::InvalidSetting {
            key,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
