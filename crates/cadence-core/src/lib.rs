//! `cadence-core`: configuration and error types shared by the scheduler
//! library and the daemon.

pub mod config;
pub mod error;

pub use config::{CadenceConfig, DatabaseConfig, DeclarationsConfig, SchedulerConfig};
pub use error::{CoreError, Result};
