use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::job::Job;

/// Maps job type names to executables.
///
/// Lives in memory only: each process registers its executables at startup,
/// and the store only records the type name.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<dyn Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executable for `job_type`.
    pub fn register(&self, job_type: impl Into<String>, job: Arc<dyn Job>) {
        let job_type = job_type.into();
        let mut jobs = self.jobs.write().expect("job registry poisoned");
        if jobs.insert(job_type.clone(), job).is_some() {
            debug!(job_type = %job_type, "job executable replaced");
        } else {
            debug!(job_type = %job_type, "job executable registered");
        }
    }

    /// Silent no-op if the type is not registered.
    pub fn unregister(&self, job_type: &str) {
        let mut jobs = self.jobs.write().expect("job registry poisoned");
        if jobs.remove(job_type).is_some() {
            debug!(job_type, "job executable unregistered");
        }
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Job>> {
        self.jobs
            .read()
            .expect("job registry poisoned")
            .get(job_type)
            .cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.jobs
            .read()
            .expect("job registry poisoned")
            .contains_key(job_type)
    }

    /// Registered type names, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .jobs
            .read()
            .expect("job registry poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
