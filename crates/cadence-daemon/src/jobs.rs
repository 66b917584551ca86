//! Job types every daemon registers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_scheduler::{Job, JobContext, JobError, JobRegistry, JobResult};
use tracing::info;

/// Data keys consumed by [`HttpPostJob`] itself rather than sent as payload.
const URL_KEY: &str = "url";
const AUTH_ENV_KEY: &str = "auth_env";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn register_builtin(registry: &JobRegistry) {
    registry.register("log", Arc::new(LogJob));
    registry.register("http_post", Arc::new(HttpPostJob::new()));
}

/// Writes its `message` data value to the log.
pub struct LogJob;

#[async_trait]
impl Job for LogJob {
    async fn run(&self, ctx: JobContext) -> JobResult {
        let message = ctx.get("message").unwrap_or("(no message)");
        info!(
            job_id = %ctx.job_id,
            trigger_id = %ctx.trigger_id,
            scheduled_at = %ctx.scheduled_at,
            "{message}"
        );
        Ok(())
    }
}

/// POSTs the job data as a JSON object to the `url` data value.
///
/// When `auth_env` is set it names an environment variable holding a bearer
/// token, so secrets stay out of the store. Any non-2xx response fails the
/// fire.
pub struct HttpPostJob {
    client: reqwest::Client,
}

impl HttpPostJob {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    fn payload(ctx: &JobContext) -> serde_json::Map<String, serde_json::Value> {
        ctx.data
            .iter()
            .filter(|(k, _)| k.as_str() != URL_KEY && k.as_str() != AUTH_ENV_KEY)
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect()
    }
}

impl Default for HttpPostJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Job for HttpPostJob {
    async fn run(&self, ctx: JobContext) -> JobResult {
        let url = ctx.require(URL_KEY)?;
        let mut request = self.client.post(url).json(&Self::payload(&ctx));

        if let Some(var) = ctx.get(AUTH_ENV_KEY) {
            let token = std::env::var(var)
                .map_err(|_| JobError::Failed(format!("environment variable {var} is not set")))?;
            request = request.bearer_auth(token);
        }

        let response = tokio::select! {
            res = request.send() => res.map_err(|e| JobError::Failed(format!("POST {url}: {e}")))?,
            _ = ctx.cancelled() => return Err(JobError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JobError::Failed(format!(
                "POST {url} returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        info!(job_id = %ctx.job_id, %url, %status, "http_post delivered");
        Ok(())
    }
}
