//! Two-phase job calls.
//!
//! Long-running server operations answer the submitting call with a numeric
//! job id. The runner then polls the job query method, filtered by that id,
//! until the job reaches a terminal state:
//!
//! - `SUCCESS`: the job's `result` is the call result
//! - `FAILED` / `ABORTED`: an error carrying the job's error text
//!
//! There is no job store on this side; every poll re-fetches the record.
//! The caller's context is checked between polls, so cancellation is prompt.

use crate::config::ProtocolConfig;
use crate::context::Context;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, RpcError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Job lifecycle as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
    /// Any state this client does not know; treated as still in progress.
    #[serde(other)]
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Aborted)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One polled snapshot of a server-side job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    #[serde(default)]
    pub method: String,
    pub state: JobState,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub progress: Option<JobProgress>,
}

impl Job {
    /// The job's error as text, whatever shape the server sent.
    pub fn error_text(&self) -> String {
        match &self.error {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => format!("job ended in state {:?}", self.state),
            Some(other) => other.to_string(),
        }
    }
}

/// Submits job calls and polls them to completion.
pub struct JobRunner<'a> {
    dispatcher: &'a Dispatcher,
    poll_interval: Duration,
}

impl<'a> JobRunner<'a> {
    pub fn new(dispatcher: &'a Dispatcher, poll_interval: Duration) -> Self {
        Self {
            dispatcher,
            poll_interval,
        }
    }

    /// Submit `method` and wait for its job to finish.
    pub async fn call_job(&self, ctx: &Context, method: &str, params: Vec<Value>) -> Result<Value> {
        self.call_job_with_progress(ctx, method, params, |_| {}).await
    }

    /// Like [`JobRunner::call_job`], decoding the result into `T`.
    pub async fn call_job_typed<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T> {
        let id = self.submit(ctx, method, params).await?;
        let job = self.wait(ctx, id, |_| {}).await?;
        let result = job.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| RpcError::JobResultDecode {
            id,
            message: e.to_string(),
            source: Some(e),
        })
    }

    /// Like [`JobRunner::call_job`], reporting each progress change.
    pub async fn call_job_with_progress(
        &self,
        ctx: &Context,
        method: &str,
        params: Vec<Value>,
        on_progress: impl FnMut(&JobProgress),
    ) -> Result<Value> {
        let id = self.submit(ctx, method, params).await?;
        let job = self.wait(ctx, id, on_progress).await?;
        Ok(job.result.unwrap_or(Value::Null))
    }

    /// Issue the submitting call and read the job id from its result.
    async fn submit(&self, ctx: &Context, method: &str, params: Vec<Value>) -> Result<i64> {
        let submitted = self
            .dispatcher
            .call(ctx, method, params)
            .await
            .map_err(|e| RpcError::JobSubmit {
                method: method.to_string(),
                source: Box::new(e),
            })?;

        let id = submitted.as_i64().ok_or_else(|| RpcError::Decode {
            what: format!("job id returned by {}", method),
            message: format!("expected a number, got {}", submitted),
            source: None,
        })?;
        debug!("{} submitted as job {}", method, id);
        Ok(id)
    }

    /// Poll until the job is terminal. Failed and aborted jobs become errors.
    async fn wait(
        &self,
        ctx: &Context,
        id: i64,
        mut on_progress: impl FnMut(&JobProgress),
    ) -> Result<Job> {
        let mut last_progress: Option<JobProgress> = None;

        loop {
            let job = self.get_job(ctx, id).await?;

            if job.progress.is_some() && job.progress != last_progress {
                if let Some(progress) = &job.progress {
                    debug!(
                        "Job {} ({}) progress {:?}: {}",
                        id,
                        job.method,
                        progress.percent,
                        progress.description.as_deref().unwrap_or("")
                    );
                    on_progress(progress);
                }
                last_progress = job.progress.clone();
            }

            match job.state {
                JobState::Success => {
                    info!("Job {} ({}) succeeded", id, job.method);
                    return Ok(job);
                }
                JobState::Failed | JobState::Aborted => {
                    return Err(RpcError::JobFailed {
                        id,
                        message: job.error_text(),
                        method: job.method,
                    });
                }
                JobState::Waiting | JobState::Running | JobState::Unknown => {}
            }

            tokio::select! {
                biased;
                reason = ctx.done() => return Err(reason.into()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Fetch the current record of job `id`.
    pub async fn get_job(&self, ctx: &Context, id: i64) -> Result<Job> {
        let records = self
            .dispatcher
            .call(
                ctx,
                ProtocolConfig::JOB_QUERY_METHOD,
                vec![json!([["id", "=", id]])],
            )
            .await?;

        let mut jobs: Vec<Job> = serde_json::from_value(records)
            .map_err(|e| RpcError::decode(format!("status of job {}", id), e))?;
        match jobs.iter().position(|job| job.id == id) {
            Some(index) => Ok(jobs.swap_remove(index)),
            None => Err(RpcError::JobNotFound { id }),
        }
    }

    /// Ask the server to abort job `id`.
    pub async fn abort_job(&self, ctx: &Context, id: i64) -> Result<()> {
        self.dispatcher
            .call(ctx, ProtocolConfig::JOB_ABORT_METHOD, vec![json!(id)])
            .await?;
        Ok(())
    }
}
