//! Job poller for `GET /api/result/{id}`.
//!
//! Issues one status query at a time at a fixed interval until the job reaches
//! a terminal status or the attempt ceiling is hit.

use crate::config::{ApiConfig, PollingConfig};
use crate::job::{JobId, JobStatus, ModelInfo, ModelResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Errors that end a conversion wait.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("Conversion failed: {reason}")]
    ConversionFailed { reason: String },

    #[error("Conversion did not finish after {attempts} status checks")]
    Timeout { attempts: u32 },

    #[error("Status query failed with HTTP {status}: {body}")]
    Transport { status: u16, body: String },

    #[error("Status query could not be sent: {0}")]
    Network(String),

    #[error("Status response could not be read: {0}")]
    InvalidResponse(String),

    #[error("Job reported completion without a model")]
    MissingResult,

    #[error("Polling was cancelled")]
    Cancelled,
}

/// Body of `GET /api/result/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultResponse {
    pub status: JobStatus,
    #[serde(default)]
    pub model_info: Option<ModelInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Polls a conversion job until it reaches a terminal status.
#[derive(Debug, Clone)]
pub struct JobPoller {
    http: Client,
    api: ApiConfig,
    interval: Duration,
    max_attempts: u32,
}

impl JobPoller {
    pub fn new(http: Client, api: ApiConfig, polling: &PollingConfig) -> Self {
        Self {
            http,
            api,
            interval: Duration::from_millis(polling.interval_ms),
            max_attempts: polling.max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Issue a single status query.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn query(&self, job_id: &JobId) -> Result<ResultResponse, ConversionError> {
        metrics::counter!("meshcap.polls.issued").increment(1);

        let url = self.api.api_url(&format!("/api/result/{}", job_id));
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ConversionError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConversionError::Transport {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ResultResponse>()
            .await
            .map_err(|e| ConversionError::InvalidResponse(e.to_string()))
    }

    /// Wait for the job to finish, resolving the model URL against the API base.
    #[instrument(skip(self, cancel), fields(job_id = %job_id, max_attempts = self.max_attempts))]
    pub async fn wait_for_result(
        &self,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<ModelResult, ConversionError> {
        for attempt in 1..=self.max_attempts {
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(ConversionError::Cancelled),
                response = self.query(job_id) => response?,
            };

            match response.status {
                JobStatus::Completed => {
                    let info = response.model_info.ok_or(ConversionError::MissingResult)?;
                    let result = ModelResult::from_info(job_id, info, &self.api.base_url);
                    metrics::counter!("meshcap.jobs.completed").increment(1);
                    info!(attempt, url = %result.resolved_url, "Conversion completed");
                    return Ok(result);
                }
                JobStatus::Failed => {
                    let reason = response
                        .error
                        .filter(|e| !e.trim().is_empty())
                        .unwrap_or_else(|| "conversion failed".to_string());
                    metrics::counter!("meshcap.jobs.failed").increment(1);
                    warn!(attempt, reason = %reason, "Conversion failed");
                    return Err(ConversionError::ConversionFailed { reason });
                }
                JobStatus::Processing => {
                    debug!(attempt, "Job still processing");
                }
            }

            if attempt == self.max_attempts {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ConversionError::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        warn!(attempts = self.max_attempts, "Gave up waiting for conversion");
        Err(ConversionError::Timeout {
            attempts: self.max_attempts,
        })
    }
}
