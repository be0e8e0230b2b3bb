//! Upload client that hands a recording to the conversion service.
//!
//! Two protocol variants are supported:
//!
//! - **Direct**: multipart `POST /api/upload` with the bytes in field `file`.
//! - **Presigned**: `POST /api/upload-url` for a write/read URL pair, `PUT` the
//!   bytes to the write URL, then `POST /api/start-conversion` with the read URL.
//!
//! Both return the job identifier. Nothing is retried here.

use crate::capture::Recording;
use crate::config::{ApiConfig, UploadProtocol};
use crate::job::JobId;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Which request of an upload failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStep {
    /// Direct multipart upload
    Upload,
    RequestUploadUrl,
    PutObject,
    StartConversion,
}

impl fmt::Display for UploadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStep::Upload => "upload",
            UploadStep::RequestUploadUrl => "upload-url request",
            UploadStep::PutObject => "object PUT",
            UploadStep::StartConversion => "start-conversion",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while uploading a recording.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("Recording is empty, nothing to upload")]
    EmptyArtifact,

    #[error("{step} failed with HTTP {status}: {body}")]
    Transport {
        step: UploadStep,
        status: u16,
        body: String,
    },

    #[error("{step} request could not be sent: {message}")]
    Network { step: UploadStep, message: String },

    #[error("{step} returned an unexpected response: {message}")]
    InvalidResponse { step: UploadStep, message: String },
}

impl UploadError {
    /// The step that failed, if a request was attempted
    pub fn step(&self) -> Option<UploadStep> {
        match self {
            UploadError::EmptyArtifact => None,
            UploadError::Transport { step, .. }
            | UploadError::Network { step, .. }
            | UploadError::InvalidResponse { step, .. } => Some(*step),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    upload_id: String,
}

#[derive(Debug, Serialize)]
struct UploadUrlRequest<'a> {
    filename: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrlResponse {
    upload_url: String,
    download_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartConversionRequest<'a> {
    download_url: &'a str,
}

/// Build the HTTP client shared by the upload client and the poller.
pub fn http_client(api: &ApiConfig) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(api.request_timeout())
        .user_agent(concat!("meshcap/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Transfers recordings to the conversion service.
#[derive(Debug, Clone)]
pub struct UploadClient {
    http: Client,
    api: ApiConfig,
}

impl UploadClient {
    pub fn new(http: Client, api: ApiConfig) -> Self {
        info!(
            base_url = %api.base_url,
            protocol = api.protocol.as_str(),
            "Upload client initialized"
        );
        Self { http, api }
    }

    pub fn protocol(&self) -> UploadProtocol {
        self.api.protocol
    }

    /// Upload a recording and return the conversion job id.
    #[instrument(skip(self, recording), fields(protocol = self.api.protocol.as_str(), bytes = recording.len()))]
    pub async fn upload(&self, recording: &Recording) -> Result<JobId, UploadError> {
        if recording.is_empty() {
            warn!("Refusing to upload an empty recording");
            return Err(UploadError::EmptyArtifact);
        }

        let result = match self.api.protocol {
            UploadProtocol::Direct => self.upload_direct(recording).await,
            UploadProtocol::Presigned => self.upload_presigned(recording).await,
        };

        match &result {
            Ok(job_id) => {
                metrics::counter!("meshcap.uploads.completed").increment(1);
                info!(job_id = %job_id, "Recording uploaded");
            }
            Err(e) => {
                metrics::counter!("meshcap.uploads.failed").increment(1);
                warn!(error = %e, "Upload failed");
            }
        }
        result
    }

    async fn upload_direct(&self, recording: &Recording) -> Result<JobId, UploadError> {
        let step = UploadStep::Upload;
        let part = Part::stream_with_length(Body::from(recording.data().clone()), recording.len() as u64)
            .file_name(recording.file_name().to_string())
            .mime_str(mime_essence(recording.container()))
            .map_err(|e| UploadError::InvalidResponse {
                step,
                message: format!("invalid container type: {e}"),
            })?;
        let form = Form::new().part("file", part);

        debug!(file_name = %recording.file_name(), "Posting recording");
        let response = self
            .http
            .post(self.api.api_url("/api/upload"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| network(step, e))?;

        let body: UploadResponse = read_json(step, response).await?;
        job_id(step, body.upload_id)
    }

    async fn upload_presigned(&self, recording: &Recording) -> Result<JobId, UploadError> {
        let step = UploadStep::RequestUploadUrl;
        let response = self
            .http
            .post(self.api.api_url("/api/upload-url"))
            .json(&UploadUrlRequest {
                filename: recording.file_name(),
            })
            .send()
            .await
            .map_err(|e| network(step, e))?;
        let urls: UploadUrlResponse = read_json(step, response).await?;
        debug!(upload_url = %urls.upload_url, "Received presigned URLs");

        let step = UploadStep::PutObject;
        let response = self
            .http
            .put(&urls.upload_url)
            .header(CONTENT_TYPE, mime_essence(recording.container()))
            .body(recording.data().clone())
            .send()
            .await
            .map_err(|e| network(step, e))?;
        check_status(step, response).await?;

        let step = UploadStep::StartConversion;
        let response = self
            .http
            .post(self.api.api_url("/api/start-conversion"))
            .json(&StartConversionRequest {
                download_url: &urls.download_url,
            })
            .send()
            .await
            .map_err(|e| network(step, e))?;
        let body: UploadResponse = read_json(step, response).await?;
        job_id(step, body.upload_id)
    }
}

fn mime_essence(container: &str) -> &str {
    container.split(';').next().unwrap_or(container).trim()
}

fn network(step: UploadStep, err: reqwest::Error) -> UploadError {
    UploadError::Network {
        step,
        message: err.to_string(),
    }
}

fn job_id(step: UploadStep, id: String) -> Result<JobId, UploadError> {
    if id.trim().is_empty() {
        return Err(UploadError::InvalidResponse {
            step,
            message: "empty uploadId".to_string(),
        });
    }
    Ok(JobId::new(id))
}

async fn check_status(step: UploadStep, response: Response) -> Result<Response, UploadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UploadError::Transport {
        step,
        status: status.as_u16(),
        body,
    })
}

async fn read_json<T: DeserializeOwned>(step: UploadStep, response: Response) -> Result<T, UploadError> {
    check_status(step, response)
        .await?
        .json::<T>()
        .await
        .map_err(|e| UploadError::InvalidResponse {
            step,
            message: e.to_string(),
        })
}
