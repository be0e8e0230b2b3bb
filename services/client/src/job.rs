//! Conversion job and model result types.

use crate::config::join_url;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier the conversion service assigns to a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-side status of a conversion job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Mesh container understood by the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    #[default]
    Obj,
    Stl,
}

impl ModelFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ModelFormat::Obj => "obj",
            ModelFormat::Stl => "stl",
        }
    }

    /// Guess the format from a path or label; anything that is not `.stl` is OBJ.
    pub fn infer(name: &str) -> Self {
        let name = name.split(['?', '#']).next().unwrap_or(name);
        if name.to_ascii_lowercase().ends_with(".stl") {
            ModelFormat::Stl
        } else {
            ModelFormat::Obj
        }
    }
}

/// `model_info` as reported by `GET /api/result/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub url: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ModelFormat>,
    #[serde(default)]
    pub label: Option<String>,
}

/// Resolved mesh location plus the metadata a viewer needs to pick a loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResult {
    /// Locator as reported by the service
    pub url: String,
    /// `url` resolved against the API base
    pub resolved_url: String,
    pub format: ModelFormat,
    pub label: String,
}

impl ModelResult {
    /// Build a result from the wire `model_info`, resolving its URL against `base_url`.
    pub fn from_info(job_id: &JobId, info: ModelInfo, base_url: &str) -> Self {
        let format = info.format.unwrap_or_else(|| {
            match info.label.as_deref() {
                Some(label) if ModelFormat::infer(label) == ModelFormat::Stl => ModelFormat::Stl,
                _ => ModelFormat::infer(&info.url),
            }
        });
        let label = info
            .label
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| job_id.to_string());

        Self {
            resolved_url: resolve_model_url(base_url, &info.url),
            url: info.url,
            format,
            label,
        }
    }
}

/// Resolve a model locator against the API base.
///
/// Absolute URLs and URLs already carrying the base are returned unchanged.
pub fn resolve_model_url(base_url: &str, url: &str) -> String {
    if Url::parse(url).is_ok() {
        return url.to_string();
    }

    let base = base_url.trim_end_matches('/');
    if !base.is_empty() && url.starts_with(base) {
        return url.to_string();
    }

    join_url(base, url)
}

/// Client-side view of a conversion job.
///
/// Status only moves out of `Processing`; terminal jobs never change again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub result: Option<ModelResult>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            status: JobStatus::Processing,
            result: None,
            error: None,
        }
    }

    /// Mark the job completed. Returns false if it was already terminal.
    pub fn complete(&mut self, result: ModelResult) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Completed;
        self.result = Some(result);
        true
    }

    /// Mark the job failed. Returns false if it was already terminal.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error = Some(reason.into());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(url: &str, format: Option<ModelFormat>, label: Option<&str>) -> ModelInfo {
        ModelInfo {
            url: url.to_string(),
            format,
            label: label.map(str::to_string),
        }
    }

    #[test]
    fn test_relative_url_resolved_against_base() {
        assert_eq!(
            resolve_model_url("http://api:8000", "/results/abc.obj"),
            "http://api:8000/results/abc.obj"
        );
        assert_eq!(
            resolve_model_url("http://api:8000/", "results/abc.obj"),
            "http://api:8000/results/abc.obj"
        );
    }

    #[test]
    fn test_absolute_url_not_prefixed() {
        let url = "https://bucket.s3.amazonaws.com/abc.obj?X-Amz-Signature=1";
        assert_eq!(resolve_model_url("http://api:8000", url), url);
    }

    #[test]
    fn test_empty_base_keeps_relative_url() {
        assert_eq!(resolve_model_url("", "/api/download-result/abc"), "/api/download-result/abc");
    }

    #[test]
    fn test_format_inferred_when_type_missing() {
        let id = JobId::new("abc");
        let result = ModelResult::from_info(&id, info("/x/mesh.STL", None, None), "");
        assert_eq!(result.format, ModelFormat::Stl);
        assert_eq!(result.label, "abc");

        let result = ModelResult::from_info(&id, info("/api/download-result/abc", None, Some("abc.obj")), "");
        assert_eq!(result.format, ModelFormat::Obj);
        assert_eq!(result.label, "abc.obj");
    }

    #[test]
    fn test_explicit_type_wins() {
        let id = JobId::new("abc");
        let result = ModelResult::from_info(
            &id,
            info("/x/mesh.obj", Some(ModelFormat::Stl), Some("Demo")),
            "http://api",
        );
        assert_eq!(result.format, ModelFormat::Stl);
        assert_eq!(result.resolved_url, "http://api/x/mesh.obj");
        assert_eq!(result.url, "/x/mesh.obj");
    }

    #[test]
    fn test_terminal_job_does_not_resurrect() {
        let mut job = Job::new(JobId::new("abc"));
        assert!(job.fail("bad video"));
        assert_eq!(job.status, JobStatus::Failed);

        let result = ModelResult::from_info(&job.id.clone(), info("/a.obj", None, None), "");
        assert!(!job.complete(result));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("bad video"));
    }
}
