//! Capture controller with exclusive device ownership and a hard recording ceiling.
//!
//! This module owns the lifecycle of the local camera+microphone handle: open,
//! start, stop, limit enforcement and release. Platforms plug in through the
//! [`CaptureBackend`] and [`MediaStream`] traits; stopping a recording is an
//! awaitable operation that completes with the finalized [`Recording`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors that can occur while acquiring or using the capture device.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Camera access requires a secure context (HTTPS or localhost)")]
    InsecureContext,

    #[error("This platform exposes no media capture API")]
    DeviceUnavailable,

    #[error("Camera or microphone permission was denied")]
    PermissionDenied,

    #[error("No camera device was found")]
    NoDevice,

    #[error("No active media stream; open the device first")]
    NoActiveStream,

    #[error("Not currently recording")]
    NotRecording,

    #[error("Encoder failed: {0}")]
    Encoder(String),

    #[error("Failed to read video file {path}: {message}")]
    FileRead { path: String, message: String },
}

/// Recording state as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingStatus {
    #[default]
    Idle,
    Recording,
    /// The artifact is being uploaded or converted
    Processing,
}

/// Where a recording came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Recorded,
    Uploaded,
}

/// A finished, immutable video artifact.
#[derive(Debug, Clone)]
pub struct Recording {
    data: Bytes,
    container: String,
    provenance: Provenance,
    file_name: String,
    created_at: DateTime<Utc>,
}

impl Recording {
    pub fn new(data: Bytes, container: impl Into<String>, provenance: Provenance) -> Self {
        let container = container.into();
        let file_name = format!("recording-{}.{}", Uuid::new_v4(), container_extension(&container));
        Self {
            data,
            container,
            provenance,
            file_name,
            created_at: Utc::now(),
        }
    }

    /// Read a local video file as an uploaded artifact.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await.map_err(|e| CaptureError::FileRead {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let container = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(container_for_extension)
            .unwrap_or("application/octet-stream");

        let mut recording = Self::new(Bytes::from(data), container, Provenance::Uploaded);
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            recording.file_name = name.to_string();
        }
        Ok(recording)
    }

    /// Override the name sent to the server
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// File extension for a MIME container tag (parameters ignored).
pub fn container_extension(container: &str) -> &'static str {
    let essence = container.split(';').next().unwrap_or("").trim();
    match essence {
        "video/webm" => "webm",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        "video/x-msvideo" => "avi",
        _ => "bin",
    }
}

fn container_for_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "webm" => "video/webm",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

/// A live camera+microphone stream held by the controller.
pub trait MediaStream: Send + Sync {
    /// Container the platform encodes to when none is requested.
    fn default_container(&self) -> String;

    /// Start encoding. Chunks arrive on the returned channel, which closes
    /// once the encoder has flushed after [`MediaStream::stop_encoder`].
    fn start_encoder(&mut self, container: Option<&str>) -> Result<mpsc::Receiver<Bytes>, CaptureError>;

    fn stop_encoder(&mut self);

    /// Stop every track and give the device back to the platform.
    fn stop_tracks(&mut self);
}

/// Platform access to capture devices.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Whether device access is allowed in this execution context.
    fn is_secure_context(&self) -> bool;

    /// Whether the platform exposes a capture API at all.
    fn has_capture_api(&self) -> bool;

    fn supports_container(&self, container: &str) -> bool;

    /// Request camera+microphone access.
    async fn acquire(&self) -> Result<Box<dyn MediaStream>, CaptureError>;
}

/// Backend for hosts without cameras; only file selection is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessBackend;

#[async_trait]
impl CaptureBackend for HeadlessBackend {
    fn is_secure_context(&self) -> bool {
        true
    }

    fn has_capture_api(&self) -> bool {
        false
    }

    fn supports_container(&self, _container: &str) -> bool {
        false
    }

    async fn acquire(&self) -> Result<Box<dyn MediaStream>, CaptureError> {
        Err(CaptureError::DeviceUnavailable)
    }
}

/// Pick the first container in `preferences` the backend can encode.
pub fn select_container(preferences: &[String], backend: &dyn CaptureBackend) -> Option<String> {
    preferences
        .iter()
        .find(|c| backend.supports_container(c))
        .cloned()
}

struct ActiveRecording {
    started_at: Instant,
    deadline: Instant,
    container: String,
    collector: JoinHandle<Bytes>,
}

/// Owns the device handle and the recording in progress.
pub struct CaptureController {
    backend: Arc<dyn CaptureBackend>,
    preferences: Vec<String>,
    max_duration: Duration,
    stream: Option<Box<dyn MediaStream>>,
    active: Option<ActiveRecording>,
    elapsed: Duration,
}

impl CaptureController {
    pub fn new(backend: Arc<dyn CaptureBackend>, preferences: Vec<String>, max_duration: Duration) -> Self {
        Self {
            backend,
            preferences,
            max_duration,
            stream: None,
            active: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Acquire the device, releasing any handle already held.
    pub async fn open(&mut self, auto_start: bool) -> Result<(), CaptureError> {
        self.release();

        if !self.backend.is_secure_context() {
            warn!("Refusing device access outside a secure context");
            return Err(CaptureError::InsecureContext);
        }
        if !self.backend.has_capture_api() {
            return Err(CaptureError::DeviceUnavailable);
        }

        let stream = self.backend.acquire().await?;
        self.stream = Some(stream);
        info!(auto_start, "Capture device opened");

        if auto_start {
            self.start_recording()?;
        }
        Ok(())
    }

    /// Begin buffering and arm the recording ceiling.
    pub fn start_recording(&mut self) -> Result<(), CaptureError> {
        if self.active.is_some() {
            debug!("Recording already in progress");
            return Ok(());
        }

        let requested = select_container(&self.preferences, self.backend.as_ref());
        let stream = self.stream.as_mut().ok_or(CaptureError::NoActiveStream)?;
        let container = requested.clone().unwrap_or_else(|| stream.default_container());
        if requested.is_none() {
            debug!(container = %container, "No preferred container supported, using platform default");
        }

        let mut chunks = stream.start_encoder(requested.as_deref())?;
        let collector = tokio::spawn(async move {
            let mut buffer = BytesMut::new();
            while let Some(chunk) = chunks.recv().await {
                buffer.extend_from_slice(&chunk);
            }
            buffer.freeze()
        });

        let now = Instant::now();
        self.elapsed = Duration::ZERO;
        self.active = Some(ActiveRecording {
            started_at: now,
            deadline: now + self.max_duration,
            container,
            collector,
        });

        info!(max_secs = self.max_duration.as_secs(), "Recording started");
        Ok(())
    }

    /// Finalize the recording and release the device.
    pub async fn stop_recording(&mut self) -> Result<Recording, CaptureError> {
        let active = self.active.take().ok_or(CaptureError::NotRecording)?;

        if let Some(stream) = self.stream.as_mut() {
            stream.stop_encoder();
        }
        self.elapsed = active.started_at.elapsed().min(self.max_duration);

        let data = active
            .collector
            .await
            .map_err(|e| CaptureError::Encoder(e.to_string()));
        self.release();
        let data = data?;

        info!(
            bytes = data.len(),
            elapsed_ms = self.elapsed.as_millis() as u64,
            container = %active.container,
            "Recording stopped"
        );
        Ok(Recording::new(data, active.container, Provenance::Recorded))
    }

    /// Resolves when the recording ceiling is reached; pending when idle.
    pub async fn wait_for_limit(&self) {
        match &self.active {
            Some(active) => tokio::time::sleep_until(active.deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Wait for the ceiling, then force the stop.
    pub async fn record_until_limit(&mut self) -> Result<Recording, CaptureError> {
        if self.active.is_none() {
            return Err(CaptureError::NotRecording);
        }
        self.wait_for_limit().await;
        metrics::counter!("meshcap.recordings.forced_stop").increment(1);
        info!("Recording ceiling reached, stopping");
        self.stop_recording().await
    }

    /// Free the device and any pending recording. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(active) = self.active.take() {
            active.collector.abort();
        }
        if let Some(mut stream) = self.stream.take() {
            stream.stop_encoder();
            stream.stop_tracks();
            debug!("Capture device released");
        }
    }

    pub fn status(&self) -> RecordingStatus {
        if self.active.is_some() {
            RecordingStatus::Recording
        } else {
            RecordingStatus::Idle
        }
    }

    /// Time recorded so far, never more than the ceiling.
    pub fn elapsed(&self) -> Duration {
        match &self.active {
            Some(active) => active.started_at.elapsed().min(self.max_duration),
            None => self.elapsed,
        }
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Container the current recording is encoded in.
    pub fn selected_container(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.container.as_str())
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.release();
    }
}
