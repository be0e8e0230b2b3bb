//! Session state machine driving capture, upload, polling and viewing.
//!
//! ```text
//!   Locked ──unlock──▶ Capturing ──stop / limit──▶ Reviewing ──job id──▶ Viewing
//!     │                  ▲   │                      │  │  ▲                 │
//!     └──select file─────┼───┴──select file────────▶┘  │  └─ confirm        │
//!                        ├──── cancel / retry ─────────┘                    │
//!                        ├──── upload or poll failure ──────────────────────┤
//!                        └──── restart ─────────────────────────────────────┘
//! ```
//!
//! The session owns the capture controller, the recording, and at most one
//! live job watch. Every entry into `Capturing` cancels the job watch and
//! releases the device before re-acquiring it. Renderers subscribe to
//! [`SessionSnapshot`]s and send [`Command`]s; they never own state.

use crate::capture::{CaptureBackend, CaptureController, CaptureError, Provenance, Recording, RecordingStatus};
use crate::config::ClientConfig;
use crate::gate::{self, Gate};
use crate::job::{Job, JobId, ModelResult};
use crate::poller::{ConversionError, JobPoller};
use crate::upload::{http_client, UploadClient, UploadError};
use crate::viewer::{LoadedSignal, Viewer, ViewerModel};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// User-visible stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Locked,
    Capturing,
    Reviewing,
    Viewing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Transient message for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub message: String,
    pub severity: Severity,
}

impl Notice {
    fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

/// Summary of the artifact under review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub provenance: Provenance,
    pub bytes: usize,
    pub container: String,
    pub file_name: String,
}

impl From<&Recording> for ArtifactInfo {
    fn from(recording: &Recording) -> Self {
        Self {
            provenance: recording.provenance(),
            bytes: recording.len(),
            container: recording.container().to_string(),
            file_name: recording.file_name().to_string(),
        }
    }
}

/// Everything a renderer needs to draw the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub stage: Stage,
    pub recording_status: RecordingStatus,
    pub elapsed: Duration,
    pub max_duration: Duration,
    pub device_open: bool,
    pub artifact: Option<ArtifactInfo>,
    pub job: Option<Job>,
    pub model_loaded: bool,
    pub notice: Option<Notice>,
}

/// User actions accepted by the session.
#[derive(Debug)]
pub enum Command {
    Unlock(String),
    StartRecording,
    StopRecording,
    SelectFile(Recording),
    Cancel,
    Retry,
    Confirm,
    Restart,
    Reset,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Unlock(_) => "unlock",
            Command::StartRecording => "start-recording",
            Command::StopRecording => "stop-recording",
            Command::SelectFile(_) => "select-file",
            Command::Cancel => "cancel",
            Command::Retry => "retry",
            Command::Confirm => "confirm",
            Command::Restart => "restart",
            Command::Reset => "reset",
        }
    }
}

/// Errors returned for rejected commands. The session stays usable.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{command} is not allowed in stage {stage:?}")]
    InvalidTransition { stage: Stage, command: &'static str },

    #[error("Credential rejected")]
    Rejected,

    #[error("No recording to submit")]
    NoRecording,

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Why a submitted conversion did not produce a model.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

#[derive(Debug)]
enum SessionEvent {
    Submitted {
        generation: u64,
        job_id: JobId,
    },
    Finished {
        generation: u64,
        result: Result<ModelResult, PipelineError>,
    },
    ModelLoaded {
        generation: u64,
    },
}

/// Background upload+poll for one submission. Dropping it cancels the work.
struct JobWatch {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Drop for JobWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// One user's capture → convert → view flow.
pub struct Session {
    stage: Stage,
    capture: CaptureController,
    uploader: UploadClient,
    poller: JobPoller,
    gate: Box<dyn Gate>,
    viewer: Arc<dyn Viewer>,
    recording: Option<Recording>,
    job: Option<Job>,
    model: Option<ModelResult>,
    model_loaded: bool,
    notice: Option<Notice>,
    watch: Option<JobWatch>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    state: watch::Sender<SessionSnapshot>,
}

impl Session {
    pub fn new(
        capture: CaptureController,
        uploader: UploadClient,
        poller: JobPoller,
        gate: Box<dyn Gate>,
        viewer: Arc<dyn Viewer>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let initial = SessionSnapshot {
            stage: Stage::Locked,
            recording_status: RecordingStatus::Idle,
            elapsed: Duration::ZERO,
            max_duration: capture.max_duration(),
            device_open: false,
            artifact: None,
            job: None,
            model_loaded: false,
            notice: None,
        };
        let (state, _) = watch::channel(initial);

        Self {
            stage: Stage::Locked,
            capture,
            uploader,
            poller,
            gate,
            viewer,
            recording: None,
            job: None,
            model: None,
            model_loaded: false,
            notice: None,
            watch: None,
            generation: 0,
            events_tx,
            events_rx,
            state,
        }
    }

    /// Wire a session from configuration.
    pub fn from_config(
        config: &ClientConfig,
        backend: Arc<dyn CaptureBackend>,
        viewer: Arc<dyn Viewer>,
    ) -> reqwest::Result<Self> {
        let http = http_client(&config.api)?;
        let capture = CaptureController::new(
            backend,
            config.capture.container_preferences.clone(),
            config.max_recording(),
        );
        let uploader = UploadClient::new(http.clone(), config.api.clone());
        let poller = JobPoller::new(http, config.api.clone(), &config.polling);
        let gate = gate::from_secret(config.gate.secret.as_deref());

        Ok(Self::new(capture, uploader, poller, gate, viewer))
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn recording(&self) -> Option<&Recording> {
        self.recording.as_ref()
    }

    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    pub fn model(&self) -> Option<&ModelResult> {
        self.model.as_ref()
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    pub fn capture(&self) -> &CaptureController {
        &self.capture
    }

    /// Receive a fresh snapshot after every transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let recording_status = if self.capture.is_recording() {
            RecordingStatus::Recording
        } else if self.watch.is_some() {
            RecordingStatus::Processing
        } else {
            RecordingStatus::Idle
        };

        SessionSnapshot {
            stage: self.stage,
            recording_status,
            elapsed: self.capture.elapsed(),
            max_duration: self.capture.max_duration(),
            device_open: self.capture.is_open(),
            artifact: self.recording.as_ref().map(ArtifactInfo::from),
            job: self.job.clone(),
            model_loaded: self.model_loaded,
            notice: self.notice.clone(),
        }
    }

    /// Apply a user command.
    pub async fn handle(&mut self, command: Command) -> Result<(), SessionError> {
        let name = command.name();
        debug!(stage = ?self.stage, command = name, "Handling command");

        let result = match (self.stage, command) {
            (_, Command::Reset) => {
                self.reset();
                Ok(())
            }
            (Stage::Locked, Command::Unlock(secret)) => self.unlock(&secret).await,
            (Stage::Locked | Stage::Capturing, Command::SelectFile(recording)) => {
                self.select_file(recording);
                Ok(())
            }
            (Stage::Capturing, Command::StartRecording) => self.start_recording(),
            (Stage::Capturing, Command::StopRecording) => self.stop_recording().await,
            (Stage::Reviewing, Command::Cancel) | (Stage::Viewing, Command::Restart) => {
                self.reenter_capturing(false).await.ok();
                Ok(())
            }
            (Stage::Reviewing, Command::Retry) => {
                self.reenter_capturing(true).await.ok();
                Ok(())
            }
            (Stage::Reviewing, Command::Confirm) if self.watch.is_none() => self.confirm(),
            (stage, _) => Err(SessionError::InvalidTransition { stage, command: name }),
        };

        self.publish();
        result
    }

    /// Wait for the next internal event (recording limit, job progress, model
    /// load) and apply it.
    pub async fn pump(&mut self) {
        tokio::select! {
            _ = self.capture.wait_for_limit() => self.stop_at_limit().await,
            Some(event) = self.events_rx.recv() => self.on_event(event).await,
        }
        self.publish();
    }

    /// Drive the session from a command channel until it closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.handle(command).await {
                            warn!(error = %e, "Command rejected");
                        }
                    }
                    None => break,
                },
                _ = self.capture.wait_for_limit() => {
                    self.stop_at_limit().await;
                    self.publish();
                }
                Some(event) = self.events_rx.recv() => {
                    self.on_event(event).await;
                    self.publish();
                }
                _ = ticker.tick(), if self.capture.is_recording() => self.publish(),
            }
        }

        self.close();
    }

    /// Stop timers, cancel the job watch and release the device.
    pub fn close(&mut self) {
        self.cancel_job();
        self.capture.release();
        self.release_model();
        self.publish();
        info!("Session closed");
    }

    async fn unlock(&mut self, secret: &str) -> Result<(), SessionError> {
        if !self.gate.check(secret) {
            self.notice = Some(Notice::new(Severity::Warning, "Incorrect password"));
            return Err(SessionError::Rejected);
        }

        info!("Session unlocked");
        self.notice = None;
        self.stage = Stage::Capturing;
        if let Err(e) = self.capture.open(false).await {
            self.notice = Some(Notice::new(Severity::Warning, capture_advice(&e)));
        }
        Ok(())
    }

    fn select_file(&mut self, recording: Recording) {
        self.capture.release();
        self.cancel_job();
        info!(bytes = recording.len(), file = %recording.file_name(), "Video file selected");
        self.recording = Some(recording);
        self.notice = None;
        self.stage = Stage::Reviewing;
    }

    fn start_recording(&mut self) -> Result<(), SessionError> {
        self.cancel_job();
        if let Err(e) = self.capture.start_recording() {
            self.notice = Some(Notice::new(Severity::Warning, capture_advice(&e)));
            return Err(e.into());
        }
        self.notice = None;
        Ok(())
    }

    async fn stop_recording(&mut self) -> Result<(), SessionError> {
        let recording = self.capture.stop_recording().await?;
        self.recording = Some(recording);
        self.stage = Stage::Reviewing;
        Ok(())
    }

    async fn stop_at_limit(&mut self) {
        let limit = self.capture.max_duration().as_secs();
        match self.capture.record_until_limit().await {
            Ok(recording) => {
                self.recording = Some(recording);
                self.notice = Some(Notice::new(
                    Severity::Info,
                    format!("Recording stopped at the {limit} second limit"),
                ));
                self.stage = Stage::Reviewing;
            }
            Err(e) => {
                warn!(error = %e, "Forced stop failed");
                self.reenter_capturing(false).await.ok();
                self.notice = Some(Notice::new(Severity::Error, e.to_string()));
            }
        }
    }

    fn confirm(&mut self) -> Result<(), SessionError> {
        let recording = self.recording.clone().ok_or(SessionError::NoRecording)?;

        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let uploader = self.uploader.clone();
        let poller = self.poller.clone();
        let events = self.events_tx.clone();

        let handle = tokio::spawn(async move {
            let pipeline = async {
                let job_id = uploader.upload(&recording).await?;
                let _ = events.send(SessionEvent::Submitted {
                    generation,
                    job_id: job_id.clone(),
                });
                let model = poller.wait_for_result(&job_id, &token).await?;
                Ok::<_, PipelineError>(model)
            };

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = pipeline => result,
            };
            let _ = events.send(SessionEvent::Finished { generation, result });
        });

        self.watch = Some(JobWatch {
            generation,
            cancel,
            handle,
        });
        self.notice = Some(Notice::new(Severity::Info, "Uploading video"));
        info!(generation, "Submitted recording for conversion");
        Ok(())
    }

    async fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Submitted { generation, job_id } => {
                if !self.is_current(generation) {
                    debug!(generation, "Ignoring stale submission");
                    return;
                }
                info!(job_id = %job_id, "Conversion job started");
                self.job = Some(Job::new(job_id));
                self.notice = Some(Notice::new(Severity::Info, "Converting video to 3D model"));
                self.stage = Stage::Viewing;
            }
            SessionEvent::Finished { generation, result } => {
                if !self.is_current(generation) {
                    debug!(generation, "Ignoring stale job result");
                    return;
                }
                self.watch = None;
                match result {
                    Ok(model) => self.show_model(generation, model),
                    Err(e) => self.fail_conversion(e).await,
                }
            }
            SessionEvent::ModelLoaded { generation } => {
                if generation == self.generation && self.model.is_some() {
                    info!("Model loaded in viewer");
                    self.model_loaded = true;
                }
            }
        }
    }

    fn show_model(&mut self, generation: u64, model: ModelResult) {
        if let Some(job) = self.job.as_mut() {
            job.complete(model.clone());
        }
        self.stage = Stage::Viewing;
        self.notice = None;
        self.model_loaded = false;

        let events = self.events_tx.clone();
        let loaded = LoadedSignal::new(move || {
            let _ = events.send(SessionEvent::ModelLoaded { generation });
        });
        self.viewer.present(ViewerModel::from(&model), loaded);
        self.model = Some(model);
    }

    async fn fail_conversion(&mut self, error: PipelineError) {
        warn!(error = %error, "Conversion aborted");
        if let Some(job) = self.job.as_mut() {
            job.fail(error.to_string());
        }

        let message = format!("Conversion failed: {error}");
        let message = match self.reenter_capturing(false).await {
            Ok(()) => message,
            Err(e) => format!("{message}. {}", capture_advice(&e)),
        };
        self.notice = Some(Notice::new(Severity::Error, message));
    }

    /// Go back to capturing with a fresh device handle.
    async fn reenter_capturing(&mut self, auto_start: bool) -> Result<(), CaptureError> {
        self.cancel_job();
        self.capture.release();
        self.release_model();
        self.recording = None;
        self.notice = None;
        self.stage = Stage::Capturing;

        let opened = self.capture.open(auto_start).await;
        if let Err(e) = &opened {
            self.notice = Some(Notice::new(Severity::Warning, capture_advice(e)));
        }
        opened
    }

    fn reset(&mut self) {
        self.close();
        self.recording = None;
        self.notice = None;
        self.stage = Stage::Locked;
        info!("Session reset");
    }

    fn cancel_job(&mut self) {
        if let Some(watch) = self.watch.take() {
            info!(generation = watch.generation, "Cancelling outstanding job watch");
        }
        self.job = None;
    }

    fn release_model(&mut self) {
        if self.model.take().is_some() {
            self.viewer.clear();
        }
        self.model_loaded = false;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.watch.as_ref().map(|w| w.generation) == Some(generation)
    }

    fn publish(&self) {
        self.state.send_replace(self.snapshot());
    }
}

/// What to tell the user when the camera cannot be used.
fn capture_advice(error: &CaptureError) -> String {
    match error {
        CaptureError::InsecureContext => {
            "Camera access needs HTTPS or localhost. You can still upload a video file.".to_string()
        }
        CaptureError::DeviceUnavailable => {
            "This device cannot record video. Upload a video file instead.".to_string()
        }
        CaptureError::PermissionDenied => {
            "Camera permission was denied. Allow access or upload a video file.".to_string()
        }
        CaptureError::NoDevice => "No camera was found. Upload a video file instead.".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::FakeBackend;
    use crate::job::{JobStatus, ModelFormat};
    use crate::viewer::{LogViewer, MockViewer};
    use bytes::Bytes;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "open-sesame";

    fn session(base_url: &str, backend: &FakeBackend, viewer: Arc<dyn Viewer>) -> Session {
        let mut config = ClientConfig::default();
        config.api.base_url = base_url.to_string();
        config.api.request_timeout_secs = 5;
        config.polling.interval_ms = 5;
        config.gate.secret = Some(SECRET.to_string());
        Session::from_config(&config, Arc::new(backend.clone()), viewer).unwrap()
    }

    fn no_viewer() -> Arc<dyn Viewer> {
        Arc::new(MockViewer::new())
    }

    async fn mount_upload(server: &MockServer, job_id: &str) {
        Mock::given(method("POST"))
            .and(path("/api/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uploadId": job_id })))
            .mount(server)
            .await;
    }

    async fn unlocked(session: &mut Session) {
        session.handle(Command::Unlock(SECRET.to_string())).await.unwrap();
        assert_eq!(session.stage(), Stage::Capturing);
    }

    async fn record(session: &mut Session) {
        session.handle(Command::StartRecording).await.unwrap();
        session.handle(Command::StopRecording).await.unwrap();
        assert_eq!(session.stage(), Stage::Reviewing);
    }

    #[tokio::test]
    async fn test_direct_upload_scenario_reaches_viewer() {
        let server = MockServer::start().await;
        mount_upload(&server, "abc").await;
        Mock::given(method("GET"))
            .and(path("/api/result/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "processing" })))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/result/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "completed",
                "model_info": { "url": "/api/download-result/abc", "type": "obj", "label": "Demo" },
            })))
            .mount(&server)
            .await;

        let expected = ModelResult {
            url: "/api/download-result/abc".to_string(),
            resolved_url: format!("{}/api/download-result/abc", server.uri()),
            format: ModelFormat::Obj,
            label: "Demo".to_string(),
        };
        let expected_view = ViewerModel::from(&expected);

        let mut viewer = MockViewer::new();
        viewer
            .expect_present()
            .withf(move |model, _| *model == expected_view)
            .times(1)
            .returning(|_, loaded| loaded.loaded());

        let backend = FakeBackend::new().with_chunks(vec![Bytes::from(vec![7u8; 2 * 1024 * 1024])]);
        let mut session = session(&server.uri(), &backend, Arc::new(viewer));
        let mut snapshots = session.subscribe();
        assert_eq!(session.stage(), Stage::Locked);

        unlocked(&mut session).await;
        assert!(session.capture().is_open());
        record(&mut session).await;
        assert_eq!(session.recording().unwrap().len(), 2 * 1024 * 1024);
        assert_eq!(backend.live(), 0);

        session.handle(Command::Confirm).await.unwrap();
        assert_eq!(snapshots.borrow_and_update().recording_status, RecordingStatus::Processing);

        session.pump().await;
        assert_eq!(session.stage(), Stage::Viewing);
        assert_eq!(session.job().unwrap().id, JobId::new("abc"));
        assert_eq!(session.job().unwrap().status, JobStatus::Processing);
        assert!(session.model().is_none());

        session.pump().await;
        assert_eq!(session.model(), Some(&expected));
        assert_eq!(session.job().unwrap().status, JobStatus::Completed);

        session.pump().await;
        let snapshot = snapshots.borrow_and_update().clone();
        assert_eq!(snapshot.stage, Stage::Viewing);
        assert!(snapshot.model_loaded);
        assert_eq!(snapshot.recording_status, RecordingStatus::Idle);
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_wrong_password_stays_locked() {
        let backend = FakeBackend::new();
        let mut session = session("http://127.0.0.1:1", &backend, no_viewer());

        let err = session.handle(Command::Unlock("guess".to_string())).await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected));
        assert_eq!(session.stage(), Stage::Locked);
        assert_eq!(session.notice().unwrap().severity, Severity::Warning);
        assert_eq!(backend.acquired(), 0);
    }

    #[tokio::test]
    async fn test_capture_failure_degrades_to_file_selection() {
        let mut backend = FakeBackend::new();
        backend.secure = false;
        let mut session = session("http://127.0.0.1:1", &backend, no_viewer());

        unlocked(&mut session).await;
        assert!(!session.capture().is_open());
        assert!(session.notice().unwrap().message.contains("upload a video file"));

        let err = session.handle(Command::StartRecording).await.unwrap_err();
        assert!(matches!(err, SessionError::Capture(CaptureError::NoActiveStream)));

        let file = Recording::new(Bytes::from_static(b"mp4"), "video/mp4", Provenance::Uploaded);
        session.handle(Command::SelectFile(file)).await.unwrap();
        assert_eq!(session.stage(), Stage::Reviewing);
        assert_eq!(session.snapshot().artifact.unwrap().provenance, Provenance::Uploaded);
    }

    #[tokio::test]
    async fn test_file_selection_releases_device() {
        let backend = FakeBackend::new();
        let mut session = session("http://127.0.0.1:1", &backend, no_viewer());
        unlocked(&mut session).await;
        session.handle(Command::StartRecording).await.unwrap();
        assert_eq!(backend.live(), 1);

        let file = Recording::new(Bytes::from_static(b"webm"), "video/webm", Provenance::Uploaded);
        session.handle(Command::SelectFile(file)).await.unwrap();
        assert_eq!(session.stage(), Stage::Reviewing);
        assert_eq!(backend.live(), 0);
        assert!(!session.capture().is_recording());
    }

    #[tokio::test]
    async fn test_file_selection_from_locked() {
        let backend = FakeBackend::new();
        let mut session = session("http://127.0.0.1:1", &backend, no_viewer());
        let file = Recording::new(Bytes::from_static(b"webm"), "video/webm", Provenance::Uploaded);
        session.handle(Command::SelectFile(file)).await.unwrap();
        assert_eq!(session.stage(), Stage::Reviewing);
        assert_eq!(backend.acquired(), 0);
    }

    #[tokio::test]
    async fn test_upload_failure_returns_to_capture_with_device() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload"))
            .respond_with(ResponseTemplate::new(400).set_body_string("File must be a video."))
            .mount(&server)
            .await;

        let backend = FakeBackend::new();
        let mut session = session(&server.uri(), &backend, no_viewer());
        unlocked(&mut session).await;
        record(&mut session).await;

        session.handle(Command::Confirm).await.unwrap();
        session.pump().await;

        assert_eq!(session.stage(), Stage::Capturing);
        assert!(session.capture().is_open());
        assert_eq!(backend.live(), 1);
        assert_eq!(backend.max_live(), 1);
        assert!(session.recording().is_none());
        let notice = session.notice().unwrap();
        assert_eq!(notice.severity, Severity::Error);
        assert!(notice.message.contains("HTTP 400"));
    }

    #[tokio::test]
    async fn test_empty_recording_fails_without_network() {
        let server = MockServer::start().await;
        let backend = FakeBackend::new().with_chunks(vec![]);
        let mut session = session(&server.uri(), &backend, no_viewer());
        unlocked(&mut session).await;
        record(&mut session).await;

        session.handle(Command::Confirm).await.unwrap();
        session.pump().await;

        assert_eq!(session.stage(), Stage::Capturing);
        assert!(session.notice().unwrap().message.contains("empty"));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conversion_failure_after_viewing_returns_to_capture() {
        let server = MockServer::start().await;
        mount_upload(&server, "abc").await;
        Mock::given(method("GET"))
            .and(path("/api/result/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "failed",
                "error": "bad video",
            })))
            .mount(&server)
            .await;

        let backend = FakeBackend::new();
        let mut session = session(&server.uri(), &backend, no_viewer());
        unlocked(&mut session).await;
        record(&mut session).await;
        session.handle(Command::Confirm).await.unwrap();

        session.pump().await;
        assert_eq!(session.stage(), Stage::Viewing);

        session.pump().await;
        assert_eq!(session.stage(), Stage::Capturing);
        assert!(session.job().is_none());
        assert!(session.capture().is_open());
        assert!(session.notice().unwrap().message.contains("bad video"));
    }

    #[tokio::test]
    async fn test_restart_cancels_outstanding_poll() {
        let server = MockServer::start().await;
        mount_upload(&server, "abc").await;
        Mock::given(method("GET"))
            .and(path("/api/result/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "processing" })))
            .mount(&server)
            .await;

        let backend = FakeBackend::new();
        let mut session = session(&server.uri(), &backend, no_viewer());
        unlocked(&mut session).await;
        record(&mut session).await;
        session.handle(Command::Confirm).await.unwrap();
        session.pump().await;
        assert_eq!(session.stage(), Stage::Viewing);

        session.handle(Command::Restart).await.unwrap();
        assert_eq!(session.stage(), Stage::Capturing);
        assert_eq!(session.snapshot().recording_status, RecordingStatus::Idle);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let settled = server.received_requests().await.unwrap().len();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), settled);
    }

    #[tokio::test]
    async fn test_retry_auto_starts_recording_with_single_handle() {
        let backend = FakeBackend::new();
        let mut session = session("http://127.0.0.1:1", &backend, no_viewer());
        unlocked(&mut session).await;
        record(&mut session).await;

        session.handle(Command::Retry).await.unwrap();
        assert_eq!(session.stage(), Stage::Capturing);
        assert_eq!(session.snapshot().recording_status, RecordingStatus::Recording);
        assert!(session.recording().is_none());
        assert_eq!(backend.max_live(), 1);

        session.handle(Command::StopRecording).await.unwrap();
        session.handle(Command::Cancel).await.unwrap();
        assert_eq!(session.stage(), Stage::Capturing);
        assert!(!session.capture().is_recording());
        assert_eq!(backend.live(), 1);
    }

    #[tokio::test]
    async fn test_commands_outside_their_stage_are_rejected() {
        let backend = FakeBackend::new();
        let mut session = session("http://127.0.0.1:1", &backend, no_viewer());

        let err = session.handle(Command::Confirm).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition {
                stage: Stage::Locked,
                command: "confirm"
            }
        ));
        assert!(session.handle(Command::Restart).await.is_err());
        assert_eq!(session.stage(), Stage::Locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_limit_moves_to_review() {
        let backend = FakeBackend::new();
        let mut session = session("http://127.0.0.1:1", &backend, no_viewer());
        unlocked(&mut session).await;
        session.handle(Command::StartRecording).await.unwrap();

        session.pump().await;
        assert_eq!(session.stage(), Stage::Reviewing);
        assert!(session.recording().is_some());
        let snapshot = session.snapshot();
        assert_eq!(snapshot.elapsed, Duration::from_secs(60));
        assert_eq!(snapshot.recording_status, RecordingStatus::Idle);
        assert_eq!(snapshot.notice.unwrap().severity, Severity::Info);
        assert_eq!(backend.live(), 0);
    }

    #[tokio::test]
    async fn test_reset_releases_everything() {
        let backend = FakeBackend::new();
        let mut session = session("http://127.0.0.1:1", &backend, no_viewer());
        unlocked(&mut session).await;
        session.handle(Command::StartRecording).await.unwrap();

        session.handle(Command::Reset).await.unwrap();
        assert_eq!(session.stage(), Stage::Locked);
        assert_eq!(backend.live(), 0);
        assert!(session.recording().is_none());
    }

    #[tokio::test]
    async fn test_run_loop_drives_commands_to_loaded_model() {
        let server = MockServer::start().await;
        mount_upload(&server, "abc").await;
        Mock::given(method("GET"))
            .and(path("/api/result/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "completed",
                "model_info": { "url": "/results/abc.obj", "type": "obj", "label": "VGGT Model #abc" },
            })))
            .mount(&server)
            .await;

        let backend = FakeBackend::new();
        let session = session(&server.uri(), &backend, Arc::new(LogViewer));
        let mut snapshots = session.subscribe();
        let (commands, rx) = mpsc::channel(8);
        let runner = tokio::spawn(session.run(rx));

        commands.send(Command::Unlock(SECRET.to_string())).await.unwrap();
        commands.send(Command::StartRecording).await.unwrap();
        commands.send(Command::StopRecording).await.unwrap();
        commands.send(Command::Confirm).await.unwrap();

        let snapshot = tokio::time::timeout(
            Duration::from_secs(5),
            snapshots.wait_for(|s| s.stage == Stage::Viewing && s.model_loaded),
        )
        .await
        .expect("model should load")
        .unwrap()
        .clone();
        assert_eq!(snapshot.job.unwrap().status, JobStatus::Completed);

        drop(commands);
        runner.await.unwrap();
        assert_eq!(backend.live(), 0);
    }
}
