//! Meshcap client - capture a short video, convert it to a 3D mesh, view it.
//!
//! A session walks one user through the whole flow:
//!
//! ```text
//! CaptureBackend -> CaptureController -> Recording
//!                                           |
//!                      UploadClient (direct | presigned) -> JobId
//!                                           |
//!                        JobPoller (GET /api/result/{id}) -> ModelResult
//!                                           |
//!                                  Viewer (present / loaded)
//! ```
//!
//! [`Session`] owns every piece and publishes a [`SessionSnapshot`] after each
//! transition. Platforms plug in through [`CaptureBackend`] and [`Viewer`].
//!
//! # Example
//!
//! ```rust,no_run
//! use meshcap_client::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::load(None)?;
//!     let mut session = Session::from_config(&config, Arc::new(HeadlessBackend), Arc::new(LogViewer))?;
//!
//!     session.handle(Command::Unlock("secret".to_string())).await?;
//!     let video = Recording::from_file("clip.mp4").await?;
//!     session.handle(Command::SelectFile(video)).await?;
//!     session.handle(Command::Confirm).await?;
//!
//!     while !session.snapshot().model_loaded {
//!         session.pump().await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod gate;
pub mod job;
pub mod poller;
pub mod session;
pub mod upload;
pub mod viewer;

// Re-export main types
pub use capture::{
    CaptureBackend, CaptureController, CaptureError, HeadlessBackend, MediaStream, Provenance,
    Recording, RecordingStatus,
};
pub use config::{ClientConfig, ConfigValidationError, UploadProtocol};
pub use gate::{Gate, OpenGate, SharedSecretGate};
pub use job::{Job, JobId, JobStatus, ModelFormat, ModelResult};
pub use poller::{ConversionError, JobPoller};
pub use session::{
    Command, Notice, PipelineError, Session, SessionError, SessionSnapshot, Severity, Stage,
};
pub use upload::{UploadClient, UploadError, UploadStep};
pub use viewer::{DownloadViewer, FetchError, LoadedSignal, LogViewer, ModelFetcher, Viewer, ViewerModel};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::capture::{CaptureBackend, HeadlessBackend, Recording};
    pub use crate::config::ClientConfig;
    pub use crate::session::{Command, Session, SessionSnapshot, Stage};
    pub use crate::viewer::{LoadedSignal, LogViewer, Viewer, ViewerModel};
}
