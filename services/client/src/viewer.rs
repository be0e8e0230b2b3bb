//! Viewer boundary.
//!
//! The session hands a resolved [`ViewerModel`] and a one-shot [`LoadedSignal`]
//! to whatever renders meshes. Headless implementations live here: one that
//! only logs, one that downloads the mesh to disk.

use crate::job::{ModelFormat, ModelResult};
use bytes::Bytes;
use reqwest::Client;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, instrument};

/// What a renderer needs to pick a loader and fetch the asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerModel {
    pub url: String,
    pub format: ModelFormat,
    pub label: String,
}

impl From<&ModelResult> for ViewerModel {
    fn from(result: &ModelResult) -> Self {
        Self {
            url: result.resolved_url.clone(),
            format: result.format,
            label: result.label.clone(),
        }
    }
}

/// Reports that the presented model is ready to display.
///
/// Consumed by [`LoadedSignal::loaded`], so it fires at most once.
pub struct LoadedSignal {
    notify: Box<dyn FnOnce() + Send>,
}

impl LoadedSignal {
    pub fn new(notify: impl FnOnce() + Send + 'static) -> Self {
        Self {
            notify: Box::new(notify),
        }
    }

    pub fn loaded(self) {
        (self.notify)()
    }
}

impl fmt::Debug for LoadedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoadedSignal")
    }
}

/// Renders converted meshes.
#[cfg_attr(test, mockall::automock)]
pub trait Viewer: Send + Sync {
    /// Show `model`, calling `loaded` once the asset is ready.
    fn present(&self, model: ViewerModel, loaded: LoadedSignal);

    /// Drop any model reference currently held.
    fn clear(&self);
}

/// Logs the model location and reports it loaded immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogViewer;

impl Viewer for LogViewer {
    fn present(&self, model: ViewerModel, loaded: LoadedSignal) {
        info!(url = %model.url, format = model.format.extension(), label = %model.label, "Model ready");
        loaded.loaded();
    }

    fn clear(&self) {}
}

/// Errors while downloading a mesh.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Model download failed with HTTP {status}: {body}")]
    Transport { status: u16, body: String },

    #[error("Model download could not be sent: {0}")]
    Network(String),

    #[error("Failed to write model to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Downloads mesh assets from their resolved URL.
#[derive(Debug, Clone)]
pub struct ModelFetcher {
    http: Client,
}

impl ModelFetcher {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    #[instrument(skip(self, model), fields(url = %model.url))]
    pub async fn fetch(&self, model: &ViewerModel) -> Result<Bytes, FetchError> {
        let response = self
            .http
            .get(&model.url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Transport {
                status: status.as_u16(),
                body,
            });
        }

        response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))
    }

    /// Download `model` into `dir`, returning the written path.
    pub async fn download_to(&self, model: &ViewerModel, dir: &Path) -> Result<PathBuf, FetchError> {
        let data = self.fetch(model).await?;
        let path = dir.join(output_file_name(model));

        let write = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, &data).await
        };
        write.await.map_err(|source| FetchError::Write {
                path: path.display().to_string(),
                source,
            })?;

        info!(path = %path.display(), bytes = data.len(), "Model saved");
        Ok(path)
    }
}

/// Downloads each presented model into a directory, then reports it loaded.
///
/// A failed download is logged and the signal is dropped unfired.
#[derive(Debug, Clone)]
pub struct DownloadViewer {
    fetcher: ModelFetcher,
    output_dir: PathBuf,
}

impl DownloadViewer {
    pub fn new(fetcher: ModelFetcher, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            output_dir: output_dir.into(),
        }
    }
}

impl Viewer for DownloadViewer {
    fn present(&self, model: ViewerModel, loaded: LoadedSignal) {
        let fetcher = self.fetcher.clone();
        let dir = self.output_dir.clone();
        tokio::spawn(async move {
            match fetcher.download_to(&model, &dir).await {
                Ok(_) => loaded.loaded(),
                Err(e) => error!(error = %e, url = %model.url, "Failed to download model"),
            }
        });
    }

    fn clear(&self) {}
}

/// `<label>.<ext>` with the label reduced to a safe path component.
fn output_file_name(model: &ViewerModel) -> String {
    let ext = model.format.extension();
    let stem = model
        .label
        .strip_suffix(&format!(".{ext}"))
        .unwrap_or(&model.label);
    let stem: String = stem
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    let stem = if stem.is_empty() { "model".to_string() } else { stem };
    format!("{stem}.{ext}")
}
