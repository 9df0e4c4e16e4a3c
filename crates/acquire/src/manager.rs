use crate::progress::{ProgressReporter, ProgressThrottle};
use crate::transfer::{HttpTransfer, Transfer};
use futures::StreamExt;
use kairos_common::{Error, Result};
use kairos_config::{DownloadConfig, ModelDescriptor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PARTIAL_SUFFIX: &str = ".part";
const MODEL_EXTENSION: &str = "gguf";

/// Downloads model artifacts into one directory.
///
/// Artifacts are named after their descriptor. Bytes land in
/// `<name>.part` and are renamed onto `<name>` only once flushed and
/// synced, so a file at the artifact path is always complete.
pub struct AcquisitionManager {
    models_dir: PathBuf,
    transfer: Arc<dyn Transfer>,
    buffer_bytes: usize,
}

impl AcquisitionManager {
    pub fn new(models_dir: impl Into<PathBuf>, transfer: Arc<dyn Transfer>) -> Self {
        Self {
            models_dir: models_dir.into(),
            transfer,
            buffer_bytes: DownloadConfig::default().buffer_bytes,
        }
    }

    /// Manager using HTTP with the configured timeouts
    pub fn with_http(models_dir: impl Into<PathBuf>, config: &DownloadConfig) -> Result<Self> {
        let transfer = Arc::new(HttpTransfer::new(config)?);
        Ok(Self::new(models_dir, transfer).with_buffer_size(config.buffer_bytes))
    }

    pub fn with_buffer_size(mut self, buffer_bytes: usize) -> Self {
        self.buffer_bytes = buffer_bytes.max(1);
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Where the artifact called `name` lives
    pub fn model_path(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(|c: char| c == '/' || c == '\\')
            && !name.ends_with(PARTIAL_SUFFIX);
        if !valid {
            return Err(Error::BadRequest(format!("Invalid model name: {}", name)));
        }
        Ok(self.models_dir.join(name))
    }

    pub fn is_downloaded(&self, name: &str) -> bool {
        self.model_path(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Names of the `.gguf` artifacts present, sorted
    pub async fn list_downloaded(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.models_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_model = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(MODEL_EXTENSION));
            if is_model && entry.file_type().await?.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Remove an artifact; returns whether one existed
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.model_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(model = name, "Deleted model");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Make the artifact for `descriptor` available locally.
    ///
    /// Returns immediately when the artifact already exists. On any
    /// failure the partial file is removed before the error is returned.
    pub async fn acquire(
        &self,
        descriptor: &ModelDescriptor,
        mut progress: ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let path = self.model_path(&descriptor.name)?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(model = %descriptor.name, "Model already present");
            return Ok(path);
        }

        fs::create_dir_all(&self.models_dir).await.map_err(|e| {
            Error::DownloadFailed(format!(
                "Cannot create {}: {}",
                self.models_dir.display(),
                e
            ))
        })?;

        let partial = partial_path(&path);
        info!(model = %descriptor.name, url = %descriptor.url, "Downloading model");

        let result = match self
            .download(descriptor, &partial, &mut progress, cancel)
            .await
        {
            Ok(bytes) => fs::rename(&partial, &path)
                .await
                .map(|_| bytes)
                .map_err(Error::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(bytes) => {
                info!(model = %descriptor.name, bytes, "Download complete");
                Ok(path)
            }
            Err(e) => {
                remove_quietly(&partial).await;
                warn!(model = %descriptor.name, error = %e, "Download failed");
                Err(describe_failure(&descriptor.name, e))
            }
        }
    }

    async fn download(
        &self,
        descriptor: &ModelDescriptor,
        partial: &Path,
        progress: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            response = self.transfer.get(&descriptor.url) => response?,
        };

        let total = response.total_bytes;
        let mut body = response.body;

        let file = fs::File::create(partial).await?;
        let mut writer = BufWriter::with_capacity(self.buffer_bytes, file);
        let mut throttle = ProgressThrottle::new(total, Instant::now());
        let mut downloaded: u64 = 0;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                chunk = body.next() => chunk,
            };

            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;

            writer.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress.report(&mut throttle, downloaded, Instant::now());
        }

        if let Some(total) = total {
            if downloaded != total {
                return Err(Error::DownloadFailed(format!(
                    "received {} of {} bytes",
                    downloaded, total
                )));
            }
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        progress.complete(&throttle, downloaded);
        Ok(downloaded)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn cancelled() -> Error {
    Error::Cancelled("download cancelled".into())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), "Could not remove partial download: {}", e);
        }
    }
}

/// Keep cancellation and HTTP status distinct, fold the rest into one message
fn describe_failure(name: &str, error: Error) -> Error {
    match error {
        e @ (Error::Cancelled(_) | Error::HttpStatus { .. } | Error::DownloadFailed(_)) => e,
        other => Error::DownloadFailed(format!("{}: {}", name, other)),
    }
}
