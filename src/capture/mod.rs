//! Screen capture into a segmented HLS stream.

pub mod backend;
pub mod ffmpeg;

pub use backend::CaptureBackend;
pub use ffmpeg::{FfmpegEncoder, PLAYLIST_NAME};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Child;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{CaptureSettings, CastError, Result};

const READY_POLL: Duration = Duration::from_millis(100);

/// Something that turns a live capture into a playlist on disk.
#[async_trait]
pub trait Encoder: Send + Sync {
    fn name(&self) -> &str;

    /// Launch the encoder writing into `output_dir`. Must not return
    /// success for a process that dies straight away.
    async fn start(&self, output_dir: &Path, settings: &CaptureSettings) -> Result<EncoderHandle>;

    /// Terminate gracefully, then forcefully. Stopping a stopped handle is a
    /// no-op. On error the handle keeps its process so the stop can be retried.
    async fn stop(&self, handle: &mut EncoderHandle) -> Result<()>;

    fn health_check(&self, handle: &mut EncoderHandle) -> EncoderHealth;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "code", rename_all = "snake_case")]
pub enum EncoderHealth {
    Running,
    Exited(Option<i32>),
    Unknown,
}

/// A running (or finished) encoder and the directory it writes to.
#[derive(Debug)]
pub struct EncoderHandle {
    process: Option<Child>,
    output_dir: PathBuf,
    media_path: PathBuf,
    stopped: bool,
}

impl EncoderHandle {
    pub fn new(process: Child, output_dir: PathBuf, media_path: PathBuf) -> Self {
        Self {
            process: Some(process),
            output_dir,
            media_path,
            stopped: false,
        }
    }

    /// A handle with no process behind it, for encoders that do not spawn one.
    pub fn detached(output_dir: PathBuf, media_path: PathBuf) -> Self {
        Self {
            process: None,
            output_dir,
            media_path,
            stopped: false,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn media_path(&self) -> &Path {
        &self.media_path
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn mark_stopped(&mut self) {
        self.stopped = true;
    }

    pub fn process_mut(&mut self) -> Option<&mut Child> {
        self.process.as_mut()
    }

    /// Record a confirmed exit. Drops the reaped process.
    pub fn finish(&mut self) {
        self.process = None;
        self.stopped = true;
    }
}

/// Owns scratch storage around an [`Encoder`].
pub struct CaptureEncoder {
    encoder: Arc<dyn Encoder>,
    scratch_root: PathBuf,
    ready_timeout: Duration,
}

impl CaptureEncoder {
    pub fn new(encoder: Arc<dyn Encoder>, scratch_root: PathBuf, ready_timeout: Duration) -> Self {
        Self {
            encoder,
            scratch_root,
            ready_timeout,
        }
    }

    /// Start a capture into a fresh `lancast-<uuid>` directory. Returns once
    /// the media resource is servable: a playlist listing at least one
    /// segment, or a non-empty file for anything else.
    pub async fn start(&self, settings: &CaptureSettings) -> Result<EncoderHandle> {
        let output_dir = self.scratch_root.join(format!("lancast-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&output_dir).await?;
        debug!("Capture scratch directory {}", output_dir.display());

        let mut handle = match self.encoder.start(&output_dir, settings).await {
            Ok(handle) => handle,
            Err(e) => {
                remove_storage(&output_dir).await;
                return Err(e);
            }
        };

        if let Err(e) = self.wait_until_ready(&mut handle).await {
            warn!("{} encoder never produced media: {}", self.encoder.name(), e);
            match self.encoder.stop(&mut handle).await {
                Ok(()) => remove_storage(&output_dir).await,
                Err(stop_err) => warn!(
                    "Failed to stop encoder, leaving {} in place: {}",
                    output_dir.display(),
                    stop_err
                ),
            }
            return Err(e);
        }

        info!("{} encoder started", self.encoder.name());
        Ok(handle)
    }

    async fn wait_until_ready(&self, handle: &mut EncoderHandle) -> Result<()> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if media_ready(handle.media_path()).await {
                return Ok(());
            }
            if let EncoderHealth::Exited(code) = self.encoder.health_check(handle) {
                return Err(CastError::CaptureStartFailed(format!(
                    "encoder exited before writing {} (code {:?})",
                    handle.media_path().display(),
                    code
                )));
            }
            if Instant::now() >= deadline {
                return Err(CastError::CaptureStartFailed(format!(
                    "{} was not ready within {:?}",
                    handle.media_path().display(),
                    self.ready_timeout
                )));
            }
            time::sleep(READY_POLL).await;
        }
    }

    /// Stop the encoder, then delete its storage. Storage stays put while
    /// the encoder may still be running. Safe to repeat.
    pub async fn stop(&self, handle: &mut EncoderHandle) -> Result<()> {
        if !handle.is_stopped() {
            self.encoder.stop(handle).await?;
            handle.mark_stopped();
        }
        remove_storage(handle.output_dir()).await;
        Ok(())
    }

    pub fn health_check(&self, handle: &mut EncoderHandle) -> EncoderHealth {
        self.encoder.health_check(handle)
    }
}

async fn media_ready(path: &Path) -> bool {
    if path.extension().and_then(|ext| ext.to_str()) == Some("m3u8") {
        match tokio::fs::read_to_string(path).await {
            Ok(playlist) => playlist
                .lines()
                .map(str::trim)
                .any(|line| !line.is_empty() && !line.starts_with('#')),
            Err(_) => false,
        }
    } else {
        tokio::fs::metadata(path)
            .await
            .map(|meta| meta.len() > 0)
            .unwrap_or(false)
    }
}

async fn remove_storage(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
    }
}
