//! ffmpeg-backed [`Encoder`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::time;
use tracing::{debug, info, warn};

use super::{CaptureBackend, Encoder, EncoderHandle, EncoderHealth};
use crate::config::CaptureConfig;
use crate::{CaptureMode, CaptureSettings, CastError, Result};

pub const PLAYLIST_NAME: &str = "stream.m3u8";
pub const SEGMENT_PATTERN: &str = "segment_%05d.ts";

const DEFAULT_RESOLUTION: &str = "1920x1080";
const COMPOSITOR_DEFAULT_TARGET: &str = "default";

pub struct FfmpegEncoder {
    binary: PathBuf,
    backend: CaptureBackend,
    startup_grace: Duration,
    stop_grace: Duration,
}

impl FfmpegEncoder {
    pub fn new(config: &CaptureConfig, backend: CaptureBackend) -> Self {
        Self {
            binary: config.ffmpeg_path.clone(),
            backend,
            startup_grace: config.startup_grace(),
            stop_grace: config.stop_grace(),
        }
    }

    pub fn backend(&self) -> &CaptureBackend {
        &self.backend
    }
}

/// Full ffmpeg argument list for one capture into `output_dir`.
pub fn build_args(
    backend: &CaptureBackend,
    output_dir: &Path,
    settings: &CaptureSettings,
) -> Vec<String> {
    let fps = settings.frame_rate.max(1);
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];

    match backend {
        CaptureBackend::WindowingSystemCapture { display } => {
            let resolution = settings.resolution.as_deref().unwrap_or(DEFAULT_RESOLUTION);
            args.extend(["-f".into(), "x11grab".into()]);
            args.extend(["-framerate".into(), fps.to_string()]);
            args.extend(["-video_size".into(), resolution.to_string()]);
            args.extend(["-draw_mouse".into(), "1".into()]);
            if let CaptureMode::Window(id) = &settings.mode {
                args.extend(["-window_id".into(), id.clone()]);
            }
            args.extend(["-i".into(), display.clone()]);
        }
        CaptureBackend::CompositorCapture => {
            let target = match &settings.mode {
                CaptureMode::Window(id) => id.as_str(),
                CaptureMode::FullScreen => COMPOSITOR_DEFAULT_TARGET,
            };
            args.extend(["-f".into(), "pipewire".into()]);
            args.extend(["-framerate".into(), fps.to_string()]);
            args.extend(["-i".into(), target.to_string()]);
        }
    }

    if let Some(source) = &settings.audio_source {
        args.extend(["-f".into(), "pulse".into(), "-ac".into(), "2".into()]);
        args.extend(["-i".into(), source.clone()]);
    }

    args.extend(["-c:v".into(), settings.video_codec.clone()]);
    args.extend(["-pix_fmt".into(), settings.pixel_format.clone()]);
    args.extend(["-preset".into(), settings.preset.clone()]);
    args.extend(["-tune".into(), settings.tune.clone()]);
    // GOP of two seconds
    args.extend(["-g".into(), (fps * 2).to_string()]);
    args.extend(["-r".into(), fps.to_string()]);

    if settings.audio_source.is_some() {
        args.extend(["-c:a".into(), "aac".into(), "-b:a".into(), "128k".into()]);
    } else {
        args.push("-an".into());
    }

    args.extend(["-f".into(), "hls".into()]);
    args.extend(["-hls_time".into(), settings.segment_duration_secs.max(1).to_string()]);
    args.extend([
        "-hls_list_size".into(),
        settings.segment_retention_count.max(1).to_string(),
    ]);
    args.extend(["-hls_flags".into(), "delete_segments+omit_endlist".into()]);
    args.push("-hls_segment_filename".into());
    args.push(output_dir.join(SEGMENT_PATTERN).to_string_lossy().into_owned());
    args.push(output_dir.join(PLAYLIST_NAME).to_string_lossy().into_owned());

    args
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn start(&self, output_dir: &Path, settings: &CaptureSettings) -> Result<EncoderHandle> {
        let args = build_args(&self.backend, output_dir, settings);
        debug!("{} {}", self.binary.display(), args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CastError::EncoderUnavailable(format!(
                    "{} not found",
                    self.binary.display()
                )),
                _ => CastError::CaptureStartFailed(format!(
                    "Failed to launch {}: {}",
                    self.binary.display(),
                    e
                )),
            })?;

        let mut stderr = child.stderr.take();

        match time::timeout(self.startup_grace, child.wait()).await {
            Ok(Ok(status)) => {
                let mut output = String::new();
                if let Some(stderr) = stderr.as_mut() {
                    let _ = stderr.read_to_string(&mut output).await;
                }
                let output = output.trim();
                warn!("Encoder exited during startup ({}): {}", status, output);
                Err(CastError::CaptureStartFailed(if output.is_empty() {
                    format!("encoder exited during startup with {}", status)
                } else {
                    format!("encoder exited during startup with {}: {}", status, output)
                }))
            }
            Ok(Err(e)) => Err(CastError::CaptureStartFailed(format!(
                "Failed to observe encoder: {}",
                e
            ))),
            Err(_) => {
                info!(
                    "Capture running ({}, {} fps) into {}",
                    self.backend,
                    settings.frame_rate,
                    output_dir.display()
                );
                if let Some(stderr) = stderr {
                    tokio::spawn(drain_stderr(stderr));
                }
                Ok(EncoderHandle::new(
                    child,
                    output_dir.to_path_buf(),
                    output_dir.join(PLAYLIST_NAME),
                ))
            }
        }
    }

    async fn stop(&self, handle: &mut EncoderHandle) -> Result<()> {
        let Some(child) = handle.process_mut() else {
            handle.finish();
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("Encoder had already exited with {}", status);
            handle.finish();
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we have not reaped yet.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => info!("Encoder stopped ({})", status),
            Ok(Err(e)) => return Err(CastError::Io(e)),
            Err(_) => {
                warn!(
                    "Encoder ignored SIGTERM for {:?}, killing it",
                    self.stop_grace
                );
                child.kill().await?;
            }
        }
        handle.finish();
        Ok(())
    }

    fn health_check(&self, handle: &mut EncoderHandle) -> EncoderHealth {
        let stopped = handle.is_stopped();
        match handle.process_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => EncoderHealth::Running,
                Ok(Some(status)) => EncoderHealth::Exited(status.code()),
                Err(_) => EncoderHealth::Unknown,
            },
            None if stopped => EncoderHealth::Exited(None),
            None => EncoderHealth::Unknown,
        }
    }
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "lancast::ffmpeg", "{}", line);
    }
}
