//! Test doubles for the encoder and the Cast client.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lancast::capture::{Encoder, EncoderHandle, EncoderHealth, PLAYLIST_NAME};
use lancast::config::CasterConfig;
use lancast::network::{CastChannel, CastConnector, LoadRequest, RemotePlayerState};
use lancast::{CaptureSettings, CastError, Device, Result, StatusKind, StatusSubscription};

const PLAYLIST: &str =
    "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nsegment_00000.ts\n";

/// Writes a playlist instead of capturing anything.
#[derive(Default)]
pub struct FakeEncoder {
    pub unavailable: AtomicBool,
    /// Write the playlist this many milliseconds after `start` returns,
    /// the way ffmpeg only writes it once the first segment is done.
    pub playlist_delay_ms: AtomicU64,
    /// The next this-many stops fail without stopping anything.
    pub failing_stops: AtomicUsize,
    pub running: AtomicUsize,
    pub starts: AtomicUsize,
}

#[async_trait]
impl Encoder for FakeEncoder {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self, output_dir: &Path, _settings: &CaptureSettings) -> Result<EncoderHandle> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CastError::EncoderUnavailable("ffmpeg not found".into()));
        }
        let playlist = output_dir.join(PLAYLIST_NAME);
        let segment = output_dir.join("segment_00000.ts");
        let delay = Duration::from_millis(self.playlist_delay_ms.load(Ordering::SeqCst));
        if delay.is_zero() {
            tokio::fs::write(&segment, vec![0x47u8; 188 * 8]).await?;
            tokio::fs::write(&playlist, PLAYLIST).await?;
        } else {
            let late = playlist.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tokio::fs::write(&segment, vec![0x47u8; 188 * 8]).await;
                let _ = tokio::fs::write(&late, PLAYLIST).await;
            });
        }

        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.fetch_add(1, Ordering::SeqCst);
        Ok(EncoderHandle::detached(output_dir.to_path_buf(), playlist))
    }

    async fn stop(&self, handle: &mut EncoderHandle) -> Result<()> {
        let failing = self.failing_stops.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_stops.store(failing - 1, Ordering::SeqCst);
            return Err(CastError::Io(std::io::Error::other("encoder would not die")));
        }
        if !handle.is_stopped() {
            handle.finish();
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn health_check(&self, handle: &mut EncoderHandle) -> EncoderHealth {
        if handle.is_stopped() {
            EncoderHealth::Exited(Some(0))
        } else {
            EncoderHealth::Running
        }
    }
}

/// A receiver that can be unplugged or made to ignore load requests.
#[derive(Default)]
pub struct FakeReceiver {
    pub offline: AtomicBool,
    pub never_activate: AtomicBool,
    pub playing: AtomicBool,
    pub connections: AtomicUsize,
    pub open_channels: AtomicUsize,
    pub loads: AtomicUsize,
    pub last_url: std::sync::Mutex<Option<String>>,
    /// HTTP status the stream URL answered with at each load.
    pub load_statuses: std::sync::Mutex<Vec<u16>>,
}

impl FakeReceiver {
    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(CastError::Connect("receiver unreachable".into()))
        } else {
            Ok(())
        }
    }
}

pub struct FakeChannel {
    receiver: Arc<FakeReceiver>,
    closed: AtomicBool,
}

#[async_trait]
impl CastChannel for FakeChannel {
    async fn load(&self, request: &LoadRequest) -> Result<()> {
        self.receiver.check_online()?;
        self.receiver.loads.fetch_add(1, Ordering::SeqCst);
        *self.receiver.last_url.lock().unwrap() = Some(request.url.clone());
        // a real receiver fetches the playlist as soon as it is told to load
        let status = match reqwest::get(&request.url).await {
            Ok(response) => response.status().as_u16(),
            Err(_) => 0,
        };
        self.receiver.load_statuses.lock().unwrap().push(status);
        if !self.receiver.never_activate.load(Ordering::SeqCst) {
            self.receiver.playing.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn player_state(&self) -> Result<RemotePlayerState> {
        self.receiver.check_online()?;
        Ok(if self.receiver.playing.load(Ordering::SeqCst) {
            RemotePlayerState::Playing
        } else {
            RemotePlayerState::Idle
        })
    }

    async fn stop_playback(&self) -> Result<()> {
        self.receiver.check_online()?;
        self.receiver.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.receiver.open_channels.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct FakeConnector(pub Arc<FakeReceiver>);

#[async_trait]
impl CastConnector for FakeConnector {
    async fn connect(&self, _device: &Device) -> Result<Arc<dyn CastChannel>> {
        self.0.check_online()?;
        self.0.connections.fetch_add(1, Ordering::SeqCst);
        self.0.open_channels.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeChannel {
            receiver: self.0.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub fn device() -> Device {
    Device {
        id: "4b1d7e0c2f".into(),
        display_name: "Living Room TV".into(),
        model_name: "Chromecast Ultra".into(),
        address: "192.168.1.40".parse().unwrap(),
        port: 8009,
        manufacturer: "Google Inc.".into(),
    }
}

pub fn scratch_root() -> PathBuf {
    std::env::temp_dir().join(format!("lancast-it-{}", uuid::Uuid::new_v4()))
}

/// Loopback server, fast session timings, scratch under `scratch`.
pub fn test_config(scratch: &Path) -> CasterConfig {
    let mut config = CasterConfig::default();
    config.server.bind_host = "127.0.0.1".parse().unwrap();
    config.server.stop_grace_ms = 500;
    config.capture.scratch_dir = Some(scratch.to_path_buf());
    config.capture.ready_timeout_secs = 5;
    config.session.poll_interval_ms = 20;
    config.session.activation_timeout_secs = 1;
    config.session.max_reconnect_attempts = 2;
    config.session.reconnect_delay_ms = 20;
    config.session.command_timeout_secs = 1;
    config
}

pub async fn next_kind(events: &mut StatusSubscription) -> StatusKind {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a status event")
        .expect("status bus closed")
        .kind
}
