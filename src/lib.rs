pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod orchestrator;
pub mod server;
pub mod session;

pub use error::{CastError, Result, StartStage};
pub use events::{StatusBus, StatusEvent, StatusKind, StatusSubscription};
pub use orchestrator::{OrchestratorStatus, StreamInfo, StreamOrchestrator};
pub use session::SessionState;

use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A Cast receiver found on the network.
///
/// Two devices are the same device when their ids match, whatever address
/// they were reported on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub display_name: String,
    pub model_name: String,
    pub address: IpAddr,
    pub port: u16,
    pub manufacturer: String,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "window_id", rename_all = "snake_case")]
pub enum CaptureMode {
    FullScreen,
    Window(String),
}

/// Snapshot of capture parameters taken when a capture starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub mode: CaptureMode,
    pub frame_rate: u32,
    pub video_codec: String,
    pub pixel_format: String,
    pub preset: String,
    pub tune: String,
    pub segment_duration_secs: u32,
    pub segment_retention_count: u32,
    /// "WIDTHxHEIGHT", used by the windowing-system capture path.
    pub resolution: Option<String>,
    /// PulseAudio-style source id; `None` streams video only.
    pub audio_source: Option<String>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            mode: CaptureMode::FullScreen,
            frame_rate: 30,
            video_codec: "libx264".to_string(),
            pixel_format: "yuv420p".to_string(),
            preset: "ultrafast".to_string(),
            tune: "zerolatency".to_string(),
            segment_duration_secs: 2,
            segment_retention_count: 5,
            resolution: None,
            audio_source: None,
        }
    }
}

/// Metadata shown by the receiver while it plays the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    pub subtitle: Option<String>,
}

impl Default for MediaMetadata {
    fn default() -> Self {
        Self {
            title: "lancast screen share".to_string(),
            subtitle: None,
        }
    }
}

/// The stream the server is currently exposing.
#[derive(Debug, Clone, Serialize)]
pub struct StreamHandle {
    pub local_address: IpAddr,
    pub port: u16,
    pub filesystem_root: Option<PathBuf>,
    pub active_media_path: PathBuf,
    /// Well-known request path of the media resource, e.g. `/stream.m3u8`.
    pub media_route: String,
}

impl StreamHandle {
    pub fn stream_url(&self) -> String {
        match self.local_address {
            IpAddr::V6(addr) => format!("http://[{}]:{}{}", addr, self.port, self.media_route),
            IpAddr::V4(addr) => format!("http://{}:{}{}", addr, self.port, self.media_route),
        }
    }
}
