//! Runtime configuration loaded from `config.toml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//! The core only reads this; remembering the user's last device or capture
//! choices is up to the caller.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{CaptureSettings, CastError, Result};

/// Default Media Receiver application id.
pub const DEFAULT_RECEIVER_APP_ID: &str = "CC1AD845";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CasterConfig {
    pub server: ServerConfig,
    pub discovery: DiscoveryConfig,
    pub capture: CaptureConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: IpAddr,
    /// 0 binds an ephemeral port.
    pub port: u16,
    pub web_root: Option<PathBuf>,
    pub stop_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::from([0, 0, 0, 0]),
            port: 0,
            web_root: None,
            stop_grace_ms: 2000,
        }
    }
}

impl ServerConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub timeout_secs: u64,
    pub probe_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            probe_timeout_ms: 2000,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub ffmpeg_path: PathBuf,
    pub startup_grace_ms: u64,
    /// How long to wait for the first playlist with a segment in it.
    pub ready_timeout_secs: u64,
    pub stop_grace_secs: u64,
    /// Parent of the per-capture scratch directories. System temp dir if unset.
    pub scratch_dir: Option<PathBuf>,
    pub defaults: CaptureSettings,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            startup_grace_ms: 1500,
            ready_timeout_secs: 15,
            stop_grace_secs: 5,
            scratch_dir: None,
            defaults: CaptureSettings::default(),
        }
    }
}

impl CaptureConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub receiver_app_id: String,
    pub poll_interval_ms: u64,
    pub activation_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_missed_polls: u32,
    pub command_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receiver_app_id: DEFAULT_RECEIVER_APP_ID.to_string(),
            poll_interval_ms: 1000,
            activation_timeout_secs: 10,
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 2000,
            max_missed_polls: 2,
            command_timeout_secs: 10,
        }
    }
}

impl CasterConfig {
    /// `config.toml` in the platform config directory, if one can be determined.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "lancast", "lancast")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from [`default_path`](Self::default_path) when
    /// `path` is `None`. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => {
                debug!("No config directory available, using defaults");
                return Ok(Self::default());
            }
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let config = Self::from_toml(&text)
                    .map_err(|e| CastError::Config(format!("{}: {}", path.display(), e)))?;
                info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(CastError::Config(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CastError::Config(e.to_string()))
    }
}
