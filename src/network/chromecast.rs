//! Cast client capability.
//!
//! `rust_cast` is blocking and its device handle is not `Send`, so each
//! connection gets a worker thread that owns the `CastDevice`. Async callers
//! talk to it through a command queue and get replies on oneshot channels.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rust_cast::channels::media::{GenericMediaMetadata, Media, Metadata, PlayerState, StreamType};
use rust_cast::channels::receiver::CastDeviceApp;
use rust_cast::CastDevice;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::{SessionConfig, DEFAULT_RECEIVER_APP_ID};
use crate::{CastError, Device, MediaMetadata, Result};

/// Content type announced for HLS playlists
pub const HLS_CONTENT_TYPE: &str = "application/x-mpegURL";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Remote media player state as reported by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemotePlayerState {
    Idle,
    Buffering,
    Playing,
    Paused,
}

impl RemotePlayerState {
    /// The receiver holds a live media session.
    pub fn is_active(&self) -> bool {
        !matches!(self, RemotePlayerState::Idle)
    }
}

impl From<&PlayerState> for RemotePlayerState {
    fn from(state: &PlayerState) -> Self {
        match state {
            PlayerState::Idle => RemotePlayerState::Idle,
            PlayerState::Buffering => RemotePlayerState::Buffering,
            PlayerState::Playing => RemotePlayerState::Playing,
            PlayerState::Paused => RemotePlayerState::Paused,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub url: String,
    pub content_type: String,
    pub metadata: MediaMetadata,
}

impl LoadRequest {
    pub fn live(url: impl Into<String>, metadata: MediaMetadata) -> Self {
        Self {
            url: url.into(),
            content_type: HLS_CONTENT_TYPE.to_string(),
            metadata,
        }
    }
}

/// An open connection to one receiver.
///
/// `player_state` failing with [`CastError::Connect`] means the connection is
/// gone; any other error is a missed poll.
#[async_trait]
pub trait CastChannel: Send + Sync {
    async fn load(&self, request: &LoadRequest) -> Result<()>;
    async fn player_state(&self) -> Result<RemotePlayerState>;
    async fn stop_playback(&self) -> Result<()>;
    async fn close(&self);
}

#[async_trait]
pub trait CastConnector: Send + Sync {
    /// Connect and wait until the receiver is ready for commands.
    async fn connect(&self, device: &Device) -> Result<Arc<dyn CastChannel>>;
}

pub struct RustCastConnector {
    app_id: String,
    command_timeout: Duration,
}

impl RustCastConnector {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            app_id: config.receiver_app_id.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }
}

impl Default for RustCastConnector {
    fn default() -> Self {
        Self::new(&SessionConfig::default())
    }
}

#[async_trait]
impl CastConnector for RustCastConnector {
    async fn connect(&self, device: &Device) -> Result<Arc<dyn CastChannel>> {
        info!(
            "Connecting to Cast device {} at {}:{}",
            device.display_name, device.address, device.port
        );

        let (commands, queue) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();
        let host = device.address.to_string();
        let port = device.port;
        let app_id = self.app_id.clone();

        thread::Builder::new()
            .name(format!("cast-{}", device.id))
            .spawn(move || run_worker(host, port, app_id, ready_tx, queue))
            .map_err(|e| CastError::Connect(format!("Failed to spawn cast worker: {}", e)))?;

        match time::timeout(self.command_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                info!("Connected to {}", device.display_name);
                Ok(Arc::new(RustCastChannel {
                    commands,
                    command_timeout: self.command_timeout,
                }))
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(CastError::Connect(format!(
                "Connection to {} closed during setup",
                device.display_name
            ))),
            Err(_) => Err(CastError::Connect(format!(
                "{} did not answer within {:?}",
                device.display_name, self.command_timeout
            ))),
        }
    }
}

enum Command {
    Load {
        request: LoadRequest,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<Result<RemotePlayerState>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

struct RustCastChannel {
    commands: Sender<Command>,
    command_timeout: Duration,
}

impl RustCastChannel {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| CastError::Connect("Cast connection closed".into()))?;

        match time::timeout(self.command_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CastError::Connect("Cast connection closed".into())),
            Err(_) => Err(CastError::Playback(format!(
                "No reply from receiver within {:?}",
                self.command_timeout
            ))),
        }
    }
}

#[async_trait]
impl CastChannel for RustCastChannel {
    async fn load(&self, request: &LoadRequest) -> Result<()> {
        let request = request.clone();
        self.request(|reply| Command::Load { request, reply }).await
    }

    async fn player_state(&self) -> Result<RemotePlayerState> {
        self.request(|reply| Command::Status { reply }).await
    }

    async fn stop_playback(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    async fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Ids of the receiver app and media session we launched.
#[derive(Default)]
struct MediaTarget {
    transport_id: Option<String>,
    session_id: Option<String>,
    media_session_id: Option<i32>,
}

fn run_worker(
    host: String,
    port: u16,
    app_id: String,
    ready: oneshot::Sender<Result<()>>,
    queue: Receiver<Command>,
) {
    let device = match CastDevice::connect_without_host_verification(host.clone(), port) {
        Ok(device) => device,
        Err(e) => {
            let _ = ready.send(Err(CastError::Connect(format!(
                "Failed to connect to {}:{}: {}",
                host, port, e
            ))));
            return;
        }
    };

    if let Err(e) = device.connection.connect("receiver-0") {
        let _ = ready.send(Err(CastError::Connect(format!(
            "Failed to connect to receiver on {}:{}: {}",
            host, port, e
        ))));
        return;
    }

    if ready.send(Ok(())).is_err() {
        debug!("Connect to {}:{} abandoned by caller", host, port);
        return;
    }

    let mut target = MediaTarget::default();
    let mut last_ping = Instant::now();

    loop {
        match queue.recv_timeout(HEARTBEAT_INTERVAL) {
            Ok(Command::Load { request, reply }) => {
                let _ = reply.send(load(&device, &app_id, &mut target, &request));
            }
            Ok(Command::Status { reply }) => {
                let _ = reply.send(player_state(&device, &mut target));
            }
            Ok(Command::Stop { reply }) => {
                let _ = reply.send(stop(&device, &mut target));
            }
            Ok(Command::Close) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if last_ping.elapsed() >= HEARTBEAT_INTERVAL {
            if let Err(e) = device.heartbeat.ping() {
                warn!("Heartbeat to {}:{} failed: {}", host, port, e);
            }
            last_ping = Instant::now();
        }
    }

    debug!("Cast worker for {}:{} exiting", host, port);
}

fn cast_app(app_id: &str) -> CastDeviceApp {
    if app_id == DEFAULT_RECEIVER_APP_ID {
        CastDeviceApp::DefaultMediaReceiver
    } else {
        CastDeviceApp::Custom(app_id.to_string())
    }
}

fn load(
    device: &CastDevice<'_>,
    app_id: &str,
    target: &mut MediaTarget,
    request: &LoadRequest,
) -> Result<()> {
    let app = device
        .receiver
        .launch_app(&cast_app(app_id))
        .map_err(|e| CastError::Playback(format!("Failed to launch receiver app: {}", e)))?;

    device
        .connection
        .connect(app.transport_id.clone())
        .map_err(|e| CastError::Playback(format!("Failed to connect to receiver app: {}", e)))?;

    let media = Media {
        content_id: request.url.clone(),
        content_type: request.content_type.clone(),
        stream_type: StreamType::Live,
        duration: None,
        metadata: Some(Metadata::Generic(GenericMediaMetadata {
            title: Some(request.metadata.title.clone()),
            subtitle: request.metadata.subtitle.clone(),
            images: Vec::new(),
            release_date: None,
        })),
    };

    let status = device
        .media
        .load(app.transport_id.clone(), app.session_id.clone(), &media)
        .map_err(|e| CastError::Playback(format!("Receiver rejected media: {}", e)))?;

    target.media_session_id = status.entries.first().map(|entry| entry.media_session_id);
    target.transport_id = Some(app.transport_id);
    target.session_id = Some(app.session_id);

    info!("Loaded {} on receiver", request.url);
    Ok(())
}

fn player_state(device: &CastDevice<'_>, target: &mut MediaTarget) -> Result<RemotePlayerState> {
    let Some(transport_id) = target.transport_id.clone() else {
        return Ok(RemotePlayerState::Idle);
    };

    let status = device
        .media
        .get_status(transport_id, None)
        .map_err(|e| CastError::Playback(format!("Failed to read media status: {}", e)))?;

    match status.entries.first() {
        Some(entry) => {
            target.media_session_id = Some(entry.media_session_id);
            Ok(RemotePlayerState::from(&entry.player_state))
        }
        None => Ok(RemotePlayerState::Idle),
    }
}

fn stop(device: &CastDevice<'_>, target: &mut MediaTarget) -> Result<()> {
    if let (Some(transport_id), Some(media_session_id)) =
        (target.transport_id.clone(), target.media_session_id)
    {
        device
            .media
            .stop(transport_id, media_session_id)
            .map_err(|e| CastError::Playback(format!("Failed to stop media: {}", e)))?;
    }

    if let Some(session_id) = target.session_id.clone() {
        device
            .receiver
            .stop_app(session_id)
            .map_err(|e| CastError::Playback(format!("Failed to stop receiver app: {}", e)))?;
    }

    *target = MediaTarget::default();
    Ok(())
}
