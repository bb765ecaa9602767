//! Top-level coordinator: capture, then serve, then cast; tear down in
//! reverse.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::capture::{CaptureBackend, CaptureEncoder, Encoder, EncoderHandle, EncoderHealth, FfmpegEncoder};
use crate::config::CasterConfig;
use crate::events::{StatusBus, StatusEvent, StatusSubscription, SubscriptionId};
use crate::network::{CastConnector, DeviceScanner, RustCastConnector};
use crate::server::StreamServer;
use crate::session::{CastSession, SessionPolicy, SessionState};
use crate::{CaptureSettings, CastError, Device, MediaMetadata, Result, StartStage};

/// What a successful start is streaming, and where.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub device: Device,
    pub stream_url: String,
    pub local_address: IpAddr,
    pub port: u16,
    pub media_path: PathBuf,
    pub settings: CaptureSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub device: Option<Device>,
    pub session: Option<SessionState>,
    pub stream: Option<StreamInfo>,
    pub encoder: Option<EncoderHealth>,
}

struct Inner {
    current_device: Option<Device>,
    settings: CaptureSettings,
    session: Option<CastSession>,
    encoder: Option<EncoderHandle>,
    server: StreamServer,
    active: Option<StreamInfo>,
    /// Bumped on every successful start.
    generation: u64,
    watchdog: Option<JoinHandle<()>>,
}

impl Inner {
    fn session_failed(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.state().is_terminal())
    }
}

/// Clears the in-flight flag when the operation ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct StreamOrchestrator {
    scanner: DeviceScanner,
    capture: Arc<CaptureEncoder>,
    connector: Arc<dyn CastConnector>,
    policy: SessionPolicy,
    bus: StatusBus,
    busy: AtomicBool,
    inner: Arc<Mutex<Inner>>,
}

impl StreamOrchestrator {
    pub fn new(
        config: CasterConfig,
        encoder: Arc<dyn Encoder>,
        connector: Arc<dyn CastConnector>,
    ) -> Self {
        Self {
            scanner: DeviceScanner::new(&config.discovery),
            capture: Arc::new(CaptureEncoder::new(
                encoder,
                config.capture.scratch_root(),
                config.capture.ready_timeout(),
            )),
            connector,
            policy: SessionPolicy::from_config(&config.session),
            bus: StatusBus::new(),
            busy: AtomicBool::new(false),
            inner: Arc::new(Mutex::new(Inner {
                current_device: None,
                settings: config.capture.defaults.clone(),
                session: None,
                encoder: None,
                server: StreamServer::new(config.server.clone()),
                active: None,
                generation: 0,
                watchdog: None,
            })),
        }
    }

    /// ffmpeg on the detected capture backend, casting through `rust_cast`.
    pub fn from_config(config: CasterConfig) -> Self {
        let encoder = Arc::new(FfmpegEncoder::new(&config.capture, CaptureBackend::detect()));
        let connector = Arc::new(RustCastConnector::new(&config.session));
        Self::new(config, encoder, connector)
    }

    fn begin(&self) -> Result<InFlight<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CastError::OperationInFlight)?;
        Ok(InFlight(&self.busy))
    }

    fn new_session(&self) -> CastSession {
        CastSession::new(self.connector.clone(), self.policy.clone(), self.bus.clone())
    }

    /// Browse for receivers; `None` uses the configured timeout.
    pub async fn discover(&self, timeout: Option<Duration>) -> Result<Vec<Device>> {
        let timeout = timeout.unwrap_or_else(|| self.scanner.default_timeout());
        self.scanner.discover(timeout).await
    }

    pub async fn verify_reachable(&self, address: IpAddr, port: u16) -> bool {
        self.scanner.verify_reachable(address, port).await
    }

    /// Connect to `device` and make it the current device.
    pub async fn select(&self, device: Device) -> Result<()> {
        let _guard = self.begin()?;
        let mut inner = self.inner.lock().await;
        self.reap_failed(&mut inner).await;

        if inner.active.is_some() {
            return Err(CastError::InvalidTransition {
                from: SessionState::Streaming.to_string(),
                to: SessionState::Connecting.to_string(),
            });
        }

        if let Some(mut previous) = inner.session.take() {
            previous.stop().await;
        }
        inner.current_device = None;

        let mut session = self.new_session();
        session.select(&device).await?;
        inner.current_device = Some(device);
        inner.session = Some(session);
        Ok(())
    }

    /// Settings for the next start. A running capture keeps its snapshot.
    pub async fn configure_capture(&self, settings: CaptureSettings) -> Result<()> {
        let _guard = self.begin()?;
        self.inner.lock().await.settings = settings;
        Ok(())
    }

    pub async fn capture_settings(&self) -> CaptureSettings {
        self.inner.lock().await.settings.clone()
    }

    pub async fn start(&self) -> Result<StreamInfo> {
        self.start_with(default_metadata()).await
    }

    /// Start capture, serve it, and cast it to the current device. On any
    /// failure everything already started is stopped again before the error
    /// is returned.
    pub async fn start_with(&self, metadata: MediaMetadata) -> Result<StreamInfo> {
        let _guard = self.begin()?;
        let mut inner = self.inner.lock().await;
        self.reap_failed(&mut inner).await;

        if inner.active.is_some() {
            return Err(CastError::InvalidTransition {
                from: SessionState::Streaming.to_string(),
                to: SessionState::Streaming.to_string(),
            });
        }
        let device = inner.current_device.clone().ok_or(CastError::NoDeviceSelected)?;
        let settings = inner.settings.clone();
        self.bus.publish(StatusEvent::started(&device));
        info!("Starting stream to {}", device.display_name);

        let mut handle = match self.capture.start(&settings).await {
            Ok(handle) => handle,
            Err(e) => {
                self.drop_session(&mut inner).await;
                return Err(self.start_failed(StartStage::Capture, e));
            }
        };

        let served = inner.server.start(handle.media_path()).await.and_then(|(address, port)| {
            let url = inner
                .server
                .stream_url()
                .ok_or_else(|| CastError::NotFound("stream handle".into()))?;
            Ok((address, port, url))
        });
        let (local_address, port, stream_url) = match served {
            Ok(served) => served,
            Err(e) => {
                self.drop_session(&mut inner).await;
                inner.server.stop().await;
                self.stop_capture(&mut handle).await;
                return Err(self.start_failed(StartStage::Server, e));
            }
        };

        if let Err(e) = self.cast(&mut inner, &device, &stream_url, metadata).await {
            self.drop_session(&mut inner).await;
            inner.server.stop().await;
            self.stop_capture(&mut handle).await;
            return Err(self.start_failed(StartStage::Session, e));
        }

        let info = StreamInfo {
            device,
            stream_url,
            local_address,
            port,
            media_path: handle.media_path().to_path_buf(),
            settings,
        };
        inner.encoder = Some(handle);
        inner.active = Some(info.clone());
        inner.generation += 1;
        if let Some(state) = inner.session.as_ref().map(CastSession::watch_state) {
            inner.watchdog = Some(tokio::spawn(watch_session(
                state,
                inner.generation,
                Arc::downgrade(&self.inner),
                self.capture.clone(),
                self.bus.clone(),
            )));
        }
        info!("Streaming {} to {}", info.stream_url, info.device.display_name);
        Ok(info)
    }

    /// A stream whose session already failed is torn down before anything
    /// else touches the orchestrator.
    async fn reap_failed(&self, inner: &mut Inner) {
        if inner.active.is_some() && inner.session_failed() {
            if let Err(e) = teardown(inner, &self.capture, &self.bus).await {
                error!("Teardown after session failure: {}", e);
            }
        }
    }

    /// Reuse the session from `select` if it is still fresh, otherwise
    /// connect a new one, then play.
    async fn cast(
        &self,
        inner: &mut Inner,
        device: &Device,
        stream_url: &str,
        metadata: MediaMetadata,
    ) -> Result<()> {
        let fresh = inner.session.as_ref().is_some_and(|session| {
            session.state() == SessionState::Connecting && session.device() == Some(device)
        });
        if !fresh {
            if let Some(mut stale) = inner.session.take() {
                stale.stop().await;
            }
            let mut session = self.new_session();
            session.select(device).await?;
            inner.session = Some(session);
        }

        match inner.session.as_mut() {
            Some(session) => session.play(stream_url, metadata).await,
            None => Err(CastError::NoDeviceSelected),
        }
    }

    async fn drop_session(&self, inner: &mut Inner) {
        if let Some(mut session) = inner.session.take() {
            session.stop().await;
        }
    }

    async fn stop_capture(&self, handle: &mut EncoderHandle) {
        if let Err(e) = self.capture.stop(handle).await {
            error!("Failed to stop capture during rollback: {}", e);
        }
    }

    fn start_failed(&self, stage: StartStage, cause: CastError) -> CastError {
        error!("Start failed at {}: {}", stage, cause);
        self.bus.publish(StatusEvent::failed(format!("{}: {}", stage, cause)));
        CastError::start_failed(stage, cause)
    }

    /// Stop the session, then the server, then the capture. Every step runs
    /// even if an earlier one failed; failures come back together.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.begin()?;
        let mut inner = self.inner.lock().await;
        teardown(&mut inner, &self.capture, &self.bus).await
    }

    pub fn subscribe(&self) -> StatusSubscription {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let mut inner = self.inner.lock().await;
        let encoder = match inner.encoder.as_mut() {
            Some(handle) => Some(self.capture.health_check(handle)),
            None => None,
        };
        OrchestratorStatus {
            device: inner.current_device.clone(),
            session: inner.session.as_ref().map(CastSession::state),
            stream: inner.active.clone(),
            encoder,
        }
    }

    pub async fn current_device(&self) -> Option<Device> {
        self.inner.lock().await.current_device.clone()
    }
}

async fn teardown(inner: &mut Inner, capture: &CaptureEncoder, bus: &StatusBus) -> Result<()> {
    if let Some(watchdog) = inner.watchdog.take() {
        watchdog.abort();
    }
    let was_streaming = inner.active.take().is_some();
    let mut failures = Vec::new();

    if let Some(mut session) = inner.session.take() {
        session.stop().await;
    }

    inner.server.stop().await;

    if let Some(mut handle) = inner.encoder.take() {
        if let Err(e) = capture.stop(&mut handle).await {
            error!("Failed to stop capture: {}", e);
            failures.push(format!("{}: {}", StartStage::Capture, e));
            inner.encoder = Some(handle);
        }
    }

    if was_streaming {
        info!("Stream stopped");
        bus.publish(StatusEvent::stopped());
    }

    if failures.is_empty() {
        Ok(())
    } else {
        warn!("Stop finished with {} failure(s)", failures.len());
        Err(CastError::StopFailed(failures))
    }
}

/// Tears the stream down once its session gives up on the receiver.
async fn watch_session(
    mut state: watch::Receiver<SessionState>,
    generation: u64,
    inner: Weak<Mutex<Inner>>,
    capture: Arc<CaptureEncoder>,
    bus: StatusBus,
) {
    let failed = state.wait_for(|s| s.is_terminal()).await.is_ok();
    let Some(inner) = inner.upgrade().filter(|_| failed) else {
        return;
    };

    let mut inner = inner.lock().await;
    if inner.generation != generation || inner.active.is_none() {
        return;
    }
    warn!("Cast session failed, stopping the stream");
    // our own handle; dropping it detaches this task
    inner.watchdog.take();
    if let Err(e) = teardown(&mut inner, &capture, &bus).await {
        error!("Teardown after session failure: {}", e);
    }
}

fn default_metadata() -> MediaMetadata {
    MediaMetadata {
        subtitle: hostname().map(|host| format!("Sharing from {}", host)),
        ..MediaMetadata::default()
    }
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is writable for buf.len() bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    (!name.is_empty()).then_some(name)
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|name| !name.is_empty())
}
