//! Connection and playback state for one selected receiver.
//!
//! A session is single use. Once stopped or failed it rejects further
//! commands; start over with a new [`CastSession`].

mod monitor;
pub mod state;

pub use state::SessionState;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::events::{StatusBus, StatusEvent};
use crate::network::{CastChannel, CastConnector, LoadRequest};
use crate::{CastError, Device, MediaMetadata, Result};

use monitor::{activate, bounded, Monitor};

/// Timing and retry limits for a session.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub poll_interval: Duration,
    pub activation_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// Consecutive failed status polls tolerated before reconnecting.
    pub max_missed_polls: u32,
    pub command_timeout: Duration,
}

impl SessionPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            activation_timeout: Duration::from_secs(config.activation_timeout_secs),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            max_missed_polls: config.max_missed_polls,
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Current state, observable through [`CastSession::watch_state`].
pub(crate) struct StateCell(watch::Sender<SessionState>);

impl StateCell {
    fn new() -> Self {
        Self(watch::Sender::new(SessionState::Idle))
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.0.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.0.subscribe()
    }

    pub(crate) fn transition(&self, next: SessionState) -> Result<()> {
        let mut refused = None;
        self.0.send_if_modified(|state| {
            if !state.can_transition_to(next) {
                refused = Some(*state);
                return false;
            }
            debug!("Session {} -> {}", *state, next);
            *state = next;
            true
        });
        match refused {
            Some(from) => Err(CastError::InvalidTransition {
                from: from.to_string(),
                to: next.to_string(),
            }),
            None => Ok(()),
        }
    }
}

struct MonitorTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<Arc<dyn CastChannel>>,
}

pub struct CastSession {
    connector: Arc<dyn CastConnector>,
    policy: SessionPolicy,
    bus: StatusBus,
    state: Arc<StateCell>,
    device: Option<Device>,
    channel: Option<Arc<dyn CastChannel>>,
    monitor: Option<MonitorTask>,
    closed: bool,
}

impl CastSession {
    pub fn new(connector: Arc<dyn CastConnector>, policy: SessionPolicy, bus: StatusBus) -> Self {
        Self {
            connector,
            policy,
            bus,
            state: Arc::new(StateCell::new()),
            device: None,
            channel: None,
            monitor: None,
            closed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Follows every state change, including those made by the monitor.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.state().is_terminal()
    }

    /// Connect to `device` and wait until it accepts commands.
    pub async fn select(&mut self, device: &Device) -> Result<()> {
        if self.is_closed() {
            return Err(CastError::SessionClosed);
        }
        self.state.transition(SessionState::Connecting)?;

        match self.connector.connect(device).await {
            Ok(channel) => {
                info!("Selected {} ({})", device.display_name, device.id);
                self.device = Some(device.clone());
                self.channel = Some(channel);
                Ok(())
            }
            Err(e) => {
                warn!("Could not connect to {}: {}", device.display_name, e);
                self.state.transition(SessionState::Idle)?;
                Err(e)
            }
        }
    }

    /// Have the receiver pull `stream_url` as a live stream, then supervise
    /// it in the background.
    pub async fn play(&mut self, stream_url: &str, metadata: MediaMetadata) -> Result<()> {
        if self.is_closed() {
            return Err(CastError::SessionClosed);
        }
        let (Some(channel), Some(device)) = (self.channel.clone(), self.device.clone()) else {
            return Err(CastError::NoDeviceSelected);
        };
        if self.state() != SessionState::Connecting {
            return Err(CastError::InvalidTransition {
                from: self.state().to_string(),
                to: SessionState::Streaming.to_string(),
            });
        }

        let request = LoadRequest::live(stream_url, metadata);
        if let Err(e) = activate(&channel, &request, &self.policy).await {
            warn!("Playback on {} did not start: {}", device.display_name, e);
            self.state.transition(SessionState::Failed)?;
            channel.close().await;
            self.channel = None;
            return Err(e);
        }

        self.state.transition(SessionState::Streaming)?;
        info!("{} is playing {}", device.display_name, stream_url);
        self.bus.publish(StatusEvent::streaming(stream_url));

        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = Monitor {
            channel,
            connector: self.connector.clone(),
            device,
            request,
            policy: self.policy.clone(),
            bus: self.bus.clone(),
            state: self.state.clone(),
        };
        self.monitor = Some(MonitorTask {
            stop: stop_tx,
            task: tokio::spawn(monitor.run(stop_rx)),
        });
        Ok(())
    }

    /// Stop remote playback and close the session. Failures talking to the
    /// receiver are logged only. Safe to call any number of times.
    pub async fn stop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let stopping = self.state.transition(SessionState::Stopping).is_ok();

        let mut channel = self.channel.take();
        if let Some(MonitorTask { stop, mut task }) = self.monitor.take() {
            let _ = stop.send(true);
            let limit = self.policy.poll_interval + self.policy.command_timeout;
            match time::timeout(limit, &mut task).await {
                Ok(Ok(live)) => channel = Some(live),
                Ok(Err(e)) => warn!("Session monitor ended abnormally: {}", e),
                Err(_) => {
                    warn!("Session monitor did not exit within {:?}, aborting", limit);
                    task.abort();
                }
            }
        }

        if let Some(channel) = channel {
            if stopping {
                if let Err(e) = bounded(self.policy.command_timeout, channel.stop_playback()).await {
                    warn!("Failed to stop playback on receiver: {}", e);
                }
            }
            channel.close().await;
        }

        if stopping {
            let _ = self.state.transition(SessionState::Idle);
        }
        if let Some(device) = &self.device {
            info!("Session with {} closed ({})", device.display_name, self.state());
        }
    }
}

impl Drop for CastSession {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.stop.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StatusKind;
    use crate::network::RemotePlayerState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Receiver {
        offline: AtomicBool,
        never_activate: AtomicBool,
        playing: AtomicBool,
        loads: AtomicUsize,
        stops: AtomicUsize,
        idle_polls_after_load: AtomicUsize,
    }

    struct FakeChannel(Arc<Receiver>);

    #[async_trait]
    impl CastChannel for FakeChannel {
        async fn load(&self, _request: &LoadRequest) -> Result<()> {
            if self.0.offline.load(Ordering::SeqCst) {
                return Err(CastError::Connect("offline".into()));
            }
            self.0.loads.fetch_add(1, Ordering::SeqCst);
            if !self.0.never_activate.load(Ordering::SeqCst) {
                self.0.playing.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn player_state(&self) -> Result<RemotePlayerState> {
            if self.0.offline.load(Ordering::SeqCst) {
                return Err(CastError::Connect("offline".into()));
            }
            if self.0.playing.load(Ordering::SeqCst) {
                Ok(RemotePlayerState::Playing)
            } else {
                Ok(RemotePlayerState::Idle)
            }
        }

        async fn stop_playback(&self) -> Result<()> {
            self.0.stops.fetch_add(1, Ordering::SeqCst);
            self.0.playing.store(false, Ordering::SeqCst);
            if self.0.offline.load(Ordering::SeqCst) {
                return Err(CastError::Connect("offline".into()));
            }
            Ok(())
        }

        async fn close(&self) {}
    }

    struct FakeConnector(Arc<Receiver>);

    #[async_trait]
    impl CastConnector for FakeConnector {
        async fn connect(&self, device: &Device) -> Result<Arc<dyn CastChannel>> {
            if self.0.offline.load(Ordering::SeqCst) {
                return Err(CastError::Connect(format!("{} unreachable", device.display_name)));
            }
            Ok(Arc::new(FakeChannel(self.0.clone())))
        }
    }

    fn device() -> Device {
        Device {
            id: "tv".into(),
            display_name: "Living Room TV".into(),
            model_name: "Chromecast".into(),
            address: "192.168.1.20".parse().unwrap(),
            port: 8009,
            manufacturer: "Google Inc.".into(),
        }
    }

    fn fast_policy() -> SessionPolicy {
        SessionPolicy {
            poll_interval: Duration::from_millis(20),
            activation_timeout: Duration::from_millis(200),
            max_reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(10),
            max_missed_polls: 2,
            command_timeout: Duration::from_millis(200),
        }
    }

    fn session(receiver: &Arc<Receiver>, bus: &StatusBus) -> CastSession {
        CastSession::new(Arc::new(FakeConnector(receiver.clone())), fast_policy(), bus.clone())
    }

    async fn next_kind(sub: &mut crate::StatusSubscription) -> StatusKind {
        time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("no status event")
            .expect("bus closed")
            .kind
    }

    #[tokio::test]
    async fn select_unreachable_device_is_connect_error() {
        let receiver = Arc::new(Receiver::default());
        receiver.offline.store(true, Ordering::SeqCst);
        let mut session = session(&receiver, &StatusBus::new());

        let err = session.select(&device()).await.unwrap_err();
        assert!(matches!(err, CastError::Connect(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.device().is_none());
    }

    #[tokio::test]
    async fn play_without_select_is_rejected() {
        let receiver = Arc::new(Receiver::default());
        let mut session = session(&receiver, &StatusBus::new());
        let err = session.play("http://x/stream.m3u8", MediaMetadata::default()).await.unwrap_err();
        assert!(matches!(err, CastError::NoDeviceSelected));
    }

    #[tokio::test]
    async fn activation_timeout_fails_the_session() {
        let receiver = Arc::new(Receiver::default());
        receiver.never_activate.store(true, Ordering::SeqCst);
        let mut session = session(&receiver, &StatusBus::new());

        session.select(&device()).await.unwrap();
        let err = session.play("http://x/stream.m3u8", MediaMetadata::default()).await.unwrap_err();
        assert!(matches!(err, CastError::ActivationTimeout(_)), "{}", err);
        assert_eq!(session.state(), SessionState::Failed);

        let again = session.select(&device()).await.unwrap_err();
        assert!(matches!(again, CastError::SessionClosed));
    }

    #[tokio::test]
    async fn idle_receiver_is_replayed_once() {
        let receiver = Arc::new(Receiver::default());
        let bus = StatusBus::new();
        let mut sub = bus.subscribe();
        let mut session = session(&receiver, &bus);

        session.select(&device()).await.unwrap();
        session.play("http://x/stream.m3u8", MediaMetadata::default()).await.unwrap();
        assert!(matches!(next_kind(&mut sub).await, StatusKind::Streaming { .. }));

        receiver.playing.store(false, Ordering::SeqCst);

        assert!(matches!(
            next_kind(&mut sub).await,
            StatusKind::Reconnecting { attempt: 1, .. }
        ));
        assert!(matches!(next_kind(&mut sub).await, StatusKind::Streaming { .. }));
        assert_eq!(receiver.loads.load(Ordering::SeqCst), 2);
        assert_eq!(session.state(), SessionState::Streaming);

        session.stop().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(receiver.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn offline_device_goes_reconnecting_then_failed() {
        let receiver = Arc::new(Receiver::default());
        let bus = StatusBus::new();
        let mut sub = bus.subscribe();
        let mut session = session(&receiver, &bus);
        let mut watched = session.watch_state();

        session.select(&device()).await.unwrap();
        session.play("http://x/stream.m3u8", MediaMetadata::default()).await.unwrap();
        assert!(matches!(next_kind(&mut sub).await, StatusKind::Streaming { .. }));

        receiver.offline.store(true, Ordering::SeqCst);
        let failed = time::timeout(Duration::from_secs(2), watched.wait_for(|s| s.is_terminal()))
            .await
            .expect("session never failed")
            .map(|state| *state);
        assert_eq!(failed.unwrap(), SessionState::Failed);

        assert!(matches!(
            next_kind(&mut sub).await,
            StatusKind::Reconnecting { attempt: 1, .. }
        ));
        assert!(matches!(
            next_kind(&mut sub).await,
            StatusKind::Reconnecting { attempt: 2, .. }
        ));
        assert!(matches!(next_kind(&mut sub).await, StatusKind::Failed { .. }));
        assert_eq!(session.state(), SessionState::Failed);

        session.stop().await;
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn device_coming_back_resumes_streaming() {
        let receiver = Arc::new(Receiver::default());
        let bus = StatusBus::new();
        let mut sub = bus.subscribe();
        let mut session = CastSession::new(
            Arc::new(FakeConnector(receiver.clone())),
            SessionPolicy {
                reconnect_delay: Duration::from_millis(100),
                ..fast_policy()
            },
            bus.clone(),
        );

        session.select(&device()).await.unwrap();
        session.play("http://x/stream.m3u8", MediaMetadata::default()).await.unwrap();
        assert!(matches!(next_kind(&mut sub).await, StatusKind::Streaming { .. }));

        receiver.offline.store(true, Ordering::SeqCst);
        assert!(matches!(next_kind(&mut sub).await, StatusKind::Reconnecting { .. }));
        receiver.offline.store(false, Ordering::SeqCst);

        assert!(matches!(next_kind(&mut sub).await, StatusKind::Streaming { .. }));
        assert_eq!(session.state(), SessionState::Streaming);
        session.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_the_session() {
        let receiver = Arc::new(Receiver::default());
        let mut never_used = session(&receiver, &StatusBus::new());
        never_used.stop().await;
        never_used.stop().await;
        assert_eq!(never_used.state(), SessionState::Idle);

        let mut session = session(&receiver, &StatusBus::new());
        session.select(&device()).await.unwrap();
        session.play("http://x/stream.m3u8", MediaMetadata::default()).await.unwrap();

        session.stop().await;
        session.stop().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(receiver.stops.load(Ordering::SeqCst), 1);

        let err = session.select(&device()).await.unwrap_err();
        assert!(matches!(err, CastError::SessionClosed));
    }

    #[tokio::test]
    async fn stop_while_offline_still_reaches_idle() {
        let receiver = Arc::new(Receiver::default());
        let mut session = CastSession::new(
            Arc::new(FakeConnector(receiver.clone())),
            SessionPolicy {
                max_missed_polls: 100,
                ..fast_policy()
            },
            StatusBus::new(),
        );
        session.select(&device()).await.unwrap();
        session.play("http://x/stream.m3u8", MediaMetadata::default()).await.unwrap();

        receiver.offline.store(true, Ordering::SeqCst);
        session.stop().await;
        assert!(matches!(session.state(), SessionState::Idle | SessionState::Failed));
    }
}
