//! Background supervision of a playing receiver.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{SessionPolicy, SessionState, StateCell};
use crate::events::{StatusBus, StatusEvent};
use crate::network::{CastChannel, CastConnector, LoadRequest};
use crate::{CastError, Device, Result};

enum Fault {
    Idle,
    Disconnected(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Idle => write!(f, "receiver stopped playing"),
            Fault::Disconnected(reason) => write!(f, "{}", reason),
        }
    }
}

enum Recovery {
    Resumed,
    Stopped,
    Failed,
}

pub(super) struct Monitor {
    pub channel: Arc<dyn CastChannel>,
    pub connector: Arc<dyn CastConnector>,
    pub device: Device,
    pub request: LoadRequest,
    pub policy: SessionPolicy,
    pub bus: StatusBus,
    pub state: Arc<StateCell>,
}

impl Monitor {
    /// Poll until stopped or failed. Hands back the channel that was live at
    /// exit so the caller can stop playback on it.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Arc<dyn CastChannel> {
        let mut missed = 0u32;
        let mut ticker = time::interval(self.policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = ticker.tick() => {}
            }

            let polled = or_stop(
                &mut stop,
                bounded(self.policy.command_timeout, self.channel.player_state()),
            )
            .await;

            let fault = match polled {
                None => break,
                Some(Ok(state)) if state.is_active() => {
                    missed = 0;
                    continue;
                }
                Some(Ok(_)) => Fault::Idle,
                Some(Err(CastError::Connect(reason))) => Fault::Disconnected(reason),
                Some(Err(e)) => {
                    missed += 1;
                    debug!("Status poll failed ({} in a row): {}", missed, e);
                    if missed < self.policy.max_missed_polls.max(1) {
                        continue;
                    }
                    Fault::Disconnected(format!("{} status polls failed, last: {}", missed, e))
                }
            };
            missed = 0;

            match self.recover(fault, &mut stop).await {
                Recovery::Resumed => ticker.reset(),
                Recovery::Stopped | Recovery::Failed => break,
            }
        }

        debug!("Monitor for {} exiting", self.device.display_name);
        self.channel
    }

    /// One reconnect episode: a single replay if the receiver merely went
    /// idle, then up to `max_reconnect_attempts` fresh connections.
    async fn recover(&mut self, fault: Fault, stop: &mut watch::Receiver<bool>) -> Recovery {
        if self.state.transition(SessionState::Reconnecting).is_err() {
            return Recovery::Stopped;
        }
        warn!("Cast session degraded: {}", fault);

        let mut attempt = 0u32;
        let mut reason = fault.to_string();

        if let Fault::Idle = fault {
            attempt += 1;
            self.bus.publish(StatusEvent::reconnecting(attempt, reason.clone()));
            info!("Replaying {} on {}", self.request.url, self.device.display_name);
            match or_stop(stop, activate(&self.channel, &self.request, &self.policy)).await {
                None => return Recovery::Stopped,
                Some(Ok(())) => return self.resumed(),
                Some(Err(e)) => {
                    warn!("Replay failed: {}", e);
                    reason = e.to_string();
                }
            }
        }

        for _ in 0..self.policy.max_reconnect_attempts {
            attempt += 1;
            self.bus.publish(StatusEvent::reconnecting(attempt, reason.clone()));

            if or_stop(stop, time::sleep(self.policy.reconnect_delay)).await.is_none() {
                return Recovery::Stopped;
            }

            match or_stop(stop, self.reconnect()).await {
                None => return Recovery::Stopped,
                Some(Ok(channel)) => {
                    self.channel = channel;
                    return self.resumed();
                }
                Some(Err(e)) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    reason = e.to_string();
                }
            }
        }

        if self.state.transition(SessionState::Failed).is_ok() {
            error!(
                "Giving up on {} after {} attempt(s): {}",
                self.device.display_name, attempt, reason
            );
            self.bus.publish(StatusEvent::failed(reason));
        }
        Recovery::Failed
    }

    async fn reconnect(&self) -> Result<Arc<dyn CastChannel>> {
        self.channel.close().await;
        let channel = self.connector.connect(&self.device).await?;
        if let Err(e) = activate(&channel, &self.request, &self.policy).await {
            channel.close().await;
            return Err(e);
        }
        Ok(channel)
    }

    fn resumed(&self) -> Recovery {
        if self.state.transition(SessionState::Streaming).is_err() {
            return Recovery::Stopped;
        }
        info!("Playback resumed on {}", self.device.display_name);
        self.bus.publish(StatusEvent::streaming(self.request.url.clone()));
        Recovery::Resumed
    }
}

/// Load `request` and wait, within the activation timeout, for the receiver
/// to report an active player.
pub(super) async fn activate(
    channel: &Arc<dyn CastChannel>,
    request: &LoadRequest,
    policy: &SessionPolicy,
) -> Result<()> {
    let attempt = async {
        bounded(policy.command_timeout, channel.load(request)).await?;
        loop {
            match bounded(policy.command_timeout, channel.player_state()).await {
                Ok(state) if state.is_active() => return Ok(()),
                Ok(state) => debug!("Waiting for activation, receiver is {:?}", state),
                Err(CastError::Connect(reason)) => return Err(CastError::Connect(reason)),
                Err(e) => debug!("Status poll during activation failed: {}", e),
            }
            time::sleep(policy.poll_interval).await;
        }
    };

    match time::timeout(policy.activation_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(CastError::ActivationTimeout(policy.activation_timeout)),
    }
}

pub(super) async fn bounded<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CastError::Playback(format!("No reply from receiver within {:?}", limit))),
    }
}

/// Resolves once a stop has been requested or the session is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn or_stop<F: Future>(stop: &mut watch::Receiver<bool>, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = stopped(stop) => None,
        out = work => Some(out),
    }
}
