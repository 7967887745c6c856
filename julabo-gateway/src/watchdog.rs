//! Device health monitoring and automatic reconnection.
//!
//! ```text
//!            check ok
//!          +---------+
//!          v         |
//!      Healthy ------+---- check failed ---> Unhealthy
//!          ^                                    |
//!          |                         close, mark offline
//!    reconnect ok                               v
//!          +------------------------ Reconnecting(attempt, backoff)
//!                                      |      ^
//!                         attempt == max|      | reconnect failed
//!                                      v      +---- backoff *= 2 (cap)
//!                                   GivenUp
//! ```
//!
//! While the device is offline the gateway answers every command except
//! `ping` with a "reconnecting" error instead of queueing on the lock.
//! `GivenUp` is terminal until the process restarts.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::server::registry::SharedDevice;
use crate::tracing::prelude::*;

/// Timing and retry limits.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogPolicy {
    /// Spacing between health checks while healthy.
    pub interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: u32,
    /// Failed reconnect attempts tolerated before giving up.
    pub max_retries: u32,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            backoff_factor: 2,
            max_retries: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Healthy,
    Unhealthy,
    /// Waiting `backoff` before reconnect attempt number `attempt`.
    Reconnecting { attempt: u32, backoff: Duration },
    GivenUp,
}

impl WatchdogState {
    /// Transition after a periodic health check.
    pub fn after_check(self, ok: bool) -> Self {
        match (self, ok) {
            (WatchdogState::Healthy, true) => WatchdogState::Healthy,
            (WatchdogState::Healthy, false) => WatchdogState::Unhealthy,
            (other, _) => other,
        }
    }

    /// Transition once the failed device has been closed.
    pub fn after_disconnect(self, policy: &WatchdogPolicy) -> Self {
        match self {
            WatchdogState::Unhealthy => WatchdogState::Reconnecting {
                attempt: 1,
                backoff: policy.initial_backoff,
            },
            other => other,
        }
    }

    /// Transition after a reconnect attempt.
    pub fn after_reconnect(self, ok: bool, policy: &WatchdogPolicy) -> Self {
        match self {
            WatchdogState::Reconnecting { .. } if ok => WatchdogState::Healthy,
            WatchdogState::Reconnecting { attempt, .. } if attempt >= policy.max_retries => {
                WatchdogState::GivenUp
            }
            WatchdogState::Reconnecting { attempt, backoff } => WatchdogState::Reconnecting {
                attempt: attempt + 1,
                backoff: (backoff * policy.backoff_factor).min(policy.max_backoff),
            },
            other => other,
        }
    }
}

/// Watches one device.
pub struct Watchdog {
    device: SharedDevice,
    policy: WatchdogPolicy,
    state_tx: watch::Sender<WatchdogState>,
}

impl Watchdog {
    pub fn new(device: SharedDevice, policy: WatchdogPolicy) -> Self {
        let (state_tx, _) = watch::channel(WatchdogState::Healthy);
        Self {
            device,
            policy,
            state_tx,
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WatchdogState> {
        self.state_tx.subscribe()
    }

    /// Run until cancelled.
    pub async fn run(self, running: CancellationToken) {
        let id = self.device.id().to_string();
        debug!(device = %id, "Watchdog started");
        let mut state = WatchdogState::Healthy;

        loop {
            state = match state {
                WatchdogState::Healthy => {
                    if !self.sleep(self.policy.interval, &running).await {
                        break;
                    }
                    let ok = self.check().await;
                    if !ok {
                        warn!(device = %id, "Watchdog detected failure, attempting reconnect");
                    }
                    state.after_check(ok)
                }
                WatchdogState::Unhealthy => {
                    self.device.set_online(false);
                    let mut chiller = self.device.chiller().lock().await;
                    if let Err(e) = chiller.close().await {
                        debug!(device = %id, error = %e, "Error closing failed device");
                    }
                    state.after_disconnect(&self.policy)
                }
                WatchdogState::Reconnecting { attempt, backoff } => {
                    if !self.sleep(backoff, &running).await {
                        break;
                    }
                    match self.reconnect().await {
                        Ok(identity) => {
                            self.device.set_online(true);
                            info!(device = %id, attempt, identity = %identity, "Watchdog reconnected");
                        }
                        Err(e) => {
                            debug!(
                                device = %id,
                                attempt,
                                backoff_secs = backoff.as_secs_f64(),
                                error = %e,
                                "Watchdog reconnect failed"
                            );
                        }
                    }
                    state.after_reconnect(self.device.is_online(), &self.policy)
                }
                WatchdogState::GivenUp => {
                    running.cancelled().await;
                    break;
                }
            };

            if state == WatchdogState::GivenUp {
                error!(
                    device = %id,
                    retries = self.policy.max_retries,
                    "Watchdog giving up; device stays offline until restart"
                );
            }
            self.state_tx.send_replace(state);
        }

        debug!(device = %id, "Watchdog stopped");
    }

    // False when cancelled during the sleep.
    async fn sleep(&self, duration: Duration, running: &CancellationToken) -> bool {
        tokio::select! {
            _ = running.cancelled() => false,
            _ = time::sleep(duration) => true,
        }
    }

    async fn check(&self) -> bool {
        let mut chiller = self.device.chiller().lock().await;
        chiller.status().await.is_ok()
    }

    async fn reconnect(&self) -> Result<String> {
        let mut chiller = self.device.chiller().lock().await;
        let result = async {
            chiller.connect().await?;
            chiller.identify().await
        }
        .await;
        if result.is_err() {
            // Next attempt must reopen from scratch.
            let _ = chiller.close().await;
        }
        result
    }
}
