//! Keepalive probing for registered connections.
//!
//! Each registered connection gets one probe: a task that queues a `ping`
//! envelope every interval while the connection is open. The probe never
//! decides a connection is dead; close and error events from the transport
//! do that.

use crate::peer::PeerHandle;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_protocol::{codec, Envelope};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, trace};

/// Default probe interval.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest interval a probe will tick at.
pub const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(1);

/// Liveness of a registered connection as seen in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    /// The connection's queue is still being read.
    Live,
    /// The transport is gone but the record has not been removed yet.
    Stale,
}

impl LivenessState {
    /// Derive the state from a peer handle.
    #[must_use]
    pub fn of(peer: &PeerHandle) -> Self {
        if peer.is_open() {
            LivenessState::Live
        } else {
            LivenessState::Stale
        }
    }
}

/// A running keepalive task. Aborted on [`stop`](Self::stop) or drop.
#[derive(Debug)]
pub struct LivenessProbe {
    task: Option<JoinHandle<()>>,
    pings_sent: Arc<AtomicU64>,
}

impl LivenessProbe {
    /// Start probing `peer` every `interval`. The first ping goes out one
    /// interval after the call. Intervals below [`MIN_PROBE_INTERVAL`] are
    /// raised to it.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(peer: PeerHandle, interval: Duration) -> Self {
        let interval = interval.max(MIN_PROBE_INTERVAL);
        let pings_sent = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&pings_sent);

        let task = tokio::spawn(async move {
            // Encode once; the ping never changes.
            let ping: Arc<str> = match codec::encode(&Envelope::ping()) {
                Ok(text) => text.into(),
                Err(e) => {
                    error!(connection = %peer.id(), error = %e, "Failed to encode ping");
                    return;
                }
            };

            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !peer.is_open() {
                    trace!(connection = %peer.id(), "Skipping ping, connection not open");
                    continue;
                }
                if peer.send_text(Arc::clone(&ping)).is_ok() {
                    counter.fetch_add(1, Ordering::Relaxed);
                    trace!(connection = %peer.id(), "Sent ping");
                }
            }
        });

        Self {
            task: Some(task),
            pings_sent,
        }
    }

    /// Stop the probe. Calling it again does nothing.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Liveness probe stopped");
        }
    }

    /// Check if the probe task is still scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Number of pings queued so far.
    #[must_use]
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::Relaxed)
    }
}

impl Drop for LivenessProbe {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_probe_pings_on_interval() {
        let (peer, mut rx) = PeerHandle::open();
        let probe = LivenessProbe::spawn(peer, Duration::from_secs(30));

        time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(&*rx.try_recv().unwrap(), r#"{"type":"ping"}"#);

        time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_ok());
        assert_eq!(probe.pings_sent(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_silences_probe() {
        let (peer, mut rx) = PeerHandle::open();
        let mut probe = LivenessProbe::spawn(peer, Duration::from_secs(30));
        assert!(probe.is_running());

        probe.stop();
        probe.stop();
        assert!(!probe.is_running());

        time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(probe.pings_sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_probe() {
        let (peer, mut rx) = PeerHandle::open();
        drop(LivenessProbe::spawn(peer, Duration::from_secs(1)));

        time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let (peer, mut rx) = PeerHandle::open();
        let probe = LivenessProbe::spawn(peer, Duration::ZERO);

        time::sleep(Duration::from_millis(5)).await;
        assert!(probe.is_running());
        assert!(probe.pings_sent() >= 1);
        assert_eq!(&*rx.try_recv().unwrap(), r#"{"type":"ping"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_peer_is_skipped() {
        let (peer, rx) = PeerHandle::open();
        let probe = LivenessProbe::spawn(peer.clone(), Duration::from_secs(5));
        drop(rx);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.pings_sent(), 0);
        assert_eq!(LivenessState::of(&peer), LivenessState::Stale);
        assert!(probe.is_running());
    }
}
