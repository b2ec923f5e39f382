//! Backend liveness monitor
//!
//! Periodically probes the target with a status query and keeps the
//! last-known result. Has no knowledge of the gateway state machine; the
//! snapshot is its only output.

use crate::protocol::{self, StatusPayload};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The backend address the gateway fronts
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Last-known liveness of the target.
///
/// `data` holds the payload of the most recent successful probe and is never
/// cleared by a failure, so stale status can still be served while the
/// target is unreachable.
#[derive(Debug, Clone)]
pub struct LivenessSnapshot {
    pub active: bool,
    pub data: Option<StatusPayload>,
    pub observed_at: Instant,
}

/// Polls the target and maintains the current [`LivenessSnapshot`]
pub struct Monitor {
    target: Target,
    interval: Duration,
    timeout: Duration,
    snapshot: RwLock<LivenessSnapshot>,
}

impl Monitor {
    pub fn new(target: Target, interval: Duration, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            target,
            interval,
            timeout,
            snapshot: RwLock::new(LivenessSnapshot {
                active: false,
                data: None,
                observed_at: Instant::now(),
            }),
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The latest snapshot. Never blocks on a probe; always has a value.
    pub fn snapshot(&self) -> LivenessSnapshot {
        self.snapshot.read().clone()
    }

    /// Run the probe cycle until shutdown is signalled.
    ///
    /// The next cycle is scheduled only after the current probe settles, so
    /// probe latency adds to the cadence but probes never overlap.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(target = %self.target, interval_secs = self.interval.as_secs(), "Liveness monitor started");
        loop {
            self.probe_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Liveness monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Issue one bounded probe and replace the snapshot with the outcome.
    ///
    /// A timed-out probe is abandoned and counts as a failure for this
    /// cycle. Failures only flip `active`; they keep the previous payload.
    pub async fn probe_once(&self) {
        let result = tokio::time::timeout(
            self.timeout,
            protocol::probe_status(&self.target.host, self.target.port),
        )
        .await;

        let mut snapshot = self.snapshot.write();
        match result {
            Ok(Ok(payload)) => {
                debug!(target = %self.target, online = payload.players.online, "Target is alive");
                *snapshot = LivenessSnapshot {
                    active: true,
                    data: Some(payload),
                    observed_at: Instant::now(),
                };
            }
            Ok(Err(e)) => {
                debug!(target = %self.target, error = %e, "Target is not alive");
                let data = snapshot.data.take();
                *snapshot = LivenessSnapshot {
                    active: false,
                    data,
                    observed_at: Instant::now(),
                };
            }
            Err(_) => {
                warn!(target = %self.target, timeout_secs = self.timeout.as_secs(), "Target status probe timed out");
                let data = snapshot.data.take();
                *snapshot = LivenessSnapshot {
                    active: false,
                    data,
                    observed_at: Instant::now(),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_handshake, serve_status, StatusPayload};
    use tokio::net::TcpListener;

    /// Serve one status exchange per accepted connection until dropped
    async fn fake_backend(motd: &str, online: i32) -> (TcpListener, StatusPayload) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let payload = StatusPayload {
            description: serde_json::json!({ "text": motd }),
            players: crate::protocol::PlayersInfo {
                max: 20,
                online,
                ..Default::default()
            },
            ..Default::default()
        };
        (listener, payload)
    }

    fn spawn_backend(listener: TcpListener, payload: StatusPayload) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let payload = payload.clone();
                tokio::spawn(async move {
                    if read_handshake(&mut stream).await.is_ok() {
                        let _ = serve_status(&mut stream, &payload).await;
                    }
                });
            }
        })
    }

    #[tokio::test]
    async fn test_initial_snapshot_is_inactive_and_empty() {
        let monitor = Monitor::new(
            Target {
                host: "localhost".to_string(),
                port: 1,
            },
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let snapshot = monitor.snapshot();
        assert!(!snapshot.active);
        assert!(snapshot.data.is_none());
    }

    #[tokio::test]
    async fn test_probe_failure_keeps_previous_payload() {
        let (listener, payload) = fake_backend("up for now", 2).await;
        let port = listener.local_addr().expect("addr").port();
        let backend = spawn_backend(listener, payload);

        let monitor = Monitor::new(
            Target {
                host: "127.0.0.1".to_string(),
                port,
            },
            Duration::from_millis(50),
            Duration::from_secs(2),
        );

        monitor.probe_once().await;
        let snapshot = monitor.snapshot();
        assert!(snapshot.active);
        let data = snapshot.data.expect("payload cached");
        assert_eq!(data.description_text(), "up for now");
        assert_eq!(data.players.online, 2);

        // kill the backend; the next probe must flip active but retain data
        backend.abort();
        monitor.probe_once().await;
        let snapshot = monitor.snapshot();
        assert!(!snapshot.active);
        let data = snapshot.data.expect("payload retained after failure");
        assert_eq!(data.description_text(), "up for now");
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_failure() {
        // a listener that accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let monitor = Monitor::new(
            Target {
                host: "127.0.0.1".to_string(),
                port,
            },
            Duration::from_millis(50),
            Duration::from_millis(100),
        );

        monitor.probe_once().await;
        let snapshot = monitor.snapshot();
        assert!(!snapshot.active);
        assert!(snapshot.data.is_none());
    }
}
