//! Gateway state machine
//!
//! Owns the externally observable lifecycle of the backend and decides when
//! it should be started or stopped. Driven by a fixed evaluation tick fed
//! with liveness snapshots, plus login attempts reported by the proxy.
//!
//! All state changes go through [`Gateway::transition`]; `starting` and
//! `stopping` are the only states with a side effect, each emitting one
//! lifecycle event on entry.

use crate::monitor::{LivenessSnapshot, Monitor};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Externally observable lifecycle of the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// No liveness information yet (before the first probe settles)
    Unknown,
    /// Target answers probes
    Active,
    /// Target does not answer probes and no start is in flight
    Inactive,
    /// A start was requested; waiting for the target to come up
    Starting,
    /// A stop was requested; waiting for the target to go down
    Stopping,
}

/// Event consumed by the external command layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The backend should be started
    Start,
    /// The backend should be stopped
    Stop,
}

/// Current state paired with when it was entered
#[derive(Debug, Clone, Copy)]
pub struct StateEntry {
    pub state: GatewayState,
    pub entered_at: Instant,
}

/// Most recently observed player count and when it last changed
#[derive(Debug, Clone, Copy)]
struct PlayerActivity {
    count: i32,
    changed_at: Instant,
}

pub struct Gateway {
    current: Mutex<StateEntry>,
    players: Mutex<PlayerActivity>,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    tick_interval: Duration,
    idle_timeout: Duration,
    transition_timeout: Duration,
}

impl Gateway {
    /// Create the state machine and the receiving end of its lifecycle
    /// events.
    ///
    /// Returns `Arc<Self>` because the gateway is shared between the tick
    /// loop and the connection handlers.
    pub fn new(
        tick_interval: Duration,
        idle_timeout: Duration,
        transition_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let gateway = Arc::new(Self {
            current: Mutex::new(StateEntry {
                state: GatewayState::Unknown,
                entered_at: now,
            }),
            players: Mutex::new(PlayerActivity {
                count: 0,
                changed_at: now,
            }),
            events_tx,
            tick_interval,
            idle_timeout,
            transition_timeout,
        });
        (gateway, events_rx)
    }

    pub fn state(&self) -> GatewayState {
        self.current.lock().state
    }

    pub fn current(&self) -> StateEntry {
        *self.current.lock()
    }

    /// The single mutation entrypoint. A no-op when the state is unchanged
    /// (unless forced), so side effects fire once per entry rather than on
    /// every tick.
    fn transition(&self, new: GatewayState, force: bool) {
        {
            let mut current = self.current.lock();
            if current.state == new && !force {
                return;
            }
            debug!(from = ?current.state, to = ?new, "State transition");
            *current = StateEntry {
                state: new,
                entered_at: Instant::now(),
            };
        }

        match new {
            GatewayState::Starting => {
                info!("Requesting backend start");
                let _ = self.events_tx.send(LifecycleEvent::Start);
            }
            GatewayState::Stopping => {
                info!("Requesting backend stop");
                let _ = self.events_tx.send(LifecycleEvent::Stop);
            }
            _ => {}
        }
    }

    fn set_state(&self, new: GatewayState) {
        self.transition(new, false);
    }

    /// A client attempted to log in while the backend is not confirmed
    /// alive. Idempotent while already starting.
    pub fn notify_login(&self) {
        if self.state() != GatewayState::Active {
            self.set_state(GatewayState::Starting);
        }
    }

    /// One evaluation pass over the given liveness snapshot
    pub fn tick(&self, snapshot: &LivenessSnapshot) {
        let now = Instant::now();

        // stuck-transition guards
        let current = self.current();
        match current.state {
            GatewayState::Stopping
                if now.duration_since(current.entered_at) >= self.transition_timeout =>
            {
                warn!("Backend stop unacknowledged, retrying");
                self.transition(GatewayState::Stopping, true);
            }
            GatewayState::Starting
                if now.duration_since(current.entered_at) >= self.transition_timeout =>
            {
                warn!("Backend start timed out, aborting");
                self.set_state(GatewayState::Inactive);
            }
            _ => {}
        }

        // follow liveness, keeping starting/stopping sticky against flicker
        let state = self.state();
        if snapshot.active && state != GatewayState::Stopping {
            self.set_state(GatewayState::Active);
        } else if !snapshot.active && state != GatewayState::Starting {
            self.set_state(GatewayState::Inactive);
        }

        // idle shutdown only applies to a confirmed-live backend
        let current = self.current();
        if current.state == GatewayState::Active {
            let online = snapshot
                .data
                .as_ref()
                .map(|data| data.players.online)
                .unwrap_or(0);

            let (count, changed_at) = {
                let mut players = self.players.lock();
                if online != players.count {
                    debug!(from = players.count, to = online, "Player count changed");
                    *players = PlayerActivity {
                        count: online,
                        changed_at: now,
                    };
                }
                (players.count, players.changed_at)
            };

            // the idle clock starts no earlier than entry into `active`
            let idle_since = changed_at.max(current.entered_at);
            if count == 0 && now.duration_since(idle_since) >= self.idle_timeout {
                info!(
                    idle_secs = self.idle_timeout.as_secs(),
                    "Backend empty past idle timeout"
                );
                self.set_state(GatewayState::Stopping);
            }
        }
    }

    /// Run the evaluation tick until shutdown is signalled
    pub async fn run(
        self: Arc<Self>,
        monitor: Arc<Monitor>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!(
            tick_ms = self.tick_interval.as_millis() as u64,
            "Gateway state machine started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {
                    self.tick(&monitor.snapshot());
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Gateway state machine shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PlayersInfo, StatusPayload};
    use tokio::time::advance;

    const IDLE: Duration = Duration::from_secs(300);
    const TRANSITION: Duration = Duration::from_secs(300);

    fn gateway() -> (Arc<Gateway>, mpsc::UnboundedReceiver<LifecycleEvent>) {
        Gateway::new(Duration::from_secs(1), IDLE, TRANSITION)
    }

    fn snapshot(active: bool, online: i32) -> LivenessSnapshot {
        LivenessSnapshot {
            active,
            data: active.then(|| StatusPayload {
                players: PlayersInfo {
                    max: 20,
                    online,
                    ..Default::default()
                },
                ..Default::default()
            }),
            observed_at: Instant::now(),
        }
    }

    fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) {
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_drives_active_and_inactive() {
        let (gateway, mut rx) = gateway();
        assert_eq!(gateway.state(), GatewayState::Unknown);

        gateway.tick(&snapshot(true, 0));
        assert_eq!(gateway.state(), GatewayState::Active);

        gateway.tick(&snapshot(false, 0));
        assert_eq!(gateway.state(), GatewayState::Inactive);

        // neither state emits lifecycle events
        assert_no_event(&mut rx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_triggers_starting_once() {
        let (gateway, mut rx) = gateway();
        gateway.tick(&snapshot(false, 0));
        assert_eq!(gateway.state(), GatewayState::Inactive);

        gateway.notify_login();
        assert_eq!(gateway.state(), GatewayState::Starting);
        assert_eq!(rx.try_recv(), Ok(LifecycleEvent::Start));

        // a second login while already starting is idempotent
        gateway.notify_login();
        assert_eq!(gateway.state(), GatewayState::Starting);
        assert_no_event(&mut rx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_while_active_is_ignored() {
        let (gateway, mut rx) = gateway();
        gateway.tick(&snapshot(true, 1));
        assert_eq!(gateway.state(), GatewayState::Active);

        gateway.notify_login();
        assert_eq!(gateway.state(), GatewayState::Active);
        assert_no_event(&mut rx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_is_sticky_against_dead_target() {
        let (gateway, mut rx) = gateway();
        gateway.notify_login();
        assert_eq!(rx.try_recv(), Ok(LifecycleEvent::Start));

        // target still down: stays starting instead of flapping to inactive
        for _ in 0..10 {
            gateway.tick(&snapshot(false, 0));
        }
        assert_eq!(gateway.state(), GatewayState::Starting);

        // target comes up: confirmed active
        gateway.tick(&snapshot(true, 0));
        assert_eq!(gateway.state(), GatewayState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_timeout_aborts_to_inactive() {
        let (gateway, mut rx) = gateway();
        gateway.notify_login();
        assert_eq!(rx.try_recv(), Ok(LifecycleEvent::Start));

        advance(TRANSITION).await;
        gateway.tick(&snapshot(false, 0));
        assert_eq!(gateway.state(), GatewayState::Inactive);
        // aborting a start never requests a stop
        assert_no_event(&mut rx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_timeout_retries_and_restarts_window() {
        let (gateway, mut rx) = gateway();

        // reach active with zero players, then idle out
        gateway.tick(&snapshot(true, 0));
        advance(IDLE).await;
        gateway.tick(&snapshot(true, 0));
        assert_eq!(gateway.state(), GatewayState::Stopping);
        assert_eq!(rx.try_recv(), Ok(LifecycleEvent::Stop));

        // target still answers; stopping is sticky against liveness
        gateway.tick(&snapshot(true, 0));
        assert_eq!(gateway.state(), GatewayState::Stopping);
        assert_no_event(&mut rx);

        // after the transition timeout the stop is re-issued
        advance(TRANSITION).await;
        let before_retry = gateway.current().entered_at;
        gateway.tick(&snapshot(true, 0));
        assert_eq!(gateway.state(), GatewayState::Stopping);
        assert_eq!(rx.try_recv(), Ok(LifecycleEvent::Stop));
        // the retry window restarts from the re-entry
        assert!(gateway.current().entered_at > before_retry);

        // once the target actually dies, stopping resolves to inactive
        gateway.tick(&snapshot(false, 0));
        assert_eq!(gateway.state(), GatewayState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_shutdown_after_continuous_zero_players() {
        let (gateway, mut rx) = gateway();
        gateway.tick(&snapshot(true, 0));
        assert_eq!(gateway.state(), GatewayState::Active);

        // not idle long enough yet
        advance(IDLE - Duration::from_secs(1)).await;
        gateway.tick(&snapshot(true, 0));
        assert_eq!(gateway.state(), GatewayState::Active);
        assert_no_event(&mut rx);

        advance(Duration::from_secs(1)).await;
        gateway.tick(&snapshot(true, 0));
        assert_eq!(gateway.state(), GatewayState::Stopping);
        assert_eq!(rx.try_recv(), Ok(LifecycleEvent::Stop));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_players_reset_idle_clock() {
        let (gateway, mut rx) = gateway();
        gateway.tick(&snapshot(true, 0));

        advance(IDLE - Duration::from_secs(1)).await;
        // someone joins just before the deadline
        gateway.tick(&snapshot(true, 1));
        assert_eq!(gateway.state(), GatewayState::Active);

        // they leave again; the clock restarts from the drop to zero
        advance(Duration::from_secs(30)).await;
        gateway.tick(&snapshot(true, 0));
        advance(IDLE - Duration::from_secs(1)).await;
        gateway.tick(&snapshot(true, 0));
        assert_eq!(gateway.state(), GatewayState::Active);
        assert_no_event(&mut rx);

        advance(Duration::from_secs(1)).await;
        gateway.tick(&snapshot(true, 0));
        assert_eq!(gateway.state(), GatewayState::Stopping);
        assert_eq!(rx.try_recv(), Ok(LifecycleEvent::Stop));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_clock_ignores_time_before_active() {
        let (gateway, mut rx) = gateway();

        // sit inactive well past the idle timeout
        gateway.tick(&snapshot(false, 0));
        advance(IDLE * 2).await;

        // becoming active must not immediately trigger a stop
        gateway.tick(&snapshot(true, 0));
        assert_eq!(gateway.state(), GatewayState::Active);
        assert_no_event(&mut rx);
    }
}
