//! Connection interceptor and splicer
//!
//! Accepts inbound connections on the listen port. While the target is not
//! confirmed alive, connections stay protocol-aware: status queries get a
//! synthetic payload for the current gateway state and login attempts are
//! disconnected after requesting a start. Once the target is alive, the
//! client socket is handed to a raw bidirectional splice and never decoded
//! again.

use crate::gateway::{Gateway, GatewayState, StateEntry};
use crate::monitor::{LivenessSnapshot, Monitor, Target};
use crate::protocol::{self, NextState, ProtocolError, StatusPayload};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Disconnect reason sent to a client whose login triggered a start
pub const LOGIN_DISCONNECT_MESSAGE: &str = "Starting the server. Please reconnect once it's up";

/// Known-bad protocol version for synthetic status, so clients render the
/// version name as text instead of trying to join
const SYNTHETIC_PROTOCOL_VERSION: i32 = 1;

/// The public-facing listener
pub struct GatewayServer {
    listener: TcpListener,
    monitor: Arc<Monitor>,
    gateway: Arc<Gateway>,
}

impl GatewayServer {
    pub async fn bind(
        addr: SocketAddr,
        monitor: Arc<Monitor>,
        gateway: Arc<Gateway>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Gateway listening");
        Ok(Self {
            listener,
            monitor,
            gateway,
        })
    }

    /// The bound address (useful when binding port 0)
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let monitor = Arc::clone(&self.monitor);
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                handle_client(stream, addr, monitor, gateway).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway listener shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    monitor: Arc<Monitor>,
    gateway: Arc<Gateway>,
) {
    debug!(addr = %addr, "Connection accepted");

    // admission decision: a live target gets a raw splice, everything else
    // stays protocol-aware
    if monitor.snapshot().active {
        splice(stream, addr, monitor.target().clone()).await;
        return;
    }

    if let Err(e) = intercept(stream, addr, &gateway, &monitor).await {
        debug!(addr = %addr, error = %e, "Intercepted connection ended with error");
    }
}

/// Cross-wire raw bytes between the client and a fresh target connection.
/// From here on the connection is never interpreted; closing either side
/// tears down both.
async fn splice(mut client: TcpStream, addr: SocketAddr, target: Target) {
    let mut backend = match TcpStream::connect((target.host.as_str(), target.port)).await {
        Ok(stream) => stream,
        Err(e) => {
            // the target died inside the snapshot race window; drop the
            // client cleanly instead of leaving it half-open
            error!(addr = %addr, target = %target, error = %e, "Failed to connect to target, closing client");
            return;
        }
    };

    debug!(addr = %addr, target = %target, "Splicing client to target");
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((client_to_target, target_to_client)) => {
            debug!(
                addr = %addr,
                client_to_target,
                target_to_client,
                "Spliced connection closed"
            );
        }
        Err(e) => {
            debug!(addr = %addr, error = %e, "Spliced connection closed with error");
        }
    }
}

/// Handle a connection at the protocol level while the target is down
async fn intercept(
    mut stream: TcpStream,
    addr: SocketAddr,
    gateway: &Gateway,
    monitor: &Monitor,
) -> Result<(), ProtocolError> {
    let handshake = protocol::read_handshake(&mut stream).await?;
    match handshake.next_state {
        NextState::Status => {
            let status = synthesize_status(gateway.current(), &monitor.snapshot());
            protocol::serve_status(&mut stream, &status).await
        }
        NextState::Login => {
            let username = protocol::read_login_start(&mut stream).await?;
            info!(addr = %addr, username, "Login while target not confirmed alive, requesting start");
            gateway.notify_login();
            protocol::write_login_disconnect(&mut stream, LOGIN_DISCONNECT_MESSAGE).await
        }
    }
}

/// Build the status payload served for the current gateway state
fn synthesize_status(entry: StateEntry, snapshot: &LivenessSnapshot) -> StatusPayload {
    // race window between the admission check and here: if the machine says
    // active and a real payload exists, answer with it verbatim
    if entry.state == GatewayState::Active {
        if let Some(data) = &snapshot.data {
            return data.clone();
        }
    }

    let elapsed = entry.entered_at.elapsed().as_secs();
    let (text, version_name) = match entry.state {
        GatewayState::Starting => (
            format!("Please wait while the server starts ({elapsed}s)"),
            "Booting up",
        ),
        GatewayState::Stopping => (
            format!("Please wait while the server shuts down ({elapsed}s)"),
            "Shutting down",
        ),
        GatewayState::Inactive => ("Server inactive. Connect to start".to_string(), "Inactive"),
        GatewayState::Unknown | GatewayState::Active => {
            ("Unknown status. Please wait".to_string(), "Unknown")
        }
    };

    let mut status = StatusPayload {
        description: serde_json::json!({ "text": text }),
        ..Default::default()
    };
    status.version.name = version_name.to_string();
    status.version.protocol = SYNTHETIC_PROTOCOL_VERSION;
    status.players.max = 0;
    status.players.online = 0;
    // keep the server icon the target last showed
    status.favicon = snapshot.data.as_ref().and_then(|data| data.favicon.clone());
    status
}
