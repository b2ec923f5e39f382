//! External command execution for lifecycle events
//!
//! Consumes the gateway's lifecycle events and runs the configured shell
//! commands. Command failure is logged and otherwise ignored: liveness
//! probes are the only feedback loop, and the state machine retries a
//! failed stop on its own.

use crate::config::CommandsConfig;
use crate::gateway::LifecycleEvent;
use anyhow::Context;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub struct CommandRunner {
    commands: CommandsConfig,
}

impl CommandRunner {
    pub fn new(commands: CommandsConfig) -> Self {
        Self { commands }
    }

    /// Consume lifecycle events until the channel closes or shutdown is
    /// signalled
    pub async fn run(
        self,
        mut events_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => self.handle(event).await,
                        None => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Command runner shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&self, event: LifecycleEvent) {
        let (name, command) = match event {
            LifecycleEvent::Start => ("start", &self.commands.start),
            LifecycleEvent::Stop => ("stop", &self.commands.stop),
        };
        let Some(command) = command else {
            warn!(command = name, "No command configured, skipping");
            return;
        };
        if let Err(e) = execute(name, command).await {
            error!(command = name, error = %e, "Command failed");
        }
    }
}

/// Run one shell command to completion, logging its output
async fn execute(name: &str, line: &str) -> anyhow::Result<()> {
    let words = shell_words::split(line)
        .with_context(|| format!("Failed to parse {} command: {}", name, line))?;
    let (program, args) = words
        .split_first()
        .with_context(|| format!("Empty {} command", name))?;

    info!(command = name, line, "Executing command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run {} command", name))?;

    if !output.status.success() {
        anyhow::bail!(
            "{} command exited with {}: {}",
            name,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    debug!(
        command = name,
        stdout = %String::from_utf8_lossy(&output.stdout).trim(),
        "Command finished"
    );
    Ok(())
}
