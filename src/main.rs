use idlegate::command::CommandRunner;
use idlegate::config::Config;
use idlegate::gateway::Gateway;
use idlegate::monitor::{Monitor, Target};
use idlegate::proxy::GatewayServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("idlegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = Monitor::new(
        Target {
            host: config.target.host.clone(),
            port: config.target.port,
        },
        config.timing.probe_interval(),
        config.timing.probe_timeout(),
    );

    let (gateway, events_rx) = Gateway::new(
        config.timing.tick_interval(),
        config.timing.idle_timeout(),
        config.timing.transition_timeout(),
    );

    let server = GatewayServer::bind(
        config.server.listen_addr()?,
        Arc::clone(&monitor),
        Arc::clone(&gateway),
    )
    .await?;

    let monitor_handle = tokio::spawn(Arc::clone(&monitor).run(shutdown_rx.clone()));
    let gateway_handle = tokio::spawn(gateway.run(Arc::clone(&monitor), shutdown_rx.clone()));

    let runner = CommandRunner::new(config.commands.clone());
    let runner_handle = tokio::spawn(runner.run(events_rx, shutdown_rx.clone()));

    let server_shutdown_rx = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(server_shutdown_rx).await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and wait for tasks to stop (with timeout)
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = monitor_handle.await;
        let _ = gateway_handle.await;
        let _ = runner_handle.await;
        let _ = server_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting gateway"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        target_host = %config.target.host,
        target_port = config.target.port,
        "Gateway configuration"
    );
    info!(
        probe_interval_secs = config.timing.probe_interval_secs,
        probe_timeout_secs = config.timing.probe_timeout_secs,
        tick_interval_ms = config.timing.tick_interval_ms,
        idle_timeout_secs = config.timing.idle_timeout_secs,
        transition_timeout_secs = config.timing.transition_timeout_secs,
        "Timing configuration"
    );
    info!(
        start_command = config.commands.start.is_some(),
        stop_command = config.commands.stop.is_some(),
        "Lifecycle commands"
    );
}
