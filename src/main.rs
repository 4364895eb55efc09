use anyhow::{Context, Result};
use clap::Parser;
use classroom_link::{create_router, AppState, Backends, Config, Device, ShutdownReason};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Classroom edge device: streams camera and microphone to the server and
/// plays back its replies
#[derive(Debug, Parser)]
#[command(name = "classroom-link", version)]
struct Cli {
    /// Configuration file (TOML, extension optional)
    #[arg(short, long, default_value = "config/classroom-link")]
    config: String,

    /// Run with built-in defaults when the configuration file is missing
    #[arg(long)]
    no_config: bool,

    /// Override the server host
    #[arg(long)]
    server: Option<String>,

    /// Override the device id
    #[arg(long)]
    device_id: Option<String>,

    /// Do not start the local HTTP control API
    #[arg(long)]
    no_http: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = (!cli.no_config).then_some(cli.config.as_str());
    let mut cfg = Config::load(config_path)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;
    if let Some(server) = cli.server {
        cfg.server.host = server;
    }
    if let Some(device_id) = cli.device_id {
        cfg.device.id = device_id;
    }
    if cli.no_http {
        cfg.http.enabled = false;
    }

    info!("classroom-link v{}", env!("CARGO_PKG_VERSION"));
    info!("Device id: {}", cfg.device.id);
    info!(
        "Server: {} (camera {}, audio {}, command {})",
        cfg.server.host, cfg.server.camera_port, cfg.server.audio_port, cfg.server.command_port
    );

    let http = cfg.http.clone();
    let device = Arc::new(Device::new(cfg.clone(), Backends::from_config(&cfg)));
    device.start().await;

    let http_stop = CancellationToken::new();
    let http_task = if http.enabled {
        let listener = TcpListener::bind(http.address())
            .await
            .with_context(|| format!("Failed to bind HTTP API to {}", http.address()))?;
        info!("HTTP API listening on {}", http.address());

        let app = create_router(AppState::new(Arc::clone(&device)));
        let stop = http_stop.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        }))
    } else {
        None
    };

    let outcome = tokio::select! {
        _ = interrupted(tokio::signal::ctrl_c()) => {
            info!("Interrupt received, shutting down");
            None
        }
        reason = device.shutdown_requested() => Some(reason),
    };

    http_stop.cancel();
    device.stop().await;

    if let Some(task) = http_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("HTTP API error: {}", e),
            Err(e) => error!("HTTP API task panicked: {}", e),
        }
    }

    match outcome {
        Some(ShutdownReason::Fatal { subsystem, error }) => {
            error!("{} failed: {}", subsystem, error);
            anyhow::bail!("{} unavailable: {}", subsystem, error)
        }
        Some(ShutdownReason::ServerRequested) => {
            info!("Stopped at the server's request");
            Ok(())
        }
        None => Ok(()),
    }
}

/// Resolves when `signal` fires; never resolves if the listener cannot be
/// installed
async fn interrupted<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!("Failed to listen for Ctrl-C: {}; waiting for the device to stop", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interrupt_fires_on_signal() {
        let signal = async { Ok::<(), std::io::Error>(()) };
        let fired = tokio::time::timeout(Duration::from_secs(1), interrupted(signal));
        assert!(fired.await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_signal_listener_never_interrupts() {
        let failing = async {
            Err::<(), _>(std::io::Error::new(
                std::io::ErrorKind::Other,
                "signal handler unavailable",
            ))
        };
        let fired = tokio::time::timeout(Duration::from_millis(50), interrupted(failing));
        assert!(fired.await.is_err());
    }
}
