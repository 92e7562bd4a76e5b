//! Waypoint daemon
//!
//! Loads the gateway configuration, starts the background workers and
//! serves the proxy and admin listeners until interrupted.

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use waypoint_api::{create_proxy_router, create_router};
use waypoint_core::{telemetry, GatewayConfig, LoggingConfig};
use waypoint_router::Gateway;

/// waypointd - request-routing core for an HTTP API gateway
#[derive(Parser, Debug)]
#[command(name = "waypointd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "waypoint.toml")]
    config: PathBuf,

    /// Log level, overrides the configured one
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_logging(&config.logging, args.log_level.as_deref());

    info!("Starting waypoint daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(
        services = config.services.len(),
        routes = config.routes.len(),
        "Configuration loaded"
    );

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            telemetry::describe_metrics();
            Some(handle)
        }
        Err(e) => {
            warn!(error = %e, "Metrics recorder not installed, /metrics disabled");
            None
        }
    };

    let gateway = Gateway::start(&config).await?;

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.address, config.server.port)
        .parse()
        .context("invalid server address")?;
    let admin_addr: SocketAddr = format!("{}:{}", config.admin.address, config.admin.port)
        .parse()
        .context("invalid admin address")?;

    let proxy_listener = TcpListener::bind(proxy_addr)
        .await
        .with_context(|| format!("binding proxy listener on {}", proxy_addr))?;
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("binding admin listener on {}", admin_addr))?;

    info!("Proxy listening on {}", proxy_addr);
    info!("Admin API listening on {}", admin_addr);

    let mut shutdown = ShutdownSignal::listen()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let proxy = axum::serve(
        proxy_listener,
        create_proxy_router(gateway.router().clone())
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(stopped(stop_rx.clone()));
    let admin = axum::serve(admin_listener, create_router(gateway.router().clone(), metrics))
        .with_graceful_shutdown(stopped(stop_rx));

    let proxy = tokio::spawn(async move { proxy.await });
    let admin = tokio::spawn(async move { admin.await });

    let signal = shutdown.recv().await?;
    info!(signal = signal, "Shutdown requested");
    let _ = stop_tx.send(true);

    for (name, server) in [("proxy", proxy), ("admin", admin)] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(listener = name, error = %e, "Server error"),
            Err(e) => error!(listener = name, error = %e, "Server task failed"),
        }
    }

    gateway.shutdown().await;
    info!("Waypoint daemon stopped");
    Ok(())
}

/// Ctrl-C, plus SIGTERM on unix
struct ShutdownSignal {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    /// Install the handlers. Signals that arrive afterwards are not lost.
    fn listen() -> anyhow::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("installing SIGTERM handler")?,
        })
    }

    /// Wait for the first signal and return its name
    async fn recv(&mut self) -> anyhow::Result<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("waiting for ctrl-c")?;
                    Ok("SIGINT")
                }
                _ = self.terminate.recv() => Ok("SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            Ok("ctrl-c")
        }
    }
}

/// Resolves once the shutdown flag flips
async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// `RUST_LOG` wins over the command line, which wins over the config file
fn init_logging(logging: &LoggingConfig, level: Option<&str>) {
    let level = level.unwrap_or(&logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let result = if logging.format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("failed to install log subscriber: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["waypointd"]);
        assert_eq!(args.config, PathBuf::from("waypoint.toml"));
        assert!(args.log_level.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_requests_shutdown() {
        let mut shutdown = ShutdownSignal::listen().unwrap();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let signal = tokio::time::timeout(Duration::from_secs(5), shutdown.recv())
            .await
            .expect("SIGTERM not observed")
            .unwrap();
        assert_eq!(signal, "SIGTERM");
    }

    #[tokio::test]
    async fn test_stopped_resolves_when_flag_flips() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(stopped(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
