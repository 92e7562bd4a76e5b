//! Waypoint CLI
//!
//! Command-line client for the gateway's admin API.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use waypoint_core::LoadBalanceStrategy;

/// waypoint - inspect and steer a running gateway
#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Admin API address
    #[arg(long, default_value = "http://127.0.0.1:9090", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List services
    Services {
        /// Only services in this domain
        #[arg(long)]
        domain: Option<String>,

        /// Only services of this type
        #[arg(long = "type")]
        kind: Option<String>,
    },

    /// Show one service and its endpoints
    Service {
        name: String,
    },

    /// Register or update an endpoint
    Register {
        service: String,
        host: String,
        port: u16,

        #[arg(long, default_value_t = 1)]
        weight: u32,

        /// Active requests above which the endpoint is skipped
        #[arg(long, default_value_t = 1024)]
        max_connections: u32,

        #[arg(long)]
        tls: bool,

        /// Load-balancing strategy for the service
        #[arg(long, value_parser = commands::parse_strategy)]
        strategy: Option<LoadBalanceStrategy>,

        #[arg(long)]
        domain: Option<String>,

        #[arg(long = "type")]
        kind: Option<String>,
    },

    /// Remove an endpoint, or the whole service when no endpoint is given
    Deregister {
        service: String,
        host: Option<String>,
        port: Option<u16>,
    },

    /// Change an endpoint's weight
    Weight {
        service: String,
        host: String,
        port: u16,
        weight: u32,
    },

    /// Mark an endpoint healthy or unhealthy
    Health {
        service: String,
        host: String,
        port: u16,

        #[arg(action = clap::ArgAction::Set)]
        healthy: bool,
    },

    /// Show routing statistics
    Stats,

    /// Show or replace the route table
    Routes {
        /// JSON array or TOML file with `[[routes]]` to install
        #[arg(long)]
        apply: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::AdminClient::new(&cli.api)?;

    match cli.command {
        Commands::Services { domain, kind } => {
            commands::services(&client, domain, kind).await?;
        }
        Commands::Service { name } => {
            commands::service(&client, &name).await?;
        }
        Commands::Register {
            service,
            host,
            port,
            weight,
            max_connections,
            tls,
            strategy,
            domain,
            kind,
        } => {
            let request = commands::RegisterRequest {
                host,
                port,
                weight,
                max_connections,
                tls,
                strategy,
                domain,
                kind,
            };
            commands::register(&client, &service, &request).await?;
        }
        Commands::Deregister {
            service,
            host,
            port,
        } => {
            let endpoint = match (host, port) {
                (Some(host), Some(port)) => Some((host, port)),
                (None, None) => None,
                _ => anyhow::bail!("give both host and port, or neither"),
            };
            commands::deregister(&client, &service, endpoint).await?;
        }
        Commands::Weight {
            service,
            host,
            port,
            weight,
        } => {
            commands::weight(&client, &service, &host, port, weight).await?;
        }
        Commands::Health {
            service,
            host,
            port,
            healthy,
        } => {
            commands::health(&client, &service, &host, port, healthy).await?;
        }
        Commands::Stats => {
            commands::stats(&client).await?;
        }
        Commands::Routes { apply } => match apply {
            Some(path) => commands::apply_routes(&client, &path).await?,
            None => commands::routes(&client).await?,
        },
    }

    Ok(())
}
