//! nimbusd: the Nimbus daemon.
//!
//! One process, one listener, many tenant sites. Each site is addressed as
//! `<label>.<base domain>`; the base domain itself serves the admin API.
//!
//! # Usage
//!
//! ```text
//! nimbusd serve --config /etc/nimbus/nimbus.toml
//! nimbusd serve --listen 127.0.0.1:8080 --base-domain localhost --data-dir ./data
//! nimbusd default-config > nimbus.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use nimbus_core::{NimbusConfig, TracingActivitySink};
use nimbusd::Host;

#[derive(Parser)]
#[command(name = "nimbusd", about = "Nimbus personal cloud host")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve all sites.
    Serve {
        /// Path to nimbus.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen address, overriding `server.listen`.
        #[arg(long)]
        listen: Option<String>,

        /// Base domain, overriding `server.base_domain`.
        #[arg(long)]
        base_domain: Option<String>,

        /// Data directory, overriding `storage.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the default configuration as TOML.
    DefaultConfig,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,nimbusd=debug,nimbus=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            listen,
            base_domain,
            data_dir,
        } => {
            let mut config = match config {
                Some(path) => NimbusConfig::from_file(&path)?,
                None => NimbusConfig::default(),
            };
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(base_domain) = base_domain {
                config.server.base_domain = base_domain;
            }
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            run_serve(config).await
        }
        Command::DefaultConfig => {
            print!("{}", NimbusConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_serve(config: NimbusConfig) -> anyhow::Result<()> {
    info!(
        base_domain = %config.base_domain(),
        data_dir = %config.storage.data_dir.display(),
        "nimbus host starting"
    );

    let host = Host::build(&config, Arc::new(TracingActivitySink))?;

    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    info!(addr = %listener.local_addr()?, "listening");

    host.serve(listener, async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => {
                error!(error = %e, "failed to install Ctrl-C handler");
                std::future::pending::<()>().await;
            }
        }
    })
    .await?;

    info!("nimbus host stopped");
    Ok(())
}
