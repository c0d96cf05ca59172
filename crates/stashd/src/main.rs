//! stashd - ephemeral file drop server
//!
//! Subcommands:
//! - `stashd serve` - Run the HTTP server
//! - `stashd config` - Print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use stashconf::StashConfig;
use stashd::{telemetry, ServeConfig};

#[derive(Parser)]
#[command(name = "stashd")]
#[command(about = "Ephemeral file drop with expiring and view-once uploads")]
#[command(version)]
struct Cli {
    /// Config file used in place of ./stash.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Address to bind (e.g., 0.0.0.0:8080)
        #[arg(short, long)]
        listen: Option<String>,

        /// Host placed in returned URLs
        #[arg(long)]
        domain: Option<String>,

        /// Use https:// in returned URLs
        #[arg(long)]
        https: bool,

        /// Directory for stored objects
        #[arg(long)]
        storage_dir: Option<PathBuf>,

        /// Expiry applied when an upload names none (e.g., "1h", "view")
        #[arg(long)]
        default_expiry: Option<String>,

        /// Largest accepted request body in bytes
        #[arg(long)]
        max_upload_bytes: Option<usize>,

        /// OTLP gRPC endpoint for OpenTelemetry (e.g., "localhost:4317")
        #[arg(long)]
        otlp_endpoint: Option<String>,
    },

    /// Print the effective configuration and where it came from
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) =
        StashConfig::load_with_sources_from(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml());
            println!();
            for file in &sources.files {
                println!("# loaded: {}", file.display());
            }
            for key in &sources.env_overrides {
                println!("# env: {key}");
            }
            Ok(())
        }
        Commands::Serve {
            listen,
            domain,
            https,
            storage_dir,
            default_expiry,
            max_upload_bytes,
            otlp_endpoint,
        } => {
            if let Some(listen) = listen {
                config.bind.listen = listen;
            }
            if let Some(domain) = domain {
                config.public.domain = domain;
            }
            if https {
                config.public.https = true;
            }
            if let Some(dir) = storage_dir {
                config.paths.storage_dir = dir;
            }
            if let Some(selector) = default_expiry {
                config.expiry.default = selector;
            }
            if let Some(max) = max_upload_bytes {
                config.limits.max_upload_bytes = max;
            }
            if let Some(endpoint) = otlp_endpoint {
                config.telemetry.otlp_endpoint = Some(endpoint);
            }

            let telemetry = telemetry::init(&config.telemetry.log_level, config.telemetry.otlp_endpoint.as_deref())
                .context("Failed to initialize telemetry")?;

            for file in &sources.files {
                tracing::info!("Config file: {}", file.display());
            }
            for key in &sources.env_overrides {
                tracing::debug!("Env override: {}", key);
            }

            let result = stashd::run(ServeConfig::from_config(&config)).await;
            telemetry.shutdown();
            result
        }
    }
}
