use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use jobforge::config::Config;
use jobforge::jobs::server;
use jobforge::logging;

#[derive(Parser)]
#[command(name = "jobforge")]
#[command(version, about = "Job execution orchestrator for scoped workspaces")]
pub struct Cli {
    /// Path to the config file (defaults to ./jobforge.toml if present)
    #[arg(short, long, global = true, env = "JOBFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API
    Serve {
        /// Port to serve on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Database path (overrides the config file)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Print the effective configuration with secrets redacted
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(db_path) = db_path {
                config.database.path = db_path;
            }
            let _guard = logging::init_logging(&config.logging)?;
            server::start_server(&config).await?;
        }
        Commands::Config => {
            println!("{}", config);
        }
    }

    Ok(())
}
