use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use devdock::config::DevdockConfig;
use devdock::logging::{LogOptions, init_tracing};

mod cmd;

#[derive(Parser)]
#[command(name = "devdock")]
#[command(version, about = "Local dashboard for Dockerized Laravel and Node projects")]
pub struct Cli {
    /// Path to devdock.toml. Defaults to $DEVDOCK_CONFIG, then the user config dir.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the dashboard server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        projects_dir: Option<PathBuf>,
        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
        /// Open the dashboard in a browser once listening
        #[arg(long)]
        open: bool,
    },
    /// Write a default devdock.toml
    Init {
        #[arg(long)]
        force: bool,
    },
    /// List registered projects
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show recorded and live status of one project
    Status { name: String },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = DevdockConfig::resolve_path(cli.config.as_deref());
    let mut config = DevdockConfig::load_layered(Some(&config_path))?;

    let serving = matches!(cli.command, Commands::Serve { .. });
    if let Commands::Serve {
        port,
        data_dir,
        projects_dir,
        dev,
        ..
    } = &cli.command
    {
        cmd::ServeOverrides {
            port: *port,
            data_dir: data_dir.clone(),
            projects_dir: projects_dir.clone(),
            dev: *dev,
        }
        .apply(&mut config);
    }

    let _log_guard = init_tracing(&LogOptions {
        verbose: cli.verbose,
        json: cli.log_json || config.logging.json,
        file_dir: (serving && config.logging.file).then(|| config.log_dir()),
    })?;

    match cli.command {
        Commands::Serve { open, .. } => {
            cmd::cmd_serve(config, open).await?;
        }
        Commands::Init { force } => {
            cmd::cmd_init(&config_path, force)?;
        }
        Commands::List { json } => {
            cmd::cmd_list(&config, json)?;
        }
        Commands::Status { name } => {
            cmd::cmd_status(&config, &name).await?;
        }
        Commands::Config => {
            cmd::cmd_config(&config, &config_path)?;
        }
    }

    Ok(())
}
