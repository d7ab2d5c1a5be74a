use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "ctf-triage")]
#[command(version, about = "Sandboxed first-pass triage of CTF challenges")]
pub struct Cli {
    /// Directory holding .triage/triage.toml, the database and job runs
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP/WebSocket server and queue workers
    Serve {
        /// Port to serve on (overrides triage.toml)
        #[arg(short, long, env = "TRIAGE_PORT")]
        port: Option<u16>,
    },
    /// Write a starter triage.toml and create the database
    Init {
        /// Overwrite an existing triage.toml
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// List the built-in playbooks
    Playbooks,
    /// Show which playbook a set of file names selects
    Classify {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// List the tool allowlist, optionally scanning the sandbox image
    Tools {
        /// Ask the container runtime which tools the image ships
        #[arg(long)]
        scan: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Check the configuration and exit non-zero on problems
    Validate,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match &cli.command {
        Commands::Serve { port } => cmd::cmd_serve(&cli, *port).await?,
        Commands::Init { force } => cmd::cmd_init(&cli, *force)?,
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
        Commands::Playbooks => cmd::cmd_playbooks()?,
        Commands::Classify { files } => cmd::cmd_classify(files)?,
        Commands::Tools { scan } => cmd::cmd_tools(&cli, *scan).await?,
    }

    Ok(())
}
