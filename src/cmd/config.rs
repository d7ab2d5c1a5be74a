//! Configuration commands: `ctf-triage init` and `ctf-triage config`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use ctf_triage::config::write_template;
use ctf_triage::triage::db::TriageDb;

use super::super::{Cli, ConfigCommands};

pub fn cmd_init(cli: &Cli, force: bool) -> Result<()> {
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| std::env::var("TRIAGE_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    let path = write_template(&data_dir, force)?;
    println!("Wrote {}", path.display());

    let config = super::load_config(cli, None)?;
    std::fs::create_dir_all(&config.runs_dir)
        .with_context(|| format!("Failed to create {}", config.runs_dir.display()))?;
    TriageDb::new(&config.db_path)?;
    println!("Database initialized at {}", config.db_path.display());
    println!("Job runs will be stored in {}", config.runs_dir.display());
    Ok(())
}

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config = super::load_config(cli, None)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("CTF Triage Configuration");
            println!("========================");
            println!();
            let path = config.config_path();
            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No triage.toml at {} (using defaults)", path.display());
            }
            println!();

            println!("[server]");
            println!("  host = \"{}\"", config.host);
            println!("  port = {}", config.port);
            println!("  runs_dir = \"{}\"", config.runs_dir.display());
            println!("  db_path = \"{}\"", config.db_path.display());
            println!();

            println!("[sandbox]");
            println!("  image = \"{}\"", config.sandbox.image);
            println!("  memory = \"{}\"", config.sandbox.memory);
            println!("  cpus = {}", config.sandbox.cpus);
            println!("  timeout = {}", config.sandbox.timeout);
            println!("  user = \"{}\"", config.sandbox.user);
            println!("  abort_on = {:?}", config.sandbox.abort_on);
            println!();

            println!("[queue]");
            println!("  workers = {}", config.queue.workers);
            println!("  max_retries = {}", config.queue.max_retries);
            println!("  job_time_limit_secs = {}", config.queue.job_time_limit_secs);
            println!();

            println!("[llm]");
            println!(
                "  api_key = {}",
                if config.llm.enabled() { "(set)" } else { "(not set)" }
            );
            println!("  api_url = \"{}\"", config.llm.api_url);
            println!("  model = \"{}\"", config.llm.model);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!("Configuration is valid.");
        }
    }
    Ok(())
}
