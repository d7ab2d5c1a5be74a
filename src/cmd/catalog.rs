//! Offline inspection commands: playbooks, classification and the tool
//! allowlist.

use std::sync::Arc;

use anyhow::{Context, Result};
use ctf_triage::triage::playbook::{PlaybookCatalog, classify};
use ctf_triage::triage::sandbox::{ALLOWED_TOOLS, ALLOWLIST_VERSION, DockerRuntime, SandboxExecutor};

use super::super::Cli;

pub fn cmd_playbooks() -> Result<()> {
    let catalog = PlaybookCatalog::builtin()?;
    for playbook in catalog.playbooks() {
        println!("{} ({} steps)", playbook.name, playbook.steps.len());
        for step in &playbook.steps {
            println!("  {} {}", step.tool, step.args.join(" "));
        }
    }
    Ok(())
}

pub fn cmd_classify(files: &[String]) -> Result<()> {
    let catalog = PlaybookCatalog::builtin()?;
    let playbook = catalog.select_playbook(files);
    println!("Category: {}", classify(files).as_str());
    println!("Playbook: {}", playbook.name);
    for (i, step) in playbook.steps.iter().enumerate() {
        println!("  cmd_{:03}  {} {}", i, step.tool, step.resolve_arguments(files).join(" "));
    }
    Ok(())
}

pub async fn cmd_tools(cli: &Cli, scan: bool) -> Result<()> {
    if !scan {
        println!("Allowlist v{} ({} tools):", ALLOWLIST_VERSION, ALLOWED_TOOLS.len());
        for tool in ALLOWED_TOOLS {
            println!("  {}", tool);
        }
        return Ok(());
    }

    let config = super::load_config(cli, None)?;
    let runtime = DockerRuntime::connect().context("Failed to connect to the container runtime")?;
    let executor = SandboxExecutor::new(config.sandbox.clone(), Arc::new(runtime));
    let availability = executor.tool_availability(true).await;
    for (tool, present) in &availability.tools {
        println!("  [{}] {}", if *present { "x" } else { " " }, tool);
    }
    println!(
        "{}/{} tools available in {}",
        availability.summary.available, availability.summary.total, config.sandbox.image
    );
    Ok(())
}
