//! Server command: `ctf-triage serve`.

use anyhow::Result;

use super::super::Cli;

pub async fn cmd_serve(cli: &Cli, port: Option<u16>) -> Result<()> {
    let config = super::load_config(cli, port)?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        image = %config.sandbox.image,
        workers = config.queue.workers,
        llm = config.llm.enabled(),
        "Starting triage server"
    );
    ctf_triage::triage::server::start_server(config).await
}
