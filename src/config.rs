//! Layered configuration for the triage service.
//!
//! Values are resolved file → environment → CLI:
//!
//! 1. `<data_dir>/.triage/triage.toml`, missing file means defaults
//! 2. `.env` (via dotenvy) and `TRIAGE_*` environment variables
//! 3. command-line flags
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8600
//!
//! [sandbox]
//! image = "ctf-triage-sandbox:latest"
//! memory = "512m"
//! cpus = 1.0
//! timeout = 60
//! abort_on = ["image_missing"]
//!
//! [queue]
//! workers = 2
//! max_retries = 2
//!
//! [llm]
//! model = "llama3.3-70b-instruct"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::triage::llm::{LlmConfig, LlmSection};
use crate::triage::queue::{QueueConfig, QueueSection};
use crate::triage::sandbox::{SandboxConfig, SandboxSection};

pub const CONFIG_DIR: &str = ".triage";
pub const CONFIG_FILE: &str = "triage.toml";
pub const DEFAULT_PORT: u16 = 8600;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Starter file written by `ctf-triage init`.
pub const CONFIG_TEMPLATE: &str = r#"# ctf-triage configuration

[server]
host = "127.0.0.1"
port = 8600

[sandbox]
image = "ctf-triage-sandbox:latest"
memory = "512m"
cpus = 1.0
timeout = 60
tools_cache_ttl = 300
# Outcomes that stop the rest of a playbook: rejected, image_missing,
# timed_out, isolation_fault. Empty runs every step.
abort_on = []

[queue]
workers = 2
max_retries = 2
retry_delay_secs = 5
job_time_limit_secs = 1200

[llm]
# api_key = "..."   (or TRIAGE_LLM_API_KEY)
model = "llama3.3-70b-instruct"
timeout_secs = 120
"#;

/// `[server]` table of `triage.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub runs_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub cors_permissive: Option<bool>,
}

/// Raw contents of `triage.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct TriageToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub llm: LlmSection,
}

impl TriageToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse triage.toml")
    }

    /// Returns defaults when the file does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Command-line overrides, highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub data_dir: Option<PathBuf>,
    pub port: Option<u16>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub runs_dir: PathBuf,
    pub db_path: PathBuf,
    pub cors_permissive: bool,
    pub sandbox: SandboxConfig,
    pub queue: QueueConfig,
    pub llm: LlmConfig,
}

impl TriageConfig {
    /// Resolve configuration from the process environment.
    pub fn load(cli: CliOverrides) -> Result<Self> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            tracing::warn!(error = %e, "Failed to load .env");
        }
        Self::resolve(cli, |key| std::env::var(key).ok())
    }

    /// Resolve against an arbitrary variable lookup.
    pub fn resolve<F>(cli: CliOverrides, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| env("TRIAGE_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        let file = TriageToml::load_or_default(&data_dir.join(CONFIG_DIR))?;

        let mut config = Self::from_toml(data_dir, file);
        config.apply_env(&env)?;
        if let Some(port) = cli.port {
            config.port = port;
        }
        config.validate()?;
        Ok(config)
    }

    fn from_toml(data_dir: PathBuf, file: TriageToml) -> Self {
        let mut sandbox = SandboxConfig::default();
        sandbox.apply(file.sandbox);
        let mut queue = QueueConfig::default();
        queue.apply(file.queue);
        let mut llm = LlmConfig::default();
        llm.apply(file.llm);

        let server = file.server;
        Self {
            host: server.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: server.port.unwrap_or(DEFAULT_PORT),
            runs_dir: server.runs_dir.unwrap_or_else(|| data_dir.join("runs")),
            db_path: server.db_path.unwrap_or_else(|| data_dir.join("triage.db")),
            cors_permissive: server.cors_permissive.unwrap_or(false),
            data_dir,
            sandbox,
            queue,
            llm,
        }
    }

    fn apply_env<F>(&mut self, env: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(image) = env("TRIAGE_SANDBOX_IMAGE") {
            self.sandbox.image = image;
        }
        if let Some(timeout) = parse_var(env, "TRIAGE_SANDBOX_TIMEOUT")? {
            self.sandbox.timeout = timeout;
        }
        if let Some(memory) = env("TRIAGE_SANDBOX_MEMORY") {
            self.sandbox.memory = memory;
        }
        if let Some(cpus) = parse_var(env, "TRIAGE_SANDBOX_CPUS")? {
            self.sandbox.cpus = cpus;
        }
        if let Some(workers) = parse_var(env, "TRIAGE_WORKERS")? {
            self.queue.workers = workers;
        }
        if let Some(key) = env("TRIAGE_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = env("TRIAGE_LLM_API_URL") {
            self.llm.api_url = url;
        }
        if let Some(model) = env("TRIAGE_LLM_MODEL") {
            self.llm.model = model;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.sandbox.validate().context("Invalid [sandbox] settings")?;
        if self.queue.workers == 0 {
            bail!("Queue needs at least one worker");
        }
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        config_path(&self.data_dir)
    }
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Write the starter config. Refuses to overwrite unless `force` is set.
pub fn write_template(data_dir: &Path, force: bool) -> Result<PathBuf> {
    let path = config_path(data_dir);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(path)
}

fn parse_var<T, F>(env: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| raw.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("Invalid value for {}", key))
}
