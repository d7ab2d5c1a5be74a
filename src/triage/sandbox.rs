use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, KillContainerOptions,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    WaitContainerOptions,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::SandboxError;
use crate::util::output_hash;

/// Bumped whenever `ALLOWED_TOOLS` changes.
pub const ALLOWLIST_VERSION: u32 = 1;

/// Read-only analysis utilities the sandbox will launch. Anything else is
/// rejected before a container is created.
pub const ALLOWED_TOOLS: &[&str] = &[
    // strings and bytes
    "strings", "file", "xxd", "hexdump", "od", "base64", "base32", "head", "tail", "cat", "wc",
    "grep", "egrep", "awk", "gawk", "sed", "cut", "sort", "uniq", "tr", "rev", "find", "ls",
    "stat", "dd", "split", "jq", "yq", "xmllint",
    // hashes
    "sha256sum", "sha1sum", "md5sum", "sha512sum", "cksum",
    // binaries
    "readelf", "objdump", "nm", "size", "ldd", "checksec", "objcopy", "patchelf", "gdb",
    "ltrace", "strace",
    // reversing
    "radare2", "r2", "rabin2", "rasm2", "rafind2", "rahash2", "r2pipe", "retdec-decompiler",
    "retdec-fileinfo", "retdec-unpacker", "ropper", "ROPgadget", "one_gadget", "uncompyle6",
    "pycdc", "javap", "jadx",
    // images and stego
    "exiftool", "identify", "convert", "steghide", "zsteg", "stegseek", "pngcheck", "pngcrush",
    "optipng", "zbarimg", "zxing",
    // audio and video
    "sox", "ffmpeg", "ffprobe", "audacity",
    // documents
    "pdfinfo", "pdftotext", "pdfimages", "pdftk",
    // network captures
    "tshark", "tcpdump", "ssldump", "curl", "wget", "nc", "ncat",
    // archives and carving
    "unzip", "zipinfo", "tar", "gzip", "gunzip", "bzip2", "xz", "7z", "unrar", "cabextract",
    "foremost", "binwalk", "bulk_extractor", "photorec", "testdisk",
    // memory
    "volatility", "volatility3",
    // crypto and cracking
    "openssl", "john", "hashcat", "hash-identifier", "name-that-hash", "nth", "fcrackzip",
    // interpreters for solve scripts
    "python3",
];

/// Container path the working directory is mounted at.
pub const WORKSPACE_MOUNT: &str = "/workspace";
/// Writable tmpfs used by the script variant.
pub const SCRATCH_DIR: &str = "/scratch";
/// Wheel cache baked into the sandbox image.
pub const WHEEL_CACHE: &str = "/opt/wheels";
pub const MAX_SCRIPT_TIMEOUT_SECS: u64 = 300;

const SCRIPT_ENV: &str = "TRIAGE_SCRIPT";

/// Resolve the base name of a requested tool, stripping any path.
pub fn tool_base_name(tool: &str) -> Option<&str> {
    Path::new(tool).file_name().and_then(|n| n.to_str())
}

pub fn is_tool_allowed(tool: &str) -> bool {
    tool_base_name(tool).is_some_and(|name| ALLOWED_TOOLS.contains(&name))
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '=' | ',' | ':' | '+')
}

/// Filter arguments down to a safe character set.
///
/// Option-shaped arguments keep their safe characters only. Anything that
/// looks like a path is first reduced to its final component. Arguments
/// that end up empty or as a bare `.`/`..` are dropped.
pub fn sanitize_arguments(arguments: &[String]) -> Vec<String> {
    arguments
        .iter()
        .filter_map(|arg| {
            let candidate = if !arg.starts_with('-') && (arg.contains('/') || arg.contains('\\')) {
                arg.rsplit(['/', '\\']).next().unwrap_or("")
            } else {
                arg.as_str()
            };
            let cleaned: String = candidate.chars().filter(|c| is_safe_char(*c)).collect();
            if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
                None
            } else {
                Some(cleaned)
            }
        })
        .collect()
}

/// Reduce an uploaded file name to something [`sanitize_arguments`] passes
/// through unchanged: final path component, whitespace as `_`, unsafe
/// characters and leading `-`/`.` removed.
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next()?.trim();
    let cleaned: String = base
        .chars()
        .filter_map(|c| if c.is_whitespace() { Some('_') } else { is_safe_char(c).then_some(c) })
        .collect();
    let cleaned = cleaned.trim_start_matches(['-', '.']);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Pip requirement names: letters, digits, `-_.` and `=` for pins.
pub fn sanitize_packages(packages: &[String]) -> Vec<String> {
    packages
        .iter()
        .map(|p| {
            p.chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '='))
                .collect::<String>()
        })
        .filter(|p| !p.is_empty() && !p.starts_with('-') && !p.starts_with('='))
        .collect()
}

/// Parse a Docker-style memory size (`512m`, `1g`, `65536k`, `1048576`).
pub fn parse_memory(value: &str) -> Result<i64> {
    let trimmed = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        Some('b') => (&trimmed[..trimmed.len() - 1], 1),
        Some(_) => (trimmed.as_str(), 1),
        None => bail!("Memory limit must not be empty"),
    };
    let amount: i64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", value))?;
    if amount <= 0 {
        bail!("Memory limit must be positive: {}", value);
    }
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Memory limit is too large: {}", value))
}

/// Reject image references carrying anything but registry-name characters.
pub fn validate_image_name(image: &str) -> Result<()> {
    if image.is_empty() {
        bail!("Sandbox image name cannot be empty");
    }
    if image.len() > 256 {
        bail!("Sandbox image name exceeds 256 characters");
    }
    if let Some(ch) = image
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '.' | ':' | '/' | '_' | '@'))
    {
        bail!("Sandbox image name contains invalid character {:?}", ch);
    }
    if image.starts_with(['-', '.', ':']) {
        bail!("Sandbox image name cannot start with {:?}", &image[..1]);
    }
    Ok(())
}

// ── Configuration ────────────────────────────────────────────────────

/// Resource and isolation settings for sandbox containers.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub image: String,
    pub memory: String,
    pub cpus: f64,
    pub timeout: u64,
    pub pids_limit: i64,
    pub user: String,
    /// Seconds a tool-availability scan stays fresh.
    pub tools_cache_ttl: u64,
    /// Outcomes that abort the rest of a playbook. Empty means every step runs.
    pub abort_on: Vec<ExecutionOutcome>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "ctf-triage-sandbox:latest".to_string(),
            memory: "512m".to_string(),
            cpus: 1.0,
            timeout: 60,
            pids_limit: 128,
            user: "1000:1000".to_string(),
            tools_cache_ttl: 300,
            abort_on: Vec::new(),
        }
    }
}

/// Raw `[sandbox]` table of `triage.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct SandboxSection {
    pub image: Option<String>,
    pub memory: Option<String>,
    pub cpus: Option<f64>,
    pub timeout: Option<u64>,
    pub pids_limit: Option<i64>,
    pub user: Option<String>,
    pub tools_cache_ttl: Option<u64>,
    pub abort_on: Option<Vec<ExecutionOutcome>>,
}

impl SandboxConfig {
    pub fn apply(&mut self, section: SandboxSection) {
        if let Some(image) = section.image {
            self.image = image;
        }
        if let Some(memory) = section.memory {
            self.memory = memory;
        }
        if let Some(cpus) = section.cpus {
            self.cpus = cpus;
        }
        if let Some(timeout) = section.timeout {
            self.timeout = timeout;
        }
        if let Some(pids_limit) = section.pids_limit {
            self.pids_limit = pids_limit;
        }
        if let Some(user) = section.user {
            self.user = user;
        }
        if let Some(ttl) = section.tools_cache_ttl {
            self.tools_cache_ttl = ttl;
        }
        if let Some(abort_on) = section.abort_on {
            self.abort_on = abort_on;
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_image_name(&self.image)?;
        parse_memory(&self.memory)?;
        if !(self.cpus > 0.0) {
            bail!("Sandbox cpus must be positive, got {}", self.cpus);
        }
        if self.timeout == 0 {
            bail!("Sandbox timeout must be at least one second");
        }
        if self.user.is_empty() || self.user == "0" || self.user.starts_with("0:") || self.user == "root" {
            bail!("Sandbox user must be a non-root identity, got {:?}", self.user);
        }
        Ok(())
    }

    pub fn memory_bytes(&self) -> Result<i64> {
        parse_memory(&self.memory)
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }

    pub fn is_fatal(&self, outcome: ExecutionOutcome) -> bool {
        self.abort_on.contains(&outcome)
    }
}

// ── Results ──────────────────────────────────────────────────────────

/// How an execution ended, as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The tool ran. Its own exit code may still be non-zero.
    Completed,
    /// Refused before launch: tool outside the allowlist.
    Rejected,
    ImageMissing,
    TimedOut,
    /// Launch failure, runtime unavailable or resource exhaustion.
    IsolationFault,
}

impl ExecutionOutcome {
    fn for_error(err: &SandboxError) -> Self {
        match err {
            SandboxError::ToolNotAllowed { .. } => Self::Rejected,
            SandboxError::ImageMissing { .. } => Self::ImageMissing,
            SandboxError::TimedOut { .. } => Self::TimedOut,
            SandboxError::RuntimeUnavailable(_)
            | SandboxError::LaunchFailed(_)
            | SandboxError::ResourceExhausted { .. } => Self::IsolationFault,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub output_hash: Option<String>,
    pub outcome: ExecutionOutcome,
    pub duration_ms: u64,
}

impl ExecutionResult {
    fn rejected(tool: &str) -> Self {
        Self {
            exit_code: 1,
            stdout: String::new(),
            stderr: SandboxError::ToolNotAllowed {
                tool: tool.to_string(),
            }
            .to_string(),
            output_hash: None,
            outcome: ExecutionOutcome::Rejected,
            duration_ms: 0,
        }
    }

    fn fault(err: &SandboxError, started: Instant) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: err.to_string(),
            output_hash: None,
            outcome: ExecutionOutcome::for_error(err),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn from_output(output: ContainerOutput, started: Instant) -> Self {
        Self {
            exit_code: output.exit_code,
            output_hash: Some(output_hash(&output.stdout)),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            outcome: ExecutionOutcome::Completed,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// True for anything other than a completed run.
    pub fn is_error(&self) -> bool {
        self.outcome != ExecutionOutcome::Completed
    }
}

// ── Container runtime seam ───────────────────────────────────────────

/// Everything needed to launch one throwaway container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub user: String,
    pub working_dir: String,
    pub binds: Vec<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub readonly_rootfs: bool,
    pub network_disabled: bool,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub tmpfs: HashMap<String, String>,
}

impl ContainerSpec {
    /// Locked-down spec for analysis tools: read-only root and input mount,
    /// no network, no capabilities.
    pub fn hardened(config: &SandboxConfig, host_dir: Option<&Path>, cmd: Vec<String>) -> Result<Self> {
        let binds = host_dir
            .map(|dir| vec![format!("{}:{}:ro", dir.display(), WORKSPACE_MOUNT)])
            .unwrap_or_default();
        let working_dir = if host_dir.is_some() { WORKSPACE_MOUNT } else { "/" };
        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,noexec,nosuid,size=64m".to_string());
        Ok(Self {
            image: config.image.clone(),
            cmd,
            env: Vec::new(),
            user: config.user.clone(),
            working_dir: working_dir.to_string(),
            binds,
            memory_bytes: config.memory_bytes()?,
            nano_cpus: config.nano_cpus(),
            pids_limit: config.pids_limit,
            readonly_rootfs: true,
            network_disabled: true,
            cap_drop: vec!["ALL".to_string()],
            security_opt: vec!["no-new-privileges".to_string()],
            tmpfs,
        })
    }

    /// Script variant: same lockdown plus an executable scratch tmpfs.
    pub fn scratch(
        config: &SandboxConfig,
        host_dir: Option<&Path>,
        cmd: Vec<String>,
        env: Vec<String>,
    ) -> Result<Self> {
        let mut spec = Self::hardened(config, host_dir, cmd)?;
        spec.env = env;
        spec.tmpfs
            .insert(SCRATCH_DIR.to_string(), "rw,exec,nosuid,size=256m".to_string());
        if host_dir.is_none() {
            spec.working_dir = SCRATCH_DIR.to_string();
        }
        Ok(spec)
    }
}

/// Raw output of a finished container.
#[derive(Debug, Clone, Default)]
pub struct ContainerOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub oom_killed: bool,
}

/// Isolation backend. Real implementation: `DockerRuntime`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, SandboxError>;

    /// Run to completion, removing the container afterwards whatever happens.
    async fn run_container(
        &self,
        spec: &ContainerSpec,
        timeout: Duration,
    ) -> Result<ContainerOutput, SandboxError>;
}

/// Docker Engine backend over the local socket.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    async fn wait_exit(&self, id: &str) -> Result<i64, SandboxError> {
        let mut stream = self.docker.wait_container(id, None::<WaitContainerOptions>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::LaunchFailed(e.to_string())),
            None => Err(SandboxError::LaunchFailed(
                "wait stream ended without an exit status".to_string(),
            )),
        }
    }

    async fn collect_logs(&self, id: &str) -> Result<(Vec<u8>, Vec<u8>), SandboxError> {
        let options = LogsOptionsBuilder::default().stdout(true).stderr(true).build();
        let mut stream = self.docker.logs(id, Some(options));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| SandboxError::LaunchFailed(e.to_string()))? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.extend_from_slice(&message)
                }
                LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok((stdout, stderr))
    }

    async fn drive(&self, id: &str, timeout: Duration) -> Result<ContainerOutput, SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| SandboxError::LaunchFailed(e.to_string()))?;

        let exit_code = match tokio::time::timeout(timeout, self.wait_exit(id)).await {
            Ok(code) => code?,
            Err(_) => {
                if let Err(e) = self.docker.kill_container(id, None::<KillContainerOptions>).await {
                    tracing::warn!(container = id, error = %e, "Failed to kill timed-out container");
                }
                return Err(SandboxError::TimedOut {
                    secs: timeout.as_secs(),
                });
            }
        };

        let oom_killed = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|info| info.state)
            .and_then(|state| state.oom_killed)
            .unwrap_or(false);

        let (stdout, stderr) = self.collect_logs(id).await?;
        Ok(ContainerOutput {
            exit_code,
            stdout,
            stderr,
            oom_killed,
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, SandboxError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(SandboxError::RuntimeUnavailable(e.to_string())),
        }
    }

    async fn run_container(
        &self,
        spec: &ContainerSpec,
        timeout: Duration,
    ) -> Result<ContainerOutput, SandboxError> {
        let name = format!("triage-{}", uuid::Uuid::new_v4());
        let options = CreateContainerOptionsBuilder::default().name(&name).build();
        let host_config = HostConfig {
            binds: Some(spec.binds.clone()),
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            pids_limit: Some(spec.pids_limit),
            readonly_rootfs: Some(spec.readonly_rootfs),
            network_mode: Some("none".to_string()),
            cap_drop: Some(spec.cap_drop.clone()),
            security_opt: Some(spec.security_opt.clone()),
            tmpfs: Some(spec.tmpfs.clone()),
            ..Default::default()
        };
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            user: Some(spec.user.clone()),
            working_dir: Some(spec.working_dir.clone()),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::ImageMissing {
                    image: spec.image.clone(),
                },
                other => SandboxError::LaunchFailed(other.to_string()),
            })?;

        let result = self.drive(&created.id, timeout).await;

        let remove = RemoveContainerOptionsBuilder::default().force(true).build();
        if let Err(e) = self.docker.remove_container(&created.id, Some(remove)).await {
            tracing::warn!(container = %created.id, error = %e, "Failed to remove sandbox container");
        }
        result
    }
}

// ── Tool availability ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvailabilitySummary {
    pub available: usize,
    pub total: usize,
}

/// Which allowlisted tools the sandbox image actually ships.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolAvailability {
    pub tools: BTreeMap<String, bool>,
    pub cached: bool,
    pub checked_at: String,
    pub summary: AvailabilitySummary,
}

impl ToolAvailability {
    fn new(tools: BTreeMap<String, bool>, cached: bool, checked_at: String) -> Self {
        let summary = AvailabilitySummary {
            available: tools.values().filter(|v| **v).count(),
            total: tools.len(),
        };
        Self {
            tools,
            cached,
            checked_at,
            summary,
        }
    }
}

struct CachedScan {
    scanned_at: Instant,
    checked_at: String,
    tools: BTreeMap<String, bool>,
}

/// Scan results kept for a fixed TTL. Concurrent callers share one scan.
pub struct ToolAvailabilityCache {
    ttl: Duration,
    entry: Mutex<Option<CachedScan>>,
}

impl ToolAvailabilityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    pub async fn get_or_scan<F, Fut>(&self, force_refresh: bool, scan: F) -> ToolAvailability
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BTreeMap<String, bool>, SandboxError>>,
    {
        let mut entry = self.entry.lock().await;
        if !force_refresh
            && let Some(cached) = entry.as_ref()
            && cached.scanned_at.elapsed() < self.ttl
        {
            return ToolAvailability::new(cached.tools.clone(), true, cached.checked_at.clone());
        }

        let checked_at = chrono::Utc::now().to_rfc3339();
        match scan().await {
            Ok(tools) => {
                *entry = Some(CachedScan {
                    scanned_at: Instant::now(),
                    checked_at: checked_at.clone(),
                    tools: tools.clone(),
                });
                ToolAvailability::new(tools, false, checked_at)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Tool availability scan failed");
                let tools = ALLOWED_TOOLS.iter().map(|t| (t.to_string(), false)).collect();
                ToolAvailability::new(tools, false, checked_at)
            }
        }
    }
}

/// Shell loop printing `name:1` or `name:0` per allowlisted tool.
fn scan_script() -> String {
    format!(
        "for t in {}; do if command -v \"$t\" >/dev/null 2>&1; then echo \"$t:1\"; else echo \"$t:0\"; fi; done",
        ALLOWED_TOOLS.join(" ")
    )
}

fn parse_scan_output(stdout: &str) -> BTreeMap<String, bool> {
    let mut tools: BTreeMap<String, bool> =
        ALLOWED_TOOLS.iter().map(|t| (t.to_string(), false)).collect();
    for line in stdout.lines() {
        if let Some((name, flag)) = line.trim().rsplit_once(':')
            && let Some(slot) = tools.get_mut(name)
        {
            *slot = flag == "1";
        }
    }
    tools
}

/// A package importable by solve scripts without installing anything.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PythonPackage {
    pub name: String,
    pub version: String,
}

/// `name==version` lines from `pip list --format=freeze`.
fn parse_pip_freeze(stdout: &str) -> Vec<PythonPackage> {
    stdout
        .lines()
        .filter_map(|line| {
            let (name, version) = line.trim().split_once("==")?;
            (!name.is_empty()).then(|| PythonPackage {
                name: name.to_string(),
                version: version.to_string(),
            })
        })
        .collect()
}

// ── Executor ─────────────────────────────────────────────────────────

/// A solve script for the loosened sandbox variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub script: String,
    #[serde(default)]
    pub packages: Vec<String>,
    pub timeout_secs: Option<u64>,
}

/// Shell line that optionally builds a venv from the wheel cache, then runs
/// the script passed through the environment.
fn script_command(packages: &[String]) -> String {
    let run = format!("python3 -c \"${}\"", SCRIPT_ENV);
    if packages.is_empty() {
        return run;
    }
    format!(
        "python3 -m venv {scratch}/venv && {scratch}/venv/bin/pip install --quiet --no-index --find-links {wheels} {pkgs} && {scratch}/venv/bin/python -c \"${env}\"",
        scratch = SCRATCH_DIR,
        wheels = WHEEL_CACHE,
        pkgs = packages.join(" "),
        env = SCRIPT_ENV,
    )
}

/// Runs allowlisted tools in throwaway containers.
pub struct SandboxExecutor {
    config: SandboxConfig,
    runtime: Arc<dyn ContainerRuntime>,
    availability: ToolAvailabilityCache,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let availability = ToolAvailabilityCache::new(Duration::from_secs(config.tools_cache_ttl));
        Self {
            config,
            runtime,
            availability,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one tool against `working_dir`. Never returns an error: every
    /// failure is folded into the result's `outcome`.
    pub async fn run(&self, tool: &str, arguments: &[String], working_dir: &Path) -> ExecutionResult {
        let started = Instant::now();
        let Some(name) = tool_base_name(tool).filter(|name| ALLOWED_TOOLS.contains(name)) else {
            tracing::warn!(tool, "Rejected tool outside the allowlist");
            return ExecutionResult::rejected(tool);
        };

        let host_dir = match absolute_dir(working_dir) {
            Ok(dir) => dir,
            Err(e) => return ExecutionResult::fault(&e, started),
        };

        let mut cmd = vec![name.to_string()];
        cmd.extend(sanitize_arguments(arguments));
        let spec = match ContainerSpec::hardened(&self.config, Some(&host_dir), cmd) {
            Ok(spec) => spec,
            Err(e) => return ExecutionResult::fault(&SandboxError::LaunchFailed(e.to_string()), started),
        };

        tracing::debug!(tool = name, args = ?spec.cmd, "Launching sandbox container");
        self.execute(&spec, Duration::from_secs(self.config.timeout), started)
            .await
    }

    /// Run a Python script with a writable scratch area. The input mount,
    /// when given, stays read-only and the network stays off.
    pub async fn run_script(&self, request: &ScriptRequest, working_dir: Option<&Path>) -> ExecutionResult {
        let started = Instant::now();
        let host_dir = match working_dir.map(absolute_dir).transpose() {
            Ok(dir) => dir,
            Err(e) => return ExecutionResult::fault(&e, started),
        };

        let packages = sanitize_packages(&request.packages);
        let timeout = request
            .timeout_secs
            .unwrap_or(self.config.timeout)
            .clamp(1, MAX_SCRIPT_TIMEOUT_SECS);
        let cmd = vec!["sh".to_string(), "-c".to_string(), script_command(&packages)];
        let env = vec![
            format!("{}={}", SCRIPT_ENV, request.script),
            format!("HOME={}", SCRATCH_DIR),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
        ];
        let spec = match ContainerSpec::scratch(&self.config, host_dir.as_deref(), cmd, env) {
            Ok(spec) => spec,
            Err(e) => return ExecutionResult::fault(&SandboxError::LaunchFailed(e.to_string()), started),
        };

        tracing::info!(packages = ?packages, timeout, "Launching script sandbox");
        self.execute(&spec, Duration::from_secs(timeout), started).await
    }

    /// Report which allowlisted tools the image provides, scanning at most
    /// once per TTL unless `force_refresh` is set.
    pub async fn tool_availability(&self, force_refresh: bool) -> ToolAvailability {
        self.availability
            .get_or_scan(force_refresh, || self.scan_tools())
            .await
    }

    /// List the Python packages preinstalled in the image.
    pub async fn python_packages(&self) -> Result<Vec<PythonPackage>, SandboxError> {
        if !self.runtime.image_exists(&self.config.image).await? {
            return Err(SandboxError::ImageMissing {
                image: self.config.image.clone(),
            });
        }
        let cmd = ["python3", "-m", "pip", "list", "--format=freeze"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let spec = ContainerSpec::hardened(&self.config, None, cmd)
            .map_err(|e| SandboxError::LaunchFailed(e.to_string()))?;
        let output = self
            .runtime
            .run_container(&spec, Duration::from_secs(self.config.timeout))
            .await?;
        if output.exit_code != 0 {
            return Err(SandboxError::LaunchFailed(format!(
                "pip list exited with {}: {}",
                output.exit_code,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_pip_freeze(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn scan_tools(&self) -> Result<BTreeMap<String, bool>, SandboxError> {
        if !self.runtime.image_exists(&self.config.image).await? {
            return Err(SandboxError::ImageMissing {
                image: self.config.image.clone(),
            });
        }
        let cmd = vec!["sh".to_string(), "-c".to_string(), scan_script()];
        let spec = ContainerSpec::hardened(&self.config, None, cmd)
            .map_err(|e| SandboxError::LaunchFailed(e.to_string()))?;
        let output = self
            .runtime
            .run_container(&spec, Duration::from_secs(self.config.timeout))
            .await?;
        Ok(parse_scan_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn execute(&self, spec: &ContainerSpec, timeout: Duration, started: Instant) -> ExecutionResult {
        match self.runtime.image_exists(&spec.image).await {
            Ok(true) => {}
            Ok(false) => {
                let err = SandboxError::ImageMissing {
                    image: spec.image.clone(),
                };
                tracing::error!(image = %spec.image, "Sandbox image missing");
                return ExecutionResult::fault(&err, started);
            }
            Err(e) => {
                tracing::error!(error = %e, "Container runtime unavailable");
                return ExecutionResult::fault(&e, started);
            }
        }

        match self.runtime.run_container(spec, timeout).await {
            Ok(output) if output.oom_killed => {
                let err = SandboxError::ResourceExhausted {
                    limit: self.config.memory.clone(),
                };
                tracing::warn!(cmd = ?spec.cmd, "Sandbox container was OOM-killed");
                let mut result = ExecutionResult::from_output(output, started);
                result.outcome = ExecutionOutcome::IsolationFault;
                if !result.stderr.is_empty() {
                    result.stderr.push('\n');
                }
                result.stderr.push_str(&err.to_string());
                result
            }
            Ok(output) => ExecutionResult::from_output(output, started),
            Err(e) => {
                tracing::warn!(cmd = ?spec.cmd, error = %e, "Sandbox execution failed");
                ExecutionResult::fault(&e, started)
            }
        }
    }
}

fn absolute_dir(dir: &Path) -> Result<PathBuf, SandboxError> {
    dir.canonicalize().map_err(|e| {
        SandboxError::LaunchFailed(format!("Working directory {} unavailable: {}", dir.display(), e))
    })
}


#[cfg(test)]
mod tests {
    use super::mock::MockRuntime;
    use super::*;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn executor(runtime: Arc<MockRuntime>) -> SandboxExecutor {
        SandboxExecutor::new(SandboxConfig::default(), runtime)
    }

    #[test]
    fn test_allowlist_has_no_duplicates_and_no_shells() {
        let mut seen = std::collections::HashSet::new();
        for tool in ALLOWED_TOOLS {
            assert!(seen.insert(*tool), "duplicate tool {}", tool);
        }
        assert!(ALLOWED_TOOLS.len() >= 100);
        for shell in ["sh", "bash", "zsh", "rm", "docker"] {
            assert!(!is_tool_allowed(shell));
        }
    }

    #[test]
    fn test_allowlist_checks_base_name() {
        assert!(is_tool_allowed("strings"));
        assert!(is_tool_allowed("/usr/bin/strings"));
        assert!(!is_tool_allowed("/bin/bash"));
        assert!(!is_tool_allowed(""));
    }

    #[test]
    fn test_sanitize_strips_metacharacters() {
        let args = strings(&["-n", "8", "a.bin; rm -rf ~", "$(id)", "`whoami`", "x|y&z"]);
        assert_eq!(sanitize_arguments(&args), vec!["-n", "8", "a.binrm-rf", "id", "whoami", "xyz"]);
    }

    #[test]
    fn test_sanitize_reduces_paths_to_base_name() {
        let args = strings(&["/etc/passwd", "../../secret.txt", "..\\win.ini", "..", "./"]);
        assert_eq!(sanitize_arguments(&args), vec!["passwd", "secret.txt", "win.ini"]);
    }

    #[test]
    fn test_sanitize_keeps_filter_expressions() {
        let args = strings(&["-Y", "tcp.flags.syn==1", "-z", "io,stat,0", "-"]);
        assert_eq!(sanitize_arguments(&args), args);
    }

    #[test]
    fn test_sanitize_packages() {
        let pkgs = strings(&["pwntools", "pycryptodome==3.20", "--index-url=http://x", "a;b", ""]);
        assert_eq!(sanitize_packages(&pkgs), vec!["pwntools", "pycryptodome==3.20", "ab"]);
    }

    #[test]
    fn test_sanitized_file_names_survive_argument_filter() {
        assert_eq!(sanitize_file_name("my file.png").as_deref(), Some("my_file.png"));
        assert_eq!(sanitize_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_file_name("C:\\chal\\flag$(id).txt").as_deref(), Some("flagid.txt"));
        assert_eq!(sanitize_file_name("-rf").as_deref(), Some("rf"));
        assert_eq!(sanitize_file_name("..").as_deref(), None);
        assert_eq!(sanitize_file_name("$$$").as_deref(), None);

        for raw in ["my file.png", "weird;name (1).pcap", ".hidden", "ünïcode.bin"] {
            let name = sanitize_file_name(raw).unwrap();
            assert_eq!(sanitize_arguments(&[name.clone()]), vec![name]);
        }
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("2048").unwrap(), 2048);
        assert!(parse_memory("").is_err());
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("0m").is_err());
        let err = parse_memory("99999999999g").unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_image_name_validation_rejects_injection() {
        assert!(validate_image_name("ctf-triage-sandbox:latest").is_ok());
        assert!(validate_image_name("registry.local/triage@sha256:abc").is_ok());
        assert!(validate_image_name("img; rm -rf /").is_err());
        assert!(validate_image_name("-privileged").is_err());
        assert!(validate_image_name("").is_err());
    }

    #[test]
    fn test_config_defaults_and_apply() {
        let mut config = SandboxConfig::default();
        assert_eq!(config.timeout, 60);
        assert_eq!(config.memory, "512m");
        assert_eq!(config.cpus, 1.0);
        assert!(config.validate().is_ok());

        config.apply(SandboxSection {
            memory: Some("1g".into()),
            abort_on: Some(vec![ExecutionOutcome::ImageMissing]),
            ..Default::default()
        });
        assert_eq!(config.memory, "1g");
        assert_eq!(config.timeout, 60);
        assert!(config.is_fatal(ExecutionOutcome::ImageMissing));
        assert!(!config.is_fatal(ExecutionOutcome::TimedOut));
    }

    #[test]
    fn test_config_rejects_root_user() {
        let config = SandboxConfig {
            user: "0:0".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hardened_spec_policy() {
        let config = SandboxConfig::default();
        let spec = ContainerSpec::hardened(&config, Some(Path::new("/data/runs/j1/input")), strings(&["file", "a"])).unwrap();
        assert_eq!(spec.binds, vec!["/data/runs/j1/input:/workspace:ro"]);
        assert_eq!(spec.working_dir, "/workspace");
        assert_eq!(spec.user, "1000:1000");
        assert!(spec.readonly_rootfs);
        assert!(spec.network_disabled);
        assert_eq!(spec.cap_drop, vec!["ALL"]);
        assert_eq!(spec.security_opt, vec!["no-new-privileges"]);
        assert_eq!(spec.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(spec.nano_cpus, 1_000_000_000);
    }

    #[test]
    fn test_scratch_spec_only_adds_scratch_mount() {
        let config = SandboxConfig::default();
        let spec = ContainerSpec::scratch(&config, None, strings(&["sh"]), vec![]).unwrap();
        assert!(spec.readonly_rootfs);
        assert!(spec.network_disabled);
        assert!(spec.tmpfs.contains_key(SCRATCH_DIR));
        assert_eq!(spec.working_dir, SCRATCH_DIR);
        assert!(spec.binds.is_empty());
    }

    #[tokio::test]
    async fn test_disallowed_tool_never_reaches_runtime() {
        let runtime = Arc::new(MockRuntime::with_stdout("should not run"));
        let exec = executor(runtime.clone());
        let dir = tempfile::tempdir().unwrap();

        for tool in ["bash", "/bin/sh", "rm", "python"] {
            let result = exec.run(tool, &strings(&["-c", "id"]), dir.path()).await;
            assert_eq!(result.exit_code, 1);
            assert_eq!(result.outcome, ExecutionOutcome::Rejected);
            assert_eq!(result.stderr, format!("Tool not allowed: {}", tool));
            assert!(result.is_error());
        }
        assert_eq!(runtime.launch_count(), 0);
        assert_eq!(*runtime.image_checks.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_allowed_tool_runs_base_name_with_sanitized_args() {
        let runtime = Arc::new(MockRuntime::with_stdout("ELF 64-bit"));
        let exec = executor(runtime.clone());
        let dir = tempfile::tempdir().unwrap();

        let result = exec
            .run("/usr/bin/file", &strings(&["../chall.bin", "&&", "ls"]), dir.path())
            .await;
        assert_eq!(result.outcome, ExecutionOutcome::Completed);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "ELF 64-bit");
        assert_eq!(result.output_hash.as_deref(), Some(output_hash(b"ELF 64-bit").as_str()));

        let spec = runtime.last_spec().unwrap();
        assert_eq!(spec.cmd, vec!["file", "chall.bin", "ls"]);
        assert!(spec.binds[0].ends_with(":/workspace:ro"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_completed_result() {
        let runtime = Arc::new(MockRuntime::with_response(|_| {
            Ok(ContainerOutput {
                exit_code: 2,
                stderr: b"No such file".to_vec(),
                ..Default::default()
            })
        }));
        let dir = tempfile::tempdir().unwrap();
        let result = executor(runtime).run("cat", &strings(&["missing"]), dir.path()).await;
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.outcome, ExecutionOutcome::Completed);
        assert!(!result.is_error());
        assert_eq!(result.stderr, "No such file");
    }

    #[tokio::test]
    async fn test_missing_image_skips_launch() {
        let mut runtime = MockRuntime::with_stdout("");
        runtime.image_present = false;
        let runtime = Arc::new(runtime);
        let dir = tempfile::tempdir().unwrap();
        let result = executor(runtime.clone()).run("file", &[], dir.path()).await;
        assert_eq!(result.outcome, ExecutionOutcome::ImageMissing);
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("ctf-triage-sandbox:latest"));
        assert_eq!(runtime.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_and_launch_faults_are_distinguishable() {
        let dir = tempfile::tempdir().unwrap();

        let runtime = Arc::new(MockRuntime::with_response(|_| Err(SandboxError::TimedOut { secs: 60 })));
        let result = executor(runtime).run("strings", &[], dir.path()).await;
        assert_eq!(result.outcome, ExecutionOutcome::TimedOut);

        let runtime = Arc::new(MockRuntime::with_response(|_| {
            Err(SandboxError::LaunchFailed("no such device".into()))
        }));
        let result = executor(runtime).run("strings", &[], dir.path()).await;
        assert_eq!(result.outcome, ExecutionOutcome::IsolationFault);
        assert!(result.stderr.contains("no such device"));
    }

    #[tokio::test]
    async fn test_oom_kill_is_isolation_fault_with_output_kept() {
        let runtime = Arc::new(MockRuntime::with_response(|_| {
            Ok(ContainerOutput {
                exit_code: 137,
                stdout: b"partial".to_vec(),
                oom_killed: true,
                ..Default::default()
            })
        }));
        let dir = tempfile::tempdir().unwrap();
        let result = executor(runtime).run("binwalk", &[], dir.path()).await;
        assert_eq!(result.outcome, ExecutionOutcome::IsolationFault);
        assert_eq!(result.stdout, "partial");
        assert!(result.stderr.contains("memory limit"));
    }

    #[tokio::test]
    async fn test_missing_working_dir_is_isolation_fault() {
        let runtime = Arc::new(MockRuntime::with_stdout(""));
        let result = executor(runtime.clone())
            .run("file", &[], Path::new("/definitely/not/here"))
            .await;
        assert_eq!(result.outcome, ExecutionOutcome::IsolationFault);
        assert_eq!(runtime.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_script_uses_wheel_cache_and_caps_timeout() {
        let runtime = Arc::new(MockRuntime::with_stdout("42\n"));
        let exec = executor(runtime.clone());
        let request = ScriptRequest {
            script: "print(6*7)".into(),
            packages: strings(&["pwntools", "x; curl evil"]),
            timeout_secs: Some(10_000),
        };
        let result = exec.run_script(&request, None).await;
        assert_eq!(result.stdout, "42\n");

        let (spec, timeout) = runtime.launches.lock().unwrap()[0].clone();
        assert_eq!(timeout, Duration::from_secs(MAX_SCRIPT_TIMEOUT_SECS));
        let shell = &spec.cmd[2];
        assert!(shell.contains("--no-index --find-links /opt/wheels pwntools xcurlevil"));
        assert!(spec.env.contains(&"TRIAGE_SCRIPT=print(6*7)".to_string()));
        assert!(spec.network_disabled);
        assert!(spec.readonly_rootfs);
    }

    #[test]
    fn test_script_command_without_packages() {
        assert_eq!(script_command(&[]), "python3 -c \"$TRIAGE_SCRIPT\"");
    }

    #[test]
    fn test_parse_scan_output() {
        let tools = parse_scan_output("strings:1\nfile:1\nzsteg:0\nbogus:1\n");
        assert_eq!(tools.len(), ALLOWED_TOOLS.len());
        assert_eq!(tools.get("strings"), Some(&true));
        assert_eq!(tools.get("zsteg"), Some(&false));
        assert_eq!(tools.get("tshark"), Some(&false));
        assert!(!tools.contains_key("bogus"));
    }

    #[tokio::test]
    async fn test_python_packages_parses_freeze_output() {
        let runtime = Arc::new(MockRuntime::with_stdout(
            "pycryptodome==3.20.0\npwntools==4.12.0\n-e git+https://x#egg=y\n",
        ));
        let packages = executor(runtime.clone()).python_packages().await.unwrap();
        assert_eq!(
            packages,
            vec![
                PythonPackage { name: "pycryptodome".into(), version: "3.20.0".into() },
                PythonPackage { name: "pwntools".into(), version: "4.12.0".into() },
            ]
        );
        let spec = runtime.last_spec().unwrap();
        assert!(spec.network_disabled);
        assert!(spec.binds.is_empty());
        assert_eq!(spec.cmd[..3], ["python3", "-m", "pip"]);
    }

    #[tokio::test]
    async fn test_python_packages_reports_missing_image() {
        let mut runtime = MockRuntime::with_stdout("");
        runtime.image_present = false;
        let runtime = Arc::new(runtime);
        let err = executor(runtime.clone()).python_packages().await.unwrap_err();
        assert!(matches!(err, SandboxError::ImageMissing { .. }));
        assert_eq!(runtime.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_tool_availability_is_cached_until_refresh() {
        let runtime = Arc::new(MockRuntime::with_stdout("strings:1\nfile:1\n"));
        let exec = executor(runtime.clone());

        let first = exec.tool_availability(false).await;
        assert!(!first.cached);
        assert_eq!(first.summary.available, 2);
        assert_eq!(first.summary.total, ALLOWED_TOOLS.len());

        let second = exec.tool_availability(false).await;
        assert!(second.cached);
        assert_eq!(second.checked_at, first.checked_at);
        assert_eq!(runtime.launch_count(), 1);

        let forced = exec.tool_availability(true).await;
        assert!(!forced.cached);
        assert_eq!(runtime.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_scan_reports_nothing_and_is_not_cached() {
        let mut runtime = MockRuntime::with_stdout("");
        runtime.image_present = false;
        let runtime = Arc::new(runtime);
        let exec = executor(runtime.clone());

        let report = exec.tool_availability(false).await;
        assert_eq!(report.summary.available, 0);
        assert!(!report.cached);
        let again = exec.tool_availability(false).await;
        assert!(!again.cached);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_scans() {
        let cache = ToolAvailabilityCache::new(Duration::ZERO);
        let mut scans = 0;
        for _ in 0..3 {
            cache
                .get_or_scan(false, || {
                    scans += 1;
                    async { Ok(BTreeMap::new()) }
                })
                .await;
        }
        assert_eq!(scans, 3);
    }
}
