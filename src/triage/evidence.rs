//! Flag-candidate extraction and the evidence files written for each run.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::sandbox::ExecutionOutcome;
use crate::util::{truncate_bytes, truncate_chars};

/// Always applied, in this order, after any custom pattern.
pub const DEFAULT_FLAG_PATTERNS: [&str; 4] = [
    r"CTF\{[^}]+\}",
    r"FLAG\{[^}]+\}",
    r"flag\{[^}]+\}",
    r"ctf\{[^}]+\}",
];

const BASE_CONFIDENCE: f64 = 0.5;
const CLEAN_TOOL_BONUS: f64 = 0.2;
const CANONICAL_SHAPE_BONUS: f64 = 0.2;
const SHORT_BODY_PENALTY: f64 = 0.2;
const LONG_BODY_PENALTY: f64 = 0.3;
const NOISY_LINE_PENALTY: f64 = 0.2;
const MIN_CONFIDENCE: f64 = 0.1;
const MAX_CONFIDENCE: f64 = 1.0;

/// Tools whose output is already decoded text.
const CLEAN_TEXT_TOOLS: [&str; 3] = ["strings", "base64", "pdftotext"];

const CONTEXT_LINES: usize = 2;
const CONTEXT_MAX_CHARS: usize = 500;

pub const STDOUT_PREVIEW_CHARS: usize = 2000;
pub const STDERR_PREVIEW_CHARS: usize = 500;
/// Per-stream cap for outputs written to `evidence.json`.
pub const STORED_OUTPUT_BYTES: usize = 10 * 1024;

static CANONICAL_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z]+\{[a-zA-Z0-9_-]+\}$").expect("canonical flag shape is a valid regex")
});
static BRACED_BODY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^}]+)\}").expect("braced body is a valid regex"));

/// One executed playbook step as seen by extraction and reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command_id: String,
    pub tool: String,
    pub arguments: Vec<String>,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub output_hash: Option<String>,
    pub outcome: ExecutionOutcome,
    pub timestamp: String,
}

/// A matched value before it is persisted against a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub value: String,
    pub confidence: f64,
    pub source: String,
    pub evidence_id: String,
    pub context: String,
}

pub struct EvidenceExtractor {
    patterns: Vec<Regex>,
}

impl EvidenceExtractor {
    /// Build the pattern list. A custom pattern is matched case-insensitively
    /// and silently ignored when it does not compile.
    pub fn new(custom_pattern: Option<&str>) -> Self {
        let mut patterns = Vec::with_capacity(DEFAULT_FLAG_PATTERNS.len() + 1);
        if let Some(raw) = custom_pattern.filter(|p| !p.trim().is_empty()) {
            match RegexBuilder::new(raw).case_insensitive(true).build() {
                Ok(re) => patterns.push(re),
                Err(e) => tracing::debug!(pattern = raw, error = %e, "Ignoring invalid flag pattern"),
            }
        }
        for raw in DEFAULT_FLAG_PATTERNS {
            if let Ok(re) = Regex::new(raw) {
                patterns.push(re);
            }
        }
        Self { patterns }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Scan every stdout with every pattern. The first occurrence of a value
    /// wins; results come back sorted by descending confidence.
    pub fn extract(&self, outputs: &[CommandOutput]) -> Vec<Candidate> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::new();

        for output in outputs {
            for pattern in &self.patterns {
                for m in pattern.find_iter(&output.stdout) {
                    let value = m.as_str();
                    if value.is_empty() || !seen.insert(value.to_string()) {
                        continue;
                    }
                    candidates.push(Candidate {
                        value: value.to_string(),
                        confidence: score(value, &output.tool, &output.stdout),
                        source: format!("{} output", output.tool),
                        evidence_id: output.command_id.clone(),
                        context: extract_context(&output.stdout, value),
                    });
                }
            }
        }

        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        candidates
    }
}

/// Share of alphanumeric or whitespace characters in `line`.
fn readable_ratio(line: &str) -> f64 {
    let total = line.chars().count().max(1);
    let readable = line
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .count();
    readable as f64 / total as f64
}

/// Confidence in [0.1, 1.0] for `value` found in `output` from `tool`.
pub fn score(value: &str, tool: &str, output: &str) -> f64 {
    let mut confidence = BASE_CONFIDENCE;

    if CLEAN_TEXT_TOOLS.contains(&tool) {
        confidence += CLEAN_TOOL_BONUS;
    }
    if CANONICAL_SHAPE.is_match(value) {
        confidence += CANONICAL_SHAPE_BONUS;
    }
    if let Some(body) = BRACED_BODY.captures(value).and_then(|c| c.get(1)) {
        let len = body.as_str().chars().count();
        if len < 5 {
            confidence -= SHORT_BODY_PENALTY;
        } else if len > 100 {
            confidence -= LONG_BODY_PENALTY;
        }
    }
    if let Some(line) = output.split('\n').find(|line| line.contains(value))
        && readable_ratio(line) < 0.5
    {
        confidence -= NOISY_LINE_PENALTY;
    }

    confidence.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

/// Up to two lines either side of the first line holding `value`.
pub fn extract_context(output: &str, value: &str) -> String {
    let lines: Vec<&str> = output.split('\n').collect();
    let Some(idx) = lines.iter().position(|line| line.contains(value)) else {
        return String::new();
    };
    let start = idx.saturating_sub(CONTEXT_LINES);
    let end = (idx + CONTEXT_LINES + 1).min(lines.len());
    let context = lines[start..end].join("\n");
    if context.chars().count() > CONTEXT_MAX_CHARS {
        format!("{}...", truncate_chars(&context, CONTEXT_MAX_CHARS))
    } else {
        context
    }
}

// ── Evidence pack ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackCommand {
    pub command_id: String,
    pub tool: String,
    pub arguments: Vec<String>,
    pub exit_code: i64,
    pub stdout_preview: String,
    pub stderr_preview: String,
}

/// Bounded, citation-checked input for report generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidencePack {
    pub commands: Vec<PackCommand>,
    pub candidates: Vec<Candidate>,
    pub command_ids: Vec<String>,
}

impl EvidencePack {
    /// Fails when step ids repeat or a candidate cites an unknown step.
    pub fn build(outputs: &[CommandOutput], candidates: &[Candidate]) -> Result<Self> {
        let mut ids = HashSet::new();
        for output in outputs {
            if !ids.insert(output.command_id.as_str()) {
                bail!("Duplicate command id in evidence: {}", output.command_id);
            }
        }
        if let Some(orphan) = candidates
            .iter()
            .find(|c| !ids.contains(c.evidence_id.as_str()))
        {
            bail!(
                "Flag candidate {} cites unknown command {}",
                orphan.value,
                orphan.evidence_id
            );
        }

        let commands = outputs
            .iter()
            .map(|o| PackCommand {
                command_id: o.command_id.clone(),
                tool: o.tool.clone(),
                arguments: o.arguments.clone(),
                exit_code: o.exit_code,
                stdout_preview: truncate_chars(&o.stdout, STDOUT_PREVIEW_CHARS).to_string(),
                stderr_preview: truncate_chars(&o.stderr, STDERR_PREVIEW_CHARS).to_string(),
            })
            .collect();

        Ok(Self {
            commands,
            candidates: candidates.to_vec(),
            command_ids: outputs.iter().map(|o| o.command_id.clone()).collect(),
        })
    }

    pub fn is_known(&self, command_id: &str) -> bool {
        self.command_ids.iter().any(|id| id == command_id)
    }
}

// ── Files on disk ────────────────────────────────────────────────────

#[derive(Serialize)]
struct EvidenceFile<'a> {
    commands: Vec<CommandOutput>,
    total_commands: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    playbook: Option<&'a str>,
}

#[derive(Serialize)]
struct FlagsFile<'a> {
    candidates: &'a [Candidate],
    total_candidates: usize,
}

/// Write `evidence.json` and `flags.json` into `job_dir`.
pub fn save_evidence(
    job_dir: &Path,
    playbook: Option<&str>,
    outputs: &[CommandOutput],
    candidates: &[Candidate],
) -> Result<()> {
    std::fs::create_dir_all(job_dir)
        .with_context(|| format!("Failed to create {}", job_dir.display()))?;

    let bounded: Vec<CommandOutput> = outputs
        .iter()
        .map(|o| CommandOutput {
            stdout: truncate_bytes(&o.stdout, STORED_OUTPUT_BYTES).to_string(),
            stderr: truncate_bytes(&o.stderr, STORED_OUTPUT_BYTES).to_string(),
            ..o.clone()
        })
        .collect();
    let evidence = EvidenceFile {
        total_commands: bounded.len(),
        commands: bounded,
        playbook,
    };
    let path = job_dir.join("evidence.json");
    std::fs::write(&path, serde_json::to_string_pretty(&evidence)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    let flags = FlagsFile {
        candidates,
        total_candidates: candidates.len(),
    };
    let path = job_dir.join("flags.json");
    std::fs::write(&path, serde_json::to_string_pretty(&flags)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(())
}
