//! Report generation from a bounded evidence pack.
//!
//! A generator only sees the `EvidencePack` and returns raw text. The
//! orchestrator runs every result through [`validate_citations`], so
//! citations of unknown steps are called out in an appended warning block
//! whichever generator produced them.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;

use super::evidence::{Candidate, EvidencePack, PackCommand};
use super::llm::{ChatClient, Sampling};
use crate::errors::LlmError;
use crate::util::truncate_chars;

pub const REPORT_FILE: &str = "report.md";

const CANDIDATE_CONTEXT_CHARS: usize = 200;
const REPORT_SAMPLING: Sampling = Sampling {
    temperature: 0.3,
    max_tokens: 4000,
};

static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cmd_\d+").expect("citation pattern is a valid regex"));

const SYSTEM_PROMPT: &str = "You are a professional CTF writeup generator. You create clear, technical writeups based ONLY on the provided evidence.

CRITICAL RULES:
1. You MUST only reference commands and outputs from the evidence pack provided
2. You MUST NOT invent or assume any commands, tools, or outputs not in the evidence
3. Every claim MUST cite the specific command_id from the evidence
4. If the flag is not definitively found, say so clearly
5. Use markdown formatting for readability

Your writeup should follow this structure:
- **Overview**: Brief challenge description
- **Reconnaissance**: Initial analysis steps taken (cite command_ids)
- **Analysis Steps**: Detailed walkthrough with evidence
- **Findings**: Key discoveries with citations
- **Flag Candidates**: List candidates with confidence and evidence
- **Reproduction Steps**: How to reproduce the analysis";

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(
        &self,
        title: &str,
        description: &str,
        pack: &EvidencePack,
    ) -> Result<String, LlmError>;
}

/// Chat-completions backed writeup generator.
pub struct LlmReportGenerator {
    client: ChatClient,
}

impl LlmReportGenerator {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReportGenerator for LlmReportGenerator {
    async fn generate(
        &self,
        title: &str,
        description: &str,
        pack: &EvidencePack,
    ) -> Result<String, LlmError> {
        if !self.client.enabled() {
            return Err(LlmError::Disabled);
        }
        let prompt = build_prompt(title, description, pack);
        tracing::info!(
            model = self.client.model(),
            commands = pack.commands.len(),
            candidates = pack.candidates.len(),
            "Requesting writeup"
        );
        self.client
            .complete(SYSTEM_PROMPT, &prompt, REPORT_SAMPLING)
            .await
    }
}

pub fn build_prompt(title: &str, description: &str, pack: &EvidencePack) -> String {
    format!(
        "Generate a professional CTF writeup based on the following evidence pack.

## Challenge Information
Title: {title}
Description:
{description}

## Evidence Pack
The following commands were executed and their outputs recorded:

{commands}

## Flag Candidates Found
{candidates}

## Instructions
1. Write a clear, professional writeup
2. Cite specific command_ids for every claim (e.g., \"Evidence: cmd_001\")
3. Do NOT mention any commands or tools not listed above
4. If candidates look valid, explain why based on the evidence
5. If no clear flag was found, explain what was discovered

Generate the writeup now:",
        commands = format_commands(&pack.commands),
        candidates = format_candidates(&pack.candidates),
    )
}

fn format_commands(commands: &[PackCommand]) -> String {
    commands
        .iter()
        .map(|cmd| {
            let mut section = format!(
                "### Command: {}\nTool: {}\nArguments: {}\nExit Code: {}\n\nOutput (truncated):\n```\n{}\n```\n",
                cmd.command_id,
                cmd.tool,
                cmd.arguments.join(" "),
                cmd.exit_code,
                if cmd.stdout_preview.is_empty() {
                    "No output"
                } else {
                    &cmd.stdout_preview
                },
            );
            if !cmd.stderr_preview.is_empty() {
                section.push_str(&format!("\nStderr:\n```\n{}\n```\n", cmd.stderr_preview));
            }
            section
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_candidates(candidates: &[Candidate]) -> String {
    if candidates.is_empty() {
        return "No flag candidates found.".to_string();
    }
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{}. **{}**\n   - Confidence: {:.2}\n   - Source: {}\n   - Evidence: {}\n   - Context: {}\n",
                i + 1,
                c.value,
                c.confidence,
                c.source,
                c.evidence_id,
                truncate_chars(&c.context, CANDIDATE_CONTEXT_CHARS),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Step identifiers cited in `text` that the pack does not contain, sorted.
pub fn unknown_citations(text: &str, pack: &EvidencePack) -> Vec<String> {
    CITATION
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|id| !pack.is_known(id))
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Append a warning block when the text cites unknown steps.
pub fn validate_citations(text: &str, pack: &EvidencePack) -> String {
    let unknown = unknown_citations(text, pack);
    if unknown.is_empty() {
        return text.to_string();
    }
    tracing::warn!(unknown = ?unknown, "Writeup cites unknown command ids");
    format!(
        "{}\n\n---\n**Warning**: This writeup may contain hallucinated command references: {}\n",
        text,
        unknown.join(", ")
    )
}

/// Deterministic report written when no generator is available.
pub fn evidence_only_report(title: &str, description: &str, pack: &EvidencePack) -> String {
    let mut out = format!("# {}\n\n", title);
    if !description.trim().is_empty() {
        out.push_str(&format!("{}\n\n", description.trim()));
    }
    out.push_str("_Automated evidence summary; no writeup model was configured._\n\n");

    out.push_str("## Commands\n\n");
    if pack.commands.is_empty() {
        out.push_str("No commands were executed.\n\n");
    }
    for cmd in &pack.commands {
        out.push_str(&format!(
            "### {}: `{} {}`\n\nExit code: {}\n\n```\n{}\n```\n\n",
            cmd.command_id,
            cmd.tool,
            cmd.arguments.join(" "),
            cmd.exit_code,
            cmd.stdout_preview.trim_end(),
        ));
    }

    out.push_str("## Flag Candidates\n\n");
    if pack.candidates.is_empty() {
        out.push_str("No flag candidates found.\n");
    }
    for c in &pack.candidates {
        out.push_str(&format!(
            "- `{}` (confidence {:.2}, {}, evidence {})\n",
            c.value, c.confidence, c.source, c.evidence_id
        ));
    }
    out
}

pub fn save_report(job_dir: &Path, text: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(job_dir)
        .with_context(|| format!("Failed to create {}", job_dir.display()))?;
    let path = job_dir.join(REPORT_FILE);
    std::fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
