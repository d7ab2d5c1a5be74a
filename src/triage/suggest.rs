//! Next-step suggestions for an interactive analysis session.
//!
//! `LlmSuggester` asks a chat model; `RuleBasedSuggester` is the offline
//! analyst. `suggest_with_fallback` picks the rule-based path on the
//! failure variant the model call returns.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::llm::{ChatClient, Sampling};
use crate::errors::LlmError;
use crate::util::{extract_json_object, truncate_chars};

/// Attempts after which the analyst stops asking for more.
pub const MAX_ATTEMPTS: u32 = 50;
const MAX_NEXT_COMMANDS: usize = 3;
const HISTORY_WINDOW: usize = 10;
const HISTORY_STDOUT_CHARS: usize = 1500;
const HISTORY_STDERR_CHARS: usize = 500;
const UNPARSED_ANALYSIS_CHARS: usize = 500;

const SUGGEST_SAMPLING: Sampling = Sampling {
    temperature: 0.2,
    max_tokens: 1500,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tool: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestRequest {
    pub files: Vec<String>,
    #[serde(default)]
    pub command_history: Vec<HistoryEntry>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_flag_hint")]
    pub flag_format: String,
    #[serde(default = "default_category")]
    pub current_category: String,
    #[serde(default = "default_attempt")]
    pub attempt_number: u32,
}

fn default_flag_hint() -> String {
    "CTF{...}".to_string()
}

fn default_category() -> String {
    "unknown".to_string()
}

fn default_attempt() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextCommand {
    pub tool: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub analysis: String,
    pub category: String,
    pub confidence: f64,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub next_commands: Vec<NextCommand>,
    #[serde(default)]
    pub flag_candidates: Vec<String>,
    #[serde(default = "default_continue")]
    pub should_continue: bool,
    #[serde(default)]
    pub rule_based: bool,
    #[serde(default)]
    pub parse_error: bool,
}

fn default_continue() -> bool {
    true
}

#[async_trait]
pub trait Suggester: Send + Sync {
    async fn suggest(&self, request: &SuggestRequest) -> Result<Suggestion, LlmError>;
}

/// Ask `primary`, falling back to the rule-based analyst on any failure.
pub async fn suggest_with_fallback(
    primary: &dyn Suggester,
    fallback: &RuleBasedSuggester,
    request: &SuggestRequest,
) -> Suggestion {
    match primary.suggest(request).await {
        Ok(suggestion) => suggestion,
        Err(LlmError::Disabled) => fallback.analyze(request, None),
        Err(e) => {
            tracing::warn!(error = %e, "Suggestion model failed, using rule-based analysis");
            fallback.analyze(request, Some(&e.to_string()))
        }
    }
}

// ── Model-backed suggester ──────────────────────────────────────────

const ANALYST_SYSTEM_PROMPT: &str = r#"You are an expert CTF (Capture The Flag) analyst. Your job is to analyze command outputs and determine the best next steps to find the flag.

CRITICAL RULES:
1. Always suggest concrete, executable commands with exact arguments
2. Base suggestions on actual output patterns you observe
3. Focus on finding the flag - look for patterns like CTF{}, FLAG{}, flag{}, etc.
4. If you see encoded data, suggest decoding steps
5. If you see files within files, suggest extraction
6. Be persistent - errors just mean try another approach
7. Consider what category the challenge is (crypto, forensics, pwn, web, stego, reversing)

Your response MUST be valid JSON with this exact structure:
{
  "analysis": "Brief analysis of what you see in the outputs",
  "category": "detected challenge category (binary|crypto|forensics|network|stego|web|misc)",
  "confidence": 0.0-1.0,
  "findings": ["list of interesting findings"],
  "next_commands": [
    {"tool": "command_name", "args": ["arg1", "arg2"], "reason": "why this command helps"}
  ],
  "flag_candidates": ["any potential flags found"],
  "should_continue": true/false
}"#;

pub struct LlmSuggester {
    client: ChatClient,
}

impl LlmSuggester {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Suggester for LlmSuggester {
    async fn suggest(&self, request: &SuggestRequest) -> Result<Suggestion, LlmError> {
        if !self.client.enabled() {
            return Err(LlmError::Disabled);
        }
        let reply = self
            .client
            .complete(ANALYST_SYSTEM_PROMPT, &user_prompt(request), SUGGEST_SAMPLING)
            .await?;
        Ok(parse_suggestion(&reply))
    }
}

fn user_prompt(request: &SuggestRequest) -> String {
    let files: Vec<String> = request.files.iter().map(|f| format!("- {}", f)).collect();
    format!(
        "Analyze these CTF challenge outputs and suggest next steps.

## Files in workspace:
{files}

## Previous command outputs (most recent first):
{history}

## What we know so far:
- Challenge description: {description}
- Expected flag format: {flag_format}
- Current detected category: {category}
- Attempt number: {attempt}

Analyze the outputs and suggest 1-3 specific commands to try next. Focus on finding the flag.",
        files = files.join("\n"),
        history = format_history(&request.command_history),
        description = if request.description.is_empty() {
            "No description provided"
        } else {
            &request.description
        },
        flag_format = request.flag_format,
        category = request.current_category,
        attempt = request.attempt_number,
    )
}

fn format_history(history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return "No commands executed yet.".to_string();
    }
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    history[start..]
        .iter()
        .map(|cmd| {
            let stdout = truncate_chars(&cmd.stdout, HISTORY_STDOUT_CHARS);
            let mut section = format!(
                "### Command: {} {}\nExit code: {}\n\nOutput:\n```\n{}\n```",
                cmd.tool,
                cmd.args.join(" "),
                cmd.exit_code
                    .map_or_else(|| "unknown".to_string(), |c| c.to_string()),
                if stdout.is_empty() { "(no output)" } else { stdout },
            );
            if !cmd.stderr.is_empty() {
                section.push_str(&format!(
                    "\nStderr:\n```\n{}\n```",
                    truncate_chars(&cmd.stderr, HISTORY_STDERR_CHARS)
                ));
            }
            section
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Parse the model reply, degrading to a `parse_error` suggestion carrying
/// the raw text.
pub fn parse_suggestion(reply: &str) -> Suggestion {
    if let Some(json) = extract_json_object(reply)
        && let Ok(parsed) = serde_json::from_str::<Suggestion>(&json)
    {
        return parsed;
    }
    Suggestion {
        analysis: truncate_chars(reply, UNPARSED_ANALYSIS_CHARS).to_string(),
        category: "unknown".to_string(),
        confidence: 0.3,
        findings: vec![],
        next_commands: vec![],
        flag_candidates: vec![],
        should_continue: true,
        rule_based: false,
        parse_error: true,
    }
}

// ── Rule-based analyst ──────────────────────────────────────────────

static FLAG_SHAPES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"[A-Z]{2,10}\{[^}]{1,100}\}", r"flag\{[^}]+\}", r"CTF\{[^}]+\}"]
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .expect("flag shape is a valid regex")
        })
        .collect()
});
static BASE64_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[A-Za-z0-9+/]{20,}={0,2}$").expect("base64 line is a valid regex")
});

#[derive(Debug, Default, Clone)]
pub struct RuleBasedSuggester;

impl RuleBasedSuggester {
    pub fn analyze(&self, request: &SuggestRequest, error: Option<&str>) -> Suggestion {
        let mut findings = Vec::new();
        let mut flags = BTreeSet::new();

        for cmd in &request.command_history {
            let output = &cmd.stdout;
            let lower = output.to_lowercase();
            for shape in FLAG_SHAPES.iter() {
                flags.extend(shape.find_iter(output).map(|m| m.as_str().to_string()));
            }
            if lower.contains("base64") || BASE64_LINE.is_match(output) {
                findings.push("Detected base64 encoded data".to_string());
            }
            if lower.contains("password") {
                findings.push("Found password reference".to_string());
            }
            if lower.contains("hidden") {
                findings.push("Found 'hidden' keyword".to_string());
            }
        }

        let mut next_commands = next_commands_for(&request.current_category, &request.files);
        next_commands.truncate(MAX_NEXT_COMMANDS);

        Suggestion {
            analysis: format!(
                "Rule-based analysis (LLM unavailable: {})",
                error.unwrap_or("not configured")
            ),
            category: request.current_category.clone(),
            confidence: 0.5,
            findings,
            next_commands,
            should_continue: request.attempt_number < MAX_ATTEMPTS && flags.is_empty(),
            flag_candidates: flags.into_iter().collect(),
            rule_based: true,
            parse_error: false,
        }
    }
}

#[async_trait]
impl Suggester for RuleBasedSuggester {
    async fn suggest(&self, request: &SuggestRequest) -> Result<Suggestion, LlmError> {
        Ok(self.analyze(request, None))
    }
}

fn next_commands_for(category: &str, files: &[String]) -> Vec<NextCommand> {
    let Some(target) = files.first() else {
        return Vec::new();
    };
    let cmd = |tool: &str, args: &[&str], reason: &str| NextCommand {
        tool: tool.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        reason: reason.to_string(),
    };
    let t = target.as_str();
    let has_image = files.iter().any(|f| {
        let lower = f.to_lowercase();
        [".png", ".jpg", ".jpeg"].iter().any(|ext| lower.ends_with(ext))
    });

    if category == "stego" || has_image {
        vec![
            cmd("zsteg", &["-a", t], "Check LSB steganography"),
            cmd("steghide", &["extract", "-sf", t, "-p", ""], "Try empty password"),
            cmd("exiftool", &["-a", "-u", t], "Check all metadata"),
        ]
    } else if category == "binary" {
        let file_arg = format!("--file={}", t);
        vec![
            cmd("checksec", &[file_arg.as_str()], "Check binary protections"),
            cmd("radare2", &["-qc", "aaa;afl", t], "Analyze functions"),
            cmd("strings", &["-n", "10", t], "Extract longer strings"),
        ]
    } else if category == "crypto" {
        vec![
            cmd("base64", &["-d", t], "Try base64 decode"),
            cmd("xxd", &[t], "View hex dump"),
            cmd("openssl", &["enc", "-d", "-aes-256-cbc", "-in", t], "Try common decryption"),
        ]
    } else {
        vec![
            cmd("strings", &["-n", "8", t], "Extract strings"),
            cmd("binwalk", &["-e", t], "Extract embedded files"),
            cmd("grep", &["-aoE", r"[A-Z]{2,10}\{[^}]+\}", t], "Search for flag pattern"),
        ]
    }
}

// ── Category detection ──────────────────────────────────────────────

struct CategorySignals {
    name: &'static str,
    file_signatures: &'static [&'static str],
    extensions: &'static [&'static str],
    strings_hints: &'static [&'static str],
}

const CATEGORY_SIGNALS: &[CategorySignals] = &[
    CategorySignals {
        name: "binary",
        file_signatures: &["ELF", "PE32", "Mach-O", "executable"],
        extensions: &[".elf", ".exe", ".out", ".bin", ".dll", ".so"],
        strings_hints: &["GLIBC", "libc", "main", "printf", "scanf", "gets", "strcpy"],
    },
    CategorySignals {
        name: "crypto",
        file_signatures: &["PGP", "GPG", "encrypted"],
        extensions: &[".enc", ".gpg", ".aes", ".rsa", ".pem", ".key"],
        strings_hints: &["BEGIN RSA", "BEGIN PGP", "AES", "RSA", "cipher", "hash"],
    },
    CategorySignals {
        name: "forensics",
        file_signatures: &["data", "archive", "filesystem"],
        extensions: &[".dd", ".img", ".raw", ".dump", ".mem", ".vmem"],
        strings_hints: &["MFT", "NTFS", "FAT32", "ext4", "inode"],
    },
    CategorySignals {
        name: "network",
        file_signatures: &["pcap", "tcpdump", "Wireshark"],
        extensions: &[".pcap", ".pcapng", ".cap"],
        strings_hints: &["HTTP", "TCP", "UDP", "GET", "POST", "User-Agent"],
    },
    CategorySignals {
        name: "stego",
        file_signatures: &["image", "PNG", "JPEG", "GIF", "BMP", "audio", "WAVE"],
        extensions: &[".png", ".jpg", ".jpeg", ".gif", ".bmp", ".wav", ".mp3"],
        strings_hints: &["IHDR", "IDAT", "IEND", "JFIF", "Exif"],
    },
    CategorySignals {
        name: "web",
        file_signatures: &["HTML", "text"],
        extensions: &[".html", ".php", ".js", ".css", ".sql"],
        strings_hints: &["DOCTYPE", "script", "SELECT", "INSERT", "WHERE"],
    },
    CategorySignals {
        name: "misc",
        file_signatures: &[],
        extensions: &[".txt", ".py", ".java", ".c", ".cpp"],
        strings_hints: &[],
    },
];

/// Score each category from extensions (+2), `file` output (+1.5 per
/// signature) and strings hits (+0.5 per hint). Returns the best category
/// and a confidence of score / 10, capped at 1. Earlier categories win ties.
pub fn detect_category(
    files: &[String],
    file_outputs: &HashMap<String, String>,
    strings_outputs: &HashMap<String, String>,
) -> (String, f64) {
    let mut scores = vec![0.0_f64; CATEGORY_SIGNALS.len()];

    for name in files {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();
        let file_output = file_outputs
            .get(name)
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        let strings_output = strings_outputs.get(name).map(String::as_str).unwrap_or("");

        for (score, signals) in scores.iter_mut().zip(CATEGORY_SIGNALS) {
            if signals.extensions.contains(&ext.as_str()) {
                *score += 2.0;
            }
            for sig in signals.file_signatures {
                if file_output.contains(&sig.to_lowercase()) {
                    *score += 1.5;
                }
            }
            for hint in signals.strings_hints {
                if strings_output.contains(hint) {
                    *score += 0.5;
                }
            }
        }
    }

    let mut best = 0;
    for (i, score) in scores.iter().enumerate() {
        if *score > scores[best] {
            best = i;
        }
    }
    if scores[best] <= 0.0 {
        return ("misc".to_string(), 0.3);
    }
    (
        CATEGORY_SIGNALS[best].name.to_string(),
        (scores[best] / 10.0).min(1.0),
    )
}
