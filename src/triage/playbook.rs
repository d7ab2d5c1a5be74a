//! Static playbook catalog.
//!
//! A playbook is chosen from the challenge's file names alone. Categories are
//! checked in a fixed precedence order and the first match wins, so a
//! `capture.pcap` next to `notes.txt` still gets the network playbook.

use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Argument token that expands to every regular file in the working directory.
pub const FILES_PLACEHOLDER: &str = "{files}";

/// Challenge category, declared in selection precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Network,
    Document,
    Binary,
    Reversing,
    ImageStego,
    AudioStego,
    Archive,
    Memory,
    Crypto,
    Web,
    Keyword,
    Default,
}

impl Category {
    /// Total selection order. `Default` always matches and is last.
    pub const PRECEDENCE: [Category; 12] = [
        Category::Network,
        Category::Document,
        Category::Binary,
        Category::Reversing,
        Category::ImageStego,
        Category::AudioStego,
        Category::Archive,
        Category::Memory,
        Category::Crypto,
        Category::Web,
        Category::Keyword,
        Category::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Document => "document",
            Self::Binary => "binary",
            Self::Reversing => "reversing",
            Self::ImageStego => "image_stego",
            Self::AudioStego => "audio_stego",
            Self::Archive => "archive",
            Self::Memory => "memory",
            Self::Crypto => "crypto",
            Self::Web => "web",
            Self::Keyword => "keyword",
            Self::Default => "default",
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Network => &[".pcap", ".pcapng", ".cap"],
            Self::Document => &[".pdf", ".doc", ".docx", ".odt", ".rtf"],
            Self::Binary => &[".elf", ".exe", ".bin", ".so", ".dll", ".out"],
            Self::Reversing => &[".pyc", ".class", ".jar", ".apk", ".dex", ".wasm"],
            Self::ImageStego => &[".png", ".jpg", ".jpeg", ".gif", ".bmp", ".tiff", ".webp"],
            Self::AudioStego => &[".wav", ".mp3", ".flac", ".ogg"],
            Self::Archive => &[
                ".zip", ".tar", ".gz", ".tgz", ".bz2", ".xz", ".7z", ".rar", ".dd", ".img", ".e01",
            ],
            Self::Memory => &[".mem", ".vmem", ".raw", ".dmp", ".dump", ".lime"],
            Self::Crypto => &[".enc", ".gpg", ".asc", ".pem", ".key", ".aes", ".rsa", ".pub", ".crt"],
            Self::Web => &[".html", ".htm", ".php", ".js", ".css", ".sql", ".jsp", ".asp"],
            Self::Keyword | Self::Default => &[],
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name fragments that mark a file as worth a closer look when no
/// extension matched.
const KEYWORDS: [&str; 4] = ["flag", "cipher", "secret", "encrypted"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub tool: String,
    pub args: Vec<String>,
}

impl Step {
    pub fn new(tool: &str, args: &[&str]) -> Result<Self> {
        if tool.trim().is_empty() {
            bail!("Playbook step has an empty tool name");
        }
        Ok(Self {
            tool: tool.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        })
    }

    /// Expand the argument template against the files present right now.
    ///
    /// `{files}` becomes every entry of `files` in order; any other
    /// brace-delimited token is dropped.
    pub fn resolve_arguments(&self, files: &[String]) -> Vec<String> {
        let mut resolved = Vec::with_capacity(self.args.len() + files.len());
        for arg in &self.args {
            if arg == FILES_PLACEHOLDER {
                resolved.extend(files.iter().cloned());
            } else if arg.len() >= 2 && arg.starts_with('{') && arg.ends_with('}') {
                continue;
            } else {
                resolved.push(arg.clone());
            }
        }
        resolved
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    pub name: String,
    pub category: Category,
    pub steps: Vec<Step>,
}

impl Playbook {
    pub fn new(name: &str, category: Category, steps: Vec<Step>) -> Result<Self> {
        if name.trim().is_empty() {
            bail!("Playbook name must not be empty");
        }
        if steps.is_empty() {
            bail!("Playbook '{}' has no steps", name);
        }
        Ok(Self {
            name: name.to_string(),
            category,
            steps,
        })
    }
}

type StepTemplate = (&'static str, &'static [&'static str]);

fn templates(category: Category) -> &'static [StepTemplate] {
    match category {
        Category::Network => &[
            ("file", &["{files}"]),
            ("tshark", &["-r", "{files}", "-q", "-z", "io,stat,0"]),
            ("tshark", &["-r", "{files}", "-Y", "http"]),
            ("tshark", &["-r", "{files}", "-Y", "tcp.flags.syn==1"]),
            ("strings", &["{files}"]),
        ],
        Category::Document => &[
            ("file", &["{files}"]),
            ("pdfinfo", &["{files}"]),
            ("pdftotext", &["{files}", "-"]),
            ("strings", &["{files}"]),
            ("exiftool", &["{files}"]),
        ],
        Category::Binary => &[
            ("file", &["{files}"]),
            ("readelf", &["-h", "{files}"]),
            ("readelf", &["-S", "{files}"]),
            ("strings", &["-n", "8", "{files}"]),
            ("objdump", &["-d", "-M", "intel", "{files}"]),
        ],
        Category::Reversing => &[
            ("file", &["{files}"]),
            ("strings", &["-n", "6", "{files}"]),
            ("unzip", &["-l", "{files}"]),
            ("xxd", &["-l", "256", "{files}"]),
        ],
        Category::ImageStego => &[
            ("file", &["{files}"]),
            ("exiftool", &["{files}"]),
            ("binwalk", &["{files}"]),
            ("strings", &["{files}"]),
            ("xxd", &["-l", "512", "{files}"]),
        ],
        Category::AudioStego => &[
            ("file", &["{files}"]),
            ("exiftool", &["{files}"]),
            ("ffprobe", &["{files}"]),
            ("binwalk", &["{files}"]),
            ("strings", &["{files}"]),
        ],
        Category::Archive => &[
            ("file", &["{files}"]),
            ("unzip", &["-l", "{files}"]),
            ("7z", &["l", "{files}"]),
            ("strings", &["{files}"]),
        ],
        Category::Memory => &[
            ("file", &["{files}"]),
            ("strings", &["-n", "10", "{files}"]),
            ("volatility3", &["-f", "{files}", "windows.info"]),
        ],
        Category::Crypto => &[
            ("file", &["{files}"]),
            ("cat", &["{files}"]),
            ("base64", &["-d", "{files}"]),
            ("xxd", &["-l", "256", "{files}"]),
        ],
        Category::Web => &[
            ("file", &["{files}"]),
            ("cat", &["{files}"]),
            ("grep", &["-n", "-i", "flag", "{files}"]),
            ("strings", &["{files}"]),
        ],
        Category::Keyword => &[
            ("file", &["{files}"]),
            ("cat", &["{files}"]),
            ("strings", &["{files}"]),
            ("base64", &["-d", "{files}"]),
            ("xxd", &["-l", "256", "{files}"]),
        ],
        Category::Default => &[
            ("file", &["{files}"]),
            ("strings", &["-n", "8", "{files}"]),
            ("xxd", &["-l", "256", "{files}"]),
            ("sha256sum", &["{files}"]),
        ],
    }
}

/// Registry of the built-in playbooks.
///
/// Pure: selection looks only at the names it is handed.
#[derive(Debug, Clone)]
pub struct PlaybookCatalog {
    playbooks: Vec<Playbook>,
}

impl PlaybookCatalog {
    pub fn builtin() -> Result<Self> {
        let mut playbooks = Vec::with_capacity(Category::PRECEDENCE.len());
        for category in Category::PRECEDENCE {
            let steps = templates(category)
                .iter()
                .map(|(tool, args)| Step::new(tool, args))
                .collect::<Result<Vec<_>>>()?;
            playbooks.push(Playbook::new(category.as_str(), category, steps)?);
        }
        Ok(Self { playbooks })
    }

    pub fn get(&self, category: Category) -> Option<&Playbook> {
        self.playbooks.iter().find(|p| p.category == category)
    }

    pub fn playbooks(&self) -> &[Playbook] {
        &self.playbooks
    }

    pub fn select_playbook(&self, file_names: &[String]) -> Playbook {
        let category = classify(file_names);
        self.get(category)
            .or_else(|| self.get(Category::Default))
            .cloned()
            .unwrap_or_else(|| Playbook {
                name: Category::Default.as_str().to_string(),
                category: Category::Default,
                steps: Vec::new(),
            })
    }
}

/// Lower-cased suffix including the dot, e.g. `".pcapng"`.
fn suffix(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
}

/// Map a set of file names to the highest-precedence matching category.
pub fn classify(file_names: &[String]) -> Category {
    let suffixes: Vec<String> = file_names.iter().filter_map(|n| suffix(n)).collect();
    for category in Category::PRECEDENCE {
        match category {
            Category::Keyword => {
                let hit = file_names.iter().any(|name| {
                    let lower = name.to_lowercase();
                    KEYWORDS.iter().any(|k| lower.contains(k))
                });
                if hit {
                    return category;
                }
            }
            Category::Default => return category,
            _ => {
                if suffixes
                    .iter()
                    .any(|s| category.extensions().contains(&s.as_str()))
                {
                    return category;
                }
            }
        }
    }
    Category::Default
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_builtin_catalog_covers_every_category() {
        let catalog = PlaybookCatalog::builtin().unwrap();
        assert_eq!(catalog.playbooks().len(), Category::PRECEDENCE.len());
        for category in Category::PRECEDENCE {
            let playbook = catalog.get(category).expect("playbook for category");
            assert!(!playbook.steps.is_empty());
        }
    }

    #[test]
    fn test_pcapng_selects_network_with_file_first() {
        let catalog = PlaybookCatalog::builtin().unwrap();
        let playbook = catalog.select_playbook(&names(&["capture.pcapng"]));
        assert_eq!(playbook.name, "network");
        let first = &playbook.steps[0];
        assert_eq!(first.tool, "file");
        assert_eq!(
            first.resolve_arguments(&names(&["capture.pcapng"])),
            vec!["capture.pcapng"]
        );
    }

    #[test]
    fn test_network_wins_over_text_notes() {
        assert_eq!(classify(&names(&["capture.pcap"])), Category::Network);
        assert_eq!(classify(&names(&["capture.pcap", "notes.txt"])), Category::Network);
    }

    #[test]
    fn test_suffix_match_is_case_insensitive() {
        assert_eq!(classify(&names(&["REPORT.PDF"])), Category::Document);
        assert_eq!(classify(&names(&["Photo.JpG"])), Category::ImageStego);
    }

    #[test]
    fn test_precedence_order_between_categories() {
        assert_eq!(classify(&names(&["doc.pdf", "cap.pcap"])), Category::Network);
        assert_eq!(classify(&names(&["chall.elf", "doc.pdf"])), Category::Document);
        assert_eq!(classify(&names(&["app.jar", "chall.bin"])), Category::Binary);
        assert_eq!(classify(&names(&["a.png", "b.pyc"])), Category::Reversing);
        assert_eq!(classify(&names(&["a.wav", "b.png"])), Category::ImageStego);
        assert_eq!(classify(&names(&["a.zip", "b.wav"])), Category::AudioStego);
        assert_eq!(classify(&names(&["a.vmem", "b.zip"])), Category::Archive);
        assert_eq!(classify(&names(&["a.pem", "b.vmem"])), Category::Memory);
        assert_eq!(classify(&names(&["a.html", "b.pem"])), Category::Crypto);
    }

    #[test]
    fn test_extension_beats_keyword() {
        // An image named "secret" is still an image challenge.
        assert_eq!(classify(&names(&["secret.png"])), Category::ImageStego);
    }

    #[test]
    fn test_keyword_fallback_and_default() {
        assert_eq!(classify(&names(&["Encrypted_message.txt"])), Category::Keyword);
        assert_eq!(classify(&names(&["my_flag"])), Category::Keyword);
        assert_eq!(classify(&names(&["notes.txt"])), Category::Default);
        assert_eq!(classify(&[]), Category::Default);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let catalog = PlaybookCatalog::builtin().unwrap();
        let files = names(&["dump.raw", "readme.md"]);
        let first = catalog.select_playbook(&files);
        for _ in 0..5 {
            assert_eq!(catalog.select_playbook(&files), first);
        }
        assert_eq!(first.name, "memory");
    }

    #[test]
    fn test_resolve_expands_files_and_drops_unknown_placeholders() {
        let step = Step::new("strings", &["-n", "8", "{files}", "{output_dir}"]).unwrap();
        let resolved = step.resolve_arguments(&names(&["a.bin", "b.bin"]));
        assert_eq!(resolved, vec!["-n", "8", "a.bin", "b.bin"]);
    }

    #[test]
    fn test_resolve_with_no_files_drops_placeholder() {
        let step = Step::new("file", &["{files}"]).unwrap();
        assert!(step.resolve_arguments(&[]).is_empty());
    }

    #[test]
    fn test_malformed_shapes_rejected_at_construction() {
        assert!(Step::new("  ", &[]).is_err());
        assert!(Playbook::new("", Category::Default, vec![]).is_err());
        assert!(Playbook::new("empty", Category::Default, vec![]).is_err());
    }
}
