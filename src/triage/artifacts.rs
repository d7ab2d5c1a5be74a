//! Read-only views over a job's run directory: workspace files, the
//! artifact listing and the downloadable bundle.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use walkdir::WalkDir;

use super::orchestrator::{EXTRACTED_DIR, INPUT_DIR};
use crate::util::output_hash;

/// Files at or above this size are listed without a hash.
const MAX_HASHED_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ArtifactInfo {
    pub path: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub hash: Option<String>,
}

/// Regular files under `dir`, as `/`-joined paths relative to it, sorted.
fn relative_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("{} escaped {}", entry.path().display(), dir.display()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((name, entry.into_path()));
    }
    Ok(files)
}

/// Files a terminal command can name: top-level inputs plus everything
/// under `extracted/`, prefixed with that directory.
pub fn workspace_files(job_dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let input = job_dir.join(INPUT_DIR);
    if input.is_dir() {
        for entry in std::fs::read_dir(&input).with_context(|| format!("Failed to list {}", input.display()))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        files.sort();
    }
    for (name, _) in relative_files(&job_dir.join(EXTRACTED_DIR))? {
        files.push(format!("{}/{}", EXTRACTED_DIR, name));
    }
    Ok(files)
}

/// Every file in the run directory with size, guessed type and a hash
/// for anything under [`MAX_HASHED_BYTES`].
pub fn list_artifacts(job_dir: &Path) -> Result<Vec<ArtifactInfo>> {
    let mut artifacts = Vec::new();
    for (path, full) in relative_files(job_dir)? {
        let size = std::fs::metadata(&full)
            .with_context(|| format!("Failed to stat {}", full.display()))?
            .len();
        let hash = if size < MAX_HASHED_BYTES {
            let bytes = std::fs::read(&full).with_context(|| format!("Failed to read {}", full.display()))?;
            Some(output_hash(&bytes))
        } else {
            None
        };
        artifacts.push(ArtifactInfo {
            mime_type: mime_guess::from_path(&full).first_or_octet_stream().to_string(),
            path,
            size,
            hash,
        });
    }
    Ok(artifacts)
}

/// Gzipped tar of the whole run directory, paths relative to it.
pub fn bundle(job_dir: &Path) -> Result<Vec<u8>> {
    let gz = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(gz);
    for (path, full) in relative_files(job_dir)? {
        let mut file = std::fs::File::open(&full).with_context(|| format!("Failed to open {}", full.display()))?;
        tar.append_file(&path, &mut file)
            .with_context(|| format!("Failed to add {} to bundle", path))?;
    }
    let gz = tar.into_inner().context("Failed to finish bundle")?;
    gz.finish().context("Failed to compress bundle")
}
