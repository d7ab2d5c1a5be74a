//! Integration tests for the ctf-triage binary
//!
//! These exercise the offline CLI surface end to end. The server itself is
//! covered by router tests inside the crate.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a ctf-triage Command isolated from the caller's environment
fn triage() -> Command {
    let mut cmd = cargo_bin_cmd!("ctf-triage");
    for var in [
        "TRIAGE_DATA_DIR",
        "TRIAGE_PORT",
        "TRIAGE_WORKERS",
        "TRIAGE_SANDBOX_IMAGE",
        "TRIAGE_SANDBOX_TIMEOUT",
        "TRIAGE_SANDBOX_MEMORY",
        "TRIAGE_SANDBOX_CPUS",
        "TRIAGE_LLM_API_KEY",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn init_data_dir(dir: &TempDir) {
    triage()
        .current_dir(dir.path())
        .arg("--data-dir")
        .arg(dir.path())
        .arg("init")
        .assert()
        .success();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        triage()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"));
    }

    #[test]
    fn test_version() {
        triage().arg("--version").assert().success();
    }

    #[test]
    fn test_classify_requires_files() {
        triage().arg("classify").assert().failure();
    }
}

// =============================================================================
// Init and Config
// =============================================================================

mod init_and_config {
    use super::*;

    #[test]
    fn test_init_creates_config_and_database() {
        let dir = TempDir::new().unwrap();

        triage()
            .current_dir(dir.path())
            .arg("--data-dir")
            .arg(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Database initialized"));

        let config = dir.path().join(".triage/triage.toml");
        assert!(config.exists());
        assert!(fs::read_to_string(&config).unwrap().contains("[sandbox]"));
        assert!(dir.path().join("triage.db").exists());
        assert!(dir.path().join("runs").is_dir());
    }

    #[test]
    fn test_second_init_needs_force() {
        let dir = TempDir::new().unwrap();
        init_data_dir(&dir);

        triage()
            .arg("--data-dir")
            .arg(dir.path())
            .arg("init")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force"));

        triage()
            .arg("--data-dir")
            .arg(dir.path())
            .args(["init", "--force"])
            .assert()
            .success();
    }

    #[test]
    fn test_config_validate_succeeds_on_template() {
        let dir = TempDir::new().unwrap();
        init_data_dir(&dir);

        triage()
            .arg("--data-dir")
            .arg(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("valid"));
    }

    #[test]
    fn test_config_show_masks_missing_key() {
        let dir = TempDir::new().unwrap();

        triage()
            .arg("--data-dir")
            .arg(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[sandbox]"))
            .stdout(predicate::str::contains("api_key = (not set)"));
    }

    #[test]
    fn test_invalid_config_fails_validation() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".triage")).unwrap();
        fs::write(
            dir.path().join(".triage/triage.toml"),
            "[queue]\nworkers = 0\n",
        )
        .unwrap();

        triage()
            .arg("--data-dir")
            .arg(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Playbooks and Tools
// =============================================================================

mod catalog {
    use super::*;

    #[test]
    fn test_playbooks_lists_network() {
        triage()
            .arg("playbooks")
            .assert()
            .success()
            .stdout(predicate::str::contains("network"))
            .stdout(predicate::str::contains("default"));
    }

    #[test]
    fn test_classify_pcapng_selects_network() {
        triage()
            .args(["classify", "capture.pcapng"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Playbook: network"))
            .stdout(predicate::str::contains("cmd_000  file capture.pcapng"));
    }

    #[test]
    fn test_tools_lists_allowlist() {
        triage()
            .arg("tools")
            .assert()
            .success()
            .stdout(predicate::str::contains("strings"))
            .stdout(predicate::str::contains("Allowlist v1"));
    }
}
