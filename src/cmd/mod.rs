//! CLI command implementations.
//!
//! | Module     | Commands handled                  |
//! |------------|-----------------------------------|
//! | `serve`    | `Serve`                           |
//! | `config`   | `Init`, `Config`                  |
//! | `catalog`  | `Playbooks`, `Classify`, `Tools`  |

pub mod catalog;
pub mod config;
pub mod serve;

pub use catalog::{cmd_classify, cmd_playbooks, cmd_tools};
pub use config::{cmd_config, cmd_init};
pub use serve::cmd_serve;

use ctf_triage::config::{CliOverrides, TriageConfig};

use super::Cli;

/// Resolve configuration with the global CLI flags applied.
fn load_config(cli: &Cli, port: Option<u16>) -> anyhow::Result<TriageConfig> {
    TriageConfig::load(CliOverrides {
        data_dir: cli.data_dir.clone(),
        port,
    })
}
