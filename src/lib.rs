pub mod config;
pub mod errors;
pub mod triage;
pub mod util;
