//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "sunroute", version, about = "Solar surplus router")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/sunroute.toml")]
    pub config: PathBuf,

    /// Log and report as JSON instead of pretty text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the router against a simulated house and print a summary
    Run {
        /// Simulated seconds to run; Ctrl-C stops earlier
        #[arg(long, value_name = "SECS", default_value_t = 60)]
        duration_s: u64,
        /// Solar production in watts
        #[arg(long, value_name = "WATTS", default_value_t = 2000.0)]
        solar_w: f32,
        /// House base consumption in watts
        #[arg(long, value_name = "WATTS", default_value_t = 500.0)]
        house_w: f32,
        /// Temperature reported by every output's probe (no probe when unset)
        #[arg(long, value_name = "CELSIUS", allow_hyphen_values = true)]
        temperature: Option<f32>,
    },
    /// Build the router on the configured board and report unusable pins
    SelfCheck,
}
