#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod check;
mod cli;
mod error_fmt;
mod run;

use clap::Parser;
use eyre::{Result, WrapErr};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use sunroute_config::{Config, Logging};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::cli::{Cli, Commands, FILE_GUARD, JSON_MODE};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    if let Err(e) = real_main(cli) {
        if JSON_MODE.get().copied().unwrap_or(false) {
            eprintln!("{}", format_error_json(&e));
        } else {
            eprintln!("{}", humanize(&e));
        }
        std::process::exit(exit_code_for_error(&e));
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("read config {}", path.display()))?;
    sunroute_config::load_toml(&text).wrap_err_with(|| format!("parse config {}", path.display()))
}

/// Console layer per `--json`, filtered by `RUST_LOG`, then `--log-level`,
/// then `logging.level`; optional JSON file sink from `[logging]`.
fn init_tracing(json: bool, cli_level: &str, logging: &Logging) -> Result<()> {
    let level = match (cli_level, logging.level.as_deref()) {
        ("info", Some(cfg)) => cfg.to_string(),
        (cli, _) => cli.to_string(),
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&level))?;

    let console = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let file = match logging.file.as_deref() {
        Some(path) => {
            let path = Path::new(path);
            let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path.file_name().map_or_else(|| "sunroute.log".into(), |n| n.to_string_lossy().into_owned());
            let appender = match logging.rotation.as_deref() {
                Some("daily") => tracing_appender::rolling::daily(dir, name),
                Some("hourly") => tracing_appender::rolling::hourly(dir, name),
                _ => tracing_appender::rolling::never(dir, name),
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(tracing_subscriber::fmt::layer().json().with_writer(writer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .wrap_err("install tracing subscriber")?;
    Ok(())
}

fn real_main(cli: Cli) -> Result<()> {
    color_eyre::install()?;
    let config = load_config(&cli.config)?;
    init_tracing(cli.json, &cli.log_level, &config.logging)?;
    tracing::debug!(config = %cli.config.display(), "config loaded");

    match cli.cmd {
        Commands::Run {
            duration_s,
            solar_w,
            house_w,
            temperature,
        } => {
            let stop = Arc::new(AtomicBool::new(false));
            let flag = stop.clone();
            if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Release)) {
                tracing::warn!(error = %e, "Ctrl-C handler not installed");
            }
            let opts = run::RunOptions {
                duration: Duration::from_secs(duration_s),
                solar_w,
                house_w,
                temperature,
            };
            let summary = run::simulate(config, &opts, &stop)?;
            run::print_summary(&summary, cli.json);
            Ok(())
        }
        Commands::SelfCheck => check::self_check(config, cli.json),
    }
}
