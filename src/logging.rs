//! Logger set-up shared by every stage binary.
//!
//! Records go to stderr, since stdout usually carries the photon stream,
//! and optionally to a log file that is rotated daily.

use std::io;
use std::path::Path;

use log::LevelFilter;

use crate::configuration::AppConfig;

fn format_line(out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record) {
    out.finish(format_args!(
        "{}[{}][{}] {}",
        chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S%.3f]"),
        record.target(),
        record.level(),
        message
    ))
}

/// Builds the dispatcher without installing it.
pub fn dispatch(level: LevelFilter, log_file: Option<&Path>) -> fern::Dispatch {
    let mut dispatch = fern::Dispatch::new()
        .format(format_line)
        .level(level)
        .chain(io::stderr());
    if let Some(path) = log_file {
        // "run.log" becomes "run.log.2021-06-01"
        let prefix = format!("{}.", path.display());
        dispatch = dispatch.chain(fern::DateBased::new(prefix, "%Y-%m-%d"));
    }
    dispatch
}

/// Installs the global logger according to `config`. Fails if a logger is
/// already installed in this process.
pub fn setup_logger(config: &AppConfig) -> Result<(), fern::InitError> {
    dispatch(config.log_level(), config.log_file.as_deref()).apply()?;
    debug!("Logger initialized at level {}", config.log_level());
    Ok(())
}
