use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

/// Stable grep-able prefixes carried in log lines.
#[derive(Debug, Clone, Copy)]
pub enum ErrorCode {
    ToolMissing = 1,
    NoWirelessInterface = 2,
    ScanFailed = 3,
    ConnectionFailed = 4,
    ProfileCleanupFailed = 5,
    PromptFailed = 6,
}

pub fn error_code(code: ErrorCode) -> String {
    format!("[E{:03}]", code as u32)
}

/// Diagnostics go to a rolling file, never to the screen, so they cannot
/// interleave with the interactive menu.
pub fn log_dir() -> PathBuf {
    if let Ok(state) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(state).join("wifisel");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/wifisel");
    }
    std::env::temp_dir().join("wifisel")
}

pub fn setup_logging(verbose: bool) -> Result<()> {
    let dir = log_dir();
    std::fs::create_dir_all(&dir).context("Failed to create log directory")?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("main")
        .filename_suffix("log")
        .max_log_files(7)
        .build(&dir)
        .context("Failed to create file appender")?;

    let default_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .with_writer(appender)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}
