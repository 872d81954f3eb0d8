// progress.rs

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Severity of a progress message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Forwards a progress message to the `log` facade at the given level.
pub fn log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => ::log::debug!("{}", message),
        LogLevel::Info => ::log::info!("{}", message),
        LogLevel::Warning => ::log::warn!("{}", message),
        LogLevel::Error => ::log::error!("{}", message),
    }
}

/// Creates a ticking spinner for a stage without a known length.
///
/// The caller finishes it with `finish_and_clear` once the stage is done.
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// A titled block of key/value statistics.
pub struct StatusBox {
    pub title: String,
    pub stats: Vec<(String, String)>,
}

/// Renders a [`StatusBox`] to stderr.
pub fn display_status_box(status: StatusBox) {
    let key_width = status.stats.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    let value_width = status.stats.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
    let inner = (key_width + value_width + 3).max(status.title.len() + 2);
    let border = "─".repeat(inner + 2);

    eprintln!("┌{}┐", border);
    eprintln!("│ {:<width$} │", status.title.bold().green(), width = inner);
    eprintln!("├{}┤", border);
    for (key, value) in &status.stats {
        let line = format!("{:<kw$} : {}", key, value, kw = key_width);
        eprintln!("│ {:<width$} │", line, width = inner);
    }
    eprintln!("└{}┘", border);
}
