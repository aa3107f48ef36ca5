//! Output formatting and progress indicators
//!
//! Human output goes to stdout, except for stage children, which reserve
//! stdout for newline-delimited JSON.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::OnceLock;
use tracing::Level;

use crate::error::PipelineError;

static GLOBAL: OnceLock<OutputConfig> = OnceLock::new();

/// Process-wide output preferences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputConfig {
    pub quiet: bool,
    pub json: bool,
    pub verbose: u8,
}

impl OutputConfig {
    pub fn new(quiet: bool, json: bool, verbose: u8) -> Self {
        Self {
            quiet,
            json,
            verbose,
        }
    }

    /// Install as the process-wide configuration (first call wins)
    pub fn apply_global(self) {
        let _ = GLOBAL.set(self);
    }

    pub fn global() -> Self {
        GLOBAL.get().copied().unwrap_or_default()
    }

    /// Log level selected by `-v` / `-q`
    pub fn log_level(&self) -> Level {
        match (self.quiet, self.verbose) {
            (true, _) => Level::ERROR,
            (false, 0) => Level::WARN,
            (false, 1) => Level::INFO,
            (false, _) => Level::DEBUG,
        }
    }

    /// Whether interactive progress bars should be drawn
    pub fn show_progress(&self) -> bool {
        !self.quiet && !self.json
    }
}

/// Create a spinner for operations with unknown duration
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.blue} {msg}")
    {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

/// Create the overall-percent bar for a pipeline run
pub fn create_run_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {prefix:.bold} {msg}")
    {
        pb.set_style(style.progress_chars("█▓▒░"));
    }
    if !OutputConfig::global().show_progress() {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }
    pb
}

/// Print an error with its remediation hint to stderr
pub fn display_error(err: &anyhow::Error) {
    if OutputConfig::global().json {
        let payload = serde_json::json!({
            "success": false,
            "error": format!("{err:#}"),
        });
        eprintln!("{payload}");
        return;
    }

    eprintln!("{} {}", status::ERROR, err);
    for cause in err.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
    if let Some(remedy) = err
        .downcast_ref::<PipelineError>()
        .and_then(PipelineError::remedy)
    {
        eprintln!("{} {}", status::INFO, remedy);
    }
}

/// Human-readable byte count
pub fn format_size(bytes: u64) -> String {
    indicatif::HumanBytes(bytes).to_string()
}

/// Status message prefixes
pub mod status {
    /// Success prefix (green checkmark)
    pub const SUCCESS: &str = "✓";

    /// Error prefix (red X)
    pub const ERROR: &str = "✗";

    /// Warning prefix (yellow triangle)
    pub const WARNING: &str = "⚠";

    /// Info prefix (blue circle)
    pub const INFO: &str = "ℹ";
}
