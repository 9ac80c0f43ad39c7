//! Progress indicators with CI fallback

use super::UiContext;
use crate::units::format_size;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    /// Start the spinner with a message
    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(message);
        } else if self.interactive {
            println!("{} {}", style("✓").green(), message);
        } else {
            println!("{} {}", style("[OK]").green(), message);
        }
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.error(message);
        } else if self.interactive {
            println!("{} {}", style("✗").red(), message);
        } else {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }
}

/// Aggregate download progress bar, refreshed at most once per second
pub struct DownloadProgress {
    bar: Option<ProgressBar>,
    total: u64,
}

impl DownloadProgress {
    pub fn new(ctx: &UiContext, total_bytes: u64) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new(total_bytes.max(1));
            bar.set_style(
                ProgressStyle::with_template(
                    "[{elapsed_precise}] {bytes} of {total_bytes} {wide_bar} {bytes_per_sec} (eta {eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.enable_steady_tick(Duration::from_secs(1));
            Some(bar)
        } else {
            None
        };
        Self {
            bar,
            total: total_bytes,
        }
    }

    /// Update with current progress; totals may be revised upward as
    /// sizes become known
    pub fn update(&mut self, bytes_done: u64, total: u64) {
        if total != self.total && total > 0 {
            self.total = total;
            if let Some(bar) = &self.bar {
                bar.set_length(total);
            }
        }
        if let Some(bar) = &self.bar {
            bar.set_position(bytes_done.min(self.total));
        }
    }

    /// Finish the bar, leaving a summary line in plain mode
    pub fn finish(&mut self, bytes_done: u64) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        } else {
            println!(
                "{} downloaded {}",
                style("[OK]").green(),
                format_size(bytes_done)
            );
        }
    }
}
