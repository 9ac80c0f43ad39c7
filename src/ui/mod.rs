//! Terminal output: step status lines and download progress

pub mod progress;

pub use progress::{DownloadProgress, TaskSpinner};

/// Detected terminal capabilities
#[derive(Debug, Clone, Copy)]
pub struct UiContext {
    interactive: bool,
}

impl UiContext {
    /// Detect from the environment
    pub fn detect() -> Self {
        Self {
            interactive: console::user_attended(),
        }
    }

    /// Plain output, for CI and tests
    pub fn non_interactive() -> Self {
        Self { interactive: false }
    }

    /// Whether spinners and live bars should be drawn
    pub fn use_fancy_output(&self) -> bool {
        self.interactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_interactive_is_plain() {
        assert!(!UiContext::non_interactive().use_fancy_output());
    }
}
