//! Error types for hotspot-imager
//!
//! All modules use `ImagerResult<T>` as their return type. Every variant
//! belongs to one error family; the family decides the process exit code.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for imager operations
pub type ImagerResult<T> = Result<T, ImagerError>;

/// All errors that can occur while building an image
#[derive(Error, Debug)]
pub enum ImagerError {
    // Input errors
    #[error("Invalid recipe: {0}")]
    RecipeInvalid(String),

    #[error("Recipe not found: {0}")]
    RecipeNotFound(String),

    #[error("Invalid size or duration literal: {0}")]
    InvalidFormat(String),

    #[error("Output {0} exists. Use --overwrite to replace it.")]
    OutputExists(PathBuf),

    #[error("Requested image size {requested} exceeds --max-size {limit}")]
    OutputTooLarge { requested: String, limit: String },

    // Resolution errors
    #[error("Source unreachable: {url}: {reason}")]
    UrlUnreachable { url: String, reason: String },

    #[error("Size of {url} could not be determined")]
    SizeUnknown { url: String },

    #[error("Unknown OCI image: {0}")]
    UnknownOciImage(String),

    // Download errors
    #[error("Download engine unreachable after {attempts} attempts")]
    EngineUnavailable { attempts: u32 },

    #[error("Download failed: {source_url}: {reason}")]
    DownloadFailed { source_url: String, reason: String },

    #[error("Checksum mismatch for {source_url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        source_url: String,
        expected: String,
        actual: String,
    },

    #[error("Expanded archive is {measured} bytes but recipe declares {declared}")]
    ArchiveTooLarge { measured: u64, declared: u64 },

    // Cache errors
    #[error("Cache at {0} is in use by another build")]
    CacheBusy(PathBuf),

    #[error("Cache format version {found} is newer than supported {supported}")]
    CacheVersionMismatch { found: u32, supported: u32 },

    #[error("Invalid cache policy at {path}: {reason}")]
    PolicyInvalid { path: PathBuf, reason: String },

    #[error("Cache journal unreadable: {0}")]
    JournalCorrupt(String),

    // Layout errors
    #[error("Cannot read partition table of {device}: {reason}")]
    PartitionTableUnreadable { device: String, reason: String },

    #[error("Partition {num} start sector moved from {before} to {after}")]
    StartSectorMoved { num: u8, before: u64, after: u64 },

    #[error("No free loop device available")]
    NoLoopDevice,

    #[error("Unable to mount {device} on {mount_point}")]
    MountFailed {
        device: String,
        mount_point: PathBuf,
    },

    #[error("Unable to unmount {0}")]
    UnmountFailed(PathBuf),

    // Tool errors
    #[error("Missing required tools: {}", .0.join(", "))]
    MissingTools(Vec<String>),

    #[error("Command failed: {command} (exit code {code}){}", stderr_suffix(.stderr))]
    ToolFailed {
        command: String,
        code: i32,
        stderr: Option<String>,
    },

    #[error("Command could not be spawned: {command}")]
    ToolSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Interrupt
    #[error("Cancelled")]
    Cancelled,

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr {
        Some(text) if !text.trim().is_empty() => format!(": {}", text.trim()),
        _ => String::new(),
    }
}

impl ImagerError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a tool failure from a finished process
    pub fn tool_failed(command: impl Into<String>, code: i32, stderr: Option<String>) -> Self {
        Self::ToolFailed {
            command: command.into(),
            code,
            stderr,
        }
    }

    /// Process exit code for this error family
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::RecipeInvalid(_)
            | Self::RecipeNotFound(_)
            | Self::InvalidFormat(_)
            | Self::OutputExists(_)
            | Self::OutputTooLarge { .. } => 1,

            Self::UrlUnreachable { .. }
            | Self::SizeUnknown { .. }
            | Self::UnknownOciImage(_)
            | Self::EngineUnavailable { .. }
            | Self::DownloadFailed { .. }
            | Self::ChecksumMismatch { .. }
            | Self::ArchiveTooLarge { .. }
            | Self::Http(_) => 2,

            Self::CacheBusy(_)
            | Self::CacheVersionMismatch { .. }
            | Self::PolicyInvalid { .. }
            | Self::JournalCorrupt(_) => 4,

            Self::PartitionTableUnreadable { .. }
            | Self::StartSectorMoved { .. }
            | Self::NoLoopDevice
            | Self::MountFailed { .. }
            | Self::UnmountFailed(_)
            | Self::MissingTools(_)
            | Self::ToolFailed { .. }
            | Self::ToolSpawn { .. } => 3,

            Self::Cancelled => 130,

            Self::Io { .. } | Self::Yaml(_) | Self::Json(_) => 1,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::OutputExists(_) => Some("Pass -X/--overwrite to replace the existing image"),
            Self::CacheBusy(_) => {
                Some("Another build is using this cache; wait or pick another --cache-dir")
            }
            Self::MissingTools(_) => Some("Install the listed tools and re-run"),
            Self::EngineUnavailable { .. } => {
                Some("Check that the download engine binary is installed and runnable")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ImagerError::OutputExists(PathBuf::from("/tmp/out.img"));
        assert!(err.to_string().contains("/tmp/out.img"));
        assert!(err.to_string().contains("--overwrite"));
    }

    #[test]
    fn tool_failed_with_stderr() {
        let err = ImagerError::tool_failed("parted", 1, Some("bad magic".to_string()));
        assert!(err.to_string().contains("parted"));
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn tool_failed_without_stderr() {
        let err = ImagerError::tool_failed("parted", 1, None);
        assert!(err.to_string().ends_with("(exit code 1)"));
    }

    #[test]
    fn exit_codes_per_family() {
        assert_eq!(ImagerError::RecipeInvalid("x".into()).exit_code(), 1);
        assert_eq!(
            ImagerError::DownloadFailed {
                source_url: "u".into(),
                reason: "r".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(ImagerError::NoLoopDevice.exit_code(), 3);
        assert_eq!(ImagerError::CacheBusy(PathBuf::from("/c")).exit_code(), 4);
        assert_eq!(ImagerError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn error_hint() {
        let err = ImagerError::OutputExists(PathBuf::from("/o"));
        assert!(err.hint().is_some());
        assert!(ImagerError::Cancelled.hint().is_none());
    }
}
