//! Host requirements pre-flight
//!
//! Everything the build shells out to must be present before any
//! network or disk work starts, and every missing tool is reported in
//! one pass instead of failing on the first.

use crate::download::ENGINE_BIN;
use crate::error::{ImagerError, ImagerResult};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Tools every build needs on PATH
pub const REQUIRED_TOOLS: &[&str] = &[
    "losetup",
    "parted",
    "partprobe",
    "mknod",
    "e2fsck",
    "resize2fs",
    "dumpe2fs",
    "mount",
    "umount",
    "sync",
    ENGINE_BIN,
];

/// Findings of the pre-flight pass
#[derive(Debug, Clone)]
pub struct Requirements {
    pub missing_tools: Vec<String>,
    pub is_root: bool,
    pub has_loop_device: bool,
    pub has_ext4_support: bool,
}

impl Requirements {
    /// Probe the host. `extra_tools` covers tools only some recipes
    /// need, like the OCI export tool.
    pub fn check(extra_tools: &[&str]) -> Self {
        let missing_tools = REQUIRED_TOOLS
            .iter()
            .chain(extra_tools)
            .filter(|tool| find_on_path(tool).is_none())
            .map(|tool| tool.to_string())
            .collect();

        Self {
            missing_tools,
            is_root: effective_uid() == Some(0),
            has_loop_device: Path::new("/dev/loop-control").exists(),
            has_ext4_support: std::fs::read_to_string("/proc/filesystems")
                .map(|text| text.lines().any(|l| l.trim().ends_with("ext4")))
                .unwrap_or(false),
        }
    }

    pub fn satisfied(&self) -> bool {
        self.missing_tools.is_empty()
            && self.is_root
            && self.has_loop_device
            && self.has_ext4_support
    }

    /// Fail with everything that is wrong at once
    pub fn ensure(&self) -> ImagerResult<()> {
        if !self.missing_tools.is_empty() {
            return Err(ImagerError::MissingTools(self.missing_tools.clone()));
        }
        if !self.is_root {
            return Err(ImagerError::RecipeInvalid(
                "building an image requires root".to_string(),
            ));
        }
        if !self.has_loop_device {
            return Err(ImagerError::NoLoopDevice);
        }
        if !self.has_ext4_support {
            return Err(ImagerError::RecipeInvalid(
                "kernel lacks ext4 support".to_string(),
            ));
        }
        Ok(())
    }
}

/// First executable named `tool` on PATH
pub fn find_on_path(tool: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(tool);
        if let Ok(metadata) = std::fs::metadata(&candidate) {
            if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                return Some(candidate);
            }
        }
    }
    None
}

/// Effective uid, read off /proc/self (Linux only, which is all this
/// tool runs on)
fn effective_uid() -> Option<u32> {
    std::fs::metadata("/proc/self").ok().map(|m| m.uid())
}
