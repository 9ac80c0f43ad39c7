//! Image layout management
//!
//! Owns the output file's journey through the build:
//!
//! ```text
//!             created ─▶ attached ─▶ probed ─▶ p3-extended ─▶ devices-ready
//!                                                                   │
//!  released ◀── detached ◀── unmounted ◀── populated ◀── resized ◀──┘
//! ```
//!
//! Partition 3 is the only partition ever touched, and its start sector
//! is the invariant the whole dance preserves: the partition is deleted
//! and recreated at the same first sector with a new end. The table is
//! re-probed from sysfs after every edit to confirm the kernel agrees.

pub mod partitions;
pub mod process;

use crate::error::{ImagerError, ImagerResult};
use partitions::{PartitionTable, BOOT_PART, DATA_PART, SECTOR_SIZE};
use process::ToolRunner;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub use partitions::Partition;
pub use process::ToolOutput;

/// Margin added above the measured minimum when shrinking, aligned to
/// whole filesystem clusters
const SHRINK_MARGIN_BYTES: u64 = 64 * 1024 * 1024;

/// Manager for the output image file and its loop device
pub struct ImageLayout {
    image_path: PathBuf,
    mount_root: PathBuf,
    sysfs_block: PathBuf,
    runner: ToolRunner,
    loop_dev: Option<String>,
    table: Option<PartitionTable>,
    created_nodes: Vec<PathBuf>,
    boot_mounted_on: Option<PathBuf>,
    data_mounted_on: Option<PathBuf>,
}

impl ImageLayout {
    pub fn new(image_path: &Path, mount_root: &Path, runner: ToolRunner) -> Self {
        Self {
            image_path: image_path.to_path_buf(),
            mount_root: mount_root.to_path_buf(),
            sysfs_block: PathBuf::from("/sys/block"),
            runner,
            loop_dev: None,
            table: None,
            created_nodes: Vec::new(),
            boot_mounted_on: None,
            data_mounted_on: None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.loop_dev.is_some()
    }

    pub fn data_mount_point(&self) -> Option<&Path> {
        self.data_mounted_on.as_deref()
    }

    pub fn boot_mount_point(&self) -> Option<&Path> {
        self.boot_mounted_on.as_deref()
    }

    /// Current size of the image file
    pub fn image_size(&self) -> ImagerResult<u64> {
        Ok(std::fs::metadata(&self.image_path)
            .map_err(|e| ImagerError::io(format!("sizing {}", self.image_path.display()), e))?
            .len())
    }

    /// Grow the image file to `size` bytes (sparse)
    pub fn grow_file(&self, size: u64) -> ImagerResult<()> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.image_path)
            .map_err(|e| ImagerError::io(format!("opening {}", self.image_path.display()), e))?;
        file.set_len(size)
            .map_err(|e| ImagerError::io(format!("growing {}", self.image_path.display()), e))?;
        Ok(())
    }

    /// Truncate the image file to `size` bytes; only meaningful after a
    /// shrink, once detached
    pub fn truncate_file(&self, size: u64) -> ImagerResult<()> {
        if self.is_attached() {
            return Err(ImagerError::UnmountFailed(self.image_path.clone()));
        }
        self.grow_file(size)
    }

    fn loop_dev(&self) -> ImagerResult<&str> {
        self.loop_dev
            .as_deref()
            .ok_or(ImagerError::NoLoopDevice)
    }

    fn loop_name(&self) -> ImagerResult<&str> {
        Ok(self.loop_dev()?.trim_start_matches("/dev/"))
    }

    /// Path of one partition's device node
    pub fn partition_device(&self, number: u8) -> ImagerResult<String> {
        Ok(format!("{}p{number}", self.loop_dev()?))
    }

    /// Associate the image with a free loop device and make sure the
    /// partition nodes exist
    pub async fn attach(&mut self) -> ImagerResult<String> {
        let free = self.runner.run("losetup", &["-f"]).await?;
        let loop_dev = free.stdout.trim().to_string();
        if loop_dev.is_empty() {
            return Err(ImagerError::NoLoopDevice);
        }
        let image = self.image_path.display().to_string();
        self.runner
            .run("losetup", &["--partscan", &loop_dev, &image])
            .await?;
        debug!(%loop_dev, "image attached");
        self.loop_dev = Some(loop_dev.clone());
        self.ensure_partition_devices().await?;
        Ok(loop_dev)
    }

    /// Read the partition table as the kernel sees it
    pub fn probe(&mut self) -> ImagerResult<&PartitionTable> {
        let table = PartitionTable::probe(&self.sysfs_block, self.loop_name()?)?;
        self.table = Some(table);
        Ok(self.table.as_ref().ok_or(ImagerError::NoLoopDevice)?)
    }

    /// Delete and recreate partition 3 with the same start sector and a
    /// new end at the last device sector
    pub async fn extend_data_partition(&mut self) -> ImagerResult<()> {
        if self.table.is_none() {
            self.probe()?;
        }
        let start = self
            .table
            .as_ref()
            .ok_or(ImagerError::NoLoopDevice)?
            .data_partition()?
            .start_sector;

        let loop_dev = self.loop_dev()?.to_string();
        let start_arg = format!("{start}s");
        self.runner
            .run(
                "parted",
                &[
                    "-s", "-m", &loop_dev, "unit", "s", "rm", "3", "mkpart", "primary", "ext4",
                    &start_arg, "100%",
                ],
            )
            .await?;
        self.runner
            .run("partprobe", &["--summary", &loop_dev])
            .await?;
        self.ensure_partition_devices().await?;

        let table = self.probe()?;
        let after = table.data_partition()?.start_sector;
        if after != start {
            return Err(ImagerError::StartSectorMoved {
                num: DATA_PART,
                before: start,
                after,
            });
        }
        debug!(start, "data partition extended to device end");
        Ok(())
    }

    /// Create `/dev/loopNpM` nodes when the environment did not, and
    /// fall back to a detach/reattach cycle when the data partition's
    /// node is unusable
    pub async fn ensure_partition_devices(&mut self) -> ImagerResult<()> {
        self.create_missing_nodes().await?;

        let data_dev = self.partition_device(DATA_PART)?;
        if std::fs::File::open(&data_dev).is_ok() {
            return Ok(());
        }
        warn!(%data_dev, "partition device unusable, reattaching loop device");

        let loop_dev = self.loop_dev()?.to_string();
        self.detach_device(&loop_dev).await;
        // the kernel needs a moment before the device can be reused
        tokio::time::sleep(Duration::from_secs(2)).await;
        let image = self.image_path.display().to_string();
        self.runner
            .run("losetup", &["--partscan", &loop_dev, &image])
            .await?;
        self.create_missing_nodes().await?;
        Ok(())
    }

    async fn create_missing_nodes(&mut self) -> ImagerResult<()> {
        let first = self.partition_device(BOOT_PART)?;
        if Path::new(&first).exists() {
            return Ok(());
        }
        let loop_name = self.loop_name()?.to_string();
        let device_dir = self.sysfs_block.join(&loop_name);
        let listing = std::fs::read_dir(&device_dir)
            .map_err(|e| ImagerError::io(format!("listing {}", device_dir.display()), e))?;

        let mut created = Vec::new();
        for item in listing.flatten() {
            let name = item.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&format!("{loop_name}p")) {
                continue;
            }
            let dev_file = item.path().join("dev");
            let numbers = std::fs::read_to_string(&dev_file)
                .map_err(|e| ImagerError::io(format!("reading {}", dev_file.display()), e))?;
            let (major, minor) = numbers
                .trim()
                .split_once(':')
                .ok_or_else(|| ImagerError::PartitionTableUnreadable {
                    device: loop_name.clone(),
                    reason: format!("bad dev numbers `{}`", numbers.trim()),
                })?;
            let node = format!("/dev/{name}");
            debug!(%node, major, minor, "creating partition node");
            created.push((node, major.to_string(), minor.to_string()));
        }
        for (node, major, minor) in created {
            self.runner
                .run("mknod", &[&node, "b", &major, &minor])
                .await?;
            self.created_nodes.push(PathBuf::from(node));
        }
        Ok(())
    }

    /// Non-interactive forced filesystem check of the data partition.
    /// Exit 1 means errors were corrected, which is acceptable.
    pub async fn check_data_filesystem(&self) -> ImagerResult<()> {
        let device = self.partition_device(DATA_PART)?;
        self.runner
            .run_accepting("e2fsck", &["-f", "-y", "-v", &device], &[0, 1])
            .await?;
        Ok(())
    }

    /// Grow the data filesystem to the new partition size, checking it
    /// on both sides of the resize
    pub async fn resize_data_filesystem(&self) -> ImagerResult<()> {
        let device = self.partition_device(DATA_PART)?;
        self.check_data_filesystem().await?;
        self.runner.run("resize2fs", &["-f", "-p", &device]).await?;
        self.check_data_filesystem().await?;
        Ok(())
    }

    /// Mount the data partition read-write
    pub async fn mount_data(&mut self) -> ImagerResult<PathBuf> {
        let mount_point = self.mount_partition(DATA_PART, "ext4").await?;
        self.data_mounted_on = Some(mount_point.clone());
        Ok(mount_point)
    }

    /// Mount the boot partition read-write
    pub async fn mount_boot(&mut self) -> ImagerResult<PathBuf> {
        let mount_point = self.mount_partition(BOOT_PART, "vfat").await?;
        self.boot_mounted_on = Some(mount_point.clone());
        Ok(mount_point)
    }

    async fn mount_partition(&mut self, number: u8, filesystem: &str) -> ImagerResult<PathBuf> {
        let device = self.partition_device(number)?;
        std::fs::create_dir_all(&self.mount_root)
            .map_err(|e| ImagerError::io("creating mount root", e))?;
        let mount_point = tempfile::Builder::new()
            .prefix(&format!("part{number}_"))
            .tempdir_in(&self.mount_root)
            .map_err(|e| ImagerError::io("creating mount point", e))?
            .into_path();

        let target = mount_point.display().to_string();
        if !self
            .runner
            .run_failsafe("mount", &["-t", filesystem, &device, &target])
            .await
        {
            let _ = std::fs::remove_dir(&mount_point);
            return Err(ImagerError::MountFailed {
                device,
                mount_point,
            });
        }
        Ok(mount_point)
    }

    /// Sync and unmount the data partition
    pub async fn unmount_data(&mut self) -> ImagerResult<()> {
        if let Some(mount_point) = self.data_mounted_on.take() {
            self.unmount(&mount_point).await?;
        }
        Ok(())
    }

    /// Sync and unmount the boot partition
    pub async fn unmount_boot(&mut self) -> ImagerResult<()> {
        if let Some(mount_point) = self.boot_mounted_on.take() {
            self.unmount(&mount_point).await?;
        }
        Ok(())
    }

    async fn unmount(&self, mount_point: &Path) -> ImagerResult<()> {
        // commit all writes before pulling the mount away
        self.runner.run("sync", &[]).await?;
        let target = mount_point.display().to_string();
        if !self.runner.run_failsafe("umount", &[&target]).await {
            return Err(ImagerError::UnmountFailed(mount_point.to_path_buf()));
        }
        let _ = std::fs::remove_dir(mount_point);
        Ok(())
    }

    /// Shrink the data filesystem to its used size plus a margin, then
    /// shrink the partition to match. Returns the minimal image file
    /// size; the caller truncates once detached.
    pub async fn shrink_data_partition(&mut self) -> ImagerResult<u64> {
        let device = self.partition_device(DATA_PART)?;
        self.check_data_filesystem().await?;

        let header = self.runner.run("dumpe2fs", &["-h", &device]).await?;
        let block_size = parse_block_size(&header.stdout).ok_or_else(|| {
            ImagerError::PartitionTableUnreadable {
                device: device.clone(),
                reason: "dumpe2fs reported no block size".to_string(),
            }
        })?;

        let estimate = self.runner.run("resize2fs", &["-P", &device]).await?;
        let min_blocks = parse_min_blocks(&estimate.stdout).ok_or_else(|| {
            ImagerError::PartitionTableUnreadable {
                device: device.clone(),
                reason: "resize2fs reported no minimum size".to_string(),
            }
        })?;

        let target_blocks = min_blocks + SHRINK_MARGIN_BYTES / block_size;
        self.runner
            .run("resize2fs", &["-f", &device, &target_blocks.to_string()])
            .await?;
        self.check_data_filesystem().await?;

        if self.table.is_none() {
            self.probe()?;
        }
        let start = self
            .table
            .as_ref()
            .ok_or(ImagerError::NoLoopDevice)?
            .data_partition()?
            .start_sector;
        let length_sectors = (target_blocks * block_size).div_ceil(SECTOR_SIZE);
        let end_sector = start + length_sectors - 1;

        let loop_dev = self.loop_dev()?.to_string();
        let start_arg = format!("{start}s");
        let end_arg = format!("{end_sector}s");
        self.runner
            .run(
                "parted",
                &[
                    "-s", "-m", &loop_dev, "unit", "s", "rm", "3", "mkpart", "primary", "ext4",
                    &start_arg, &end_arg,
                ],
            )
            .await?;
        self.runner
            .run("partprobe", &["--summary", &loop_dev])
            .await?;

        let table = self.probe()?;
        let after = table.data_partition()?.start_sector;
        if after != start {
            return Err(ImagerError::StartSectorMoved {
                num: DATA_PART,
                before: start,
                after,
            });
        }
        Ok((end_sector + 1) * SECTOR_SIZE)
    }

    /// Detach the loop device and remove any partition nodes we created
    pub async fn detach(&mut self) -> ImagerResult<()> {
        self.unmount_data().await?;
        self.unmount_boot().await?;
        if let Some(loop_dev) = self.loop_dev.take() {
            if !self
                .runner
                .run_failsafe("losetup", &["--detach", &loop_dev])
                .await
            {
                self.loop_dev = Some(loop_dev.clone());
                return Err(ImagerError::tool_failed(
                    format!("losetup --detach {loop_dev}"),
                    1,
                    None,
                ));
            }
            self.remove_created_nodes();
        }
        self.table = None;
        Ok(())
    }

    /// Failsafe unwind for error paths, in LIFO order of acquisition
    pub async fn release(&mut self) {
        if let Some(mount_point) = self.data_mounted_on.take() {
            let _ = self.runner.run_failsafe("sync", &[]).await;
            let target = mount_point.display().to_string();
            let _ = self.runner.run_failsafe("umount", &[&target]).await;
            let _ = std::fs::remove_dir(&mount_point);
        }
        if let Some(mount_point) = self.boot_mounted_on.take() {
            let target = mount_point.display().to_string();
            let _ = self.runner.run_failsafe("umount", &[&target]).await;
            let _ = std::fs::remove_dir(&mount_point);
        }
        if let Some(loop_dev) = self.loop_dev.take() {
            self.detach_device(&loop_dev).await;
        }
        self.table = None;
    }

    async fn detach_device(&mut self, loop_dev: &str) {
        let _ = self
            .runner
            .run_failsafe("losetup", &["--detach", loop_dev])
            .await;
        self.remove_created_nodes();
    }

    fn remove_created_nodes(&mut self) {
        for node in self.created_nodes.drain(..) {
            debug!(node = %node.display(), "removing partition node");
            let _ = std::fs::remove_file(&node);
        }
    }
}

/// Filesystem block size out of `dumpe2fs -h` output
fn parse_block_size(output: &str) -> Option<u64> {
    let re = Regex::new(r"(?m)^Block size:\s+(\d+)").ok()?;
    re.captures(output)?.get(1)?.as_str().parse().ok()
}

/// Minimum filesystem size (in fs blocks) out of `resize2fs -P` output
fn parse_min_blocks(output: &str) -> Option<u64> {
    let re = Regex::new(r"Estimated minimum size of the filesystem:\s+(\d+)").ok()?;
    re.captures(output)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ImageLayout {
        ImageLayout::new(
            Path::new("/tmp/test.img"),
            Path::new("/tmp/mounts"),
            ToolRunner::new(false),
        )
    }

    #[test]
    fn partition_device_requires_attachment() {
        let layout = layout();
        assert!(layout.partition_device(3).is_err());
    }

    #[test]
    fn partition_device_names() {
        let mut layout = layout();
        layout.loop_dev = Some("/dev/loop4".to_string());
        assert_eq!(layout.partition_device(3).unwrap(), "/dev/loop4p3");
        assert_eq!(layout.loop_name().unwrap(), "loop4");
    }

    #[test]
    fn truncate_refused_while_attached() {
        let mut layout = layout();
        layout.loop_dev = Some("/dev/loop4".to_string());
        assert!(layout.truncate_file(1024).is_err());
    }

    #[test]
    fn parses_dumpe2fs_block_size() {
        let output = "Filesystem features: ext_attr\nBlock size:               4096\nFragment size:            4096\n";
        assert_eq!(parse_block_size(output), Some(4096));
    }

    #[test]
    fn parses_resize2fs_minimum() {
        let output = "Estimated minimum size of the filesystem: 655360\n";
        assert_eq!(parse_min_blocks(output), Some(655360));
        assert_eq!(parse_min_blocks("no estimate here"), None);
    }

    #[test]
    fn grow_and_size_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("img");
        std::fs::write(&image, b"seed").unwrap();
        let layout = ImageLayout::new(&image, dir.path(), ToolRunner::new(false));
        layout.grow_file(1 << 20).unwrap();
        assert_eq!(layout.image_size().unwrap(), 1 << 20);
        layout.truncate_file(4096).unwrap();
        assert_eq!(layout.image_size().unwrap(), 4096);
    }
}
