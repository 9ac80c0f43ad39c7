//! Partition table probing via sysfs
//!
//! The kernel exposes the geometry of an attached loop device under
//! `/sys/block/<name>`: total device size and, per partition,
//! `start`/`size` in 512-byte sectors. Reading it there reflects what
//! the kernel actually believes, which is the contract the resize state
//! machine depends on.

use crate::error::{ImagerError, ImagerResult};
use std::path::Path;

/// Sysfs `start`/`size` values are always 512-byte units
pub const SECTOR_SIZE: u64 = 512;

/// Partition numbers of the fixed layout
pub const BOOT_PART: u8 = 1;
pub const ROOT_PART: u8 = 2;
pub const DATA_PART: u8 = 3;

/// One partition as the kernel sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub number: u8,
    pub start_sector: u64,
    pub length_sectors: u64,
}

impl Partition {
    pub fn end_sector(&self) -> u64 {
        self.start_sector + self.length_sectors - 1
    }
}

/// The three-partition table of an attached device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub device_sectors: u64,
    pub logical_block_size: u64,
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Read the table from sysfs. `sysfs_block` is `/sys/block` outside
    /// of tests.
    pub fn probe(sysfs_block: &Path, loop_name: &str) -> ImagerResult<Self> {
        let device_dir = sysfs_block.join(loop_name);
        let unreadable = |reason: String| ImagerError::PartitionTableUnreadable {
            device: loop_name.to_string(),
            reason,
        };

        let device_sectors = read_sysfs_u64(&device_dir.join("size"))
            .map_err(|e| unreadable(e.to_string()))?;
        let logical_block_size =
            read_sysfs_u64(&device_dir.join("queue/logical_block_size")).unwrap_or(SECTOR_SIZE);

        let mut partitions = Vec::new();
        for number in [BOOT_PART, ROOT_PART, DATA_PART] {
            let part_dir = device_dir.join(format!("{loop_name}p{number}"));
            if !part_dir.is_dir() {
                return Err(unreadable(format!("partition {number} missing from sysfs")));
            }
            let start_sector = read_sysfs_u64(&part_dir.join("start"))
                .map_err(|e| unreadable(format!("partition {number}: {e}")))?;
            let length_sectors = read_sysfs_u64(&part_dir.join("size"))
                .map_err(|e| unreadable(format!("partition {number}: {e}")))?;
            partitions.push(Partition {
                number,
                start_sector,
                length_sectors,
            });
        }

        Ok(Self {
            device_sectors,
            logical_block_size,
            partitions,
        })
    }

    pub fn partition(&self, number: u8) -> ImagerResult<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.number == number)
            .ok_or_else(|| ImagerError::PartitionTableUnreadable {
                device: String::new(),
                reason: format!("no partition {number}"),
            })
    }

    /// The one partition the builder may grow
    pub fn data_partition(&self) -> ImagerResult<&Partition> {
        self.partition(DATA_PART)
    }
}

fn read_sysfs_u64(path: &Path) -> ImagerResult<u64> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ImagerError::io(format!("reading {}", path.display()), e))?;
    text.trim()
        .parse()
        .map_err(|_| ImagerError::io(
            format!("parsing {}", path.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidData, text.trim().to_string()),
        ))
}
