//! BTRFS on-disk structures and the chunk-map overlay
//!
//! This module holds everything the rescue pipeline needs to understand a
//! damaged filesystem: typed addresses, the superblock, tree node and item
//! decoding, per-sector checksum runs, and the [`volume::LogicalVolume`]
//! overlay the pipeline rebuilds.

pub mod addr;
pub mod checksum;
pub mod item;
pub mod node;
pub mod sums;
pub mod superblock;
pub mod volume;

use thiserror::Error;

pub use addr::{Addr, AddrDelta, DeviceId, LogicalAddr, PhysicalAddr, QualifiedPhysicalAddr};
pub use checksum::{ChecksumKind, ShortSum};
pub use item::Generation;
pub use sums::{SumRun, SumRunWithGaps};
pub use superblock::Superblock;
pub use volume::{BlockGroupFlags, LogicalVolume, Mapping, MappingError};

/// BTRFS magic number: "_BHRfS_M"
pub const BTRFS_MAGIC: [u8; 8] = *b"_BHRfS_M";

/// Primary superblock offset (64 KiB)
pub const SUPERBLOCK_OFFSET: u64 = 0x10000;

/// Superblock mirror offsets (64 MiB and 256 GiB)
pub const SUPERBLOCK_MIRROR_OFFSETS: [u64; 2] = [0x4000000, 0x4000000000];

/// Size of the on-disk superblock structure
pub const SUPERBLOCK_SIZE: usize = 0x1000;

/// Checksum granularity: one checksum per 4 KiB sector
pub const BLOCK_SIZE: i64 = 4096;

/// All superblock locations on a device, primary first
pub fn superblock_addrs() -> [PhysicalAddr; 3] {
    [
        PhysicalAddr(SUPERBLOCK_OFFSET as i64),
        PhysicalAddr(SUPERBLOCK_MIRROR_OFFSETS[0] as i64),
        PhysicalAddr(SUPERBLOCK_MIRROR_OFFSETS[1] as i64),
    ]
}

/// Errors that can occur while rescuing a filesystem
#[derive(Error, Debug)]
pub enum RescueError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Block device error: {0}")]
    BlockDevice(#[from] crate::blockdev::BlockDeviceError),

    #[error("Invalid magic number")]
    InvalidMagic,

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Corrupt filesystem: {0}")]
    Corrupt(String),

    #[error("Mapping rejected: {0}")]
    Mapping(#[from] MappingError),

    #[error("Sector size is {actual}, expected {expected}")]
    SectorSizeMismatch { expected: u32, actual: u32 },

    #[error("Scan result mentions device {0} that is not part of the volume")]
    DeviceMismatch(DeviceId),

    #[error("Found block groups are inconsistent: {0}")]
    InconsistentBlockGroups(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RescueError>;
