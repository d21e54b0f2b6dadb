//! Superblock parsing and validation
//!
//! The superblock lives at offset 0x10000 (64 KiB) with mirrors at
//! 0x4000000 (64 MiB) and 0x4000000000 (256 GiB). On a damaged filesystem
//! any one of the copies may survive, so reads fall back through the
//! mirrors and keep the newest valid copy.

use super::checksum::{ChecksumKind, ShortSum};
use super::item::Generation;
use super::{
    addr::DeviceId, superblock_addrs, RescueError, Result, BTRFS_MAGIC, SUPERBLOCK_SIZE,
};
use crate::blockdev::BlockDevice;
use byteorder::{ByteOrder, LittleEndian};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// On-disk superblock layout
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct SuperblockRaw {
    /// Checksum of everything from offset 0x20 to 0x1000
    pub csum: [u8; 32],
    /// Filesystem UUID
    pub fsid: [u8; 16],
    /// Physical address of this block
    pub bytenr: u64,
    /// Flags
    pub flags: u64,
    /// Magic number: "_BHRfS_M"
    pub magic: [u8; 8],
    /// Generation number
    pub generation: u64,
    /// Logical address of the root tree root
    pub root: u64,
    /// Logical address of the chunk tree root
    pub chunk_root: u64,
    /// Logical address of the log tree root
    pub log_root: u64,
    /// Log root transaction ID
    pub log_root_transid: u64,
    /// Total bytes in filesystem
    pub total_bytes: u64,
    /// Bytes used
    pub bytes_used: u64,
    /// Root directory object ID
    pub root_dir_objectid: u64,
    /// Number of devices
    pub num_devices: u64,
    /// Sector size
    pub sector_size: u32,
    /// Node size
    pub node_size: u32,
    /// Leaf size (unused, same as node_size)
    pub leaf_size: u32,
    /// Stripe size
    pub stripe_size: u32,
    /// Size of sys_chunk_array
    pub sys_chunk_array_size: u32,
    /// Chunk root generation
    pub chunk_root_generation: u64,
    /// Compatible feature flags
    pub compat_flags: u64,
    /// Compatible read-only feature flags
    pub compat_ro_flags: u64,
    /// Incompatible feature flags
    pub incompat_flags: u64,
    /// Checksum type
    pub csum_type: u16,
    /// Root level
    pub root_level: u8,
    /// Chunk root level
    pub chunk_root_level: u8,
    /// Log root level
    pub log_root_level: u8,
    /// Device item for this device
    pub dev_item: [u8; 0x62],
    /// Label (up to 256 bytes)
    pub label: [u8; 256],
    /// Cache generation
    pub cache_generation: u64,
    /// UUID tree generation
    pub uuid_tree_generation: u64,
    /// Reserved for future expansion
    pub reserved: [u8; 0xF0],
    /// System chunk array (bootstrap chunks)
    pub sys_chunk_array: [u8; 0x800],
    /// Root backups
    pub super_roots: [u8; 0x2A0],
    /// Unused
    pub unused: [u8; 0x235],
}

/// Parsed superblock with convenient accessors
#[derive(Debug, Clone)]
pub struct Superblock {
    raw: SuperblockRaw,
}

impl Superblock {
    /// Reads the newest valid superblock copy from a device
    ///
    /// Tries the primary offset and both mirrors; of the copies that parse
    /// and verify, the one with the highest generation wins.
    pub fn read_from_device(device: &dyn BlockDevice) -> Result<Self> {
        let mut best: Option<Superblock> = None;
        let mut last_err = RescueError::Corrupt("No superblock copy in range".to_string());
        for addr in superblock_addrs() {
            let offset = addr.0 as u64;
            if offset + SUPERBLOCK_SIZE as u64 > device.size() {
                continue;
            }
            let mut buf = [0u8; SUPERBLOCK_SIZE];
            if let Err(err) = device.read_exact_at(offset, &mut buf) {
                last_err = err.into();
                continue;
            }
            match Self::parse(&buf) {
                Ok(sb) => {
                    if best
                        .as_ref()
                        .is_none_or(|b| sb.generation() > b.generation())
                    {
                        best = Some(sb);
                    }
                }
                Err(err) => last_err = err,
            }
        }
        best.ok_or(last_err)
    }

    /// Parses and verifies a superblock from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SUPERBLOCK_SIZE {
            return Err(RescueError::Corrupt(format!(
                "Superblock too small: {} bytes",
                data.len()
            )));
        }

        let raw = SuperblockRaw::read_from_bytes(&data[..SUPERBLOCK_SIZE])
            .map_err(|_| RescueError::Corrupt("Failed to parse superblock".to_string()))?;

        if raw.magic != BTRFS_MAGIC {
            return Err(RescueError::InvalidMagic);
        }

        let superblock = Self { raw };
        superblock.verify_checksum(data)?;
        Ok(superblock)
    }

    /// Verifies the superblock's self-checksum
    fn verify_checksum(&self, data: &[u8]) -> Result<()> {
        // Copy packed fields to avoid unaligned references.
        let csum_type = { self.raw.csum_type };
        let csum = { self.raw.csum };

        let kind = ChecksumKind::from_type(csum_type)?;
        let expected = ShortSum::from_bytes(&csum[..kind.size()]);
        let actual = kind.sum(&data[0x20..SUPERBLOCK_SIZE])?;

        if expected != actual {
            return Err(RescueError::ChecksumMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        Ok(())
    }

    /// Returns the filesystem UUID
    pub fn fsid(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.raw.fsid)
    }

    /// Returns the raw filesystem UUID bytes
    pub fn fsid_bytes(&self) -> [u8; 16] {
        self.raw.fsid
    }

    /// Returns the filesystem label
    pub fn label(&self) -> &str {
        let label = &self.raw.label;
        let end = label.iter().position(|&b| b == 0).unwrap_or(label.len());
        std::str::from_utf8(&label[..end]).unwrap_or("")
    }

    /// Returns the generation number
    pub fn generation(&self) -> Generation {
        Generation(self.raw.generation)
    }

    /// Returns the total bytes in the filesystem
    pub fn total_bytes(&self) -> u64 {
        self.raw.total_bytes
    }

    /// Returns the number of devices
    pub fn num_devices(&self) -> u64 {
        self.raw.num_devices
    }

    /// Returns the sector size
    pub fn sector_size(&self) -> u32 {
        self.raw.sector_size
    }

    /// Returns the node size
    pub fn node_size(&self) -> u32 {
        self.raw.node_size
    }

    /// Returns the checksum type field
    pub fn csum_type(&self) -> u16 {
        self.raw.csum_type
    }

    /// Returns the checksum algorithm
    pub fn checksum_kind(&self) -> Result<ChecksumKind> {
        ChecksumKind::from_type(self.csum_type())
    }

    /// Returns the device ID this copy's device item carries
    ///
    /// Each device of a multi-device filesystem stores its own device item
    /// in its superblock; this is how scan results are keyed.
    pub fn devid(&self) -> DeviceId {
        DeviceId(LittleEndian::read_u64(&self.raw.dev_item[0..8]))
    }
}
