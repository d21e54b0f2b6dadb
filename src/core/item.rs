//! Decoders for the leaf items the rescue pipeline feeds on
//!
//! Only four item kinds matter for rebuilding the chunk map: chunk items,
//! block-group items, device extents, and extent checksums. Checksum item
//! payloads are raw bytes and are handled directly by the scanner.

use super::addr::{AddrDelta, DeviceId, LogicalAddr, PhysicalAddr, QualifiedPhysicalAddr};
use super::volume::BlockGroupFlags;
use super::{RescueError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Transaction counter stamped on every filesystem write; higher wins in
/// conflicts
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The objectid shared by all extent-checksum items
pub const EXTENT_CSUM_OBJECTID: u64 = 0xFFFF_FFFF_FFFF_FFF6; // -10

/// A decoded CHUNK_ITEM: one logical extent mapped onto one or more stripes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkItem {
    /// Logical size of the chunk
    pub size: AddrDelta,
    /// Type and redundancy-profile flags
    pub flags: BlockGroupFlags,
    /// Stripe length
    pub stripe_len: u64,
    /// Physical start of each stripe
    pub stripes: Vec<QualifiedPhysicalAddr>,
}

impl ChunkItem {
    /// Parses a CHUNK_ITEM payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 0x30 {
            return Err(RescueError::Corrupt("CHUNK_ITEM too small".to_string()));
        }

        let size = LittleEndian::read_u64(&data[0..8]);
        let _owner = LittleEndian::read_u64(&data[8..16]);
        let stripe_len = LittleEndian::read_u64(&data[16..24]);
        let flags = LittleEndian::read_u64(&data[24..32]);
        let num_stripes = LittleEndian::read_u16(&data[44..46]);

        let mut stripes = Vec::with_capacity(num_stripes as usize);
        let mut offset = 0x30;
        for _ in 0..num_stripes {
            if offset + 0x20 > data.len() {
                return Err(RescueError::Corrupt(
                    "CHUNK_ITEM stripe data truncated".to_string(),
                ));
            }
            let devid = LittleEndian::read_u64(&data[offset..offset + 8]);
            let stripe_offset = LittleEndian::read_u64(&data[offset + 8..offset + 16]);
            stripes.push(QualifiedPhysicalAddr::new(
                DeviceId(devid),
                PhysicalAddr(stripe_offset as i64),
            ));
            offset += 0x20;
        }

        Ok(Self {
            size: AddrDelta(size as i64),
            flags: BlockGroupFlags(flags),
            stripe_len,
            stripes,
        })
    }
}

/// A decoded BLOCK_GROUP_ITEM payload
///
/// The item's logical address and size live in its key, not its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroupItem {
    /// Used bytes in this block group
    pub used: u64,
    /// Chunk object ID
    pub chunk_objectid: u64,
    /// Type and redundancy-profile flags
    pub flags: BlockGroupFlags,
}

impl BlockGroupItem {
    /// Parses a BLOCK_GROUP_ITEM payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 24 {
            return Err(RescueError::Corrupt(
                "BLOCK_GROUP_ITEM too small".to_string(),
            ));
        }

        Ok(Self {
            used: LittleEndian::read_u64(&data[0..8]),
            chunk_objectid: LittleEndian::read_u64(&data[8..16]),
            flags: BlockGroupFlags(LittleEndian::read_u64(&data[16..24])),
        })
    }
}

/// A decoded DEV_EXTENT payload
///
/// The owning device and the physical start live in the item's key; the
/// payload names the chunk the extent belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevExtentItem {
    /// Chunk tree the extent belongs to (always 3)
    pub chunk_tree: u64,
    /// Chunk object ID
    pub chunk_objectid: u64,
    /// Logical address of the owning chunk
    pub chunk_offset: LogicalAddr,
    /// Length in bytes
    pub length: AddrDelta,
}

impl DevExtentItem {
    /// Parses a DEV_EXTENT payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 48 {
            return Err(RescueError::Corrupt("DEV_EXTENT too small".to_string()));
        }

        Ok(Self {
            chunk_tree: LittleEndian::read_u64(&data[0..8]),
            chunk_objectid: LittleEndian::read_u64(&data[8..16]),
            chunk_offset: LogicalAddr(LittleEndian::read_u64(&data[16..24]) as i64),
            length: AddrDelta(LittleEndian::read_u64(&data[24..32]) as i64),
        })
    }
}

/// Builds a CHUNK_ITEM payload for tests
#[cfg(test)]
pub(crate) fn chunk_item_bytes(size: u64, flags: u64, stripes: &[(u64, u64)]) -> Vec<u8> {
    let mut data = vec![0u8; 0x30 + stripes.len() * 0x20];
    data[0..8].copy_from_slice(&size.to_le_bytes());
    data[8..16].copy_from_slice(&2u64.to_le_bytes());
    data[16..24].copy_from_slice(&0x10000u64.to_le_bytes());
    data[24..32].copy_from_slice(&flags.to_le_bytes());
    data[32..36].copy_from_slice(&4096u32.to_le_bytes());
    data[36..40].copy_from_slice(&4096u32.to_le_bytes());
    data[40..44].copy_from_slice(&4096u32.to_le_bytes());
    data[44..46].copy_from_slice(&(stripes.len() as u16).to_le_bytes());
    for (i, (devid, offset)) in stripes.iter().enumerate() {
        let beg = 0x30 + i * 0x20;
        data[beg..beg + 8].copy_from_slice(&devid.to_le_bytes());
        data[beg + 8..beg + 16].copy_from_slice(&offset.to_le_bytes());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chunk_item_single_stripe() {
        let data = chunk_item_bytes(0x10000, BlockGroupFlags::DATA, &[(1, 0x200000)]);
        let chunk = ChunkItem::from_bytes(&data).unwrap();
        assert_eq!(chunk.size, AddrDelta(0x10000));
        assert_eq!(chunk.flags, BlockGroupFlags(BlockGroupFlags::DATA));
        assert_eq!(chunk.stripe_len, 0x10000);
        assert_eq!(chunk.stripes.len(), 1);
        assert_eq!(chunk.stripes[0].dev, DeviceId(1));
        assert_eq!(chunk.stripes[0].addr, PhysicalAddr(0x200000));
    }

    #[test]
    fn test_parse_chunk_item_two_stripes() {
        let data = chunk_item_bytes(
            0x10000,
            BlockGroupFlags::METADATA | BlockGroupFlags::RAID1,
            &[(1, 0x200000), (2, 0x400000)],
        );
        let chunk = ChunkItem::from_bytes(&data).unwrap();
        assert_eq!(chunk.stripes.len(), 2);
        assert_eq!(chunk.stripes[1].dev, DeviceId(2));
        assert_eq!(chunk.stripes[1].addr, PhysicalAddr(0x400000));
    }

    #[test]
    fn test_parse_chunk_item_too_small() {
        assert!(ChunkItem::from_bytes(&[0u8; 0x20]).is_err());
    }

    #[test]
    fn test_parse_chunk_item_stripe_truncated() {
        let mut data = chunk_item_bytes(0x10000, BlockGroupFlags::DATA, &[(1, 0x200000)]);
        data[44..46].copy_from_slice(&5u16.to_le_bytes());
        assert!(ChunkItem::from_bytes(&data).is_err());
    }

    #[test]
    fn test_parse_block_group_item() {
        let mut data = vec![0u8; 24];
        data[0..8].copy_from_slice(&1048576u64.to_le_bytes());
        data[8..16].copy_from_slice(&256u64.to_le_bytes());
        data[16..24].copy_from_slice(&BlockGroupFlags::DATA.to_le_bytes());
        let item = BlockGroupItem::from_bytes(&data).unwrap();
        assert_eq!(item.used, 1048576);
        assert_eq!(item.chunk_objectid, 256);
        assert_eq!(item.flags, BlockGroupFlags(BlockGroupFlags::DATA));
    }

    #[test]
    fn test_parse_block_group_item_too_small() {
        assert!(BlockGroupItem::from_bytes(&[0u8; 20]).is_err());
    }

    #[test]
    fn test_parse_dev_extent() {
        let mut data = vec![0u8; 48];
        data[0..8].copy_from_slice(&3u64.to_le_bytes());
        data[8..16].copy_from_slice(&256u64.to_le_bytes());
        data[16..24].copy_from_slice(&0x100000u64.to_le_bytes());
        data[24..32].copy_from_slice(&0x80000u64.to_le_bytes());
        let ext = DevExtentItem::from_bytes(&data).unwrap();
        assert_eq!(ext.chunk_tree, 3);
        assert_eq!(ext.chunk_objectid, 256);
        assert_eq!(ext.chunk_offset, LogicalAddr(0x100000));
        assert_eq!(ext.length, AddrDelta(0x80000));
    }

    #[test]
    fn test_parse_dev_extent_too_small() {
        assert!(DevExtentItem::from_bytes(&[0u8; 40]).is_err());
    }

    #[test]
    fn test_extent_csum_objectid_is_minus_ten() {
        assert_eq!(EXTENT_CSUM_OBJECTID, (-10i64) as u64);
    }

    #[test]
    fn test_generation_ordering() {
        assert!(Generation(2) > Generation(1));
        assert_eq!(format!("{}", Generation(42)), "42");
    }
}
