//! Raw device scanning
//!
//! The scanner walks every sector of every device once, with no knowledge of
//! tree structure: it checksums each sector, recognizes tree nodes by their
//! embedded filesystem UUID plus a valid node checksum, and harvests the
//! leaf items the rebuild pipeline feeds on. Devices are scanned in
//! parallel, one blocking task each; the pipeline itself never touches a
//! device again.

use crate::blockdev::BlockDevice;
use crate::cancel::CancelToken;
use crate::core::item::{
    BlockGroupItem, ChunkItem, DevExtentItem, Generation, EXTENT_CSUM_OBJECTID,
};
use crate::core::node::{self, item_type, leaf_items, NodeHeader};
use crate::core::{
    AddrDelta, BlockGroupFlags, DeviceId, LogicalAddr, PhysicalAddr, RescueError, Result,
    Superblock, SumRun, BLOCK_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Bytes read from a device per batch
const SCAN_BATCH_SIZE: usize = 1 << 20;

/// Everything recovered by scanning all devices
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanDevicesResult {
    /// Per-device results, keyed by the device ID from each device's
    /// superblock
    pub devices: BTreeMap<DeviceId, ScanOneDeviceResult>,
}

/// Everything recovered by scanning one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOneDeviceResult {
    /// Device size in bytes
    pub size: PhysicalAddr,
    /// One checksum per sector of the whole device
    pub checksums: SumRun<PhysicalAddr>,
    /// Physical addresses at which a node claiming each logical address was
    /// observed
    pub found_nodes: BTreeMap<LogicalAddr, Vec<PhysicalAddr>>,
    /// Decoded chunk items
    pub found_chunks: Vec<FoundChunk>,
    /// Decoded block-group items
    pub found_block_groups: Vec<FoundBlockGroup>,
    /// Decoded device extents
    pub found_dev_extents: Vec<FoundDevExtent>,
    /// Checksum-tree items, tagged with the generation of the containing
    /// node
    pub found_extent_csums: Vec<FoundExtentCsum>,
}

/// One observed chunk item and the logical address its key carried
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundChunk {
    pub laddr: LogicalAddr,
    pub item: ChunkItem,
}

/// One observed block-group record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundBlockGroup {
    pub laddr: LogicalAddr,
    pub size: AddrDelta,
    pub flags: BlockGroupFlags,
}

/// One observed device extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevExtent {
    pub dev: DeviceId,
    pub paddr: PhysicalAddr,
    pub laddr: LogicalAddr,
    pub size: AddrDelta,
}

/// One observed run of extent checksums
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundExtentCsum {
    pub generation: Generation,
    pub sums: SumRun<LogicalAddr>,
}

/// Scans all devices in parallel, one blocking task per device
pub async fn scan_devices(
    token: &CancelToken,
    sb: &Superblock,
    devices: Vec<(DeviceId, Arc<dyn BlockDevice>)>,
) -> Result<ScanDevicesResult> {
    let mut tasks = JoinSet::new();
    for (devid, device) in devices {
        let token = token.clone();
        let sb = sb.clone();
        tasks.spawn_blocking(move || -> Result<(DeviceId, ScanOneDeviceResult)> {
            let result = scan_one_device(&token, &sb, devid, device.as_ref())?;
            Ok((devid, result))
        });
    }

    let mut out = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (devid, result) =
            joined.map_err(|e| RescueError::Io(std::io::Error::other(e)))??;
        out.insert(devid, result);
    }
    Ok(ScanDevicesResult { devices: out })
}

/// Scans a single device sequentially
pub fn scan_one_device(
    token: &CancelToken,
    sb: &Superblock,
    devid: DeviceId,
    device: &dyn BlockDevice,
) -> Result<ScanOneDeviceResult> {
    if sb.sector_size() != BLOCK_SIZE as u32 {
        return Err(RescueError::SectorSizeMismatch {
            expected: BLOCK_SIZE as u32,
            actual: sb.sector_size(),
        });
    }
    let kind = sb.checksum_kind()?;
    let node_size = sb.node_size() as usize;
    let fsid = sb.fsid_bytes();

    let dev_size = device.size();
    let num_blocks = dev_size / BLOCK_SIZE as u64;
    info!(
        device = %devid,
        size = dev_size,
        blocks = num_blocks,
        "scanning device"
    );

    let mut result = ScanOneDeviceResult {
        size: PhysicalAddr(dev_size as i64),
        checksums: SumRun::new(kind.size(), PhysicalAddr(0), Vec::new()),
        found_nodes: BTreeMap::new(),
        found_chunks: Vec::new(),
        found_block_groups: Vec::new(),
        found_dev_extents: Vec::new(),
        found_extent_csums: Vec::new(),
    };
    let mut sums = Vec::with_capacity(num_blocks as usize * kind.size());

    let mut batch = vec![0u8; SCAN_BATCH_SIZE];
    let mut node_buf = vec![0u8; node_size];
    let scan_end = num_blocks * BLOCK_SIZE as u64;
    let mut pos = 0u64;
    while pos < scan_end {
        token.check()?;
        let want = SCAN_BATCH_SIZE.min((scan_end - pos) as usize);
        device.read_exact_at(pos, &mut batch[..want])?;

        for beg in (0..want).step_by(BLOCK_SIZE as usize) {
            let sector = &batch[beg..beg + BLOCK_SIZE as usize];
            sums.extend_from_slice(kind.sum(sector)?.as_bytes());

            // A node begins here iff the sector carries our fsid at the
            // header offset and the whole node checksums cleanly.
            let paddr = pos + beg as u64;
            if sector[0x20..0x30] == fsid && paddr + node_size as u64 <= dev_size {
                device.read_exact_at(paddr, &mut node_buf)?;
                if crate::core::checksum::verify_node_checksum(kind, &node_buf).is_ok() {
                    if let Ok(header) = NodeHeader::from_bytes(&node_buf) {
                        harvest_node(&header, &node_buf, kind.size(), PhysicalAddr(paddr as i64), &mut result);
                    }
                }
            }
        }
        pos += want as u64;
    }

    result.checksums = SumRun::new(kind.size(), PhysicalAddr(0), sums);
    info!(
        device = %devid,
        nodes = result.found_nodes.len(),
        chunks = result.found_chunks.len(),
        block_groups = result.found_block_groups.len(),
        dev_extents = result.found_dev_extents.len(),
        extent_csums = result.found_extent_csums.len(),
        "device scan finished"
    );
    Ok(result)
}

/// Records one verified node and, for leaves, the items it carries
fn harvest_node(
    header: &NodeHeader,
    node_buf: &[u8],
    csum_size: usize,
    paddr: PhysicalAddr,
    result: &mut ScanOneDeviceResult,
) {
    result
        .found_nodes
        .entry(LogicalAddr(header.bytenr as i64))
        .or_default()
        .push(paddr);

    if !header.is_leaf() {
        return;
    }

    for item in leaf_items(header, node_buf) {
        match item.key.item_type {
            item_type::CHUNK_ITEM => match ChunkItem::from_bytes(item.data) {
                Ok(chunk) => result.found_chunks.push(FoundChunk {
                    laddr: LogicalAddr(item.key.offset as i64),
                    item: chunk,
                }),
                Err(err) => debug!(%paddr, "bad chunk item: {err}"),
            },
            item_type::BLOCK_GROUP_ITEM => match BlockGroupItem::from_bytes(item.data) {
                Ok(bg) => result.found_block_groups.push(FoundBlockGroup {
                    laddr: LogicalAddr(item.key.objectid as i64),
                    size: AddrDelta(item.key.offset as i64),
                    flags: bg.flags,
                }),
                Err(err) => debug!(%paddr, "bad block-group item: {err}"),
            },
            item_type::DEV_EXTENT => match DevExtentItem::from_bytes(item.data) {
                Ok(ext) => result.found_dev_extents.push(FoundDevExtent {
                    dev: DeviceId(item.key.objectid),
                    paddr: PhysicalAddr(item.key.offset as i64),
                    laddr: ext.chunk_offset,
                    size: ext.length,
                }),
                Err(err) => debug!(%paddr, "bad dev-extent item: {err}"),
            },
            item_type::EXTENT_CSUM => {
                if item.key.objectid != EXTENT_CSUM_OBJECTID {
                    continue;
                }
                if item.data.is_empty() || item.data.len() % csum_size != 0 {
                    debug!(%paddr, "bad extent-csum item: {} bytes", item.data.len());
                    continue;
                }
                result.found_extent_csums.push(FoundExtentCsum {
                    generation: Generation(header.generation),
                    sums: SumRun::new(
                        csum_size,
                        LogicalAddr(item.key.offset as i64),
                        item.data.to_vec(),
                    ),
                });
            }
            _ => {}
        }
    }
}
