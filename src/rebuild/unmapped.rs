//! Complement enumeration over both address spaces
//!
//! Stages 5 and 6 only ever search space the overlay does not already
//! account for: physical regions no mapping touches (minus the superblock
//! copies, which are permanently reserved), and logical checksums that no
//! mapping covers.

use crate::core::sums::{SumRun, SumRunWithGaps};
use crate::core::{
    superblock_addrs, AddrDelta, DeviceId, LogicalAddr, LogicalVolume, PhysicalAddr,
    BLOCK_SIZE, SUPERBLOCK_SIZE,
};
use std::collections::BTreeMap;

/// One contiguous unmapped physical range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRegion {
    /// First unmapped byte
    pub beg: PhysicalAddr,
    /// One past the last unmapped byte
    pub end: PhysicalAddr,
}

impl PhysicalRegion {
    /// Size of the region in bytes
    pub fn size(&self) -> AddrDelta {
        self.end - self.beg
    }
}

/// Per-device complement of the current physical coverage
///
/// The superblock copies (and their byte length) are excluded on every
/// device even though no mapping covers them.
pub fn list_unmapped_physical_regions(
    lv: &LogicalVolume,
) -> BTreeMap<DeviceId, Vec<PhysicalRegion>> {
    let sb_len = AddrDelta(SUPERBLOCK_SIZE as i64);
    let mut out = BTreeMap::new();
    for (&dev, &dev_size) in lv.physical_volumes() {
        let mut reserved: Vec<(PhysicalAddr, PhysicalAddr)> = lv
            .physical_coverage(dev)
            .into_iter()
            .map(|(beg, size)| (beg, beg + size))
            .collect();
        for sb in superblock_addrs() {
            if sb < dev_size {
                reserved.push((sb, (sb + sb_len).min(dev_size)));
            }
        }
        reserved.sort();

        let mut regions = Vec::new();
        let mut pos = PhysicalAddr(0);
        for (beg, end) in reserved {
            if beg > pos {
                regions.push(PhysicalRegion { beg: pos, end: beg });
            }
            pos = pos.max(end);
        }
        if pos < dev_size {
            regions.push(PhysicalRegion {
                beg: pos,
                end: dev_size,
            });
        }
        out.insert(dev, regions);
    }
    out
}

/// The subsequences of `sums` whose logical addresses no mapping covers
///
/// Granularity is [`BLOCK_SIZE`]; the gap structure of the input is kept.
pub fn list_unmapped_logical_regions(
    lv: &LogicalVolume,
    sums: &SumRunWithGaps<LogicalAddr>,
) -> Vec<SumRun<LogicalAddr>> {
    let mut out = Vec::new();
    for run in &sums.runs {
        let cs = run.checksum_size;
        let mut unmapped_beg: Option<usize> = None;
        for i in 0..=run.num_sums() {
            let block_unmapped = i < run.num_sums() && {
                let addr = run.addr + AddrDelta(i as i64 * BLOCK_SIZE);
                lv.resolve_any(addr, AddrDelta(BLOCK_SIZE)).is_none()
            };
            match (unmapped_beg, block_unmapped) {
                (None, true) => unmapped_beg = Some(i),
                (Some(beg), false) => {
                    out.push(SumRun::new(
                        cs,
                        run.addr + AddrDelta(beg as i64 * BLOCK_SIZE),
                        run.sums[beg * cs..i * cs].to_vec(),
                    ));
                    unmapped_beg = None;
                }
                _ => {}
            }
        }
    }
    out
}

/// The restriction of `sums` to `[beg, beg + size)`, preserving gaps
pub fn sums_for_logical_region(
    sums: &SumRunWithGaps<LogicalAddr>,
    beg: LogicalAddr,
    size: AddrDelta,
) -> SumRunWithGaps<LogicalAddr> {
    let end = beg + size;
    let mut runs = Vec::new();
    for run in &sums.runs {
        if run.end() <= beg || run.addr >= end {
            continue;
        }
        let cs = run.checksum_size;
        let clip_beg = run.addr.max(beg);
        let clip_end = run.end().min(end);
        let from = ((clip_beg - run.addr).0 / BLOCK_SIZE) as usize * cs;
        let to = ((clip_end - run.addr).0 / BLOCK_SIZE) as usize * cs;
        runs.push(SumRun::new(cs, clip_beg, run.sums[from..to].to_vec()));
    }
    SumRunWithGaps {
        addr: beg,
        size,
        runs,
    }
}
