//! Chunk-map reconstruction pipeline
//!
//! Six ordered stages feed evidence from a [`ScanDevicesResult`] into a
//! [`LogicalVolume`], most authoritative first: chunk items, device
//! extents, observed nodes, block groups aligned against existing coverage,
//! then exact and finally fuzzy checksum placement for whatever block
//! groups remain. Individual rejected mappings are logged and skipped; only
//! self-inconsistent input or cancellation aborts the run.

pub mod kmp;
pub mod logical_sums;
pub mod report;
pub mod unmapped;

pub use kmp::{build_kmp_table, index_all, KmpHaystack, KmpPattern};
pub use logical_sums::extract_logical_sums;
pub use report::write_report;
pub use unmapped::{
    list_unmapped_logical_regions, list_unmapped_physical_regions, sums_for_logical_region,
    PhysicalRegion,
};

use crate::cancel::CancelToken;
use crate::core::{
    AddrDelta, BlockGroupFlags, LogicalAddr, LogicalVolume, Mapping, PhysicalAddr,
    QualifiedPhysicalAddr, RescueError, Result, ShortSum, SumRunWithGaps, BLOCK_SIZE,
};
use crate::scan::ScanDevicesResult;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use tracing::{error, info};

/// Tunables for the reconstruction pipeline
#[derive(Debug, Clone)]
pub struct RebuildOptions {
    /// Minimum fraction of concrete checksum positions the best fuzzy
    /// candidate must exceed, and the runner-up must not
    pub min_fuzzy_pct: f64,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self { min_fuzzy_pct: 0.5 }
    }
}

/// One deduplicated block-group candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockGroup {
    pub laddr: LogicalAddr,
    pub size: AddrDelta,
    pub flags: BlockGroupFlags,
}

/// Rebuilds the chunk map from scan evidence
///
/// Mutates `lv` stage by stage and writes the final diagnostic report to
/// `report_out`. `node_size` comes from the superblock and sizes the
/// mappings implied by observed nodes.
pub fn rebuild_mappings(
    token: &CancelToken,
    lv: &mut LogicalVolume,
    scan: &ScanDevicesResult,
    node_size: AddrDelta,
    opts: &RebuildOptions,
    report_out: &mut dyn io::Write,
) -> Result<()> {
    for &dev in scan.devices.keys() {
        if !lv.physical_volumes().contains_key(&dev) {
            return Err(RescueError::DeviceMismatch(dev));
        }
    }

    info!("stage 1/6: chunk items");
    for dev_result in scan.devices.values() {
        for chunk in &dev_result.found_chunks {
            token.check()?;
            for &stripe in &chunk.item.stripes {
                let m = Mapping {
                    laddr: chunk.laddr,
                    paddr: stripe,
                    size: chunk.item.size,
                    size_locked: true,
                    flags: Some(chunk.item.flags),
                };
                if let Err(err) = lv.add_mapping(m) {
                    error!("chunk stripe rejected: {err}");
                }
            }
        }
    }

    info!("stage 2/6: device extents");
    for dev_result in scan.devices.values() {
        for ext in &dev_result.found_dev_extents {
            token.check()?;
            let m = Mapping {
                laddr: ext.laddr,
                paddr: QualifiedPhysicalAddr::new(ext.dev, ext.paddr),
                size: ext.size,
                size_locked: true,
                flags: None,
            };
            if let Err(err) = lv.add_mapping(m) {
                error!("device extent rejected: {err}");
            }
        }
    }

    info!("stage 3/6: observed nodes");
    for (&dev, dev_result) in &scan.devices {
        for (&laddr, paddrs) in &dev_result.found_nodes {
            token.check()?;
            for &paddr in paddrs {
                let m = Mapping {
                    laddr,
                    paddr: QualifiedPhysicalAddr::new(dev, paddr),
                    size: node_size,
                    size_locked: false,
                    flags: None,
                };
                if let Err(err) = lv.add_mapping(m) {
                    error!("node mapping rejected: {err}");
                }
            }
        }
    }

    info!("stage 4/6: block groups");
    let mut bgs = dedup_block_groups(scan)?;
    let total = bgs.len();
    for laddr in bgs.keys().copied().collect::<Vec<_>>() {
        token.check()?;
        let bg = bgs[&laddr];
        let Some((other_l, other_p)) = lv.resolve_any(bg.laddr, bg.size) else {
            error!(
                "block group laddr={} has no overlap with any mapping; deferring to checksum search",
                bg.laddr
            );
            continue;
        };
        let m = Mapping {
            laddr: bg.laddr,
            paddr: QualifiedPhysicalAddr::new(other_p.dev, other_p.addr - (other_l - bg.laddr)),
            size: bg.size,
            size_locked: true,
            flags: Some(bg.flags),
        };
        match lv.add_mapping(m) {
            Ok(()) => {
                bgs.remove(&laddr);
            }
            Err(err) => error!("block group rejected: {err}"),
        }
    }
    info!(
        placed = total - bgs.len(),
        remaining = bgs.len(),
        "block groups aligned against existing coverage"
    );

    let logical_sums = extract_logical_sums(token, scan)?;
    info!(
        runs = logical_sums.runs.len(),
        coverage_pct = logical_sums.pct_full() * 100.0,
        "recovered logical checksums"
    );

    match_block_groups_exact(token, lv, scan, &logical_sums, &mut bgs)?;
    match_block_groups_fuzzy(token, lv, scan, &logical_sums, &mut bgs, opts)?;

    write_report(report_out, lv, &logical_sums, &bgs)?;
    Ok(())
}

/// Deduplicates block-group records across devices and asserts their
/// self-consistency
///
/// The dedup key is the full `(laddr, size, flags)` triple, so records that
/// share an address but disagree on flags stay distinct candidates.
fn dedup_block_groups(scan: &ScanDevicesResult) -> Result<BTreeMap<LogicalAddr, BlockGroup>> {
    let mut set: BTreeSet<BlockGroup> = BTreeSet::new();
    for dev_result in scan.devices.values() {
        for found in &dev_result.found_block_groups {
            set.insert(BlockGroup {
                laddr: found.laddr,
                size: found.size,
                flags: found.flags,
            });
        }
    }

    let mut pos = LogicalAddr(i64::MIN);
    for bg in &set {
        if bg.size.0 <= 0 {
            return Err(RescueError::InconsistentBlockGroups(format!(
                "block group {} has non-positive size {}",
                bg.laddr, bg.size
            )));
        }
        if bg.laddr < pos {
            return Err(RescueError::InconsistentBlockGroups(format!(
                "block group {} overlaps its predecessor",
                bg.laddr
            )));
        }
        pos = bg.laddr + bg.size;
    }

    Ok(set.into_iter().map(|bg| (bg.laddr, bg)).collect())
}

/// Stage 5: place block groups whose checksum pattern occurs at exactly one
/// unmapped physical position
///
/// The unmapped regions are computed once, up front: every placement here
/// shrinks the search space stage 6 must index.
fn match_block_groups_exact(
    token: &CancelToken,
    lv: &mut LogicalVolume,
    scan: &ScanDevicesResult,
    logical_sums: &SumRunWithGaps<LogicalAddr>,
    bgs: &mut BTreeMap<LogicalAddr, BlockGroup>,
) -> Result<()> {
    info!(candidates = bgs.len(), "stage 5/6: exact checksum search");
    let regions = list_unmapped_physical_regions(lv);

    for laddr in bgs.keys().copied().collect::<Vec<_>>() {
        token.check()?;
        let bg = bgs[&laddr];
        let pattern = sums_for_logical_region(logical_sums, bg.laddr, bg.size);
        if pattern.num_sums() == 0 {
            info!("block group laddr={}: no recovered checksums to search with", bg.laddr);
            continue;
        }

        let mut matches: Vec<QualifiedPhysicalAddr> = Vec::new();
        for (&dev, dev_regions) in &regions {
            let Some(dev_result) = scan.devices.get(&dev) else {
                continue;
            };
            let checksums = &dev_result.checksums;
            for region in dev_regions {
                let beg_block = ((region.beg.0 + BLOCK_SIZE - 1) / BLOCK_SIZE) as usize;
                let end_block = ((region.end.0 / BLOCK_SIZE) as usize).min(checksums.num_sums());
                if end_block <= beg_block {
                    continue;
                }
                let view = checksums.view(beg_block, end_block - beg_block);
                for pos in index_all(&view, &pattern) {
                    matches.push(QualifiedPhysicalAddr::new(
                        dev,
                        PhysicalAddr((beg_block + pos) as i64 * BLOCK_SIZE),
                    ));
                }
            }
        }

        match matches.as_slice() {
            [paddr] => {
                let m = Mapping {
                    laddr: bg.laddr,
                    paddr: *paddr,
                    size: bg.size,
                    size_locked: true,
                    flags: Some(bg.flags),
                };
                match lv.add_mapping(m) {
                    Ok(()) => {
                        info!("block group laddr={} placed at {}", bg.laddr, paddr);
                        bgs.remove(&laddr);
                    }
                    Err(err) => error!("exact match rejected: {err}"),
                }
            }
            [] => info!("block group laddr={}: no exact match", bg.laddr),
            many => info!(
                "block group laddr={}: {} exact matches, leaving unplaced",
                bg.laddr,
                many.len()
            ),
        }
    }
    Ok(())
}

/// Stage 6: place remaining block groups by voting over a sector-checksum
/// index
///
/// The index holds one entry per unmapped physical sector and is dropped
/// before this function returns, ahead of report formatting.
fn match_block_groups_fuzzy(
    token: &CancelToken,
    lv: &mut LogicalVolume,
    scan: &ScanDevicesResult,
    logical_sums: &SumRunWithGaps<LogicalAddr>,
    bgs: &mut BTreeMap<LogicalAddr, BlockGroup>,
    opts: &RebuildOptions,
) -> Result<()> {
    info!(candidates = bgs.len(), "stage 6/6: fuzzy checksum search");
    if bgs.is_empty() {
        return Ok(());
    }

    let regions = list_unmapped_physical_regions(lv);
    let mut index: HashMap<ShortSum, Vec<QualifiedPhysicalAddr>> = HashMap::new();
    let mut indexed = 0usize;
    for (&dev, dev_regions) in &regions {
        let Some(dev_result) = scan.devices.get(&dev) else {
            continue;
        };
        for region in dev_regions {
            token.check()?;
            let beg_block = ((region.beg.0 + BLOCK_SIZE - 1) / BLOCK_SIZE) as usize;
            let end_block =
                ((region.end.0 / BLOCK_SIZE) as usize).min(dev_result.checksums.num_sums());
            for i in beg_block..end_block {
                index
                    .entry(dev_result.checksums.sum_at(i))
                    .or_default()
                    .push(QualifiedPhysicalAddr::new(
                        dev,
                        PhysicalAddr(i as i64 * BLOCK_SIZE),
                    ));
                indexed += 1;
            }
        }
    }
    info!(sectors = indexed, "fuzzy index built");

    for laddr in bgs.keys().copied().collect::<Vec<_>>() {
        token.check()?;
        let bg = bgs[&laddr];
        let pattern = sums_for_logical_region(logical_sums, bg.laddr, bg.size);

        let mut concrete = 0usize;
        let mut votes: HashMap<QualifiedPhysicalAddr, usize> = HashMap::new();
        for i in 0..pattern.pat_len() {
            let Some(sum) = pattern.pat_get(i) else {
                continue;
            };
            concrete += 1;
            let Some(candidates) = index.get(&sum) else {
                continue;
            };
            for qpa in candidates {
                let start = qpa.addr.0 - i as i64 * BLOCK_SIZE;
                if start < 0 {
                    continue;
                }
                *votes
                    .entry(QualifiedPhysicalAddr::new(qpa.dev, PhysicalAddr(start)))
                    .or_default() += 1;
            }
        }
        if concrete == 0 {
            info!("block group laddr={}: no recovered checksums to vote with", bg.laddr);
            continue;
        }

        let mut best: Option<(QualifiedPhysicalAddr, usize)> = None;
        let mut second = 0usize;
        for (&start, &n) in &votes {
            match best {
                Some((_, best_n)) if n <= best_n => second = second.max(n),
                _ => {
                    if let Some((_, best_n)) = best {
                        second = second.max(best_n);
                    }
                    best = Some((start, n));
                }
            }
        }
        let Some((start, n1)) = best else {
            info!("block group laddr={}: no fuzzy candidates", bg.laddr);
            continue;
        };

        let pct1 = n1 as f64 / concrete as f64;
        let pct2 = second as f64 / concrete as f64;
        // A lone candidate above the threshold wins unconditionally; there
        // is no runner-up to compare against.
        if pct1 > opts.min_fuzzy_pct && pct2 <= opts.min_fuzzy_pct {
            info!(
                "block group laddr={} placed at {} ({:.1}% match, runner-up {:.1}%)",
                bg.laddr,
                start,
                pct1 * 100.0,
                pct2 * 100.0
            );
            let m = Mapping {
                laddr: bg.laddr,
                paddr: start,
                size: bg.size,
                size_locked: true,
                flags: Some(bg.flags),
            };
            match lv.add_mapping(m) {
                Ok(()) => {
                    bgs.remove(&laddr);
                }
                Err(err) => error!("fuzzy match rejected: {err}"),
            }
        } else {
            info!(
                "block group laddr={}: ambiguous fuzzy scores ({:.1}% vs {:.1}%), leaving unplaced",
                bg.laddr,
                pct1 * 100.0,
                pct2 * 100.0
            );
        }
    }
    Ok(())
}
