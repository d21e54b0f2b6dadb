//! Fusing recovered checksum-tree items into one logical-address run
//!
//! Every device contributes extent-checksum items from whatever checksum
//! tree nodes survived, possibly at several generations. The fuser merges
//! them into a single address-ordered [`SumRunWithGaps`]: newer generations
//! overwrite older ones, equal generations must agree byte for byte, and
//! duplicates across mirrors collapse.

use crate::cancel::CancelToken;
use crate::core::item::Generation;
use crate::core::sums::{SumRun, SumRunWithGaps};
use crate::core::{AddrDelta, LogicalAddr, Result, BLOCK_SIZE};
use crate::scan::{FoundExtentCsum, ScanDevicesResult};
use std::collections::BTreeMap;
use std::ops::Bound::Excluded;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    generation: Generation,
    run: SumRun<LogicalAddr>,
}

impl Record {
    fn end(&self) -> LogicalAddr {
        self.run.end()
    }

    /// The checksum bytes covering `[beg, end)`, which must lie inside the
    /// run
    fn bytes_for(&self, beg: LogicalAddr, end: LogicalAddr) -> &[u8] {
        let cs = self.run.checksum_size;
        let from = ((beg - self.run.addr).0 / BLOCK_SIZE) as usize * cs;
        let to = ((end - self.run.addr).0 / BLOCK_SIZE) as usize * cs;
        &self.run.sums[from..to]
    }
}

/// Merges every device's extent-checksum records into one gap-aware run
pub fn extract_logical_sums(
    token: &CancelToken,
    scan: &ScanDevicesResult,
) -> Result<SumRunWithGaps<LogicalAddr>> {
    let mut records: Vec<&FoundExtentCsum> = scan
        .devices
        .values()
        .flat_map(|dev| dev.found_extent_csums.iter())
        .collect();
    // Lower generations are inserted first so that newer data overwrites
    // older data below.
    records.sort_by_key(|rec| (rec.generation, rec.sums.addr));

    let mut map: BTreeMap<LogicalAddr, Record> = BTreeMap::new();
    'records: for rec in records {
        token.check()?;
        let mut new = Record {
            generation: rec.generation,
            run: rec.sums.clone(),
        };
        loop {
            let Some(old_key) = first_overlap(&map, new.run.addr, new.end()) else {
                map.insert(new.run.addr, new);
                continue 'records;
            };
            let old = &map[&old_key];
            if *old == new {
                // Duplicate across mirrors or devices.
                continue 'records;
            }
            if old.generation < new.generation {
                map.remove(&old_key);
                continue;
            }
            match merge_same_generation(old, &new) {
                Some(merged) => {
                    map.remove(&old_key);
                    new = merged;
                }
                None => {
                    error!(
                        addr = %new.run.addr,
                        generation = %new.generation,
                        "checksum items of the same generation disagree; dropping record"
                    );
                    continue 'records;
                }
            }
        }
    }

    // Concatenate adjacent runs, leaving a gap where there is a hole.
    let mut runs: Vec<SumRun<LogicalAddr>> = Vec::with_capacity(map.len());
    for (_, rec) in map {
        if let Some(last) = runs.last_mut() {
            if last.end() == rec.run.addr && last.checksum_size == rec.run.checksum_size {
                last.sums.extend_from_slice(&rec.run.sums);
                continue;
            }
        }
        runs.push(rec.run);
    }

    let (addr, size) = match (runs.first(), runs.last()) {
        (Some(first), Some(last)) => (first.addr, last.end() - first.addr),
        _ => (LogicalAddr(0), AddrDelta(0)),
    };
    Ok(SumRunWithGaps { addr, size, runs })
}

/// Key of the lowest record overlapping `[beg, end)`
fn first_overlap(
    map: &BTreeMap<LogicalAddr, Record>,
    beg: LogicalAddr,
    end: LogicalAddr,
) -> Option<LogicalAddr> {
    if let Some((&key, rec)) = map.range(..=beg).next_back() {
        if rec.end() > beg {
            return Some(key);
        }
    }
    map.range((Excluded(beg), Excluded(end)))
        .next()
        .map(|(&key, _)| key)
}

/// Unions two equal-generation overlapping records, or `None` if their
/// overlapping checksum bytes disagree
fn merge_same_generation(old: &Record, new: &Record) -> Option<Record> {
    let cs = old.run.checksum_size;
    if cs != new.run.checksum_size {
        return None;
    }

    let overlap_beg = old.run.addr.max(new.run.addr);
    let overlap_end = old.end().min(new.end());
    if old.bytes_for(overlap_beg, overlap_end) != new.bytes_for(overlap_beg, overlap_end) {
        return None;
    }

    let beg = old.run.addr.min(new.run.addr);
    let end = old.end().max(new.end());
    let mut sums = vec![0u8; ((end - beg).0 / BLOCK_SIZE) as usize * cs];
    for rec in [old, new] {
        let at = ((rec.run.addr - beg).0 / BLOCK_SIZE) as usize * cs;
        sums[at..at + rec.run.sums.len()].copy_from_slice(&rec.run.sums);
    }
    Some(Record {
        generation: old.generation,
        run: SumRun::new(cs, beg, sums),
    })
}
