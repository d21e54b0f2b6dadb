//! Final diagnostic report
//!
//! After the last stage the tool reports what could not be accounted for:
//! physical space no mapping touches, recovered logical checksums with no
//! mapping, and block groups that never found a home. Counts and totals
//! come first, then the detailed listings in sorted order.

use super::unmapped::{list_unmapped_logical_regions, list_unmapped_physical_regions};
use super::BlockGroup;
use crate::core::{LogicalAddr, LogicalVolume, SumRunWithGaps};
use std::collections::BTreeMap;
use std::io::{self, Write};

/// Writes the post-rebuild report to `out`
pub fn write_report(
    out: &mut dyn Write,
    lv: &LogicalVolume,
    logical_sums: &SumRunWithGaps<LogicalAddr>,
    unplaced: &BTreeMap<LogicalAddr, BlockGroup>,
) -> io::Result<()> {
    let physical = list_unmapped_physical_regions(lv);
    let logical = list_unmapped_logical_regions(lv, logical_sums);

    writeln!(out, "summary:")?;
    for (dev, regions) in &physical {
        let total: i64 = regions.iter().map(|r| r.size().0).sum();
        writeln!(
            out,
            "  device {}: {} unmapped physical regions, {} bytes",
            dev,
            regions.len(),
            total
        )?;
    }
    let logical_total: i64 = logical.iter().map(|run| run.size().0).sum();
    writeln!(
        out,
        "  unmapped logical regions with checksums: {} regions, {} bytes",
        logical.len(),
        logical_total
    )?;
    let unplaced_total: i64 = unplaced.values().map(|bg| bg.size.0).sum();
    writeln!(
        out,
        "  unplaced block groups: {}, {} bytes",
        unplaced.len(),
        unplaced_total
    )?;

    writeln!(out)?;
    writeln!(out, "unmapped physical regions:")?;
    for (dev, regions) in &physical {
        writeln!(out, "  device {}:", dev)?;
        for region in regions {
            writeln!(
                out,
                "    {}..{} ({} bytes)",
                region.beg,
                region.end,
                region.size().0
            )?;
        }
    }

    writeln!(out)?;
    writeln!(out, "unmapped logical regions with checksums:")?;
    for run in &logical {
        writeln!(
            out,
            "  {}..{} ({} bytes)",
            run.addr,
            run.end(),
            run.size().0
        )?;
    }

    writeln!(out)?;
    writeln!(out, "unplaced block groups:")?;
    for bg in unplaced.values() {
        writeln!(
            out,
            "  laddr={} size={} flags={}",
            bg.laddr, bg.size, bg.flags
        )?;
    }

    Ok(())
}
