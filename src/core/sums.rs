//! Checksum runs over an address space
//!
//! A [`SumRun`] is a dense sequence of per-sector checksums starting at some
//! address; a [`SumRunWithGaps`] is an ordered collection of runs inside a
//! window that need not be fully covered. Runs are generic over the address
//! space so the same types serve whole-device physical checksums and the
//! recovered logical checksum map.

use super::addr::{Addr, AddrDelta};
use super::checksum::ShortSum;
use super::BLOCK_SIZE;
use serde::{Deserialize, Serialize};

/// Consecutive per-sector checksums starting at `addr`
///
/// `sums` holds `sums.len() / checksum_size` checksums; each covers exactly
/// one [`BLOCK_SIZE`] sector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumRun<A> {
    /// Bytes per checksum
    pub checksum_size: usize,
    /// Address of the first checksummed sector
    pub addr: A,
    /// Concatenated checksum bytes
    pub sums: Vec<u8>,
}

impl<A: Addr> SumRun<A> {
    /// Creates a run; `sums` must be a whole number of checksums
    pub fn new(checksum_size: usize, addr: A, sums: Vec<u8>) -> Self {
        assert!(checksum_size > 0, "checksum size must be positive");
        assert_eq!(sums.len() % checksum_size, 0, "truncated checksum data");
        Self {
            checksum_size,
            addr,
            sums,
        }
    }

    /// Number of checksums in the run
    pub fn num_sums(&self) -> usize {
        self.sums.len() / self.checksum_size
    }

    /// Number of bytes of the address space the run covers
    pub fn size(&self) -> AddrDelta {
        AddrDelta(self.num_sums() as i64 * BLOCK_SIZE)
    }

    /// One past the last covered address
    pub fn end(&self) -> A {
        self.addr.offset(self.size())
    }

    /// Checksum of the `i`-th sector
    pub fn sum_at(&self, i: usize) -> ShortSum {
        let beg = i * self.checksum_size;
        ShortSum::from_bytes(&self.sums[beg..beg + self.checksum_size])
    }

    /// Checksum of the sector containing `addr`, if covered
    pub fn sum_for_addr(&self, addr: A) -> Option<ShortSum> {
        if addr < self.addr || addr >= self.end() {
            return None;
        }
        let i = (addr.dist_from(self.addr).0 / BLOCK_SIZE) as usize;
        Some(self.sum_at(i))
    }

    /// Borrowed window of `num` checksums starting at block `beg`
    pub fn view(&self, beg: usize, num: usize) -> SumRunView<'_, A> {
        assert!(beg + num <= self.num_sums(), "view out of bounds");
        SumRunView {
            run: self,
            beg,
            num,
        }
    }

    /// Visits every `(addr, sum)` pair in order
    pub fn walk(&self, mut f: impl FnMut(A, ShortSum)) {
        for i in 0..self.num_sums() {
            f(self.addr.offset(AddrDelta(i as i64 * BLOCK_SIZE)), self.sum_at(i));
        }
    }
}

/// A borrowed, block-aligned window into a [`SumRun`]
#[derive(Debug, Clone, Copy)]
pub struct SumRunView<'a, A> {
    run: &'a SumRun<A>,
    beg: usize,
    num: usize,
}

impl<'a, A: Addr> SumRunView<'a, A> {
    /// Number of checksums in the window
    pub fn num_sums(&self) -> usize {
        self.num
    }

    /// Checksum of the `i`-th sector of the window
    pub fn sum_at(&self, i: usize) -> ShortSum {
        assert!(i < self.num, "view index out of bounds");
        self.run.sum_at(self.beg + i)
    }

    /// Address of the first sector of the window
    pub fn addr(&self) -> A {
        self.run
            .addr
            .offset(AddrDelta(self.beg as i64 * BLOCK_SIZE))
    }
}

/// Ordered, non-overlapping checksum runs inside `[addr, addr + size)`
///
/// The union of the runs need not cover the window; uncovered sectors read
/// as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumRunWithGaps<A> {
    /// Window start
    pub addr: A,
    /// Window size in bytes
    pub size: AddrDelta,
    /// Runs in address order
    pub runs: Vec<SumRun<A>>,
}

impl<A: Addr> SumRunWithGaps<A> {
    /// Number of checksums actually present
    pub fn num_sums(&self) -> usize {
        self.runs.iter().map(SumRun::num_sums).sum()
    }

    /// Number of sectors the window spans, present or not
    pub fn num_blocks(&self) -> usize {
        (self.size.0 / BLOCK_SIZE) as usize
    }

    /// Fraction of the window that has checksums
    pub fn pct_full(&self) -> f64 {
        let blocks = self.num_blocks();
        if blocks == 0 {
            return 1.0;
        }
        self.num_sums() as f64 / blocks as f64
    }

    /// One past the end of the window
    pub fn end(&self) -> A {
        self.addr.offset(self.size)
    }

    /// Checksum of the sector containing `addr`, if present
    pub fn sum_for_addr(&self, addr: A) -> Option<ShortSum> {
        // Runs are ordered; find the last run starting at or before addr.
        let i = self
            .runs
            .partition_point(|run| run.addr <= addr)
            .checked_sub(1)?;
        self.runs[i].sum_for_addr(addr)
    }

    /// Visits every present `(addr, sum)` pair in order
    pub fn walk(&self, mut f: impl FnMut(A, ShortSum)) {
        for run in &self.runs {
            run.walk(&mut f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::addr::{LogicalAddr, PhysicalAddr};

    fn sums_of(bytes: &[u8]) -> Vec<u8> {
        // One fake 4-byte checksum per entry value.
        bytes.iter().flat_map(|&b| [b, 0, 0, 0]).collect()
    }

    #[test]
    fn test_sum_run_basics() {
        let run = SumRun::new(4, PhysicalAddr(0x1000), sums_of(&[1, 2, 3]));
        assert_eq!(run.num_sums(), 3);
        assert_eq!(run.size(), AddrDelta(3 * 4096));
        assert_eq!(run.end(), PhysicalAddr(0x1000 + 3 * 4096));
        assert_eq!(run.sum_at(1).as_bytes(), &[2, 0, 0, 0]);
    }

    #[test]
    fn test_sum_run_lookup() {
        let run = SumRun::new(4, LogicalAddr(0x2000), sums_of(&[9, 8]));
        assert_eq!(
            run.sum_for_addr(LogicalAddr(0x2000)).unwrap().as_bytes(),
            &[9, 0, 0, 0]
        );
        // Mid-sector addresses resolve to the covering sector.
        assert_eq!(
            run.sum_for_addr(LogicalAddr(0x3123)).unwrap().as_bytes(),
            &[8, 0, 0, 0]
        );
        assert!(run.sum_for_addr(LogicalAddr(0x1fff)).is_none());
        assert!(run.sum_for_addr(LogicalAddr(0x4000)).is_none());
    }

    #[test]
    #[should_panic(expected = "truncated")]
    fn test_sum_run_truncated() {
        SumRun::new(4, LogicalAddr(0), vec![1, 2, 3]);
    }

    #[test]
    fn test_view() {
        let run = SumRun::new(4, PhysicalAddr(0), sums_of(&[1, 2, 3, 4, 5]));
        let view = run.view(1, 3);
        assert_eq!(view.num_sums(), 3);
        assert_eq!(view.addr(), PhysicalAddr(4096));
        assert_eq!(view.sum_at(0).as_bytes(), &[2, 0, 0, 0]);
        assert_eq!(view.sum_at(2).as_bytes(), &[4, 0, 0, 0]);
    }

    #[test]
    fn test_gaps_lookup_and_walk() {
        let gaps = SumRunWithGaps {
            addr: LogicalAddr(0),
            size: AddrDelta(6 * 4096),
            runs: vec![
                SumRun::new(4, LogicalAddr(0), sums_of(&[1, 2])),
                SumRun::new(4, LogicalAddr(4 * 4096), sums_of(&[5])),
            ],
        };
        assert_eq!(gaps.num_sums(), 3);
        assert_eq!(gaps.num_blocks(), 6);
        assert!((gaps.pct_full() - 0.5).abs() < 1e-9);

        assert!(gaps.sum_for_addr(LogicalAddr(2 * 4096)).is_none());
        assert_eq!(
            gaps.sum_for_addr(LogicalAddr(4 * 4096)).unwrap().as_bytes(),
            &[5, 0, 0, 0]
        );

        let mut seen = Vec::new();
        gaps.walk(|addr, sum| seen.push((addr, sum.as_bytes()[0])));
        assert_eq!(
            seen,
            vec![
                (LogicalAddr(0), 1),
                (LogicalAddr(4096), 2),
                (LogicalAddr(4 * 4096), 5),
            ]
        );
    }

    #[test]
    fn test_empty_window_is_full() {
        let gaps: SumRunWithGaps<LogicalAddr> = SumRunWithGaps {
            addr: LogicalAddr(0),
            size: AddrDelta(0),
            runs: vec![],
        };
        assert!((gaps.pct_full() - 1.0).abs() < 1e-9);
    }
}
