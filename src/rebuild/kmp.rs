//! Substring search with wildcards
//!
//! A substring matcher generic over the element type. Patterns may report a
//! wildcard at any position; a wildcard compares equal to anything on
//! either side. The haystack is traversed strictly left to right with one
//! read per position, which keeps searches over checksum runs cheap.
//!
//! Concrete patterns are searched with classical Knuth-Morris-Pratt in
//! `O(haystack + pattern)`. Patterns containing wildcards cannot use the
//! KMP failure function: "matches a wildcard" is not transitive, so a
//! border the table claims need not hold for the actual text, and trusting
//! it reports positions that do not match. Those patterns are searched by
//! checking every window against a ring buffer of the most recent values,
//! which is `O(haystack * pattern)` in the worst case.

use crate::core::sums::{SumRunView, SumRunWithGaps};
use crate::core::{Addr, AddrDelta, ShortSum, BLOCK_SIZE};

/// A pattern to search for; positions may be wildcards
pub trait KmpPattern<V> {
    /// Number of positions in the pattern
    fn pat_len(&self) -> usize;

    /// Value at position `i`, or `None` for a wildcard that matches any
    /// concrete value
    fn pat_get(&self, i: usize) -> Option<V>;
}

/// A sequence to search in
pub trait KmpHaystack<V> {
    /// Number of positions in the sequence
    fn seq_len(&self) -> usize;

    /// Value at position `i`; called exactly once per position
    fn seq_get(&self, i: usize) -> V;
}

impl<V: Copy> KmpHaystack<V> for [V] {
    fn seq_len(&self) -> usize {
        self.len()
    }

    fn seq_get(&self, i: usize) -> V {
        self[i]
    }
}

/// A slice of optional values is the simplest pattern; `None` is a wildcard
impl<V: Copy> KmpPattern<V> for [Option<V>] {
    fn pat_len(&self) -> usize {
        self.len()
    }

    fn pat_get(&self, i: usize) -> Option<V> {
        self[i]
    }
}

/// Physical checksum windows act as haystacks of one sum per sector
impl<A: Addr> KmpHaystack<ShortSum> for SumRunView<'_, A> {
    fn seq_len(&self) -> usize {
        self.num_sums()
    }

    fn seq_get(&self, i: usize) -> ShortSum {
        self.sum_at(i)
    }
}

/// Sparse logical checksum runs act as patterns whose gaps are wildcards
impl<A: Addr> KmpPattern<ShortSum> for SumRunWithGaps<A> {
    fn pat_len(&self) -> usize {
        self.num_blocks()
    }

    fn pat_get(&self, i: usize) -> Option<ShortSum> {
        self.sum_for_addr(self.addr.offset(AddrDelta(i as i64 * BLOCK_SIZE)))
    }
}

fn pat_matches<V: PartialEq, P: KmpPattern<V> + ?Sized>(pat: &P, i: usize, value: &V) -> bool {
    match pat.pat_get(i) {
        None => true,
        Some(v) => v == *value,
    }
}

/// Pattern self-comparison under wildcard equality
fn pat_self_eq<V: PartialEq, P: KmpPattern<V> + ?Sized>(pat: &P, i: usize, j: usize) -> bool {
    match (pat.pat_get(i), pat.pat_get(j)) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Builds the KMP failure table for `pat`
///
/// `table[m - 1]` is the largest `v < m` such that the first `v` positions
/// of the pattern equal (under wildcard equality) the `v` positions ending
/// at `m`.
///
/// The search only trusts this table for concrete patterns: wildcard
/// equality is not transitive, so for patterns with wildcards the table's
/// borders are not guaranteed to hold for the text being searched.
pub fn build_kmp_table<V: PartialEq, P: KmpPattern<V> + ?Sized>(pat: &P) -> Vec<usize> {
    let len = pat.pat_len();
    let mut table = vec![0usize; len];
    let mut k = 0usize;
    for j in 1..len {
        while k > 0 && !pat_self_eq(pat, j, k) {
            k = table[k - 1];
        }
        if pat_self_eq(pat, j, k) {
            k += 1;
        }
        table[j] = k;
    }
    table
}

/// Returns every position of `haystack` at which `pat` matches
///
/// A position `i` is returned iff for every `j`, `pat` is a wildcard at `j`
/// or equals `haystack[i + j]`. Overlapping matches are all returned.
/// Panics if the pattern is empty; that is a programming error, not
/// recoverable input.
pub fn index_all<V, H, P>(haystack: &H, pat: &P) -> Vec<usize>
where
    V: PartialEq,
    H: KmpHaystack<V> + ?Sized,
    P: KmpPattern<V> + ?Sized,
{
    let len = pat.pat_len();
    assert!(len > 0, "empty pattern");
    if (0..len).any(|j| pat.pat_get(j).is_none()) {
        index_all_windowed(haystack, pat)
    } else {
        index_all_concrete(haystack, pat)
    }
}

/// Classical KMP over a pattern with no wildcards
fn index_all_concrete<V, H, P>(haystack: &H, pat: &P) -> Vec<usize>
where
    V: PartialEq,
    H: KmpHaystack<V> + ?Sized,
    P: KmpPattern<V> + ?Sized,
{
    let table = build_kmp_table(pat);

    let mut matches = Vec::new();
    let mut matched = 0usize;
    for i in 0..haystack.seq_len() {
        let value = haystack.seq_get(i);
        while matched > 0 && !pat_matches(pat, matched, &value) {
            matched = table[matched - 1];
        }
        if pat_matches(pat, matched, &value) {
            matched += 1;
            if matched == pat.pat_len() {
                matches.push(i + 1 - matched);
                matched = table[matched - 1];
            }
        }
    }
    matches
}

/// Windowed scan for patterns with wildcards
///
/// Keeps the last `pat_len` haystack values in a ring buffer and checks
/// each window in full, so the haystack is still read exactly once per
/// position and no failure-function shortcut is taken.
fn index_all_windowed<V, H, P>(haystack: &H, pat: &P) -> Vec<usize>
where
    V: PartialEq,
    H: KmpHaystack<V> + ?Sized,
    P: KmpPattern<V> + ?Sized,
{
    let len = pat.pat_len();
    let mut matches = Vec::new();
    let mut window: Vec<V> = Vec::with_capacity(len);
    for i in 0..haystack.seq_len() {
        let value = haystack.seq_get(i);
        if window.len() < len {
            window.push(value);
        } else {
            window[i % len] = value;
        }
        if i + 1 >= len {
            let beg = i + 1 - len;
            let hit = (0..len).all(|j| match pat.pat_get(j) {
                None => true,
                Some(v) => v == window[(beg + j) % len],
            });
            if hit {
                matches.push(beg);
            }
        }
    }
    matches
}
