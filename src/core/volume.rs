//! Logical volume overlay
//!
//! The overlay is the mutable state the rescue pipeline rebuilds: an ordered
//! set of non-overlapping extents mapping the logical address space onto
//! per-device physical ranges. Every insertion is validated against the
//! existing mappings on both axes; incompatible evidence is rejected with a
//! descriptive error and the overlay is left untouched.

use super::addr::{AddrDelta, DeviceId, LogicalAddr, PhysicalAddr, QualifiedPhysicalAddr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::{Excluded, Unbounded};
use thiserror::Error;

/// Intended use of a logical region: data / metadata / system plus a
/// redundancy profile
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockGroupFlags(pub u64);

impl BlockGroupFlags {
    pub const DATA: u64 = 1 << 0;
    pub const SYSTEM: u64 = 1 << 1;
    pub const METADATA: u64 = 1 << 2;
    pub const RAID0: u64 = 1 << 3;
    pub const RAID1: u64 = 1 << 4;
    pub const DUP: u64 = 1 << 5;
    pub const RAID10: u64 = 1 << 6;
    pub const RAID5: u64 = 1 << 7;
    pub const RAID6: u64 = 1 << 8;
    pub const RAID1C3: u64 = 1 << 9;
    pub const RAID1C4: u64 = 1 << 10;

    const NAMES: [(u64, &'static str); 11] = [
        (Self::DATA, "DATA"),
        (Self::SYSTEM, "SYSTEM"),
        (Self::METADATA, "METADATA"),
        (Self::RAID0, "RAID0"),
        (Self::RAID1, "RAID1"),
        (Self::DUP, "DUP"),
        (Self::RAID10, "RAID10"),
        (Self::RAID5, "RAID5"),
        (Self::RAID6, "RAID6"),
        (Self::RAID1C3, "RAID1C3"),
        (Self::RAID1C4, "RAID1C4"),
    ];

    /// Whether all of `bits` are set
    pub const fn contains(&self, bits: u64) -> bool {
        self.0 & bits == bits
    }
}

impl fmt::Display for BlockGroupFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.0;
        let mut first = true;
        for (bit, name) in Self::NAMES {
            if self.0 & bit != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
                rest &= !bit;
            }
        }
        if rest != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "0x{:x}", rest)?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// One extent of the logical-to-physical map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Logical start
    pub laddr: LogicalAddr,
    /// Physical start (device + offset)
    pub paddr: QualifiedPhysicalAddr,
    /// Extent size in bytes, strictly positive
    pub size: AddrDelta,
    /// If true the size is exact and may never change; if false it is a
    /// lower bound that merges may extend
    pub size_locked: bool,
    /// Block-group flags, once a block-group record has been associated
    pub flags: Option<BlockGroupFlags>,
}

impl Mapping {
    /// One past the last logical byte
    pub fn laddr_end(&self) -> LogicalAddr {
        self.laddr + self.size
    }

    /// One past the last physical byte
    pub fn paddr_end(&self) -> PhysicalAddr {
        self.paddr.addr + self.size
    }

    /// The constant logical-to-physical offset of this extent
    fn translation(&self) -> i64 {
        self.paddr.addr.0 - self.laddr.0
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "laddr={} paddr={} size={} locked={}",
            self.laddr, self.paddr, self.size, self.size_locked
        )?;
        match self.flags {
            Some(flags) => write!(f, " flags={}", flags),
            None => write!(f, " flags=unset"),
        }
    }
}

/// Why a mapping was rejected by [`LogicalVolume::add_mapping`]
#[derive(Error, Debug)]
pub enum MappingError {
    #[error("conflicting mapping: candidate ({new}) does not translate like existing ({existing})")]
    Conflict { new: Mapping, existing: Mapping },

    #[error("conflicting flags: {a} vs {b}")]
    ConflictingFlags { a: BlockGroupFlags, b: BlockGroupFlags },

    #[error("mapping size is locked: ({existing}) cannot become size {size}")]
    SizeLocked { existing: Mapping, size: AddrDelta },

    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("mapping has non-positive size: {0}")]
    NonPositiveSize(AddrDelta),
}

/// Ordered, gap-free store of non-overlapping mappings
///
/// Invariants enforced on every insertion: logical uniqueness, per-device
/// physical uniqueness, flag agreement, size-lock monotonicity, and
/// coalescing of compatible neighbours. Mappings are never deleted; they
/// only grow by union or adjacency merge.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LogicalVolume {
    devices: BTreeMap<DeviceId, PhysicalAddr>,
    mappings: BTreeMap<LogicalAddr, Mapping>,
    by_paddr: BTreeMap<DeviceId, BTreeMap<PhysicalAddr, LogicalAddr>>,
}

impl LogicalVolume {
    /// Creates an empty volume with no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device and its size
    pub fn add_physical_volume(&mut self, dev: DeviceId, size: PhysicalAddr) {
        self.devices.insert(dev, size);
        self.by_paddr.entry(dev).or_default();
    }

    /// Devices and their sizes, in device order
    pub fn physical_volumes(&self) -> &BTreeMap<DeviceId, PhysicalAddr> {
        &self.devices
    }

    /// Mappings in logical-address order
    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.values()
    }

    /// Number of mappings
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Whether the volume has no mappings yet
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Physical extents mapped on `dev`, in physical order
    pub fn physical_coverage(&self, dev: DeviceId) -> Vec<(PhysicalAddr, AddrDelta)> {
        let Some(index) = self.by_paddr.get(&dev) else {
            return Vec::new();
        };
        index
            .iter()
            .map(|(&paddr, laddr)| (paddr, self.mappings[laddr].size))
            .collect()
    }

    /// Inserts `m` if it is compatible with every existing mapping
    ///
    /// Overlapping compatible mappings are replaced by their union; the
    /// result is then coalesced with adjacent neighbours. On error the
    /// overlay is unchanged.
    pub fn add_mapping(&mut self, m: Mapping) -> Result<(), MappingError> {
        if m.size.0 <= 0 {
            return Err(MappingError::NonPositiveSize(m.size));
        }
        let dev = m.paddr.dev;
        if !self.devices.contains_key(&dev) {
            return Err(MappingError::UnknownDevice(dev));
        }

        // Gather the transitive closure of intersectors on both axes before
        // touching the maps, so a rejection cannot leave partial state.
        let delta = m.translation();
        let mut l_beg = m.laddr;
        let mut l_end = m.laddr_end();
        let mut members: BTreeMap<LogicalAddr, Mapping> = BTreeMap::new();
        let mut merged_flags: Option<BlockGroupFlags> = None;
        loop {
            let p_beg = PhysicalAddr(l_beg.0 + delta);
            let p_end = PhysicalAddr(l_end.0 + delta);
            let mut candidates = self.logical_overlaps(l_beg, l_end);
            candidates.extend(self.physical_overlaps(dev, p_beg, p_end));

            let mut grew = false;
            for key in candidates {
                if members.contains_key(&key) {
                    continue;
                }
                let other = self.mappings[&key];
                if other.paddr.dev != dev || other.translation() != delta {
                    return Err(MappingError::Conflict {
                        new: m,
                        existing: other,
                    });
                }
                if let Some(flags) = other.flags {
                    match merged_flags {
                        Some(have) if have != flags => {
                            return Err(MappingError::ConflictingFlags { a: have, b: flags });
                        }
                        _ => merged_flags = Some(flags),
                    }
                }
                l_beg = l_beg.min(other.laddr);
                l_end = l_end.max(other.laddr_end());
                members.insert(key, other);
                grew = true;
            }
            if !grew {
                break;
            }
        }

        if let (Some(have), Some(flags)) = (merged_flags, m.flags) {
            if have != flags {
                return Err(MappingError::ConflictingFlags { a: have, b: flags });
            }
        }

        let size = l_end - l_beg;
        let unioned = Mapping {
            laddr: l_beg,
            paddr: QualifiedPhysicalAddr::new(dev, PhysicalAddr(l_beg.0 + delta)),
            size,
            size_locked: m.size_locked || members.values().any(|o| o.size_locked),
            flags: merged_flags.or(m.flags),
        };

        // A locked constituent's size is exact; the union may not change it.
        for c in members.values().chain(std::iter::once(&m)) {
            if c.size_locked && c.size != size {
                return Err(MappingError::SizeLocked { existing: *c, size });
            }
        }

        for (key, member) in &members {
            self.mappings.remove(key);
            self.by_paddr
                .get_mut(&member.paddr.dev)
                .expect("device index exists")
                .remove(&member.paddr.addr);
        }
        self.insert(unioned);
        self.coalesce_at(unioned.laddr);
        Ok(())
    }

    /// Returns any `(l, p)` with `l` in `[laddr, laddr + size)` and `p`
    /// mapped from `l`
    pub fn resolve_any(
        &self,
        laddr: LogicalAddr,
        size: AddrDelta,
    ) -> Option<(LogicalAddr, QualifiedPhysicalAddr)> {
        let end = laddr + size;
        let m = self
            .logical_overlaps(laddr, end)
            .first()
            .map(|key| self.mappings[key])?;
        let l = laddr.max(m.laddr);
        let p = m.paddr.add(l - m.laddr);
        Some((l, p))
    }

    fn logical_overlaps(&self, beg: LogicalAddr, end: LogicalAddr) -> Vec<LogicalAddr> {
        let mut out = Vec::new();
        if let Some((&key, prev)) = self.mappings.range(..=beg).next_back() {
            if prev.laddr_end() > beg {
                out.push(key);
            }
        }
        for (&key, _) in self.mappings.range((Excluded(beg), Excluded(end))) {
            out.push(key);
        }
        out
    }

    fn physical_overlaps(&self, dev: DeviceId, beg: PhysicalAddr, end: PhysicalAddr) -> Vec<LogicalAddr> {
        let mut out = Vec::new();
        let Some(index) = self.by_paddr.get(&dev) else {
            return out;
        };
        if let Some((_, &laddr)) = index.range(..=beg).next_back() {
            if self.mappings[&laddr].paddr_end() > beg {
                out.push(laddr);
            }
        }
        for (_, &laddr) in index.range((Excluded(beg), Excluded(end))) {
            out.push(laddr);
        }
        out
    }

    fn insert(&mut self, m: Mapping) {
        self.by_paddr
            .get_mut(&m.paddr.dev)
            .expect("device index exists")
            .insert(m.paddr.addr, m.laddr);
        self.mappings.insert(m.laddr, m);
    }

    fn remove(&mut self, laddr: LogicalAddr) -> Option<Mapping> {
        let m = self.mappings.remove(&laddr)?;
        self.by_paddr
            .get_mut(&m.paddr.dev)
            .expect("device index exists")
            .remove(&m.paddr.addr);
        Some(m)
    }

    fn coalesce_at(&mut self, laddr: LogicalAddr) {
        self.merge_with_next(laddr);
        if let Some((&prev, _)) = self.mappings.range(..laddr).next_back() {
            self.merge_with_next(prev);
        }
    }

    /// Merges `laddr`'s mapping with its logical successor if the two are
    /// contiguous on both axes, neither is size-locked, and their flags
    /// agree (or one side has none)
    fn merge_with_next(&mut self, laddr: LogicalAddr) {
        let Some(&cur) = self.mappings.get(&laddr) else {
            return;
        };
        let Some((&next_key, &next)) = self.mappings.range((Excluded(laddr), Unbounded)).next()
        else {
            return;
        };
        if cur.laddr_end() != next.laddr
            || cur.size_locked
            || next.size_locked
            || cur.paddr.dev != next.paddr.dev
            || cur.paddr_end() != next.paddr.addr
        {
            return;
        }
        if let (Some(a), Some(b)) = (cur.flags, next.flags) {
            if a != b {
                return;
            }
        }
        self.remove(laddr);
        self.remove(next_key);
        self.insert(Mapping {
            laddr: cur.laddr,
            paddr: cur.paddr,
            size: cur.size + next.size,
            size_locked: false,
            flags: cur.flags.or(next.flags),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: u64) -> DeviceId {
        DeviceId(id)
    }

    fn qpa(id: u64, addr: i64) -> QualifiedPhysicalAddr {
        QualifiedPhysicalAddr::new(dev(id), PhysicalAddr(addr))
    }

    fn mapping(laddr: i64, paddr: QualifiedPhysicalAddr, size: i64) -> Mapping {
        Mapping {
            laddr: LogicalAddr(laddr),
            paddr,
            size: AddrDelta(size),
            size_locked: false,
            flags: None,
        }
    }

    fn volume() -> LogicalVolume {
        let mut lv = LogicalVolume::new();
        lv.add_physical_volume(dev(1), PhysicalAddr(1 << 30));
        lv.add_physical_volume(dev(2), PhysicalAddr(1 << 30));
        lv
    }

    fn snapshot(lv: &LogicalVolume) -> Vec<Mapping> {
        lv.mappings().copied().collect()
    }

    #[test]
    fn test_add_single_mapping() {
        let mut lv = volume();
        let m = Mapping {
            size_locked: true,
            flags: Some(BlockGroupFlags(BlockGroupFlags::DATA)),
            ..mapping(0x100000, qpa(1, 0x200000), 0x10000)
        };
        lv.add_mapping(m).unwrap();
        assert_eq!(snapshot(&lv), vec![m]);
    }

    #[test]
    fn test_unknown_device() {
        let mut lv = volume();
        let err = lv
            .add_mapping(mapping(0, qpa(9, 0), 0x1000))
            .unwrap_err();
        assert!(matches!(err, MappingError::UnknownDevice(d) if d == dev(9)));
    }

    #[test]
    fn test_non_positive_size() {
        let mut lv = volume();
        let err = lv.add_mapping(mapping(0, qpa(1, 0), 0)).unwrap_err();
        assert!(matches!(err, MappingError::NonPositiveSize(_)));
    }

    #[test]
    fn test_contained_mapping_is_absorbed() {
        let mut lv = volume();
        let chunk = Mapping {
            size_locked: true,
            flags: Some(BlockGroupFlags(BlockGroupFlags::METADATA)),
            ..mapping(0x100000, qpa(1, 0x200000), 0x10000)
        };
        lv.add_mapping(chunk).unwrap();
        // A node observed inside the chunk adds nothing.
        lv.add_mapping(mapping(0x108000, qpa(1, 0x208000), 0x4000))
            .unwrap();
        assert_eq!(snapshot(&lv), vec![chunk]);
    }

    #[test]
    fn test_translation_conflict() {
        let mut lv = volume();
        lv.add_mapping(mapping(0x100000, qpa(1, 0x200000), 0x10000))
            .unwrap();
        let before = snapshot(&lv);
        // Overlapping logical range, different physical offset.
        let err = lv
            .add_mapping(mapping(0x108000, qpa(1, 0x300000), 0x4000))
            .unwrap_err();
        assert!(matches!(err, MappingError::Conflict { .. }));
        assert_eq!(snapshot(&lv), before);
    }

    #[test]
    fn test_physical_conflict_detected() {
        let mut lv = volume();
        lv.add_mapping(mapping(0x100000, qpa(1, 0x200000), 0x10000))
            .unwrap();
        // Disjoint logical range but the same physical bytes on dev 1.
        let err = lv
            .add_mapping(mapping(0x900000, qpa(1, 0x208000), 0x4000))
            .unwrap_err();
        assert!(matches!(err, MappingError::Conflict { .. }));
    }

    #[test]
    fn test_same_physical_on_other_device_ok() {
        let mut lv = volume();
        lv.add_mapping(mapping(0x100000, qpa(1, 0x200000), 0x10000))
            .unwrap();
        lv.add_mapping(mapping(0x900000, qpa(2, 0x200000), 0x10000))
            .unwrap();
        assert_eq!(lv.len(), 2);
    }

    #[test]
    fn test_conflicting_flags() {
        let mut lv = volume();
        lv.add_mapping(Mapping {
            flags: Some(BlockGroupFlags(BlockGroupFlags::DATA)),
            ..mapping(0x100000, qpa(1, 0x200000), 0x10000)
        })
        .unwrap();
        let err = lv
            .add_mapping(Mapping {
                flags: Some(BlockGroupFlags(BlockGroupFlags::METADATA)),
                ..mapping(0x104000, qpa(1, 0x204000), 0x4000)
            })
            .unwrap_err();
        assert!(matches!(err, MappingError::ConflictingFlags { .. }));
    }

    #[test]
    fn test_flags_adopted_from_either_side() {
        let mut lv = volume();
        lv.add_mapping(mapping(0x100000, qpa(1, 0x200000), 0x10000))
            .unwrap();
        lv.add_mapping(Mapping {
            flags: Some(BlockGroupFlags(BlockGroupFlags::DATA)),
            ..mapping(0x100000, qpa(1, 0x200000), 0x10000)
        })
        .unwrap();
        let all = snapshot(&lv);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].flags, Some(BlockGroupFlags(BlockGroupFlags::DATA)));
    }

    #[test]
    fn test_union_extends_unlocked() {
        let mut lv = volume();
        lv.add_mapping(mapping(0x100000, qpa(1, 0x200000), 0x8000))
            .unwrap();
        lv.add_mapping(mapping(0x104000, qpa(1, 0x204000), 0x8000))
            .unwrap();
        let all = snapshot(&lv);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].laddr, LogicalAddr(0x100000));
        assert_eq!(all[0].size, AddrDelta(0xc000));
        assert!(!all[0].size_locked);
    }

    #[test]
    fn test_size_lock_violation() {
        let mut lv = volume();
        lv.add_mapping(Mapping {
            size_locked: true,
            ..mapping(0x100000, qpa(1, 0x200000), 0x10000)
        })
        .unwrap();
        let before = snapshot(&lv);
        // A node that would extend past the locked chunk's end.
        let err = lv
            .add_mapping(mapping(0x10c000, qpa(1, 0x20c000), 0x8000))
            .unwrap_err();
        assert!(matches!(err, MappingError::SizeLocked { .. }));
        assert_eq!(snapshot(&lv), before);
    }

    #[test]
    fn test_locked_size_never_changes() {
        let mut lv = volume();
        let chunk = Mapping {
            size_locked: true,
            ..mapping(0x100000, qpa(1, 0x200000), 0x10000)
        };
        lv.add_mapping(chunk).unwrap();
        // Exact duplicate is fine and is a no-op.
        lv.add_mapping(chunk).unwrap();
        assert_eq!(snapshot(&lv), vec![chunk]);
    }

    #[test]
    fn test_adjacent_unlocked_coalesce() {
        let mut lv = volume();
        lv.add_mapping(mapping(0x100000, qpa(1, 0x200000), 0x4000))
            .unwrap();
        lv.add_mapping(mapping(0x104000, qpa(1, 0x204000), 0x4000))
            .unwrap();
        let all = snapshot(&lv);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].size, AddrDelta(0x8000));
    }

    #[test]
    fn test_adjacent_locked_not_coalesced() {
        let mut lv = volume();
        lv.add_mapping(Mapping {
            size_locked: true,
            ..mapping(0x100000, qpa(1, 0x200000), 0x4000)
        })
        .unwrap();
        lv.add_mapping(Mapping {
            size_locked: true,
            ..mapping(0x104000, qpa(1, 0x204000), 0x4000)
        })
        .unwrap();
        assert_eq!(lv.len(), 2);
    }

    #[test]
    fn test_adjacent_different_translation_not_coalesced() {
        let mut lv = volume();
        lv.add_mapping(mapping(0x100000, qpa(1, 0x200000), 0x4000))
            .unwrap();
        lv.add_mapping(mapping(0x104000, qpa(1, 0x300000), 0x4000))
            .unwrap();
        assert_eq!(lv.len(), 2);
    }

    #[test]
    fn test_resolve_any() {
        let mut lv = volume();
        lv.add_mapping(mapping(0x100000, qpa(1, 0x200000), 0x10000))
            .unwrap();

        // Window starting inside the mapping.
        let (l, p) = lv
            .resolve_any(LogicalAddr(0x108000), AddrDelta(0x1000))
            .unwrap();
        assert_eq!(l, LogicalAddr(0x108000));
        assert_eq!(p, qpa(1, 0x208000));

        // Window starting before the mapping resolves at the mapping start.
        let (l, p) = lv
            .resolve_any(LogicalAddr(0xf0000), AddrDelta(0x20000))
            .unwrap();
        assert_eq!(l, LogicalAddr(0x100000));
        assert_eq!(p, qpa(1, 0x200000));

        assert!(lv
            .resolve_any(LogicalAddr(0x900000), AddrDelta(0x1000))
            .is_none());
    }

    #[test]
    fn test_pairwise_non_overlap_property() {
        // Pseudo-random adds; whatever is accepted must stay disjoint on
        // both axes.
        let mut lv = volume();
        let mut state = 0x243f_6a88_85a3_08d3u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        for _ in 0..500 {
            let laddr = ((next() % 256) * 0x1000) as i64;
            let paddr = ((next() % 256) * 0x1000) as i64;
            let size = (1 + next() % 8) as i64 * 0x1000;
            let device = 1 + next() % 2;
            let m = Mapping {
                size_locked: next() % 4 == 0,
                ..mapping(laddr, qpa(device, paddr), size)
            };
            let _ = lv.add_mapping(m);
        }
        let all = snapshot(&lv);
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                let l_disjoint = a.laddr_end() <= b.laddr || b.laddr_end() <= a.laddr;
                assert!(l_disjoint, "logical overlap: ({}) vs ({})", a, b);
                if a.paddr.dev == b.paddr.dev {
                    let p_disjoint =
                        a.paddr_end() <= b.paddr.addr || b.paddr_end() <= a.paddr.addr;
                    assert!(p_disjoint, "physical overlap: ({}) vs ({})", a, b);
                }
            }
        }
    }

    #[test]
    fn test_flags_display() {
        let f = BlockGroupFlags(BlockGroupFlags::DATA | BlockGroupFlags::RAID1);
        assert_eq!(format!("{}", f), "DATA|RAID1");
        assert_eq!(format!("{}", BlockGroupFlags(0)), "none");
        assert_eq!(format!("{}", BlockGroupFlags(1 << 20)), "0x100000");
    }

    #[test]
    fn test_mapping_display() {
        let m = Mapping {
            size_locked: true,
            flags: Some(BlockGroupFlags(BlockGroupFlags::DATA)),
            ..mapping(0x100000, qpa(1, 0x200000), 0x10000)
        };
        let s = format!("{}", m);
        assert!(s.contains("laddr=0x100000"));
        assert!(s.contains("paddr=1:0x200000"));
        assert!(s.contains("locked=true"));
        assert!(s.contains("flags=DATA"));
    }
}
