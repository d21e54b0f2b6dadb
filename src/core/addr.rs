//! Typed addresses for the logical and physical address spaces
//!
//! The volume manager presents one contiguous logical address space that is
//! mapped onto per-device physical byte offsets. Keeping the two spaces as
//! distinct types means an offset from one space can never be compared with
//! or added to an offset from the other; all mixing goes through
//! [`AddrDelta`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub};

/// Byte offset in the volume's logical address space
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogicalAddr(pub i64);

/// Byte offset within a single device
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PhysicalAddr(pub i64);

/// Signed difference between two addresses of the same space
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct AddrDelta(pub i64);

/// Identifier of one device in the filesystem
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct DeviceId(pub u64);

/// A physical address qualified with the device it lives on
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct QualifiedPhysicalAddr {
    /// Device ID
    pub dev: DeviceId,
    /// Offset on that device
    pub addr: PhysicalAddr,
}

impl QualifiedPhysicalAddr {
    /// Creates a qualified physical address
    pub const fn new(dev: DeviceId, addr: PhysicalAddr) -> Self {
        Self { dev, addr }
    }

    /// Offsets the physical component by `delta`, keeping the device
    pub fn add(self, delta: AddrDelta) -> Self {
        Self {
            dev: self.dev,
            addr: self.addr + delta,
        }
    }
}

fn fmt_signed_hex(v: i64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if v < 0 {
        write!(f, "-0x{:x}", v.unsigned_abs())
    } else {
        write!(f, "0x{:x}", v)
    }
}

impl fmt::Display for LogicalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_signed_hex(self.0, f)
    }
}

impl fmt::Display for PhysicalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_signed_hex(self.0, f)
    }
}

impl fmt::Display for AddrDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_signed_hex(self.0, f)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for QualifiedPhysicalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.addr)
    }
}

impl Add<AddrDelta> for LogicalAddr {
    type Output = LogicalAddr;
    fn add(self, rhs: AddrDelta) -> LogicalAddr {
        LogicalAddr(self.0 + rhs.0)
    }
}

impl AddAssign<AddrDelta> for LogicalAddr {
    fn add_assign(&mut self, rhs: AddrDelta) {
        self.0 += rhs.0;
    }
}

impl Sub for LogicalAddr {
    type Output = AddrDelta;
    fn sub(self, rhs: LogicalAddr) -> AddrDelta {
        AddrDelta(self.0 - rhs.0)
    }
}

impl Sub<AddrDelta> for LogicalAddr {
    type Output = LogicalAddr;
    fn sub(self, rhs: AddrDelta) -> LogicalAddr {
        LogicalAddr(self.0 - rhs.0)
    }
}

impl Add<AddrDelta> for PhysicalAddr {
    type Output = PhysicalAddr;
    fn add(self, rhs: AddrDelta) -> PhysicalAddr {
        PhysicalAddr(self.0 + rhs.0)
    }
}

impl AddAssign<AddrDelta> for PhysicalAddr {
    fn add_assign(&mut self, rhs: AddrDelta) {
        self.0 += rhs.0;
    }
}

impl Sub for PhysicalAddr {
    type Output = AddrDelta;
    fn sub(self, rhs: PhysicalAddr) -> AddrDelta {
        AddrDelta(self.0 - rhs.0)
    }
}

impl Sub<AddrDelta> for PhysicalAddr {
    type Output = PhysicalAddr;
    fn sub(self, rhs: AddrDelta) -> PhysicalAddr {
        PhysicalAddr(self.0 - rhs.0)
    }
}

impl Add for AddrDelta {
    type Output = AddrDelta;
    fn add(self, rhs: AddrDelta) -> AddrDelta {
        AddrDelta(self.0 + rhs.0)
    }
}

impl Sub for AddrDelta {
    type Output = AddrDelta;
    fn sub(self, rhs: AddrDelta) -> AddrDelta {
        AddrDelta(self.0 - rhs.0)
    }
}

impl Mul<i64> for AddrDelta {
    type Output = AddrDelta;
    fn mul(self, rhs: i64) -> AddrDelta {
        AddrDelta(self.0 * rhs)
    }
}

impl Neg for AddrDelta {
    type Output = AddrDelta;
    fn neg(self) -> AddrDelta {
        AddrDelta(-self.0)
    }
}

/// Common interface over the two address spaces
///
/// Lets [`super::sums::SumRun`] and friends be generic over whether their
/// checksums cover logical or physical bytes.
pub trait Addr: Copy + Ord + fmt::Display + fmt::Debug {
    /// Offsets the address by `delta`
    fn offset(self, delta: AddrDelta) -> Self;

    /// Distance from `other` to `self`
    fn dist_from(self, other: Self) -> AddrDelta;
}

impl Addr for LogicalAddr {
    fn offset(self, delta: AddrDelta) -> Self {
        self + delta
    }

    fn dist_from(self, other: Self) -> AddrDelta {
        self - other
    }
}

impl Addr for PhysicalAddr {
    fn offset(self, delta: AddrDelta) -> Self {
        self + delta
    }

    fn dist_from(self, other: Self) -> AddrDelta {
        self - other
    }
}
