//! BTRFS chunk-map rescue
//!
//! Rebuilds the logical-to-physical address map of a BTRFS filesystem whose
//! volume-management metadata is too damaged to mount, working only from
//! raw device sectors.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`blockdev`]: Read-only block device abstraction for images and raw
//!   devices
//! - [`core`]: On-disk structures, typed addresses, checksum runs, and the
//!   [`core::LogicalVolume`] overlay
//! - [`scan`]: Parallel per-device sector scanner producing the evidence
//!   the pipeline consumes
//! - [`rebuild`]: The six-stage reconstruction pipeline and its report
//!
//! A rescue run is: read a superblock, [`scan::scan_devices`], then
//! [`rebuild::rebuild_mappings`] into a fresh [`core::LogicalVolume`].

pub mod blockdev;
pub mod cancel;
pub mod core;
pub mod rebuild;
pub mod scan;

pub use blockdev::{BlockDevice, BlockDeviceError};
pub use cancel::CancelToken;
pub use core::{LogicalVolume, Mapping, RescueError, Superblock};
pub use rebuild::{rebuild_mappings, RebuildOptions};
pub use scan::{scan_devices, ScanDevicesResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
