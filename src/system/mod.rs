//! Host-level checks.

pub mod disk;

pub use self::disk::{DiskPolicy, DiskSpacePrecheck, DiskVerdict, FreeSpace, SystemFreeSpace};
