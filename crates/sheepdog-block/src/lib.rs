//! # sheepdog-block
//!
//! Client block driver for sheepdog clusters.
//!
//! A [`SheepdogDevice`] exposes one VDI as a virtual disk: random-access
//! reads and writes, discard, flush, growing, snapshots and VM state.
//! Data I/O is split into per-object requests that are pipelined over one
//! persistent connection to a sheep daemon, while administrative calls use
//! short-lived connections. A broken connection is re-established and the
//! pending requests are replayed.

pub mod admin;
mod aio;
pub mod config;
pub mod create;
pub mod device;
pub mod error;
pub mod location;
mod overlap;
mod recovery;
mod session;
pub mod snapshot;

#[cfg(test)]
mod testing;

pub use config::{CacheMode, DriverConfig, LockType};
pub use create::{parse_object_size, parse_redundancy, CreateOptions, Prealloc, Redundancy};
pub use device::{IoHandle, SheepdogDevice};
pub use error::{DriverError, DriverResult};
pub use location::VdiLocation;
pub use sheepdog_core::inode::BlockStatus;
pub use snapshot::SnapshotInfo;
