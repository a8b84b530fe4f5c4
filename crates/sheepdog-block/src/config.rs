//! Driver configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sheepdog_proto::constants::{LOCK_TYPE_NORMAL, LOCK_TYPE_SHARED};
use sheepdog_proto::defaults::{DEFAULT_RECONNECT_DELAY_MS, DEFAULT_SNAPSHOT_LIST_MAX};
use sheepdog_proto::request::{SD_FLAG_CMD_CACHE, SD_FLAG_CMD_DIRECT};

/// How the daemon's object cache treats this client's writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Writes may be cached by the daemon until a flush.
    #[default]
    Writeback,
    /// Writes bypass the daemon's cache.
    Directio,
}

impl CacheMode {
    /// Request flags carried by every data-path request.
    pub fn request_flags(self) -> u16 {
        match self {
            CacheMode::Writeback => SD_FLAG_CMD_CACHE,
            CacheMode::Directio => SD_FLAG_CMD_DIRECT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    #[default]
    Normal,
    /// Several clients may hold the VDI (iSCSI multipath).
    Shared,
}

impl LockType {
    pub fn code(self) -> u32 {
        match self {
            LockType::Normal => LOCK_TYPE_NORMAL,
            LockType::Shared => LOCK_TYPE_SHARED,
        }
    }
}

/// Driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Cache mode requested at open.
    pub cache_mode: CacheMode,
    /// Delay between reconnect attempts after the data link fails.
    pub reconnect_delay: Duration,
    /// Maximum entries returned by a snapshot listing.
    pub snapshot_list_max: usize,
    /// Lock taken on the VDI at open.
    pub lock_type: LockType,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::default(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            snapshot_list_max: DEFAULT_SNAPSHOT_LIST_MAX,
            lock_type: LockType::default(),
        }
    }
}
