//! Tunable operational defaults for the sheepdog block driver.
//!
//! Protocol-level constants (wire format, object sizes, id spaces)
//! remain in [`crate::constants`]. This module centralizes the
//! configurable defaults that can be overridden through `DriverConfig`
//! or CLI flags.

// ─── Connection ─────────────────────────────────────────────────────────────

/// Delay between reconnect attempts after the data link fails (milliseconds).
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Largest response payload accepted on an admin connection (bytes). 64 MB.
/// Protects against corrupt length fields on the wire.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

// ─── Snapshots ──────────────────────────────────────────────────────────────

/// Maximum number of snapshots returned by a snapshot listing.
pub const DEFAULT_SNAPSHOT_LIST_MAX: usize = 1024;
