//! Tunables recognized by the blob store.

use std::time::Duration;

/// Default upper bound on part numbers in a multipart upload.
pub const DEFAULT_MAX_PARTS: u32 = 400;

/// Default expiry applied to new multipart uploads.
pub const DEFAULT_UPLOAD_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Default interval between expired-upload sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default time-to-live of a two-phase put challenge.
pub const DEFAULT_CHALLENGE_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// Configuration for a blob [`Store`](crate::blobstore::Store).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound (exclusive) on multipart part numbers.
    pub max_parts: u32,

    /// Expiry applied to uploads created without an explicit deadline.
    pub upload_expiry: Duration,

    /// How often the background sweeper deletes expired parts.
    pub sweep_interval: Duration,

    /// How long a two-phase put challenge stays redeemable.
    pub challenge_expiry: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_parts: DEFAULT_MAX_PARTS,
            upload_expiry: DEFAULT_UPLOAD_EXPIRY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            challenge_expiry: DEFAULT_CHALLENGE_EXPIRY,
        }
    }
}
