//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ALPHA, DEFAULT_BUCKET_STALE_AFTER, DEFAULT_KSIZE, DEFAULT_REFRESH_INTERVAL,
    DEFAULT_RPC_TIMEOUT, DEFAULT_STORAGE_TTL,
};

/// Tuning knobs for a DHT server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Entries per k-bucket and width of lookup results.
    pub ksize: usize,

    /// Concurrent RPCs per lookup round.
    pub alpha: usize,

    /// Lifetime of a stored value between rewrites.
    pub storage_ttl: Duration,

    /// How long to wait for an RPC response.
    pub rpc_timeout: Duration,

    /// Interval between bucket-refresh and republish sweeps.
    pub refresh_interval: Duration,

    /// A bucket untouched for this long gets a refresh lookup.
    pub bucket_stale_after: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            ksize: DEFAULT_KSIZE,
            alpha: DEFAULT_ALPHA,
            storage_ttl: DEFAULT_STORAGE_TTL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            bucket_stale_after: DEFAULT_BUCKET_STALE_AFTER,
        }
    }
}
