//! Protocol constants and tuning parameters.
//!
//! Defaults follow the usual Kademlia literature values (k=20, α=3). All of
//! the timing knobs can be overridden per server through
//! [`DhtConfig`](crate::DhtConfig).

use std::time::Duration;

/// Replication parameter: entries per k-bucket and lookup result width.
pub const DEFAULT_KSIZE: usize = 20;

/// Lookup parallelism: concurrent RPCs per spider round.
pub const DEFAULT_ALPHA: usize = 3;

/// How long a stored value lives without being rewritten.
pub const DEFAULT_STORAGE_TTL: Duration = Duration::from_secs(20);

/// How long to wait for an RPC response before treating the peer as silent.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between bucket-refresh and republish sweeps.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// A bucket untouched for this long is due for a refresh lookup.
pub const DEFAULT_BUCKET_STALE_AFTER: Duration = Duration::from_secs(3600);

/// Values held longer than this are republished by the refresh sweep.
pub const REPUBLISH_AGE: Duration = Duration::from_secs(3600);

/// Message kind byte plus the 20-byte message id.
pub const HEADER_LEN: usize = 21;

/// Framed requests above this size are rejected before sending.
pub const MAX_REQUEST_LEN: usize = 512;
