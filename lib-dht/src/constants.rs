//! Protocol constants.
//!
//! Times are milliseconds unless noted. These knobs are protocol behavior,
//! not tuning parameters; changing them changes interoperability.

/// K - entries per bucket and default closest-set size
pub const MAX_ENTRIES_PER_BUCKET: usize = 8;

/// alpha - concurrent in-flight requests per iterative lookup
pub const MAX_CONCURRENT_TASK_REQUESTS: usize = 3;

/// Running tasks per DHT; further tasks queue
pub const MAX_ACTIVE_TASKS: usize = 16;

/// Soft per-call deadline; a quiet call becomes STALLED here
pub const RPC_CALL_TIMEOUT_BASE: u64 = 2_000;

/// Hard per-call deadline measured from send
pub const RPC_CALL_TIMEOUT_MAX: u64 = 10_000;

/// Quiet window after which a server socket is considered unreachable
pub const RPC_SERVER_REACHABILITY_TIMEOUT: u64 = 60_000;

/// Main periodic tick of each DHT instance
pub const DHT_UPDATE_INTERVAL: u64 = 1_000;

pub const BOOTSTRAP_MIN_INTERVAL: u64 = 4 * 60_000;
pub const BOOTSTRAP_IF_LESS_THAN_X_PEERS: usize = 30;

pub const ROUTING_TABLE_MAINTENANCE_INTERVAL: u64 = 4 * 60_000;
pub const ROUTING_TABLE_PERSIST_INTERVAL: u64 = 10 * 60_000;

/// Failed requests before a reachable entry turns bad
pub const KBUCKET_MAX_TIMEOUTS: i32 = 5;

/// Failed requests before a never-verified entry turns bad
pub const KBUCKET_UNVERIFIED_MAX_TIMEOUTS: i32 = 2;

/// Entries quiet for this long with failures are old-and-stale
pub const KBUCKET_OLD_AND_STALE_TIME: u64 = 15 * 60_000;

/// Entries quiet for this long want a maintenance ping
pub const KBUCKET_PING_TIME: u64 = 30_000;

/// Buckets quiet for this long get a refresh lookup
pub const BUCKET_REFRESH_INTERVAL: u64 = 15 * 60_000;

/// Non-persistent value/peer lifetime
pub const MAX_VALUE_AGE: u64 = 2 * 60 * 60_000;
pub const MAX_PEER_AGE: u64 = 2 * 60 * 60_000;

pub const STORAGE_EXPIRE_INTERVAL: u64 = 10 * 60_000;

/// Persistent entries quiet for this long are re-announced
pub const RE_ANNOUNCE_INTERVAL: u64 = 30 * 60_000;

/// Write-token validity window; the session secret rotates at this pace
pub const TOKEN_TIMEOUT: u64 = 5 * 60_000;

/// Crypto cache sweep cadence
pub const CRYPTO_CACHE_EXPIRE_CHECK_INTERVAL: u64 = 60_000;

/// Crypto cache capacity (distinct peers with live boxes)
pub const CRYPTO_CACHE_CAPACITY: usize = 256;

/// Peers returned for a FIND_PEER hit
pub const MAX_PEERS_PER_RESPONSE: usize = 8;

/// Wire protocol version tag carried in every message
pub const PROTOCOL_VERSION: u32 = 1;

/// Hard cap on a value body
pub const MAX_VALUE_SIZE: usize = 32 * 1024;
