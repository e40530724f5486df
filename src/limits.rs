/// Largest mutation batch the record store accepts in one call.
pub const MAX_BATCH_SIZE: usize = 10;

/// Throttle retries before a run is abandoned.
pub const MAX_STORE_RETRIES: u32 = 8;

/// Upper bound on a single backoff sleep.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Raw feed bodies larger than this are rejected outright.
pub const MAX_FEED_BYTES: usize = 16 * 1024 * 1024;

pub const MAX_UID_LEN: usize = 512;

pub const MAX_PROPERTY_NAME_LEN: usize = 256;

/// Window bounds accepted from configuration.
pub const MAX_LOOKBACK_DAYS: i64 = 3_650;
pub const MAX_LOOKAHEAD_DAYS: i64 = 3_650;

pub const MAX_PARALLEL_FEEDS: usize = 64;
