//! Default configuration values

/// Chunk size for streaming downloads (1 MiB)
pub const FETCH_CHUNK_SIZE: usize = 1024 * 1024;

/// Block size for raw device writes (4 MiB)
pub const WRITE_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Size of the region read back by the post-write sanity check
pub const BOOT_SECTOR_SIZE: usize = 512;

/// Maximum number of download retries after the first attempt
pub const MAX_DOWNLOAD_RETRIES: u32 = 3;

/// Base delay for exponential download backoff (in milliseconds)
pub const BASE_RETRY_DELAY_MS: u64 = 1000;

/// Upper bound for a single backoff delay (in milliseconds)
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Read timeout for download requests (in seconds)
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 60;

/// Connect timeout for download requests (in seconds)
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Maximum directory-listing recursion depth
pub const MAX_LISTING_DEPTH: usize = 4;

/// Maximum number of listings fetched during one resolution
pub const MAX_LISTING_VISITS: usize = 64;

/// Largest device accepted as a removable target (2 TiB)
pub const MAX_DEVICE_BYTES: u64 = 2 * 1024 * 1024 * 1024 * 1024;

/// Wall-clock budget for a whole pipeline run (in seconds)
pub const MAX_RUN_SECS: u64 = 2 * 60 * 60;

/// Grace period between terminate and kill for a cancelled stage (in seconds)
pub const CANCEL_GRACE_SECS: u64 = 5;

/// Capacity of the relay -> observer event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Diagnostic output kept per stage (bytes, tail)
pub const MAX_DIAGNOSTIC_BYTES: usize = 64 * 1024;

/// Default listen address for `flashpipe serve`
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8787";

/// Block-copy helper looked up on the search path
#[cfg(not(windows))]
pub const HELPER_TOOL: &str = "dd";

/// Block-copy helper looked up on the search path
#[cfg(windows)]
pub const HELPER_TOOL: &str = "dd.exe";

/// Known helper install locations, checked before the search path
#[cfg(not(windows))]
pub const HELPER_LOCATIONS: &[&str] = &["/bin/dd", "/usr/bin/dd", "/usr/local/bin/dd"];

/// Known helper install locations, checked before the search path
#[cfg(windows)]
pub const HELPER_LOCATIONS: &[&str] = &[r"C:\Program Files\Git\usr\bin\dd.exe"];

/// Overall percent sub-range reserved for each stage
pub mod ranges {
    /// Formatting: 0-10
    pub const FORMATTING: (f64, f64) = (0.0, 10.0);
    /// Downloading: 10-60
    pub const DOWNLOADING: (f64, f64) = (10.0, 60.0);
    /// Writing: 60-95
    pub const WRITING: (f64, f64) = (60.0, 95.0);
    /// Verifying: 95-100
    pub const VERIFYING: (f64, f64) = (95.0, 100.0);
}
