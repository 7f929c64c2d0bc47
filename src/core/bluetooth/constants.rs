//! Constants used by the Bluetooth link
//! Timeouts, retry budgets and scan parameters.

/// Number of consecutive "peripheral not found" attempts before the key is given up
pub const MAX_CONNECT_RETRIES: u32 = 5;

/// Delay between connection attempts in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// Timeout for a single connection attempt in seconds
pub const BLUETOOTH_OPERATION_TIMEOUT_SECS: u64 = 10;

/// Timeout for a remote RSSI read in seconds
pub const RSSI_READ_TIMEOUT_SECS: u64 = 10;

/// Scan duration in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 5;

/// Advertisements weaker than this are not offered as candidate keys
pub const MIN_RSSI_THRESHOLD: i16 = -90;

/// Platform status code reported when the radio gives no better one
pub const GENERIC_FAILURE_CODE: i32 = 257;
