//! Log throttling defaults.

/// Total bytes of event log per container run.
pub const LIMIT_LOG_BYTES_PER_JOB: u64 = 67_108_864;

/// Bytes allowed per throttle period.
pub const THROTTLE_BYTES: u64 = 65_536;

/// Throttle period in seconds.
pub const THROTTLE_PERIOD_SECS: u64 = 60;

/// Lines allowed per throttle period.
pub const THROTTLE_LINES: u64 = 1024;

/// At most one partial (`[...]`) line per this many seconds.
pub const PARTIAL_LINE_PERIOD_SECS: u64 = 5;

/// Emit an event once this many bytes are buffered.
pub const BYTES_PER_EVENT: usize = 4096;

/// Emit an event at least this often while output is pending.
pub const SECONDS_BETWEEN_EVENTS: u64 = 1;

/// Checkpoint the log collection at least this often.
pub const LOG_UPDATE_PERIOD_SECS: u64 = 1800;

/// Checkpoint the log collection after this much growth.
pub const LOG_UPDATE_SIZE: u64 = 32 << 20;

/// Container output lines longer than this are split.
pub const MAX_LOG_LINE: usize = 4096;

/// Marker appended/prepended to the pieces of a split line.
pub const PARTIAL_LINE_MARKER: &str = "[...]";

/// Appended to every rate-limit notice.
pub const THROTTLE_NOTICE_SUFFIX: &str =
    " A complete log is still being written to Keep, and will be available when the job finishes.";

/// Log collections are kept this many days unless the final save hands them over.
pub const LOG_COLLECTION_TTL_DAYS: i64 = 14;
