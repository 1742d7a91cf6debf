//! Container runtime constants.

/// Runtime used when `-runtime-engine` is not given.
pub const DEFAULT_RUNTIME: &str = "docker";

/// Runtimes selectable with `-runtime-engine`.
pub const SUPPORTED_RUNTIMES: &[&str] = &["docker", "singularity"];

/// The docker daemon refuses memory limits below this.
pub const DOCKER_MIN_RAM: u64 = 16 << 20;

/// Default interval between watchdog inspections.
pub const WATCHDOG_INTERVAL_SECS: u64 = 60;

/// Consecutive failed inspections before the watchdog gives up.
pub const WATCHDOG_MAX_ERRORS: u32 = 3;

/// Symlinks followed before output capture gives up.
pub const MAX_SYMLINKS: i32 = 10;

/// Seconds the mount helper is given to unmount.
pub const UNMOUNT_TIMEOUT_SECS: u64 = 8;

/// Default interval between control-plane priority checks.
pub const PRIORITY_POLL_INTERVAL_SECS: u64 = 60;

/// Default telemetry sampling interval.
pub const CRUNCHSTAT_INTERVAL_SECS: u64 = 10;

/// Length of a container UUID.
pub const UUID_LEN: usize = 27;

/// Container memory usage (percent of its RAM constraint) that triggers a
/// warning in the supervisor log.
pub const MEMORY_WARNING_PERCENTAGES: &[u64] = &[90, 95, 99];
