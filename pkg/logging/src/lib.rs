//! Container run logs: timestamped, buffered, rate-limited.
//!
//! Each log stream (`crunch-run`, `stdout`, `stderr`, `arv-mount`, ...) is a
//! [`ThrottledLogger`] writing into a [`LogSink`]. Sinks write the complete
//! text into the run's log collection and, separately, emit rate-limited
//! event records to the control plane.

pub mod lines;
pub mod params;
pub mod scanner;
pub mod sink;
pub mod throttle;
pub mod timestamp;

pub use lines::copy_lines;
pub use params::ThrottleParams;
pub use scanner::LogScanner;
pub use sink::{CollectionFile, LogSink};
pub use throttle::{EventLogWriter, ThrottledLogger};
pub use timestamp::rfc3339_nano;
