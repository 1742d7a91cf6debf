//! Host and container telemetry for crunch-run.
//!
//! A [`Reporter`] samples either the node ([`Reporter::host`]) or one
//! container's cgroup ([`Reporter::cgroup`]) on a fixed interval and
//! writes crunchstat-style lines to a log. Stopping it yields a
//! [`Summary`] of totals and peaks.

pub mod cgroup;
mod reporter;

pub use cgroup::StatFiles;
pub use reporter::{Reporter, ReporterHandle, Summary};
