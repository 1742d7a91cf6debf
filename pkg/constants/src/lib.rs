//! Centralized constants for crunch-run.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod keep;
pub mod logging;
pub mod paths;
pub mod runtime;
