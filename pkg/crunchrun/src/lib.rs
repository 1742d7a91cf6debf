//! Container execution supervisor.
//!
//! [`ContainerRunner`] takes a container record the dispatcher has locked,
//! stages its mounts through the FUSE helper, runs it with a container
//! runtime, captures the output directory as a collection and records the
//! outcome, saving logs along the way.

pub mod cancel;
pub mod clients;
pub mod config;
pub mod copier;
pub mod cost;
pub mod errors;
pub mod helper;
pub mod hostinfo;
pub mod logs;
pub mod mounts;
pub mod runner;
pub mod stub;

pub use cancel::CancelToken;
pub use clients::{ClientFactory, FixedClients, HttpClients};
pub use config::{NetworkPolicy, RunnerConfig};
pub use errors::CrunchError;
pub use helper::{ArvMount, MountHelper};
pub use runner::{ContainerRunner, RunnerDeps};
