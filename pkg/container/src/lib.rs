//! Container runtimes the supervisor can drive.

pub mod docker;
pub mod executor;
pub mod runtime;
pub mod singularity;
pub mod stub;

pub use executor::{BindMount, ContainerExecutor, ContainerSpec, InputStream, OutputStream};
pub use runtime::new_executor;
