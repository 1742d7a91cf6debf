//! Control-plane and storage clients used by the supervisor.
//!
//! Both capabilities are traits so that the supervisor can run against the
//! HTTP implementations in production and the in-memory stubs in tests.

pub mod api;
pub mod collectionfs;
pub mod config;
pub mod keep;
pub mod stub;

pub use api::{ApiClient, ApiError, HttpApiClient, is_not_found};
pub use collectionfs::{CollectionFs, SharedCollectionFs};
pub use config::ClientConfig;
pub use keep::{HttpKeepClient, KeepClient};
