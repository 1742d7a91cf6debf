//! Control-plane and block-store clients acting as the container.

use anyhow::Result;
use async_trait::async_trait;
use pkg_client::{ApiClient, ClientConfig, HttpApiClient, HttpKeepClient, KeepClient};
use std::sync::Arc;

/// Builds clients that authenticate with a container-scoped token.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn clients(&self, token: &str) -> Result<(Arc<dyn ApiClient>, Arc<dyn KeepClient>)>;
}

/// HTTP clients sharing the dispatcher's connection settings.
pub struct HttpClients {
    config: ClientConfig,
}

impl HttpClients {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClientFactory for HttpClients {
    async fn clients(&self, token: &str) -> Result<(Arc<dyn ApiClient>, Arc<dyn KeepClient>)> {
        let config = self.config.with_token(token);
        let api = HttpApiClient::new(config.clone())?;
        let keep = HttpKeepClient::new(config, &api).await?;
        Ok((Arc::new(api), Arc::new(keep)))
    }
}

/// Hands out the same clients for every token.
pub struct FixedClients {
    pub api: Arc<dyn ApiClient>,
    pub keep: Arc<dyn KeepClient>,
}

#[async_trait]
impl ClientFactory for FixedClients {
    async fn clients(&self, _token: &str) -> Result<(Arc<dyn ApiClient>, Arc<dyn KeepClient>)> {
        Ok((self.api.clone(), self.keep.clone()))
    }
}
