use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use md5::{Digest, Md5};
use pkg_manifest::{BlockLocator, Manifest};
use std::sync::{Arc, RwLock};

use crate::api::{ApiClient, backoff};
use crate::config::ClientConfig;

/// Block storage capability.
#[async_trait]
pub trait KeepClient: Send + Sync {
    /// Store one block (at most `BLOCK_SIZE` bytes); returns its locator.
    async fn put_block(&self, data: &[u8]) -> Result<String>;

    /// Read `len` bytes at `offset` within a block.
    async fn read_at(&self, locator: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Whole content of a file in a manifest.
    async fn read_file(&self, manifest: &Manifest, path: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for seg in manifest.file_segments(path)? {
            out.extend(self.read_at(&seg.locator, seg.offset, seg.len as usize).await?);
        }
        Ok(out)
    }

    /// A locator for the same block that is readable on the local cluster.
    async fn local_locator(&self, locator: &str) -> Result<String>;

    /// Storage classes requested for subsequent writes.
    fn set_storage_classes(&self, classes: Vec<String>);

    /// Drop cached block data.
    fn clear_cache(&self);
}

/// md5 locator (`<hash>+<size>`) of a block.
pub fn block_hash_locator(data: &[u8]) -> String {
    format!("{}+{}", hex::encode(Md5::digest(data)), data.len())
}

// ─── HTTP client ────────────────────────────────────────────────

pub struct HttpKeepClient {
    config: ClientConfig,
    http: reqwest::Client,
    services: Vec<String>,
    replicas: u32,
    storage_classes: RwLock<Vec<String>>,
    cache: DashMap<String, Arc<Vec<u8>>>,
}

impl HttpKeepClient {
    /// Use `config.keep_services`, or ask the control plane for accessible services.
    pub async fn new(config: ClientConfig, api: &dyn ApiClient) -> Result<Self> {
        let mut services = config.keep_services.clone();
        if services.is_empty() {
            let list = api
                .call("GET", "keep_services", "", "accessible", serde_json::json!({}))
                .await?;
            for item in list["items"].as_array().cloned().unwrap_or_default() {
                let scheme = if item["service_ssl_flag"].as_bool().unwrap_or(false) {
                    "https"
                } else {
                    "http"
                };
                services.push(format!(
                    "{}://{}:{}",
                    scheme,
                    item["service_host"].as_str().unwrap_or_default(),
                    item["service_port"].as_u64().unwrap_or(0)
                ));
            }
        }
        if services.is_empty() {
            anyhow::bail!("no keep services available");
        }
        let http = config.http_client()?;
        Ok(Self {
            config,
            http,
            services,
            replicas: pkg_constants::keep::DEFAULT_REPLICAS,
            storage_classes: RwLock::new(Vec::new()),
            cache: DashMap::new(),
        })
    }

    /// Services in rendezvous order for a block hash.
    fn probe_order(&self, hash: &str) -> Vec<String> {
        let mut ranked: Vec<(String, &String)> = self
            .services
            .iter()
            .map(|s| (hex::encode(Md5::digest(format!("{}{}", hash, s))), s))
            .collect();
        ranked.sort();
        ranked.into_iter().rev().map(|(_, s)| s.clone()).collect()
    }

    async fn fetch_block(&self, locator: &BlockLocator, raw: &str) -> Result<Arc<Vec<u8>>> {
        if let Some(hit) = self.cache.get(&locator.hash) {
            return Ok(hit.clone());
        }
        let mut last_err = String::new();
        for attempt in 1..=self.config.retries.clamp(1, 4) {
            for svc in self.probe_order(&locator.hash) {
                let url = format!("{}/{}", svc.trim_end_matches('/'), raw);
                let resp = self
                    .http
                    .get(&url)
                    .header("Authorization", format!("Bearer {}", self.config.api_token))
                    .send()
                    .await;
                match resp {
                    Ok(r) if r.status().is_success() => {
                        let data = r.bytes().await?.to_vec();
                        if block_hash_locator(&data) != locator.stripped() {
                            last_err = format!("{}: checksum mismatch", url);
                            continue;
                        }
                        let data = Arc::new(data);
                        self.cache.insert(locator.hash.clone(), data.clone());
                        return Ok(data);
                    }
                    Ok(r) => last_err = format!("{}: HTTP {}", url, r.status()),
                    Err(e) => last_err = format!("{}: {}", url, e),
                }
            }
            tokio::time::sleep(backoff(attempt)).await;
        }
        anyhow::bail!("block {} not found: {}", locator.hash, last_err)
    }
}

#[async_trait]
impl KeepClient for HttpKeepClient {
    async fn put_block(&self, data: &[u8]) -> Result<String> {
        let plain = block_hash_locator(data);
        let hash = plain.split('+').next().unwrap_or_default().to_string();
        let classes = self
            .storage_classes
            .read()
            .map(|c| c.join(", "))
            .unwrap_or_default();
        let mut last_err = String::new();
        for attempt in 1..=self.config.retries.clamp(1, 4) {
            for svc in self.probe_order(&hash) {
                let url = format!("{}/{}", svc.trim_end_matches('/'), hash);
                let mut req = self
                    .http
                    .put(&url)
                    .header("Authorization", format!("Bearer {}", self.config.api_token))
                    .header("X-Keep-Desired-Replicas", self.replicas.to_string())
                    .body(data.to_vec());
                if !classes.is_empty() {
                    req = req.header("X-Keep-Storage-Classes", classes.clone());
                }
                match req.send().await {
                    Ok(r) if r.status().is_success() => {
                        let body = r.text().await.unwrap_or_default();
                        let signed = body.trim();
                        return Ok(if signed.is_empty() {
                            plain
                        } else {
                            signed.to_string()
                        });
                    }
                    Ok(r) => last_err = format!("{}: HTTP {}", url, r.status()),
                    Err(e) => last_err = format!("{}: {}", url, e),
                }
            }
            tokio::time::sleep(backoff(attempt)).await;
        }
        anyhow::bail!("could not write block {}: {}", plain, last_err)
    }

    async fn read_at(&self, locator: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let parsed = BlockLocator::parse(locator)?;
        let block = self.fetch_block(&parsed, locator).await?;
        let start = offset as usize;
        let end = start.saturating_add(len);
        if end > block.len() {
            anyhow::bail!(
                "read {}+{} past end of block {} ({} bytes)",
                offset,
                len,
                locator,
                block.len()
            );
        }
        Ok(block[start..end].to_vec())
    }

    async fn local_locator(&self, locator: &str) -> Result<String> {
        let parsed = BlockLocator::parse(locator)?;
        if parsed.remote_hint().is_none() {
            return Ok(locator.to_string());
        }
        let data = self.fetch_block(&parsed, locator).await?;
        self.put_block(&data).await
    }

    fn set_storage_classes(&self, classes: Vec<String>) {
        if let Ok(mut sc) = self.storage_classes.write() {
            *sc = classes;
        }
    }

    fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_locator() {
        assert_eq!(block_hash_locator(b"foo"), "acbd18db4cc2f85cedef654fccc4a4d8+3");
        assert_eq!(block_hash_locator(b""), "d41d8cd98f00b204e9800998ecf8427e+0");
    }
}
