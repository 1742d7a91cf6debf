use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::ClientConfig;

/// Control-plane capability.
///
/// `params` follow the REST API conventions: `create`/`update` take
/// `{"<singular resource>": {...}, ...}`, list-style calls take `filters`,
/// `select`, etc.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// POST `<resource>`
    async fn create(&self, resource: &str, params: Value) -> Result<Value>;

    /// GET `<resource>/<uuid>`
    async fn get(&self, resource: &str, uuid: &str, params: Value) -> Result<Value>;

    /// PUT `<resource>/<uuid>`
    async fn update(&self, resource: &str, uuid: &str, params: Value) -> Result<Value>;

    /// Arbitrary `METHOD <resource>[/<uuid>][/<action>]`, JSON response.
    async fn call(
        &self,
        method: &str,
        resource: &str,
        uuid: &str,
        action: &str,
        params: Value,
    ) -> Result<Value>;

    /// Same as `call`, returning the undecoded body.
    async fn call_raw(
        &self,
        method: &str,
        resource: &str,
        uuid: &str,
        action: &str,
        params: Value,
    ) -> Result<Vec<u8>>;

    /// Value of a key in the discovery document.
    async fn discovery(&self, key: &str) -> Result<Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{method} {url}: HTTP {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },
    #[error("{method} {url}: giving up after {attempts} attempts: {message}")]
    Transient {
        method: String,
        url: String,
        attempts: u32,
        message: String,
    },
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Transient { .. } => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }
}

/// True if `err` is an HTTP 404 from the control plane.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>().and_then(ApiError::status) == Some(404)
}

// ─── HTTP client ────────────────────────────────────────────────

pub struct HttpApiClient {
    config: ClientConfig,
    http: reqwest::Client,
    discovery: OnceCell<Value>,
}

impl HttpApiClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.api_host.is_empty() {
            anyhow::bail!("ARVADOS_API_HOST is not set");
        }
        let http = config.http_client()?;
        Ok(Self {
            config,
            http,
            discovery: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, resource: &str, uuid: &str, action: &str) -> String {
        let mut url = format!(
            "https://{}/arvados/v1/{}",
            self.config.api_host.trim_end_matches('/'),
            resource
        );
        for part in [uuid, action] {
            if !part.is_empty() {
                url.push('/');
                url.push_str(part);
            }
        }
        url
    }

    async fn request(&self, method: &str, url: &str, params: &Value) -> Result<Vec<u8>> {
        let method_ = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| anyhow::anyhow!("bad method {}: {}", method, e))?;
        let with_body = !matches!(method_, reqwest::Method::GET | reqwest::Method::DELETE);

        let mut target = reqwest::Url::parse(url)?;
        if !with_body && let Value::Object(map) = params {
            let mut pairs = target.query_pairs_mut();
            for (k, v) in map {
                match v {
                    Value::String(s) => pairs.append_pair(k, s),
                    other => pairs.append_pair(k, &other.to_string()),
                };
            }
        }

        let attempts = self.config.retries.max(1);
        let mut last_err = String::new();
        for attempt in 1..=attempts {
            let mut req = self
                .http
                .request(method_.clone(), target.clone())
                .header("Authorization", format!("Bearer {}", self.config.api_token));
            if with_body {
                req = req.json(params);
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                    if status.is_success() {
                        return Ok(body);
                    }
                    if !status.is_server_error() {
                        return Err(ApiError::Status {
                            method: method.to_string(),
                            url: url.to_string(),
                            status: status.as_u16(),
                            body: String::from_utf8_lossy(&body).into_owned(),
                        }
                        .into());
                    }
                    last_err = format!("HTTP {}", status);
                }
                Err(e) => last_err = e.to_string(),
            }
            tracing::debug!("[api] {} {} attempt {} failed: {}", method, url, attempt, last_err);
            if attempt < attempts {
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
        Err(ApiError::Transient {
            method: method.to_string(),
            url: url.to_string(),
            attempts,
            message: last_err,
        }
        .into())
    }
}

/// Exponential backoff capped at 10s.
pub(crate) fn backoff(attempt: u32) -> Duration {
    Duration::from_millis((100u64 << attempt.min(7)).min(10_000))
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn create(&self, resource: &str, params: Value) -> Result<Value> {
        self.call("POST", resource, "", "", params).await
    }

    async fn get(&self, resource: &str, uuid: &str, params: Value) -> Result<Value> {
        self.call("GET", resource, uuid, "", params).await
    }

    async fn update(&self, resource: &str, uuid: &str, params: Value) -> Result<Value> {
        self.call("PUT", resource, uuid, "", params).await
    }

    async fn call(
        &self,
        method: &str,
        resource: &str,
        uuid: &str,
        action: &str,
        params: Value,
    ) -> Result<Value> {
        let body = self.call_raw(method, resource, uuid, action, params).await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body)
            .map_err(|e| anyhow::anyhow!("{} {}: decode response: {}", method, resource, e))
    }

    async fn call_raw(
        &self,
        method: &str,
        resource: &str,
        uuid: &str,
        action: &str,
        params: Value,
    ) -> Result<Vec<u8>> {
        let url = self.url(resource, uuid, action);
        self.request(method, &url, &params).await
    }

    async fn discovery(&self, key: &str) -> Result<Value> {
        let doc = self
            .discovery
            .get_or_try_init(|| async {
                let url = format!(
                    "https://{}/discovery/v1/apis/arvados/v1/rest",
                    self.config.api_host.trim_end_matches('/')
                );
                let body = self.request("GET", &url, &Value::Null).await?;
                serde_json::from_slice::<Value>(&body)
                    .map_err(|e| anyhow::anyhow!("decode discovery document: {}", e))
            })
            .await?;
        doc.get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("discovery document has no key {:?}", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = HttpApiClient::new(ClientConfig {
            api_host: "zzzzz.example.com/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.url("containers", "zzzzz-dz642-000000000000000", "auth"),
            "https://zzzzz.example.com/arvados/v1/containers/zzzzz-dz642-000000000000000/auth"
        );
        assert_eq!(client.url("logs", "", ""), "https://zzzzz.example.com/arvados/v1/logs");
    }

    #[test]
    fn test_missing_host_is_an_error() {
        assert!(HttpApiClient::new(ClientConfig::default()).is_err());
    }

    #[test]
    fn test_not_found_classification() {
        let err: anyhow::Error = ApiError::Status {
            method: "GET".into(),
            url: "u".into(),
            status: 404,
            body: String::new(),
        }
        .into();
        assert!(is_not_found(&err));
        assert!(!is_not_found(&anyhow::anyhow!("other")));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_millis(200));
        assert_eq!(backoff(30), Duration::from_millis(10_000));
    }
}
