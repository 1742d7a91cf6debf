//! In-memory control plane and block store for tests.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use pkg_manifest::{BlockLocator, Manifest};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::api::{ApiClient, ApiError};
use crate::keep::{KeepClient, block_hash_locator};

// ─── Block store ────────────────────────────────────────────────

#[derive(Default)]
pub struct StubKeep {
    blocks: DashMap<String, Vec<u8>>,
    storage_classes: Mutex<Vec<String>>,
}

impl StubKeep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn storage_classes(&self) -> Vec<String> {
        self.storage_classes
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Store `files` as a single-stream collection and return its manifest.
    pub fn store_files(&self, files: &[(&str, &[u8])]) -> Manifest {
        let mut entries = Vec::new();
        for (path, data) in files {
            let locator = block_hash_locator(data);
            self.blocks.insert(locator.clone(), data.to_vec());
            entries.push((
                path.to_string(),
                vec![pkg_manifest::FileSegment {
                    locator,
                    offset: 0,
                    len: data.len() as u64,
                }],
            ));
        }
        Manifest::from_files(entries)
    }
}

#[async_trait]
impl KeepClient for StubKeep {
    async fn put_block(&self, data: &[u8]) -> Result<String> {
        let locator = block_hash_locator(data);
        self.blocks.insert(locator.clone(), data.to_vec());
        Ok(locator)
    }

    async fn read_at(&self, locator: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let key = BlockLocator::parse(locator)?.stripped();
        let block = self
            .blocks
            .get(&key)
            .ok_or_else(|| anyhow::anyhow!("block {} not found", key))?;
        let start = offset as usize;
        let end = start + len;
        if end > block.len() {
            anyhow::bail!("read past end of block {}", key);
        }
        Ok(block[start..end].to_vec())
    }

    async fn local_locator(&self, locator: &str) -> Result<String> {
        let parsed = BlockLocator::parse(locator)?;
        let key = parsed.stripped();
        if !self.blocks.contains_key(&key) {
            anyhow::bail!("block {} not found", key);
        }
        Ok(key)
    }

    fn set_storage_classes(&self, classes: Vec<String>) {
        if let Ok(mut sc) = self.storage_classes.lock() {
            *sc = classes;
        }
    }

    fn clear_cache(&self) {}
}

// ─── Control plane ──────────────────────────────────────────────

/// One recorded call.
#[derive(Debug, Clone)]
pub struct ApiCall {
    pub method: String,
    pub resource: String,
    pub uuid: String,
    pub action: String,
    pub params: Value,
}

#[derive(Default)]
struct StubState {
    objects: HashMap<String, HashMap<String, Value>>,
    calls: Vec<ApiCall>,
    secret_mounts: Option<Value>,
    discovery: Map<String, Value>,
    fail_updates: bool,
}

/// Stores objects per resource; `create` assigns UUIDs, `update` merges the
/// singular-resource object into the stored record.
#[derive(Default)]
pub struct StubApi {
    state: Mutex<StubState>,
}

fn singular(resource: &str) -> &str {
    resource.strip_suffix('s').unwrap_or(resource)
}

fn infix(resource: &str) -> &'static str {
    match resource {
        "collections" => "4zz18",
        "logs" => "57u5n",
        "containers" => "dz642",
        "api_client_authorizations" => "gj3su",
        _ => "xxxxx",
    }
}

impl StubApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StubState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Seed an object.
    pub fn insert(&self, resource: &str, uuid: &str, object: Value) {
        self.with_state(|s| {
            s.objects
                .entry(resource.to_string())
                .or_default()
                .insert(uuid.to_string(), object);
        });
    }

    pub fn object(&self, resource: &str, uuid: &str) -> Option<Value> {
        self.with_state(|s| s.objects.get(resource).and_then(|m| m.get(uuid)).cloned())
    }

    pub fn objects(&self, resource: &str) -> Vec<Value> {
        self.with_state(|s| {
            s.objects
                .get(resource)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn set_secret_mounts(&self, mounts: Value) {
        self.with_state(|s| s.secret_mounts = Some(mounts));
    }

    pub fn set_discovery(&self, key: &str, value: Value) {
        self.with_state(|s| {
            s.discovery.insert(key.to_string(), value);
        });
    }

    /// Make every `update` fail with HTTP 500.
    pub fn fail_updates(&self, fail: bool) {
        self.with_state(|s| s.fail_updates = fail);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.with_state(|s| s.calls.clone())
    }

    /// Every `<resource>` object passed to `update` for `uuid`, in order.
    pub fn updates(&self, resource: &str, uuid: &str) -> Vec<Value> {
        let key = singular(resource).to_string();
        self.calls()
            .into_iter()
            .filter(|c| c.method == "PUT" && c.resource == resource && c.uuid == uuid)
            .map(|c| c.params.get(&key).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Concatenated text of every event of `event_type` logged for `object_uuid`.
    pub fn event_text(&self, object_uuid: &str, event_type: &str) -> String {
        self.calls()
            .into_iter()
            .filter(|c| c.method == "POST" && c.resource == "logs")
            .filter_map(|c| c.params.get("log").cloned())
            .filter(|l| l["object_uuid"] == object_uuid && l["event_type"] == event_type)
            .filter_map(|l| l["properties"]["text"].as_str().map(str::to_string))
            .collect()
    }

    fn record(&self, method: &str, resource: &str, uuid: &str, action: &str, params: &Value) {
        self.with_state(|s| {
            s.calls.push(ApiCall {
                method: method.to_string(),
                resource: resource.to_string(),
                uuid: uuid.to_string(),
                action: action.to_string(),
                params: params.clone(),
            })
        });
    }

    fn not_found(method: &str, resource: &str, uuid: &str) -> anyhow::Error {
        ApiError::Status {
            method: method.to_string(),
            url: format!("{}/{}", resource, uuid),
            status: 404,
            body: "not found".to_string(),
        }
        .into()
    }
}

#[async_trait]
impl ApiClient for StubApi {
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
        self.record(method, resource, uuid, action, &params);
        match (method, action) {
            ("GET", "auth") => Ok(json!({
                "uuid": "zzzzz-gj3su-000000000000000",
                "api_token": format!("token-for-{}", uuid),
            })),
            ("GET", "secret_mounts") => self
                .with_state(|s| s.secret_mounts.clone())
                .map(|m| json!({ "secret_mounts": m }))
                .ok_or_else(|| Self::not_found(method, resource, uuid)),
            ("POST", _) => {
                let mut obj = params
                    .get(singular(resource))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                let new_uuid = format!(
                    "zzzzz-{}-{}",
                    infix(resource),
                    &Uuid::new_v4().simple().to_string()[..15]
                );
                obj["uuid"] = json!(new_uuid);
                if resource == "collections" {
                    let text = obj["manifest_text"].as_str().unwrap_or_default().to_string();
                    obj["portable_data_hash"] = json!(Manifest::new(text).portable_data_hash());
                }
                self.insert(resource, &new_uuid, obj.clone());
                Ok(obj)
            }
            ("PUT", _) => {
                if self.with_state(|s| s.fail_updates) {
                    return Err(ApiError::Status {
                        method: method.to_string(),
                        url: format!("{}/{}", resource, uuid),
                        status: 500,
                        body: "update refused".to_string(),
                    }
                    .into());
                }
                let mut obj = self
                    .object(resource, uuid)
                    .ok_or_else(|| Self::not_found(method, resource, uuid))?;
                if let (Some(target), Some(Value::Object(changes))) =
                    (obj.as_object_mut(), params.get(singular(resource)))
                {
                    for (k, v) in changes {
                        target.insert(k.clone(), v.clone());
                    }
                }
                if resource == "collections" {
                    let text = obj["manifest_text"].as_str().unwrap_or_default().to_string();
                    obj["portable_data_hash"] = json!(Manifest::new(text).portable_data_hash());
                }
                self.insert(resource, uuid, obj.clone());
                Ok(obj)
            }
            ("GET", _) if uuid.is_empty() => {
                let items = self.objects(resource);
                Ok(json!({ "items": items, "items_available": items.len() }))
            }
            ("GET", _) => self
                .object(resource, uuid)
                .ok_or_else(|| Self::not_found(method, resource, uuid)),
            _ => Err(Self::not_found(method, resource, uuid)),
        }
    }

    async fn call_raw(
        &self,
        method: &str,
        resource: &str,
        uuid: &str,
        action: &str,
        params: Value,
    ) -> Result<Vec<u8>> {
        let v = self.call(method, resource, uuid, action, params).await?;
        Ok(serde_json::to_vec(&v)?)
    }

    async fn discovery(&self, key: &str) -> Result<Value> {
        self.with_state(|s| s.discovery.get(key).cloned())
            .ok_or_else(|| anyhow::anyhow!("discovery document has no key {:?}", key))
    }
}
