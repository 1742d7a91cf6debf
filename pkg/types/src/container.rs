use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::mount::Mount;

// --- Container state ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ContainerState {
    #[default]
    Queued,
    Locked,
    Running,
    Complete,
    Cancelled,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Queued => write!(f, "Queued"),
            ContainerState::Locked => write!(f, "Locked"),
            ContainerState::Running => write!(f, "Running"),
            ContainerState::Complete => write!(f, "Complete"),
            ContainerState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

// --- Constraints ---

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CudaConstraints {
    #[serde(default)]
    pub device_count: u32,
    #[serde(default)]
    pub driver_version: String,
    #[serde(default)]
    pub hardware_capability: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConstraints {
    /// Container may talk to the control plane; injects credentials and enables networking.
    #[serde(default, rename = "API")]
    pub api: bool,
    /// Memory in bytes
    #[serde(default)]
    pub ram: u64,
    #[serde(default)]
    pub vcpus: u32,
    /// Mount helper RAM cache, bytes
    #[serde(default)]
    pub keep_cache_ram: u64,
    /// Mount helper disk cache, bytes
    #[serde(default)]
    pub keep_cache_disk: u64,
    #[serde(default)]
    pub cuda: CudaConstraints,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulingParameters {
    /// Seconds; 0 means no limit.
    #[serde(default)]
    pub max_run_time: u64,
    #[serde(default)]
    pub preemptible: bool,
}

// --- Container record ---

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Container {
    pub uuid: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub container_image: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: BTreeMap<String, Mount>,
    #[serde(default)]
    pub output_path: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub runtime_constraints: RuntimeConstraints,
    #[serde(default)]
    pub scheduling_parameters: SchedulingParameters,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub output_storage_classes: Vec<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub log: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl Container {
    /// Mount declared at `output_path`, if any.
    pub fn output_mount(&self) -> Option<&Mount> {
        self.mounts.get(&self.output_path)
    }
}

/// Response of `containers/<uuid>/auth`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiClientAuthorization {
    pub uuid: String,
    pub api_token: String,
}

impl ApiClientAuthorization {
    /// Token scoped to one container: `v2/<auth uuid>/<token>/<container uuid>`.
    pub fn container_token(&self, container_uuid: &str) -> String {
        format!("v2/{}/{}/{}", self.uuid, self.api_token, container_uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_container_record() {
        let raw = r#"{
            "uuid": "zzzzz-dz642-202301121543210",
            "command": ["echo", "hello world"],
            "container_image": "d4ab34d3d4f8a72f5c4973051ae69fab+122",
            "cwd": ".",
            "mounts": {"/tmp": {"kind": "tmp", "capacity": 1000000}},
            "output_path": "/tmp",
            "priority": 1,
            "runtime_constraints": {"API": true, "ram": 12000000000, "vcpus": 4},
            "scheduling_parameters": {"max_run_time": 1},
            "state": "Locked"
        }"#;
        let c: Container = serde_json::from_str(raw).unwrap();
        assert_eq!(c.state, ContainerState::Locked);
        assert!(c.runtime_constraints.api);
        assert_eq!(c.runtime_constraints.vcpus, 4);
        assert_eq!(c.scheduling_parameters.max_run_time, 1);
        assert!(matches!(c.output_mount(), Some(Mount::Tmp { .. })));
        assert!(c.exit_code.is_none());
    }

    #[test]
    fn test_container_token() {
        let auth = ApiClientAuthorization {
            uuid: "zzzzz-gj3su-000000000000000".to_string(),
            api_token: "abc".to_string(),
        };
        assert_eq!(
            auth.container_token("zzzzz-dz642-000000000000000"),
            "v2/zzzzz-gj3su-000000000000000/abc/zzzzz-dz642-000000000000000"
        );
    }
}
