use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cluster configuration file (YAML). Only the keys the supervisor reads.
///
/// Example `config.yml`:
/// ```yaml
/// Clusters:
///   zzzzz:
///     Containers:
///       LocalKeepLogsToContainerLog: errors
///       Logging:
///         LogThrottleBytes: 65536
///         LogThrottlePeriod: 60s
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfigFile {
    #[serde(default, rename = "Clusters")]
    pub clusters: BTreeMap<String, ClusterConfig>,
}

impl ClusterConfigFile {
    /// The single cluster in the file, if there is exactly one.
    pub fn single(&self) -> Option<&ClusterConfig> {
        if self.clusters.len() == 1 {
            self.clusters.values().next()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterConfig {
    #[serde(default)]
    pub containers: ContainersConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainersConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// `none`, `errors` or `all`
    #[serde(default)]
    pub local_keep_logs_to_container_log: Option<String>,
}

/// Log throttling overrides. Durations are strings such as `60s`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub limit_log_bytes_per_job: Option<u64>,
    #[serde(default)]
    pub log_throttle_bytes: Option<u64>,
    #[serde(default)]
    pub log_throttle_lines: Option<u64>,
    #[serde(default)]
    pub log_throttle_period: Option<String>,
    #[serde(default)]
    pub log_partial_line_throttle_period: Option<String>,
    #[serde(default)]
    pub log_bytes_per_event: Option<usize>,
    #[serde(default)]
    pub log_seconds_between_events: Option<String>,
    #[serde(default)]
    pub log_update_period: Option<String>,
    #[serde(default)]
    pub log_update_size: Option<u64>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
