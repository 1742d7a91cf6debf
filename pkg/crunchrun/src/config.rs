use pkg_constants::paths::{CA_CERT_CANDIDATES, DEFAULT_LOCK_DIR};
use pkg_constants::runtime::{
    CRUNCHSTAT_INTERVAL_SECS, DEFAULT_RUNTIME, PRIORITY_POLL_INTERVAL_SECS, WATCHDOG_INTERVAL_SECS,
};
use pkg_logging::ThrottleParams;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// When containers get a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkPolicy {
    /// Only containers with the `API` constraint.
    #[default]
    Default,
    Always,
}

impl FromStr for NetworkPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "default" => Ok(NetworkPolicy::Default),
            "always" => Ok(NetworkPolicy::Always),
            other => anyhow::bail!(
                "invalid container-enable-networking value {:?} (expected \"default\" or \"always\")",
                other
            ),
        }
    }
}

/// Settings for one supervisor run, built once at startup.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Lockfiles, the broken-node sentinel and price history live here.
    pub lock_dir: PathBuf,
    /// The run's private temp tree is created below this.
    pub temp_root: PathBuf,
    pub stat_interval: Duration,
    pub cgroup_root: PathBuf,
    /// Cgroup parent handed to the runtime; empty means the runtime default.
    pub cgroup_parent: String,
    pub enable_memory_limit: bool,
    pub enable_network: NetworkPolicy,
    pub network_mode: String,
    pub runtime_engine: String,
    pub broken_node_hook: Option<String>,
    pub watchdog_interval: Duration,
    pub priority_poll_interval: Duration,
    pub throttle: ThrottleParams,
    /// `GatewayAddress`; only used when a secret is set.
    pub gateway_address: String,
    pub gateway_auth_secret: Option<String>,
    /// Raw `$InstanceType` JSON.
    pub instance_type: Option<String>,
    /// Host CA bundles; the first existing one is bound into API containers.
    pub ca_cert_candidates: Vec<PathBuf>,
    /// Environment of child processes (the mount helper, host-info commands).
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
            temp_root: std::env::temp_dir(),
            stat_interval: Duration::from_secs(CRUNCHSTAT_INTERVAL_SECS),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_parent: String::new(),
            enable_memory_limit: true,
            enable_network: NetworkPolicy::Default,
            network_mode: "default".to_string(),
            runtime_engine: DEFAULT_RUNTIME.to_string(),
            broken_node_hook: None,
            watchdog_interval: Duration::from_secs(WATCHDOG_INTERVAL_SECS),
            priority_poll_interval: Duration::from_secs(PRIORITY_POLL_INTERVAL_SECS),
            throttle: ThrottleParams::default(),
            gateway_address: String::new(),
            gateway_auth_secret: None,
            instance_type: None,
            ca_cert_candidates: default_cert_candidates(None),
            env: BTreeMap::new(),
        }
    }
}

impl RunnerConfig {
    /// Pick up the variables the dispatcher passes: `InstanceType`,
    /// `GatewayAddress`, `GatewayAuthSecret`, `SSL_CERT_FILE`. The gateway
    /// secret is removed from `env` so it never reaches child processes.
    pub fn apply_env(&mut self, mut env: BTreeMap<String, String>) {
        self.instance_type = env.get("InstanceType").filter(|v| !v.is_empty()).cloned();
        self.gateway_address = env.get("GatewayAddress").cloned().unwrap_or_default();
        self.gateway_auth_secret = env.remove("GatewayAuthSecret").filter(|v| !v.is_empty());
        self.ca_cert_candidates = default_cert_candidates(env.get("SSL_CERT_FILE").map(String::as_str));
        self.env = env;
    }

    /// Whether a container with the given `API` constraint gets a network.
    pub fn network_enabled(&self, api: bool) -> bool {
        api || self.enable_network == NetworkPolicy::Always
    }
}

fn default_cert_candidates(ssl_cert_file: Option<&str>) -> Vec<PathBuf> {
    ssl_cert_file
        .filter(|f| !f.is_empty())
        .into_iter()
        .chain(CA_CERT_CANDIDATES.iter().copied())
        .map(PathBuf::from)
        .collect()
}
