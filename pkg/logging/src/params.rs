use anyhow::Result;
use pkg_client::ApiClient;
use pkg_constants::logging as defaults;
use pkg_types::config::LoggingConfig;
use serde_json::Value;
use std::time::Duration;

/// Log throttling knobs. Built from defaults, then the cluster config file,
/// then the control plane's discovery document (last one wins).
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleParams {
    pub limit_bytes_per_job: u64,
    pub throttle_bytes: u64,
    pub throttle_lines: u64,
    pub throttle_period: Duration,
    pub partial_line_period: Duration,
    pub bytes_per_event: usize,
    pub seconds_between_events: Duration,
    pub update_period: Duration,
    pub update_size: u64,
}

impl Default for ThrottleParams {
    fn default() -> Self {
        Self {
            limit_bytes_per_job: defaults::LIMIT_LOG_BYTES_PER_JOB,
            throttle_bytes: defaults::THROTTLE_BYTES,
            throttle_lines: defaults::THROTTLE_LINES,
            throttle_period: Duration::from_secs(defaults::THROTTLE_PERIOD_SECS),
            partial_line_period: Duration::from_secs(defaults::PARTIAL_LINE_PERIOD_SECS),
            bytes_per_event: defaults::BYTES_PER_EVENT,
            seconds_between_events: Duration::from_secs(defaults::SECONDS_BETWEEN_EVENTS),
            update_period: Duration::from_secs(defaults::LOG_UPDATE_PERIOD_SECS),
            update_size: defaults::LOG_UPDATE_SIZE,
        }
    }
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| anyhow::anyhow!("invalid duration for {}: {:?}: {}", key, raw, e))
}

impl ThrottleParams {
    /// Overlay values set in the cluster config file.
    pub fn apply_config(&mut self, cfg: &LoggingConfig) -> Result<()> {
        if let Some(v) = cfg.limit_log_bytes_per_job {
            self.limit_bytes_per_job = v;
        }
        if let Some(v) = cfg.log_throttle_bytes {
            self.throttle_bytes = v;
        }
        if let Some(v) = cfg.log_throttle_lines {
            self.throttle_lines = v;
        }
        if let Some(v) = &cfg.log_throttle_period {
            self.throttle_period = parse_duration("LogThrottlePeriod", v)?;
        }
        if let Some(v) = &cfg.log_partial_line_throttle_period {
            self.partial_line_period = parse_duration("LogPartialLineThrottlePeriod", v)?;
        }
        if let Some(v) = cfg.log_bytes_per_event {
            self.bytes_per_event = v;
        }
        if let Some(v) = &cfg.log_seconds_between_events {
            self.seconds_between_events = parse_duration("LogSecondsBetweenEvents", v)?;
        }
        if let Some(v) = &cfg.log_update_period {
            self.update_period = parse_duration("LogUpdatePeriod", v)?;
        }
        if let Some(v) = cfg.log_update_size {
            self.update_size = v;
        }
        Ok(())
    }

    /// Overlay values published in the discovery document. Missing keys are
    /// left alone; durations there are plain numbers of seconds.
    pub async fn apply_discovery(&mut self, api: &dyn ApiClient) {
        let num = |v: Value| v.as_f64().filter(|n| *n >= 0.0);
        if let Some(n) = lookup(api, "crunchLimitLogBytesPerJob").await.and_then(num) {
            self.limit_bytes_per_job = n as u64;
        }
        if let Some(n) = lookup(api, "crunchLogThrottleBytes").await.and_then(num) {
            self.throttle_bytes = n as u64;
        }
        if let Some(n) = lookup(api, "crunchLogThrottlePeriod").await.and_then(num) {
            self.throttle_period = Duration::from_secs_f64(n);
        }
        if let Some(n) = lookup(api, "crunchLogThrottleLines").await.and_then(num) {
            self.throttle_lines = n as u64;
        }
        if let Some(n) = lookup(api, "crunchLogPartialLineThrottlePeriod").await.and_then(num) {
            self.partial_line_period = Duration::from_secs_f64(n);
        }
        if let Some(n) = lookup(api, "crunchLogBytesPerEvent").await.and_then(num) {
            self.bytes_per_event = n as usize;
        }
        if let Some(n) = lookup(api, "crunchLogSecondsBetweenEvents").await.and_then(num) {
            self.seconds_between_events = Duration::from_secs_f64(n);
        }
        if let Some(n) = lookup(api, "crunchLogUpdateSize").await.and_then(num) {
            self.update_size = n as u64;
        }
        if let Some(n) = lookup(api, "crunchLogUpdatePeriod").await.and_then(num) {
            self.update_period = Duration::from_secs_f64(n);
        }
    }
}

async fn lookup(api: &dyn ApiClient, key: &str) -> Option<Value> {
    match api.discovery(key).await {
        Ok(Value::Null) => None,
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!("discovery key {} unavailable: {}", key, e);
            None
        }
    }
}
