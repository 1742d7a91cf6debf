use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cloud instance description passed in `$InstanceType`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceType {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub provider_type: String,
    #[serde(default, rename = "VCPUs")]
    pub vcpus: u32,
    #[serde(default, rename = "RAM")]
    pub ram: u64,
    /// Hourly price
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub preemptible: bool,
}

/// Hourly price effective from `start_time`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct InstancePrice {
    pub start_time: DateTime<Utc>,
    pub price: f64,
}
