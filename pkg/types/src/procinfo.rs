use serde::{Deserialize, Serialize};

/// Record persisted in a supervisor lockfile.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ProcInfo {
    #[serde(rename = "UUID", default)]
    pub uuid: String,
    #[serde(rename = "PID", default)]
    pub pid: i32,
}
