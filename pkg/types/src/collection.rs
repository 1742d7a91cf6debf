use serde::{Deserialize, Serialize};

/// Collection record as returned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Collection {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub portable_data_hash: String,
    #[serde(default)]
    pub manifest_text: String,
    #[serde(default)]
    pub is_trashed: bool,
    #[serde(default)]
    pub storage_classes_desired: Vec<String>,
}
