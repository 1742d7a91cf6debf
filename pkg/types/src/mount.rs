use serde::{Deserialize, Serialize};

/// Collection mount source.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CollectionMount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portable_data_hash: Option<String>,
    /// Sub-path inside the collection
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub exclude_from_output: bool,
}

impl CollectionMount {
    /// Neither uuid nor content hash: an empty writable collection.
    pub fn is_empty_source(&self) -> bool {
        self.uuid.as_deref().unwrap_or("").is_empty()
            && self.portable_data_hash.as_deref().unwrap_or("").is_empty()
    }
}

/// A declarative request for data to appear at a container path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mount {
    Collection(CollectionMount),
    Tmp {
        #[serde(default)]
        capacity: u64,
    },
    Text {
        #[serde(default)]
        content: String,
    },
    Json {
        #[serde(default)]
        content: serde_json::Value,
    },
    /// Only valid for `stdout`/`stderr`: a file under `output_path`.
    File {
        #[serde(default)]
        path: String,
    },
    GitTree {
        #[serde(default)]
        uuid: String,
        #[serde(default)]
        commit: String,
        #[serde(default)]
        path: String,
    },
    #[serde(other)]
    Unsupported,
}

impl Mount {
    pub fn kind(&self) -> &'static str {
        match self {
            Mount::Collection(_) => "collection",
            Mount::Tmp { .. } => "tmp",
            Mount::Text { .. } => "text",
            Mount::Json { .. } => "json",
            Mount::File { .. } => "file",
            Mount::GitTree { .. } => "git_tree",
            Mount::Unsupported => "unsupported",
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionMount> {
        match self {
            Mount::Collection(c) => Some(c),
            _ => None,
        }
    }

    /// Content of a `text`/`json` mount as it is written to disk.
    pub fn literal_content(&self) -> Option<Vec<u8>> {
        match self {
            Mount::Text { content } => Some(content.as_bytes().to_vec()),
            Mount::Json { content } => serde_json::to_vec(content).ok(),
            _ => None,
        }
    }

    /// Staged into the output dir by plain file copy rather than read from a manifest.
    pub fn is_copied_into_output(&self) -> bool {
        match self {
            Mount::Text { .. } | Mount::Json { .. } => true,
            Mount::Collection(c) => c.writable,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_kinds() {
        let m: Mount = serde_json::from_str(
            r#"{"kind":"collection","portable_data_hash":"59389a8f9ee9d399be35462a0f92541c+53","path":"/foo","writable":false}"#,
        )
        .unwrap();
        let c = m.as_collection().unwrap();
        assert_eq!(c.path, "/foo");
        assert!(!c.is_empty_source());

        let m: Mount = serde_json::from_str(r#"{"kind":"json","content":{"a":[1,2]}}"#).unwrap();
        assert_eq!(m.literal_content().unwrap(), br#"{"a":[1,2]}"#.to_vec());
        assert!(m.is_copied_into_output());

        let m: Mount = serde_json::from_str(r#"{"kind":"keep"}"#).unwrap();
        assert_eq!(m, Mount::Unsupported);

        let m: Mount = serde_json::from_str(r#"{"kind":"file","path":"/tmp/a.out"}"#).unwrap();
        assert_eq!(m.kind(), "file");
    }

    #[test]
    fn test_empty_writable_collection() {
        let m: Mount = serde_json::from_str(r#"{"kind":"collection","writable":true}"#).unwrap();
        assert!(m.as_collection().unwrap().is_empty_source());
        assert!(m.is_copied_into_output());
    }
}
