//! Rule store configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::rules::ForwardRule;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// "inmemory" or "file"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Rules file for the file backend (YAML, or JSON by extension).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Inline rules for the in-memory backend.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ForwardRule>,
}

fn default_backend() -> String {
    "inmemory".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
            rules: Vec::new(),
        }
    }
}
