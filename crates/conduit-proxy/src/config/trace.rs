//! Execution trace configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Response header carrying the base64 trace.
    #[serde(default = "default_header")]
    pub header: String,
    /// Body snapshots in the trace keep at most this many bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Encoded traces larger than this drop their payloads, then the header entirely.
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_header() -> String {
    "x-conduit-trace".to_string()
}

fn default_max_body_bytes() -> usize {
    2048
}

fn default_max_header_bytes() -> usize {
    16 * 1024
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            header: default_header(),
            max_body_bytes: default_max_body_bytes(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}
