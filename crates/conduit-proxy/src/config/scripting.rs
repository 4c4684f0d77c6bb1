//! Script sandbox configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptingConfig {
    /// Default engine for rules without a `scriptEngine` override: "rhai" or "javascript".
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Wall-clock limit per script invocation.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Rhai operation budget (0 = unlimited, the timeout still applies)
    #[serde(default)]
    pub max_operations: u64,
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_collection_size: usize,
    /// JavaScript iteration budget, counted per loop.
    #[serde(default = "default_loop_iteration_limit")]
    pub loop_iteration_limit: u64,
    /// JavaScript workers allowed to run at once, including ones past their deadline.
    #[serde(default = "default_max_js_workers")]
    pub max_js_workers: usize,
}

fn default_engine() -> String {
    if cfg!(feature = "javascript") {
        "javascript".to_string()
    } else {
        "rhai".to_string()
    }
}

fn default_timeout_ms() -> u64 {
    100
}

fn default_max_call_depth() -> usize {
    64
}

fn default_max_string_size() -> usize {
    1024 * 1024
}

fn default_max_collection_size() -> usize {
    100_000
}

fn default_loop_iteration_limit() -> u64 {
    100_000
}

fn default_max_js_workers() -> usize {
    16
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            timeout_ms: default_timeout_ms(),
            max_operations: 0,
            max_call_depth: default_max_call_depth(),
            max_string_size: default_max_string_size(),
            max_collection_size: default_max_collection_size(),
            loop_iteration_limit: default_loop_iteration_limit(),
            max_js_workers: default_max_js_workers(),
        }
    }
}
