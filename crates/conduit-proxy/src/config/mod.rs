//! Configuration types for the conduit forwarding engine.

mod listen;
mod scripting;
mod store;
mod trace;
mod upstream;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use listen::{ListenConfig, MetricsConfig};
pub use scripting::ScriptingConfig;
pub use store::StoreConfig;
pub use trace::TraceConfig;
pub use upstream::UpstreamConfig;

use crate::scripting::ScriptLanguage;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    /// Requests under this prefix are never forwarded; they go to the fallback.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scripting: ScriptingConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    /// Prometheus endpoint; disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            api_prefix: default_api_prefix(),
            store: StoreConfig::default(),
            scripting: ScriptingConfig::default(),
            upstream: UpstreamConfig::default(),
            trace: TraceConfig::default(),
            metrics: None,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{}': {e}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&contents)?;

        // A relative rules file is resolved against the config file's directory.
        if let (Some(rules_path), Some(dir)) = (config.store.path.as_mut(), path.parent()) {
            if rules_path.is_relative() {
                *rules_path = dir.join(&*rules_path);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.api_prefix.starts_with('/') || self.api_prefix.len() < 2 {
            anyhow::bail!(
                "api_prefix must start with '/' and name a path segment, got '{}'",
                self.api_prefix
            );
        }

        match self.store.backend.as_str() {
            "inmemory" => {}
            "file" => {
                if self.store.path.is_none() {
                    anyhow::bail!("store.backend 'file' requires 'store.path'");
                }
            }
            other => anyhow::bail!("Unknown rule store backend: '{other}'. Supported: inmemory, file"),
        }

        let language = ScriptLanguage::from_name(&self.scripting.engine).ok_or_else(|| {
            anyhow::anyhow!("Unknown script engine type: '{}'", self.scripting.engine)
        })?;
        if !language.is_available() {
            anyhow::bail!("JavaScript engine specified but 'javascript' feature is not enabled");
        }
        if self.scripting.timeout_ms == 0 {
            anyhow::bail!("scripting.timeout_ms must be greater than zero");
        }
        if self.scripting.max_js_workers == 0 {
            anyhow::bail!("scripting.max_js_workers must be greater than zero");
        }

        if self.upstream.timeout_secs == 0 {
            anyhow::bail!("upstream.timeout_secs must be greater than zero");
        }

        if self.trace.enabled && hyper::header::HeaderName::try_from(&self.trace.header).is_err() {
            anyhow::bail!("trace.header '{}' is not a valid header name", self.trace.header);
        }

        Ok(())
    }

    pub fn api_prefix(&self) -> &str {
        self.api_prefix.trim_end_matches('/')
    }
}
