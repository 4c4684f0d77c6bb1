use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use thiserror::Error;

use super::{FileRuleStore, ForwardRule, InMemoryRuleStore};
use crate::config::StoreConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read rules from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse rules from {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("rule store unavailable: {0}")]
    Unavailable(String),
}

/// Read access to the externally owned forward rules.
///
/// The engine never writes through this trait. Every call reflects the store's current
/// contents, so rule edits take effect on the next request without a restart.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// All rules in store order. Route resolution takes the first match in this order.
    async fn list_all(&self) -> Result<Vec<ForwardRule>, StoreError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<ForwardRule>, StoreError> {
        Ok(self.list_all().await?.into_iter().find(|rule| rule.id == id))
    }
}

/// Create a RuleStore based on configuration
///
/// `inmemory` serves the rules embedded in the config file, `file` re-reads a YAML or
/// JSON rules file on every lookup.
pub fn create_rule_store(config: &StoreConfig) -> Result<Arc<dyn RuleStore>> {
    match config.backend.as_str() {
        "inmemory" => {
            tracing::info!("Using in-memory rule store ({} rules)", config.rules.len());
            Ok(Arc::new(InMemoryRuleStore::new(config.rules.clone())))
        }
        "file" => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| anyhow!("File rule store selected but no 'store.path' provided"))?;
            let store = FileRuleStore::open(path)
                .with_context(|| format!("Failed to open rules file {}", path.display()))?;
            tracing::info!("Using file rule store (path={})", path.display());
            Ok(Arc::new(store))
        }
        other => Err(anyhow!("Unknown rule store backend: {other}")),
    }
}
