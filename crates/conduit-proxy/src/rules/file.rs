use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use super::{ForwardRule, RuleStore, StoreError};

/// Rules file backed store.
///
/// The file is re-read on every lookup so edits are picked up by the next request.
/// Files ending in `.json` are parsed as JSON, everything else as YAML. Both a bare list
/// of rules and a document with a top-level `rules` list are accepted.
#[derive(Debug, Clone)]
pub struct FileRuleStore {
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RulesDocument {
    List(Vec<ForwardRule>),
    Wrapped { rules: Vec<ForwardRule> },
}

impl FileRuleStore {
    /// Open a rules file, failing if it cannot be read or parsed right now.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let contents = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        let rules = parse_rules(&path, &contents)?;
        tracing::debug!(path = %path.display(), rules = rules.len(), "Opened rules file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RuleStore for FileRuleStore {
    async fn list_all(&self) -> Result<Vec<ForwardRule>, StoreError> {
        let contents =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|source| StoreError::Io {
                    path: self.path.clone(),
                    source,
                })?;
        parse_rules(&self.path, &contents)
    }
}

fn parse_rules(path: &Path, contents: &str) -> Result<Vec<ForwardRule>, StoreError> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let document: RulesDocument = if is_json {
        serde_json::from_str(contents).map_err(|e| StoreError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    } else if contents.trim().is_empty() {
        RulesDocument::List(Vec::new())
    } else {
        serde_yaml::from_str(contents).map_err(|e| StoreError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    };

    let mut rules = match document {
        RulesDocument::List(rules) | RulesDocument::Wrapped { rules } => rules,
    };
    rules.iter_mut().for_each(ForwardRule::normalize);
    Ok(rules)
}
