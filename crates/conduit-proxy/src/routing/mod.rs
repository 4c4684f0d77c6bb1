//! Request path to forward rule resolution.

mod pattern;

use std::collections::BTreeMap;
use std::sync::Arc;

use hyper::Uri;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::rules::{ForwardRule, RuleStore, StoreError};

pub use pattern::{PatternMatch, RoutePattern, WILDCARD_PARAM};

#[derive(Debug, Clone, Error)]
pub enum RouteError {
    #[error("invalid route template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },
    #[error("invalid target url '{url}': {reason}")]
    InvalidTarget { url: String, reason: String },
    #[error("invalid slug '{0}'")]
    InvalidSlug(String),
}

/// The rule selected for a request plus what its route captured.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub rule: ForwardRule,
    pub route: String,
    pub path_params: BTreeMap<String, String>,
    pub remainder: String,
}

impl MatchResult {
    /// Upstream URL: `targetUrl` without its trailing slash, then the remainder with
    /// exactly one leading slash, then the target's own query joined with `query`.
    pub fn upstream_url(&self, query: Option<&str>) -> Result<Uri, RouteError> {
        let target = self.rule.target_url.trim();
        let target = target.split('#').next().unwrap_or(target);
        let (base, target_query) = match target.split_once('?') {
            Some((base, q)) => (base, Some(q)),
            None => (target, None),
        };

        let mut url = base.trim_end_matches('/').to_string();
        if !self.remainder.is_empty() {
            url.push('/');
            url.push_str(self.remainder.trim_start_matches('/'));
        }

        let query: Vec<&str> = [target_query, query]
            .into_iter()
            .flatten()
            .filter(|q| !q.is_empty())
            .collect();
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }

        url.parse::<Uri>().map_err(|e| RouteError::InvalidTarget {
            url: url.clone(),
            reason: e.to_string(),
        })
    }

    /// Snapshot for the `config-lookup` trace entry.
    pub fn trace_data(&self) -> Value {
        json!({
            "ruleId": self.rule.id,
            "name": self.rule.name,
            "slug": self.rule.slug,
            "route": self.route,
            "method": self.rule.method,
            "targetUrl": self.rule.target_url,
            "pathParams": self.path_params,
            "remainder": self.remainder,
            "paramsChannel": self.rule.params_channel(),
            "headersInConfig": self.rule.headers_in(),
            "headersOutConfig": self.rule.headers_out(),
        })
    }
}

/// Resolves request paths against the live rule store.
///
/// Rules are loaded on every call; there is no cache to invalidate. The first rule in
/// store order whose pattern matches wins.
#[derive(Clone)]
pub struct RouteResolver {
    store: Arc<dyn RuleStore>,
}

impl RouteResolver {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    pub async fn resolve(&self, path: &str) -> Result<Option<MatchResult>, StoreError> {
        let rules = self.store.list_all().await?;
        let Some(first_segment) = path.split('/').nth(1).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };

        for rule in rules {
            // Every route starts with its slug; skip the compile for everything else.
            if rule.slug != first_segment {
                continue;
            }

            let pattern = match RoutePattern::for_rule(&rule) {
                Ok(pattern) => pattern,
                Err(e) => {
                    warn!(rule_id = rule.id, slug = %rule.slug, error = %e, "Skipping rule with invalid route");
                    continue;
                }
            };

            if let Some(matched) = pattern.matches(path) {
                debug!(
                    rule_id = rule.id,
                    slug = %rule.slug,
                    route = pattern.source(),
                    "Resolved forward rule"
                );
                return Ok(Some(MatchResult {
                    route: pattern.source().to_string(),
                    path_params: matched.params,
                    remainder: matched.remainder,
                    rule,
                }));
            }
        }

        Ok(None)
    }
}
