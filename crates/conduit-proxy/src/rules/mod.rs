//! Forward rule model and rule store backends.
//!
//! A [`ForwardRule`] maps a slug-prefixed route to an upstream API and carries up to
//! three optional transform scripts. Rules are owned by an external store; the engine
//! only ever reads them through [`RuleStore`].

mod file;
mod inmemory;
mod store;
mod validation;

use chrono::{DateTime, Utc};
use hyper::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::scripting::ScriptRole;

pub use file::FileRuleStore;
pub use inmemory::InMemoryRuleStore;
pub use store::{create_rule_store, RuleStore, StoreError};
pub use validation::{validate_rules, IssueSeverity, RuleIssue};

/// A stored forward rule.
///
/// Field names follow the camelCase JSON shape the rule store persists.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRule {
    pub id: i64,
    pub name: String,
    /// First path segment of the rule's route. Derived from `name` when empty.
    #[serde(default)]
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_route: Option<String>,
    pub target_url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers_in_config: Value,
    #[serde(default)]
    pub headers_out_config: Value,
    #[serde(default)]
    pub params_config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_script: Option<String>,
    /// Overrides the configured default script engine for this rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Where the parameter script reads from and writes back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamChannel {
    Query,
    Body,
}

impl ParamChannel {
    /// Mutating methods carry their parameters in the body.
    pub fn for_method(method: &Method) -> Self {
        match *method {
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE => ParamChannel::Body,
            _ => ParamChannel::Query,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamChannel::Query => "query",
            ParamChannel::Body => "body",
        }
    }
}

impl ForwardRule {
    /// Fill in derived fields. Called by every store on read.
    pub fn normalize(&mut self) {
        if self.slug.trim().is_empty() {
            self.slug = slugify(&self.name);
        }
        self.method = self.method.trim().to_ascii_uppercase();
    }

    /// Case-insensitive comparison against the configured method.
    pub fn accepts(&self, method: &Method) -> bool {
        self.method.eq_ignore_ascii_case(method.as_str())
    }

    /// The configured method parsed as an HTTP method, falling back to GET.
    pub fn http_method(&self) -> Method {
        Method::from_bytes(self.method.as_bytes()).unwrap_or(Method::GET)
    }

    /// Parameter channel from `paramsConfig.type`, defaulting from the rule's method.
    pub fn params_channel(&self) -> ParamChannel {
        let config = config_object(&self.params_config);
        match config.get("type").and_then(Value::as_str) {
            Some(t) if t.eq_ignore_ascii_case("query") => ParamChannel::Query,
            Some(t) if t.eq_ignore_ascii_case("body") => ParamChannel::Body,
            _ => ParamChannel::for_method(&self.http_method()),
        }
    }

    pub fn headers_in(&self) -> Map<String, Value> {
        config_object(&self.headers_in_config)
    }

    pub fn headers_out(&self) -> Map<String, Value> {
        config_object(&self.headers_out_config)
    }

    /// Script source for a role, `None` when unset or blank.
    pub fn script_for(&self, role: ScriptRole) -> Option<&str> {
        let source = match role {
            ScriptRole::Header => self.header_script.as_deref(),
            ScriptRole::Param => self.param_script.as_deref(),
            ScriptRole::Response => self.response_script.as_deref(),
        };
        source.filter(|s| !s.trim().is_empty())
    }

    pub fn has_scripts(&self) -> bool {
        ScriptRole::ALL.iter().any(|role| self.script_for(*role).is_some())
    }
}

/// Read a free-form config blob as an object.
///
/// Stores may hand back either a JSON object or a JSON-encoded string. Anything that
/// does not resolve to an object degrades to an empty map.
pub fn config_object(raw: &Value) -> Map<String, Value> {
    match raw {
        Value::Object(map) => map.clone(),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}

/// URL-safe slug derived from a rule name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

#[cfg(test)]
pub(crate) fn test_rule(id: i64, slug: &str, target_url: &str) -> ForwardRule {
    ForwardRule {
        id,
        name: format!("Rule {id}"),
        slug: slug.to_string(),
        custom_route: None,
        target_url: target_url.to_string(),
        method: "GET".to_string(),
        headers_in_config: Value::Null,
        headers_out_config: Value::Null,
        params_config: Value::Null,
        header_script: None,
        param_script: None,
        response_script: None,
        script_engine: None,
        updated_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Weather API"), "weather-api");
        assert_eq!(slugify("  GitHub // Users!  "), "github-users");
        assert_eq!(slugify("v2_orders"), "v2-orders");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn test_normalize_derives_slug_and_uppercases_method() {
        let mut rule = test_rule(1, "", "https://api.example.com");
        rule.name = "My Echo".to_string();
        rule.method = " post ".to_string();
        rule.normalize();
        assert_eq!(rule.slug, "my-echo");
        assert_eq!(rule.method, "POST");
    }

    #[test]
    fn test_normalize_keeps_explicit_slug() {
        let mut rule = test_rule(1, "echo", "https://api.example.com");
        rule.normalize();
        assert_eq!(rule.slug, "echo");
    }

    #[test]
    fn test_accepts_is_case_insensitive() {
        let mut rule = test_rule(1, "echo", "https://api.example.com");
        rule.method = "post".to_string();
        assert!(rule.accepts(&Method::POST));
        assert!(!rule.accepts(&Method::GET));
    }

    #[test]
    fn test_params_channel_defaults_from_method() {
        let mut rule = test_rule(1, "echo", "https://api.example.com");
        assert_eq!(rule.params_channel(), ParamChannel::Query);
        rule.method = "PATCH".to_string();
        assert_eq!(rule.params_channel(), ParamChannel::Body);
        rule.method = "DELETE".to_string();
        assert_eq!(rule.params_channel(), ParamChannel::Body);
    }

    #[test]
    fn test_params_channel_from_config_object() {
        let mut rule = test_rule(1, "echo", "https://api.example.com");
        rule.method = "POST".to_string();
        rule.params_config = json!({"type": "query"});
        assert_eq!(rule.params_channel(), ParamChannel::Query);
    }

    #[test]
    fn test_params_channel_from_json_string() {
        let mut rule = test_rule(1, "echo", "https://api.example.com");
        rule.params_config = json!(r#"{"type": "BODY"}"#);
        assert_eq!(rule.params_channel(), ParamChannel::Body);
    }

    #[test]
    fn test_params_channel_malformed_config_degrades() {
        let mut rule = test_rule(1, "echo", "https://api.example.com");
        rule.method = "PUT".to_string();
        rule.params_config = json!("{not json");
        assert_eq!(rule.params_channel(), ParamChannel::Body);
        rule.params_config = json!({"type": "cookies"});
        assert_eq!(rule.params_channel(), ParamChannel::Body);
        rule.params_config = json!(42);
        assert_eq!(rule.params_channel(), ParamChannel::Body);
    }

    #[test]
    fn test_script_for_ignores_blank_source() {
        let mut rule = test_rule(1, "echo", "https://api.example.com");
        rule.header_script = Some("   \n ".to_string());
        rule.response_script = Some("|b, h, ctx| b".to_string());
        assert_eq!(rule.script_for(ScriptRole::Header), None);
        assert_eq!(rule.script_for(ScriptRole::Param), None);
        assert_eq!(rule.script_for(ScriptRole::Response), Some("|b, h, ctx| b"));
        assert!(rule.has_scripts());
    }

    #[test]
    fn test_deserialize_camel_case_rule() {
        let rule: ForwardRule = serde_json::from_value(json!({
            "id": 7,
            "name": "Echo",
            "slug": "echo",
            "customRoute": "/v1/{id}",
            "targetUrl": "https://api.example.com/items",
            "method": "GET",
            "headersInConfig": "{\"x-api-key\": \"required\"}",
            "paramsConfig": {"type": "query"},
            "headerScript": "(h, ctx) => h",
            "updatedAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(rule.id, 7);
        assert_eq!(rule.custom_route.as_deref(), Some("/v1/{id}"));
        assert_eq!(rule.headers_in().get("x-api-key"), Some(&json!("required")));
        assert!(rule.headers_out().is_empty());
        assert!(rule.updated_at.is_some());
    }
}
