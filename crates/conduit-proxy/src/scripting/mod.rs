//! Sandboxed execution of rule transform scripts.
//!
//! Each rule may carry up to three scripts: a header transform, a parameter transform and
//! a response transform. A script's source must evaluate to a callable which the sandbox
//! then invokes with the role's arguments plus a per-request shared context:
//!
//! | role     | arguments                | `null` / `()` result |
//! |----------|--------------------------|----------------------|
//! | header   | `(headers, ctx)`         | request blocked      |
//! | param    | `(params, ctx)`          | request blocked      |
//! | response | `(body, headers, ctx)`   | response unchanged   |
//!
//! Scripts see only `console` (log/info/warn/error/debug, routed to `tracing`) and
//! `timer` (`now()`, `elapsed()`). Every invocation runs on the blocking pool under a
//! wall-clock deadline.
//!
//! Rhai checks the deadline itself and stops. Boa cannot be interrupted: a JavaScript
//! worker past its deadline is abandoned and keeps its thread until the loop iteration
//! budget ends it. That budget is counted per loop, so nested loops multiply it and a
//! script like `while (true) { for (let i = 0; i < 1000; i++) {} }` can run for a long
//! time. At most `max_js_workers` JavaScript workers exist at once, finished or not;
//! past that, new JavaScript calls fail with [`ScriptError::Saturated`] until one returns.
//!
//! Rhai (always available):
//! ```rhai
//! |headers, ctx| {
//!     ctx["apiKey"] = headers["x-api-key"];
//!     headers["x-source"] = "conduit";
//!     headers
//! }
//! ```
//!
//! JavaScript (feature `javascript`):
//! ```javascript
//! (body, headers, ctx) => ({ body: { wrapped: body }, headers })
//! ```

mod rhai_engine;
mod rhai_validator;
mod validator;

#[cfg(feature = "javascript")]
mod js_engine;
#[cfg(feature = "javascript")]
mod js_validator;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::ScriptingConfig;
use crate::metrics;
use crate::rules::ForwardRule;

pub use rhai_validator::RhaiValidator;
pub use validator::{validate_script, ScriptValidationError, ScriptValidator};

#[cfg(feature = "javascript")]
pub use js_validator::JsValidator;

/// Log target for everything scripts emit through `console`.
pub const SCRIPT_LOG_TARGET: &str = "conduit::script";

/// Slack on top of the script timeout before the async side gives up on the worker.
const DEADLINE_GRACE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptRole {
    Header,
    Param,
    Response,
}

impl ScriptRole {
    pub const ALL: [ScriptRole; 3] = [ScriptRole::Header, ScriptRole::Param, ScriptRole::Response];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptRole::Header => "header",
            ScriptRole::Param => "param",
            ScriptRole::Response => "response",
        }
    }
}

impl fmt::Display for ScriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptLanguage {
    Rhai,
    JavaScript,
}

impl ScriptLanguage {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "rhai" => Some(ScriptLanguage::Rhai),
            "javascript" | "js" => Some(ScriptLanguage::JavaScript),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptLanguage::Rhai => "rhai",
            ScriptLanguage::JavaScript => "javascript",
        }
    }

    /// Whether this build can execute the language.
    pub fn is_available(&self) -> bool {
        match self {
            ScriptLanguage::Rhai => true,
            ScriptLanguage::JavaScript => cfg!(feature = "javascript"),
        }
    }

    /// The rule's `scriptEngine` override, or `default`.
    pub fn for_rule(rule: &ForwardRule, default: ScriptLanguage) -> Result<Self, ScriptError> {
        match rule.script_engine.as_deref().map(str::trim) {
            None | Some("") => Ok(default),
            Some(name) => Self::from_name(name)
                .ok_or_else(|| ScriptError::Unavailable(format!("unknown script engine '{name}'"))),
        }
    }
}

impl fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request key/value bag shared by every script invocation of one request.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    values: Arc<Mutex<Map<String, Value>>>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    pub fn set_value(&self, key: &str, value: Value) {
        self.values.lock().insert(key.to_string(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.lock().remove(key)
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.lock().clone()
    }

    pub fn replace(&self, values: Map<String, Value>) {
        *self.values.lock() = values;
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

/// Arguments for one invocation. The variant decides the role.
#[derive(Debug, Clone)]
pub enum ScriptInput {
    Header { headers: Value },
    Param { params: Value },
    Response { body: Value, headers: Value },
}

impl ScriptInput {
    pub fn role(&self) -> ScriptRole {
        match self {
            ScriptInput::Header { .. } => ScriptRole::Header,
            ScriptInput::Param { .. } => ScriptRole::Param,
            ScriptInput::Response { .. } => ScriptRole::Response,
        }
    }

    fn into_args(self) -> Vec<Value> {
        match self {
            ScriptInput::Header { headers } => vec![headers],
            ScriptInput::Param { params } => vec![params],
            ScriptInput::Response { body, headers } => vec![body, headers],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutcome {
    /// No script, or a response script that returned nothing.
    Unchanged,
    Replaced(Value),
    /// A header or param script returned `null`/`undefined`/`()`.
    Blocked,
}

/// What a response script's non-empty result means.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseTransform {
    /// `{ body, headers }`: both replace the upstream's.
    Full {
        body: Value,
        headers: Map<String, Value>,
    },
    /// Anything else replaces only the body.
    BodyOnly(Value),
}

impl ResponseTransform {
    /// Whether `value` has the `{ body, headers }` shape.
    pub fn is_full(value: &Value) -> bool {
        value.as_object().is_some_and(|map| {
            map.contains_key("body") && map.get("headers").is_some_and(Value::is_object)
        })
    }

    pub fn from_value(value: Value) -> Self {
        if !Self::is_full(&value) {
            return ResponseTransform::BodyOnly(value);
        }
        match value {
            Value::Object(mut map) => {
                let body = map.remove("body").unwrap_or(Value::Null);
                let headers = match map.remove("headers") {
                    Some(Value::Object(headers)) => headers,
                    _ => Map::new(),
                };
                ResponseTransform::Full { body, headers }
            }
            other => ResponseTransform::BodyOnly(other),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ScriptError {
    #[error("{role} script exceeded its {limit_ms}ms time limit")]
    Timeout { role: ScriptRole, limit_ms: u64 },
    #[error("{role} script must define a function")]
    NotCallable { role: ScriptRole },
    #[error("{role} script failed to compile: {message}")]
    Compile { role: ScriptRole, message: String },
    #[error("{role} script threw: {message}")]
    Runtime { role: ScriptRole, message: String },
    #[error("{role} script exceeded a resource limit: {message}")]
    ResourceLimit { role: ScriptRole, message: String },
    #[error("{role} script returned an unusable value: {message}")]
    InvalidResult { role: ScriptRole, message: String },
    #[error("{role} script rejected: all {limit} javascript workers are busy")]
    Saturated { role: ScriptRole, limit: usize },
    #[error("script engine unavailable: {0}")]
    Unavailable(String),
    #[error("script worker failed: {0}")]
    Internal(String),
}

impl ScriptError {
    pub fn kind(&self) -> &'static str {
        match self {
            ScriptError::Timeout { .. } => "timeout",
            ScriptError::NotCallable { .. } => "not_callable",
            ScriptError::Compile { .. } => "compile",
            ScriptError::Runtime { .. } => "runtime",
            ScriptError::ResourceLimit { .. } => "resource_limit",
            ScriptError::InvalidResult { .. } => "invalid_result",
            ScriptError::Saturated { .. } => "saturated",
            ScriptError::Unavailable(_) => "unavailable",
            ScriptError::Internal(_) => "internal",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ScriptError::Timeout { .. })
    }
}

/// Resource limits applied to every invocation.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout: Duration,
    /// Rhai operation budget, 0 for unlimited (the deadline still applies).
    pub max_operations: u64,
    pub max_call_depth: usize,
    pub max_string_size: usize,
    pub max_collection_size: usize,
    /// Boa loop iteration budget. Stops a runaway JavaScript worker after its deadline.
    pub loop_iteration_limit: u64,
    pub max_js_workers: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from(&ScriptingConfig::default())
    }
}

impl From<&ScriptingConfig> for SandboxLimits {
    fn from(config: &ScriptingConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            max_operations: config.max_operations,
            max_call_depth: config.max_call_depth,
            max_string_size: config.max_string_size,
            max_collection_size: config.max_collection_size,
            loop_iteration_limit: config.loop_iteration_limit,
            max_js_workers: config.max_js_workers,
        }
    }
}

/// Everything an engine needs for one call. Owned so it can move to a blocking worker.
pub(crate) struct Invocation {
    pub label: String,
    pub role: ScriptRole,
    pub source: String,
    pub args: Vec<Value>,
    pub context: SharedContext,
    pub limits: SandboxLimits,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl ConsoleLevel {
    pub const METHODS: [(&'static str, ConsoleLevel); 5] = [
        ("log", ConsoleLevel::Log),
        ("info", ConsoleLevel::Info),
        ("warn", ConsoleLevel::Warn),
        ("error", ConsoleLevel::Error),
        ("debug", ConsoleLevel::Debug),
    ];
}

pub(crate) fn console_emit(level: ConsoleLevel, label: &str, role: ScriptRole, message: &str) {
    match level {
        ConsoleLevel::Log | ConsoleLevel::Info => {
            info!(target: SCRIPT_LOG_TARGET, rule = label, role = %role, "{message}")
        }
        ConsoleLevel::Warn => {
            warn!(target: SCRIPT_LOG_TARGET, rule = label, role = %role, "{message}")
        }
        ConsoleLevel::Error => {
            error!(target: SCRIPT_LOG_TARGET, rule = label, role = %role, "{message}")
        }
        ConsoleLevel::Debug => {
            debug!(target: SCRIPT_LOG_TARGET, rule = label, role = %role, "{message}")
        }
    }
}

pub(crate) fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Runs transform scripts with the configured engine and limits.
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    default_language: ScriptLanguage,
    limits: SandboxLimits,
    /// One permit per live JavaScript worker, held until the worker returns.
    js_workers: Arc<Semaphore>,
}

impl ScriptSandbox {
    pub fn new(default_language: ScriptLanguage, limits: SandboxLimits) -> Self {
        Self {
            default_language,
            limits,
            js_workers: Arc::new(Semaphore::new(limits.max_js_workers.max(1))),
        }
    }

    pub fn from_config(config: &ScriptingConfig) -> anyhow::Result<Self> {
        let language = ScriptLanguage::from_name(&config.engine)
            .ok_or_else(|| anyhow::anyhow!("Unknown script engine type: '{}'", config.engine))?;
        if !language.is_available() {
            anyhow::bail!("{language} engine specified but the '{language}' feature is not enabled");
        }
        Ok(Self::new(language, SandboxLimits::from(config)))
    }

    pub fn default_language(&self) -> ScriptLanguage {
        self.default_language
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn language_for(&self, rule: &ForwardRule) -> Result<ScriptLanguage, ScriptError> {
        ScriptLanguage::for_rule(rule, self.default_language)
    }

    /// Run the rule's script for the input's role. Missing scripts are a no-op.
    pub async fn run_for_rule(
        &self,
        rule: &ForwardRule,
        input: ScriptInput,
        context: &SharedContext,
    ) -> Result<ScriptOutcome, ScriptError> {
        let Some(source) = rule.script_for(input.role()) else {
            return Ok(ScriptOutcome::Unchanged);
        };
        let language = self.language_for(rule)?;
        self.run(language, &rule.slug, source, input, context).await
    }

    pub async fn run(
        &self,
        language: ScriptLanguage,
        label: &str,
        source: &str,
        input: ScriptInput,
        context: &SharedContext,
    ) -> Result<ScriptOutcome, ScriptError> {
        let role = input.role();
        if source.trim().is_empty() {
            return Ok(ScriptOutcome::Unchanged);
        }

        let limits = self.limits;
        let invocation = Invocation {
            label: label.to_string(),
            role,
            source: source.to_string(),
            args: input.into_args(),
            context: context.clone(),
            limits,
        };

        let permit = match language {
            ScriptLanguage::JavaScript => match Arc::clone(&self.js_workers).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(rule = label, role = %role, "No JavaScript worker available");
                    metrics::record_script_execution(role.as_str(), "saturated", Duration::ZERO);
                    return Err(ScriptError::Saturated {
                        role,
                        limit: limits.max_js_workers,
                    });
                }
            },
            ScriptLanguage::Rhai => None,
        };

        let started = Instant::now();
        let worker = tokio::task::spawn_blocking(move || {
            let result = execute(language, &invocation);
            drop(permit);
            result
        });
        let result = match tokio::time::timeout(limits.timeout + DEADLINE_GRACE, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ScriptError::Internal(join_error.to_string())),
            Err(_) => Err(ScriptError::Timeout {
                role,
                limit_ms: limits.timeout.as_millis() as u64,
            }),
        };

        let result_label = match &result {
            Ok(Some(_)) => "value",
            Ok(None) => "empty",
            Err(e) => e.kind(),
        };
        metrics::record_script_execution(role.as_str(), result_label, started.elapsed());

        Ok(match (role, result?) {
            (_, Some(value)) => ScriptOutcome::Replaced(value),
            (ScriptRole::Response, None) => ScriptOutcome::Unchanged,
            (_, None) => ScriptOutcome::Blocked,
        })
    }
}

fn execute(language: ScriptLanguage, invocation: &Invocation) -> Result<Option<Value>, ScriptError> {
    match language {
        ScriptLanguage::Rhai => rhai_engine::invoke(invocation),
        #[cfg(feature = "javascript")]
        ScriptLanguage::JavaScript => js_engine::invoke(invocation),
        #[cfg(not(feature = "javascript"))]
        ScriptLanguage::JavaScript => Err(ScriptError::Unavailable(
            "JavaScript engine is not enabled. Enable the 'javascript' feature flag".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::test_rule;
    use serde_json::json;

    fn sandbox() -> ScriptSandbox {
        ScriptSandbox::new(ScriptLanguage::Rhai, SandboxLimits::default())
    }

    fn header_input() -> ScriptInput {
        ScriptInput::Header {
            headers: json!({"accept": "application/json", "x-api-key": "k-123"}),
        }
    }

    // ============================================
    // Value types
    // ============================================

    #[test]
    fn test_language_from_name() {
        assert_eq!(ScriptLanguage::from_name("rhai"), Some(ScriptLanguage::Rhai));
        assert_eq!(ScriptLanguage::from_name(" JS "), Some(ScriptLanguage::JavaScript));
        assert_eq!(
            ScriptLanguage::from_name("javascript"),
            Some(ScriptLanguage::JavaScript)
        );
        assert_eq!(ScriptLanguage::from_name("lua"), None);
    }

    #[test]
    fn test_language_for_rule_override() {
        let mut rule = test_rule(1, "a", "http://a.example");
        assert_eq!(
            ScriptLanguage::for_rule(&rule, ScriptLanguage::JavaScript).unwrap(),
            ScriptLanguage::JavaScript
        );
        rule.script_engine = Some("rhai".to_string());
        assert_eq!(
            ScriptLanguage::for_rule(&rule, ScriptLanguage::JavaScript).unwrap(),
            ScriptLanguage::Rhai
        );
        rule.script_engine = Some("python".to_string());
        assert!(matches!(
            ScriptLanguage::for_rule(&rule, ScriptLanguage::Rhai),
            Err(ScriptError::Unavailable(_))
        ));
    }

    #[test]
    fn test_shared_context_clones_share_state() {
        let ctx = SharedContext::new();
        let other = ctx.clone();
        other.set_value("apiKey", json!("k-1"));
        assert_eq!(ctx.get_value("apiKey"), Some(json!("k-1")));
        assert!(ctx.contains("apiKey"));
        assert_eq!(ctx.remove("apiKey"), Some(json!("k-1")));
        assert!(other.is_empty());
    }

    #[test]
    fn test_response_transform_full() {
        let transform = ResponseTransform::from_value(json!({
            "body": {"ok": true},
            "headers": {"x-new": "1"}
        }));
        assert_eq!(
            transform,
            ResponseTransform::Full {
                body: json!({"ok": true}),
                headers: json!({"x-new": "1"}).as_object().unwrap().clone(),
            }
        );
    }

    #[test]
    fn test_response_transform_body_only() {
        let cases = [
            json!("plain text"),
            json!({"body": "x"}),
            json!({"body": "x", "headers": "not-an-object"}),
            json!([1, 2, 3]),
        ];
        for value in cases {
            assert!(!ResponseTransform::is_full(&value));
            assert_eq!(
                ResponseTransform::from_value(value.clone()),
                ResponseTransform::BodyOnly(value)
            );
        }
    }

    #[test]
    fn test_error_kinds() {
        let role = ScriptRole::Header;
        assert_eq!(ScriptError::Timeout { role, limit_ms: 100 }.kind(), "timeout");
        assert!(ScriptError::Timeout { role, limit_ms: 100 }.is_timeout());
        assert_eq!(ScriptError::NotCallable { role }.kind(), "not_callable");
        assert_eq!(
            ScriptError::NotCallable { role }.to_string(),
            "header script must define a function"
        );
    }

    // ============================================
    // Sandbox runs (Rhai)
    // ============================================

    #[tokio::test]
    async fn test_blank_source_is_unchanged() {
        let ctx = SharedContext::new();
        for source in ["", "   \n\t"] {
            let outcome = sandbox()
                .run(ScriptLanguage::Rhai, "t", source, header_input(), &ctx)
                .await
                .unwrap();
            assert_eq!(outcome, ScriptOutcome::Unchanged);
        }
    }

    #[tokio::test]
    async fn test_rule_without_script_is_unchanged() {
        let rule = test_rule(1, "a", "http://a.example");
        let outcome = sandbox()
            .run_for_rule(&rule, header_input(), &SharedContext::new())
            .await
            .unwrap();
        assert_eq!(outcome, ScriptOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_header_script_modifies_headers() {
        let source = r#"|headers, ctx| { headers["x-added"] = "yes"; headers }"#;
        let outcome = sandbox()
            .run(ScriptLanguage::Rhai, "t", source, header_input(), &SharedContext::new())
            .await
            .unwrap();
        let ScriptOutcome::Replaced(headers) = outcome else {
            panic!("expected replaced headers, got {outcome:?}");
        };
        assert_eq!(headers["x-added"], "yes");
        assert_eq!(headers["x-api-key"], "k-123");
    }

    #[tokio::test]
    async fn test_header_script_unit_blocks() {
        let outcome = sandbox()
            .run(
                ScriptLanguage::Rhai,
                "t",
                "|headers, ctx| ()",
                header_input(),
                &SharedContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ScriptOutcome::Blocked);
    }

    #[tokio::test]
    async fn test_response_script_unit_is_unchanged() {
        let input = ScriptInput::Response {
            body: json!({"a": 1}),
            headers: json!({}),
        };
        let outcome = sandbox()
            .run(
                ScriptLanguage::Rhai,
                "t",
                "|body, headers, ctx| ()",
                input,
                &SharedContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ScriptOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_script_throw_is_runtime_error() {
        let err = sandbox()
            .run(
                ScriptLanguage::Rhai,
                "t",
                r#"|headers, ctx| { throw "missing api key"; }"#,
                header_input(),
                &SharedContext::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { .. }), "{err:?}");
        assert!(err.to_string().contains("missing api key"));
    }

    #[tokio::test]
    async fn test_script_must_be_callable() {
        let err = sandbox()
            .run(
                ScriptLanguage::Rhai,
                "t",
                "let x = 1; x + 1",
                header_input(),
                &SharedContext::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::NotCallable { .. }));
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let limits = SandboxLimits {
            timeout: Duration::from_millis(50),
            ..SandboxLimits::default()
        };
        let sandbox = ScriptSandbox::new(ScriptLanguage::Rhai, limits);
        let started = Instant::now();
        let err = sandbox
            .run(
                ScriptLanguage::Rhai,
                "t",
                "|headers, ctx| { let n = 0; loop { n += 1; } }",
                header_input(),
                &SharedContext::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(feature = "javascript")]
    #[tokio::test]
    async fn test_javascript_workers_past_deadline_are_bounded() {
        let limits = SandboxLimits {
            timeout: Duration::from_millis(20),
            max_js_workers: 1,
            ..SandboxLimits::default()
        };
        let sandbox = ScriptSandbox::new(ScriptLanguage::JavaScript, limits);
        let ctx = SharedContext::new();
        // Nested loops stay under the per-loop budget but outlive the deadline.
        let slow = "(headers, ctx) => { let n = 0; for (let j = 0; j < 100; j++) { for (let i = 0; i < 50000; i++) { n++; } } return headers; }";
        let quick = "(headers, ctx) => headers";

        let err = sandbox
            .run(ScriptLanguage::JavaScript, "t", slow, header_input(), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err:?}");

        // The abandoned worker still holds the only slot.
        let err = sandbox
            .run(ScriptLanguage::JavaScript, "t", quick, header_input(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Saturated { limit: 1, .. }), "{err:?}");
        assert_eq!(err.kind(), "saturated");

        // Rhai stops itself and is not counted.
        let outcome = sandbox
            .run(ScriptLanguage::Rhai, "t", "|headers, ctx| headers", header_input(), &ctx)
            .await
            .unwrap();
        assert!(matches!(outcome, ScriptOutcome::Replaced(_)));

        // The slot comes back once the worker returns.
        let waited = Instant::now();
        loop {
            match sandbox
                .run(ScriptLanguage::JavaScript, "t", quick, header_input(), &ctx)
                .await
            {
                Ok(outcome) => {
                    assert!(matches!(outcome, ScriptOutcome::Replaced(_)));
                    break;
                }
                Err(ScriptError::Saturated { .. }) => {
                    assert!(waited.elapsed() < Duration::from_secs(120), "worker never returned");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_shared_context_flows_between_roles() {
        let ctx = SharedContext::new();
        let sandbox = sandbox();

        sandbox
            .run(
                ScriptLanguage::Rhai,
                "t",
                r#"|headers, ctx| { ctx["apiKey"] = headers["x-api-key"]; headers }"#,
                header_input(),
                &ctx,
            )
            .await
            .unwrap();

        let outcome = sandbox
            .run(
                ScriptLanguage::Rhai,
                "t",
                r#"|params, ctx| { params["key"] = ctx["apiKey"]; params }"#,
                ScriptInput::Param {
                    params: json!({"q": "rust"}),
                },
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ScriptOutcome::Replaced(json!({"q": "rust", "key": "k-123"}))
        );
    }

    #[tokio::test]
    async fn test_run_for_rule_uses_rule_engine_override() {
        let mut rule = test_rule(1, "a", "http://a.example");
        rule.script_engine = Some("rhai".to_string());
        rule.param_script = Some("|params, ctx| #{ fixed: true }".to_string());
        let sandbox = ScriptSandbox::new(ScriptLanguage::JavaScript, SandboxLimits::default());

        let outcome = sandbox
            .run_for_rule(
                &rule,
                ScriptInput::Param { params: json!({}) },
                &SharedContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ScriptOutcome::Replaced(json!({"fixed": true})));
    }

    #[test]
    fn test_from_config_rejects_unknown_engine() {
        let config = ScriptingConfig {
            engine: "lua".to_string(),
            ..ScriptingConfig::default()
        };
        assert!(ScriptSandbox::from_config(&config).is_err());
    }
}
