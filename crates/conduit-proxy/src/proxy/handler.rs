//! The forwarding pipeline.
//!
//! One request runs these stages in order, each leaving one trace entry:
//!
//! ```text
//! req-received -> config-lookup -> method-validation -> header-validation ->
//! param-validation -> req-sent -> resp-received -> resp-manipulation -> resp-sent
//! ```
//!
//! A failing stage is recorded as an error, followed by an `error` entry, and the
//! request ends with the status of its [`ForwardError`]. A path no rule matches is
//! handed back untouched so the server can pass it to its fallback.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use hyper::Response;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::context::{BufferedRequest, ForwardContext};
use super::forwarding::{dispatch, error_response};
use super::headers::{
    headers_to_json, json_to_headers, sanitize_request_headers, strip_response_headers,
    ConduitHeadersExt, CONTENT_TYPE_JSON,
};
use super::params::{body_to_json, json_to_body, json_to_query, query_to_json};
use crate::error::ForwardError;
use crate::metrics;
use crate::routing::MatchResult;
use crate::rules::ParamChannel;
use crate::scripting::{
    ResponseTransform, ScriptError, ScriptInput, ScriptOutcome, ScriptRole, SharedContext,
};
use crate::trace::{Stage, StageStatus, TraceLog};

pub enum ForwardOutcome {
    Response(Response<Full<Bytes>>),
    /// No rule matched; the request is returned unchanged.
    NotForwarded(BufferedRequest),
}

impl std::fmt::Debug for ForwardOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardOutcome::Response(r) => write!(f, "Response({})", r.status()),
            ForwardOutcome::NotForwarded(req) => write!(f, "NotForwarded({})", req.path()),
        }
    }
}

pub async fn handle_forward(ctx: &ForwardContext, req: BufferedRequest) -> ForwardOutcome {
    let started = Instant::now();
    let mut trace = TraceLog::new(ctx.trace.limits);

    let body_snapshot = trace.body_snapshot(&req.body);
    trace.record(
        Stage::ReqReceived,
        StageStatus::Success,
        Duration::ZERO,
        json!({
            "method": req.method.as_str(),
            "path": req.path(),
            "query": req.query(),
            "headers": headers_to_json(&req.headers),
            "body": body_snapshot,
        }),
    );

    let lookup_started = Instant::now();
    let matched = match ctx.resolver.resolve(req.path()).await {
        Ok(Some(matched)) => matched,
        Ok(None) => {
            debug!(path = %req.path(), "No forward rule matched");
            metrics::record_fallthrough("no_rule");
            return ForwardOutcome::NotForwarded(req);
        }
        Err(e) => {
            trace.record(
                Stage::ConfigLookup,
                StageStatus::Error,
                lookup_started.elapsed(),
                json!({ "error": e.to_string() }),
            );
            let err = ForwardError::from(e);
            let mut response = failure_response(&mut trace, Stage::ConfigLookup, &err);
            attach_trace(ctx, &trace, &mut response);
            metrics::record_request_duration("failed", started.elapsed());
            return ForwardOutcome::Response(response);
        }
    };
    trace.record(
        Stage::ConfigLookup,
        StageStatus::Success,
        lookup_started.elapsed(),
        matched.trace_data(),
    );

    let rule_id = matched.rule.id;
    let slug = matched.rule.slug.clone();
    let mut pipeline = Pipeline {
        ctx,
        matched,
        shared: SharedContext::new(),
        trace,
    };

    let (mut response, outcome) = match pipeline.run(req).await {
        Ok(response) => (response, "forwarded"),
        Err((stage, err)) => {
            let outcome = if err.status().is_client_error() {
                "rejected"
            } else {
                "failed"
            };
            (failure_response(&mut pipeline.trace, stage, &err), outcome)
        }
    };
    attach_trace(ctx, &pipeline.trace, &mut response);

    let status = response.status().as_u16();
    let elapsed = started.elapsed();
    metrics::record_forward(&slug, status);
    metrics::record_request_duration(outcome, elapsed);
    info!(
        rule_id,
        slug = %slug,
        status,
        duration_ms = elapsed.as_millis() as u64,
        "Forward complete"
    );

    ForwardOutcome::Response(response)
}

type StageResult<T> = Result<T, (Stage, ForwardError)>;

struct Pipeline<'a> {
    ctx: &'a ForwardContext,
    matched: MatchResult,
    shared: SharedContext,
    trace: TraceLog,
}

impl Pipeline<'_> {
    async fn run(&mut self, req: BufferedRequest) -> StageResult<Response<Full<Bytes>>> {
        let BufferedRequest {
            method,
            uri,
            headers,
            mut body,
        } = req;

        let checked = Instant::now();
        if !self.matched.rule.accepts(&method) {
            let expected = self.matched.rule.method.clone();
            self.trace.record(
                Stage::MethodValidation,
                StageStatus::Error,
                checked.elapsed(),
                json!({ "expected": expected, "actual": method.as_str() }),
            );
            return Err((
                Stage::MethodValidation,
                ForwardError::MethodMismatch {
                    expected,
                    actual: method.to_string(),
                },
            ));
        }
        self.trace.record(
            Stage::MethodValidation,
            StageStatus::Success,
            checked.elapsed(),
            json!({ "method": method.as_str() }),
        );

        let mut headers = sanitize_request_headers(&headers);

        let input = ScriptInput::Header {
            headers: headers_to_json(&headers),
        };
        if let Some(Value::Object(replaced)) = self
            .script_stage(Stage::HeaderValidation, input)
            .await
            .map_err(|e| (Stage::HeaderValidation, e))?
        {
            headers = json_to_headers(&replaced);
        }

        let channel = self.matched.rule.params_channel();
        let mut query = uri.query().map(str::to_string);
        let params = match channel {
            ParamChannel::Query => query_to_json(uri.query()),
            ParamChannel::Body => body_to_json(&headers, &body),
        };
        let input = ScriptInput::Param {
            params: params.clone(),
        };
        let replaced = self
            .script_stage(Stage::ParamValidation, input)
            .await
            .map_err(|e| (Stage::ParamValidation, e))?;
        // A script that hands its input back keeps the original bytes.
        if let Some(value) = replaced.filter(|value| *value != params) {
            match channel {
                ParamChannel::Query => query = Some(json_to_query(&value)),
                ParamChannel::Body => {
                    let (encoded, content_type) = json_to_body(&headers, &value);
                    body = encoded;
                    if let Some(content_type) = content_type {
                        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                    }
                }
            }
        }

        let url = match self.matched.upstream_url(query.as_deref()) {
            Ok(url) => url,
            Err(e) => {
                self.trace.record(
                    Stage::ReqSent,
                    StageStatus::Error,
                    Duration::ZERO,
                    json!({ "error": e.to_string() }),
                );
                return Err((Stage::ReqSent, e.into()));
            }
        };

        // The client frames the body itself.
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);

        let body_snapshot = self.trace.body_snapshot(&body);
        self.trace.record(
            Stage::ReqSent,
            StageStatus::Pending,
            Duration::ZERO,
            json!({
                "method": method.as_str(),
                "url": url.to_string(),
                "headers": headers_to_json(&headers),
                "body": body_snapshot,
            }),
        );

        let slug = self.matched.rule.slug.as_str();
        let sent = Instant::now();
        let result = dispatch(
            &self.ctx.client,
            method,
            url,
            headers,
            body,
            self.ctx.upstream_timeout,
        )
        .await;
        let elapsed = sent.elapsed();

        let (mut parts, upstream_body) = match result {
            Ok(exchange) => exchange,
            Err(e) => {
                metrics::record_upstream_duration(slug, "error", elapsed);
                self.trace.finalize(
                    Stage::ReqSent,
                    StageStatus::Error,
                    elapsed,
                    json!({ "error": e.to_string() }),
                );
                return Err((Stage::ReqSent, e.into()));
            }
        };
        metrics::record_upstream_duration(slug, parts.status.as_str(), elapsed);
        self.trace.finalize(
            Stage::ReqSent,
            StageStatus::Success,
            elapsed,
            json!({ "status": parts.status.as_u16() }),
        );

        let body_snapshot = self.trace.body_snapshot(&upstream_body);
        self.trace.record(
            Stage::RespReceived,
            StageStatus::Success,
            Duration::ZERO,
            json!({
                "status": parts.status.as_u16(),
                "headers": headers_to_json(&parts.headers),
                "body": body_snapshot,
            }),
        );

        let has_script = self.matched.rule.script_for(ScriptRole::Response).is_some();
        let original = if has_script {
            response_body_value(&upstream_body)
        } else {
            Value::Null
        };
        let input = ScriptInput::Response {
            body: original.clone(),
            headers: headers_to_json(&parts.headers),
        };
        let replaced = self
            .script_stage(Stage::RespManipulation, input)
            .await
            .map_err(|e| (Stage::RespManipulation, e))?;

        let mut body = upstream_body;
        let mut body_changed = false;
        if let Some(value) = replaced {
            let new_body = match ResponseTransform::from_value(value) {
                ResponseTransform::Full { body, headers } => {
                    parts.headers = json_to_headers(&headers);
                    body
                }
                ResponseTransform::BodyOnly(body) => {
                    warn!(
                        rule_id = self.matched.rule.id,
                        "Response script returned neither {{ body, headers }} nor null; replacing the body only"
                    );
                    body
                }
            };
            if new_body != original {
                body = encode_response_body(&new_body, &mut parts.headers);
                body_changed = true;
            }
        }

        let finishing = Instant::now();
        strip_response_headers(&mut parts.headers, body_changed);

        let body_snapshot = self.trace.body_snapshot(&body);
        self.trace.record(
            Stage::RespSent,
            StageStatus::Success,
            finishing.elapsed(),
            json!({
                "status": parts.status.as_u16(),
                "headers": headers_to_json(&parts.headers),
                "body": body_snapshot,
                "bodyChanged": body_changed,
            }),
        );

        Ok(Response::from_parts(parts, Full::new(body)))
    }

    /// Run the rule's script for `stage` and record its entry.
    ///
    /// `Ok(None)` means no script or no change. Blocking results and errors come
    /// back as [`ForwardError`]s.
    async fn script_stage(
        &mut self,
        stage: Stage,
        input: ScriptInput,
    ) -> Result<Option<Value>, ForwardError> {
        let role = input.role();
        let rule = &self.matched.rule;
        if rule.script_for(role).is_none() {
            self.trace.record(
                stage,
                StageStatus::Skipped,
                Duration::ZERO,
                json!({ "reason": "no script" }),
            );
            return Ok(None);
        }

        let started = Instant::now();
        let result = match self.ctx.sandbox.run_for_rule(rule, input, &self.shared).await {
            Ok(ScriptOutcome::Blocked) => Err(ForwardError::Blocked { role }),
            Ok(ScriptOutcome::Replaced(value))
                if role == ScriptRole::Header && !value.is_object() =>
            {
                Err(ScriptError::InvalidResult {
                    role,
                    message: format!("expected a header object, got {}", json_type(&value)),
                }
                .into())
            }
            Ok(ScriptOutcome::Replaced(value)) => Ok(Some(value)),
            Ok(ScriptOutcome::Unchanged) => Ok(None),
            Err(e) => Err(e.into()),
        };
        let elapsed = started.elapsed();

        let context = Value::Object(self.shared.snapshot());
        let (status, data) = match &result {
            Ok(Some(value)) if role != ScriptRole::Response => (
                StageStatus::Success,
                json!({ "result": "value", "output": value, "context": context }),
            ),
            Ok(Some(value)) if ResponseTransform::is_full(value) => (
                StageStatus::Success,
                json!({ "result": "value", "context": context }),
            ),
            Ok(Some(_)) => (
                StageStatus::Success,
                json!({ "result": "value", "warning": "body-only result", "context": context }),
            ),
            Ok(None) => (
                StageStatus::Success,
                json!({ "result": "unchanged", "context": context }),
            ),
            Err(ForwardError::Blocked { .. }) => (
                StageStatus::Error,
                json!({ "result": "blocked", "context": context }),
            ),
            Err(e) => (
                StageStatus::Error,
                json!({ "result": "error", "kind": e.kind(), "error": e.to_string(), "context": context }),
            ),
        };
        self.trace.record(stage, status, elapsed, data);
        result
    }
}

/// Record the `error` entry and build the client response.
fn failure_response(trace: &mut TraceLog, stage: Stage, err: &ForwardError) -> Response<Full<Bytes>> {
    let status = err.status();
    if status.is_server_error() {
        warn!(stage = %stage, kind = err.kind(), status = status.as_u16(), "Forward failed: {err}");
    } else {
        info!(stage = %stage, kind = err.kind(), status = status.as_u16(), "Forward rejected: {err}");
    }
    metrics::record_stage_failure(stage.as_str(), err.kind());
    trace.record(
        Stage::Error,
        StageStatus::Error,
        Duration::ZERO,
        json!({
            "stage": stage.as_str(),
            "kind": err.kind(),
            "message": err.to_string(),
            "status": status.as_u16(),
        }),
    );
    error_response(err)
}

fn attach_trace(ctx: &ForwardContext, trace: &TraceLog, response: &mut Response<Full<Bytes>>) {
    let Some(name) = &ctx.trace.header else {
        return;
    };
    if let Some(encoded) = trace.serialize() {
        if !response.set_header_value(name, &encoded) {
            warn!("Trace is not a valid header value, omitting");
        }
    }
}

/// Upstream body as the response script sees it: parsed JSON, else text, else `null`.
fn response_body_value(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or_else(|_| match std::str::from_utf8(body) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::Null,
    })
}

/// Strings go out verbatim; anything else is JSON.
fn encode_response_body(value: &Value, headers: &mut HeaderMap) -> Bytes {
    match value {
        Value::String(text) => Bytes::from(text.clone()),
        other => {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, CONTENT_TYPE_JSON.clone());
            }
            Bytes::from(other.to_string())
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
