//! Per-request execution trace.
//!
//! Every pipeline stage records one entry: status, wall time and a payload snapshot.
//! The finished trace travels back to the caller as a base64 encoded JSON header.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::TraceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    ReqReceived,
    ConfigLookup,
    MethodValidation,
    HeaderValidation,
    ParamValidation,
    ReqSent,
    RespReceived,
    RespManipulation,
    RespSent,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ReqReceived => "req-received",
            Stage::ConfigLookup => "config-lookup",
            Stage::MethodValidation => "method-validation",
            Stage::HeaderValidation => "header-validation",
            Stage::ParamValidation => "param-validation",
            Stage::ReqSent => "req-sent",
            Stage::RespReceived => "resp-received",
            Stage::RespManipulation => "resp-manipulation",
            Stage::RespSent => "resp-sent",
            Stage::Error => "error",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Error,
    Skipped,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub status: StageStatus,
    pub duration_ms: f64,
    pub data: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct TraceLimits {
    pub max_body_bytes: usize,
    pub max_header_bytes: usize,
}

impl From<&TraceConfig> for TraceLimits {
    fn from(config: &TraceConfig) -> Self {
        Self {
            max_body_bytes: config.max_body_bytes,
            max_header_bytes: config.max_header_bytes,
        }
    }
}

impl Default for TraceLimits {
    fn default() -> Self {
        Self::from(&TraceConfig::default())
    }
}

/// Ordered stage log of one request. Each stage appears at most once.
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    entries: Vec<(Stage, TraceEntry)>,
    limits: TraceLimits,
}

impl TraceLog {
    pub fn new(limits: TraceLimits) -> Self {
        Self {
            entries: Vec::with_capacity(10),
            limits,
        }
    }

    /// Append an entry. A stage that is already present is left as it was.
    pub fn record(&mut self, stage: Stage, status: StageStatus, duration: Duration, data: Value) {
        if self.contains(stage) {
            tracing::debug!(stage = %stage, "Ignoring duplicate trace entry");
            return;
        }
        self.entries.push((
            stage,
            TraceEntry {
                status,
                duration_ms: duration_ms(duration),
                data,
            },
        ));
    }

    /// Settle a pending entry. `data` is merged into an object payload, or replaces it.
    pub fn finalize(&mut self, stage: Stage, status: StageStatus, duration: Duration, data: Value) {
        let Some((_, entry)) = self.entries.iter_mut().find(|(s, _)| *s == stage) else {
            self.record(stage, status, duration, data);
            return;
        };
        entry.status = status;
        entry.duration_ms = duration_ms(duration);
        match (&mut entry.data, data) {
            (Value::Object(existing), Value::Object(update)) => existing.extend(update),
            (slot, data) => *slot = data,
        }
    }

    pub fn get(&self, stage: Stage) -> Option<&TraceEntry> {
        self.entries
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, entry)| entry)
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.get(stage).is_some()
    }

    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.entries.iter().map(|(stage, _)| *stage)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Body snapshot bounded by `max_body_bytes`.
    pub fn body_snapshot(&self, body: &[u8]) -> Value {
        let limit = self.limits.max_body_bytes;
        let kept = &body[..body.len().min(limit)];
        json!({
            "encoding": "base64",
            "size": body.len(),
            "truncated": body.len() > limit,
            "data": STANDARD.encode(kept),
        })
    }

    /// Header-safe form: base64 of the compact JSON. Over budget the payloads are
    /// dropped; if even that does not fit, `None`.
    pub fn serialize(&self) -> Option<String> {
        let encoded = encode(self)?;
        if encoded.len() <= self.limits.max_header_bytes {
            return Some(encoded);
        }

        let stripped = TraceLog {
            entries: self
                .entries
                .iter()
                .map(|(stage, entry)| {
                    (
                        *stage,
                        TraceEntry {
                            data: json!({"truncated": true}),
                            ..entry.clone()
                        },
                    )
                })
                .collect(),
            limits: self.limits,
        };
        let encoded = encode(&stripped)?;
        if encoded.len() <= self.limits.max_header_bytes {
            Some(encoded)
        } else {
            tracing::warn!(
                size = encoded.len(),
                limit = self.limits.max_header_bytes,
                "Trace exceeds header budget, omitting"
            );
            None
        }
    }

    /// Decode a header value produced by [`TraceLog::serialize`].
    pub fn decode(header: &str) -> Option<Value> {
        let bytes = STANDARD.decode(header.trim()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

impl Serialize for TraceLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (stage, entry) in &self.entries {
            map.serialize_entry(stage.as_str(), entry)?;
        }
        map.end()
    }
}

fn encode(log: &TraceLog) -> Option<String> {
    match serde_json::to_vec(log) {
        Ok(json) => Some(STANDARD.encode(json)),
        Err(e) => {
            tracing::warn!("Failed to serialize trace: {e}");
            None
        }
    }
}

fn duration_ms(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1_000_000.0).round() / 1000.0
}
