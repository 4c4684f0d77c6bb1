use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::header::HeaderName;
use hyper::{HeaderMap, Method, Request, Uri};

use crate::config::Config;
use crate::proxy::client::{create_http_client, HttpClient};
use crate::routing::RouteResolver;
use crate::rules::RuleStore;
use crate::scripting::ScriptSandbox;
use crate::trace::TraceLimits;

/// An inbound request with its body already read.
#[derive(Debug, Clone)]
pub struct BufferedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BufferedRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    pub fn from_parts(parts: hyper::http::request::Parts, body: Bytes) -> Self {
        Self::new(parts.method, parts.uri, parts.headers, body)
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Back to a plain request, for handing on to a fallback.
    pub fn into_request(self) -> Request<Bytes> {
        let mut req = Request::new(self.body);
        *req.method_mut() = self.method;
        *req.uri_mut() = self.uri;
        *req.headers_mut() = self.headers;
        req
    }
}

/// Trace emission settings resolved from config.
#[derive(Debug, Clone)]
pub struct TraceSettings {
    /// `None` disables the trace header.
    pub header: Option<HeaderName>,
    pub limits: TraceLimits,
}

/// Long-lived state shared by every request the pipeline handles.
#[derive(Clone)]
pub struct ForwardContext {
    pub resolver: RouteResolver,
    pub sandbox: ScriptSandbox,
    pub client: HttpClient,
    pub upstream_timeout: Duration,
    pub trace: TraceSettings,
}

impl ForwardContext {
    pub fn from_config(config: &Config, store: Arc<dyn RuleStore>) -> anyhow::Result<Self> {
        let header = if config.trace.enabled {
            Some(HeaderName::try_from(config.trace.header.as_str()).map_err(|e| {
                anyhow::anyhow!("invalid trace header '{}': {e}", config.trace.header)
            })?)
        } else {
            None
        };

        Ok(Self {
            resolver: RouteResolver::new(store),
            sandbox: ScriptSandbox::from_config(&config.scripting)?,
            client: create_http_client(&config.upstream)?,
            upstream_timeout: config.upstream.timeout(),
            trace: TraceSettings {
                header,
                limits: TraceLimits::from(&config.trace),
            },
        })
    }
}
