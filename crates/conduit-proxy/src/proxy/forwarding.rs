//! Upstream dispatch and client-facing error responses.

use std::convert::Infallible;
use std::time::Duration;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, CONTENT_TYPE};
use hyper::http::response::Parts;
use hyper::{Method, Request, Response, StatusCode, Uri};
use serde_json::Value;
use tracing::{debug, error};

use super::client::HttpClient;
use super::headers::{ConduitHeadersExt, CONTENT_TYPE_JSON};
use crate::error::{ForwardError, UpstreamError};

/// JSON response with the given status.
pub fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.set_header(&CONTENT_TYPE, &CONTENT_TYPE_JSON);
    response
}

/// Client response for a pipeline failure. Carries no internal detail.
pub fn error_response(err: &ForwardError) -> Response<Full<Bytes>> {
    json_response(err.status(), &err.client_body())
}

/// Send one request upstream and buffer the whole response.
///
/// `timeout` bounds connect, send and the body read together. Every status is a
/// success here; the body is returned exactly as received.
pub async fn dispatch(
    client: &HttpClient,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    timeout: Duration,
) -> Result<(Parts, Bytes), UpstreamError> {
    debug!(method = %method, url = %uri, "Forwarding upstream");

    let mut req = Request::new(BoxBody::new(
        Full::new(body).map_err(|never: Infallible| match never {}),
    ));
    *req.method_mut() = method;
    *req.uri_mut() = uri;
    *req.headers_mut() = headers;

    let exchange = async {
        let response = client
            .request(req)
            .await
            .map_err(|e| UpstreamError::Request(format_client_error(&e)))?;
        let (parts, body) = response.into_parts();
        match body.collect().await {
            Ok(collected) => Ok((parts, collected.to_bytes())),
            Err(e) => Err(UpstreamError::Body {
                status: Some(parts.status),
                message: e.to_string(),
            }),
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => {
            if let Err(e) = &result {
                error!("Upstream request failed: {e}");
            }
            result
        }
        Err(_) => {
            error!(timeout_ms = timeout.as_millis() as u64, "Upstream request timed out");
            Err(UpstreamError::Timeout(timeout))
        }
    }
}

/// The legacy client wraps the interesting error; walk the source chain.
fn format_client_error(err: &hyper_util::client::legacy::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::proxy::client::create_http_client;
    use crate::scripting::{ScriptError, ScriptRole};

    #[test]
    fn test_error_response_is_sanitized_json() {
        let err: ForwardError = ScriptError::Runtime {
            role: ScriptRole::Response,
            message: "TypeError at line 3".into(),
        }
        .into();
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn test_dispatch_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = create_http_client(&UpstreamConfig::default()).unwrap();
        let err = dispatch(
            &client,
            Method::GET,
            format!("http://{addr}/").parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UpstreamError::Request(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_dispatch_times_out() {
        // Accepts but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = create_http_client(&UpstreamConfig::default()).unwrap();
        let err = dispatch(
            &client,
            Method::GET,
            format!("http://{addr}/slow").parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout(_)));
        hold.abort();
    }
}
