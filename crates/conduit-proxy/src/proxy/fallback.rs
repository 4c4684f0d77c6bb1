//! What happens to requests the forwarding engine does not own.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;

use super::forwarding::json_response;

/// Receives every request under the API prefix and every path no rule matched.
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn handle(&self, req: Request<Bytes>) -> Response<Full<Bytes>>;
}

/// Built-in fallback: a health probe under the API prefix, 404 for everything else.
#[derive(Debug, Clone)]
pub struct NotFoundFallback {
    health_path: String,
}

impl NotFoundFallback {
    pub fn new(api_prefix: &str) -> Self {
        Self {
            health_path: format!("{}/health", api_prefix.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl Fallback for NotFoundFallback {
    async fn handle(&self, req: Request<Bytes>) -> Response<Full<Bytes>> {
        if req.method() == Method::GET && req.uri().path() == self.health_path {
            return json_response(StatusCode::OK, &json!({ "status": "ok" }));
        }
        json_response(StatusCode::NOT_FOUND, &json!({ "error": "Not found" }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn request(method: Method, path: &str) -> Request<Bytes> {
        let mut req = Request::new(Bytes::new());
        *req.method_mut() = method;
        *req.uri_mut() = path.parse().unwrap();
        req
    }

    #[tokio::test]
    async fn test_health() {
        let fallback = NotFoundFallback::new("/api/");
        let response = fallback.handle(request(Method::GET, "/api/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_everything_else_is_404() {
        let fallback = NotFoundFallback::new("/api");
        for (method, path) in [
            (Method::POST, "/api/health"),
            (Method::GET, "/api/rules"),
            (Method::GET, "/unknown"),
        ] {
            let response = fallback.handle(request(method, path)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }
    }
}
