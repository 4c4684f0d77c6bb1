//! Connection handling and request dispatch between forwarding and the fallback.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::context::{BufferedRequest, ForwardContext};
use super::fallback::{Fallback, NotFoundFallback};
use super::forwarding::json_response;
use super::handler::{handle_forward, ForwardOutcome};
use crate::config::{Config, ListenConfig};
use crate::metrics;
use crate::rules::RuleStore;

pub struct ConduitServer {
    forward: ForwardContext,
    fallback: Arc<dyn Fallback>,
    api_prefix: String,
    listen: ListenConfig,
}

impl ConduitServer {
    pub fn new(config: &Config, store: Arc<dyn RuleStore>) -> anyhow::Result<Self> {
        let api_prefix = config.api_prefix().to_string();
        Ok(Self {
            forward: ForwardContext::from_config(config, store)?,
            fallback: Arc::new(NotFoundFallback::new(&api_prefix)),
            api_prefix,
            listen: config.listen.clone(),
        })
    }

    /// Replace the built-in 404 fallback.
    pub fn with_fallback(mut self, fallback: Arc<dyn Fallback>) -> Self {
        self.fallback = fallback;
        self
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.listen.socket_addr()?;
        TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}"))
    }

    /// Serve connections from `listener` until `shutdown` resolves.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            addr = %listener.local_addr()?,
            api_prefix = %self.api_prefix,
            "Conduit listening"
        );

        let server = Arc::new(self);
        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    return Ok(());
                }
            };

            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection from {}: {}", remote_addr, err);
                }
            });
        }
    }

    /// Handle one request: buffer the body, then forward or fall back.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.listen.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                debug!(limit = self.listen.max_body_bytes, "Request body too large");
                return boxed(json_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    &json!({ "error": "Request body too large" }),
                ));
            }
            Err(e) => {
                debug!("Failed to read request body: {e}");
                return boxed(json_response(
                    StatusCode::BAD_REQUEST,
                    &json!({ "error": "Failed to read request body" }),
                ));
            }
        };
        let req = BufferedRequest::from_parts(parts, body);

        if self.is_api_path(req.path()) {
            metrics::record_fallthrough("api_prefix");
            return boxed(self.fallback.handle(req.into_request()).await);
        }

        match handle_forward(&self.forward, req).await {
            ForwardOutcome::Response(response) => boxed(response),
            ForwardOutcome::NotForwarded(req) => boxed(self.fallback.handle(req.into_request()).await),
        }
    }

    fn is_api_path(&self, path: &str) -> bool {
        path.strip_prefix(self.api_prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
}

fn boxed(response: Response<Full<Bytes>>) -> Response<BoxBody<Bytes, hyper::Error>> {
    response.map(|body| body.map_err(|never: Infallible| match never {}).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{test_rule, InMemoryRuleStore};

    fn server(max_body_bytes: usize) -> ConduitServer {
        let mut config = Config::default();
        config.scripting.engine = "rhai".to_string();
        config.listen.max_body_bytes = max_body_bytes;
        let mut rule = test_rule(1, "api-rule", "http://127.0.0.1:9");
        rule.method = "POST".to_string();
        let mut other = test_rule(2, "echo", "http://127.0.0.1:9");
        other.method = "POST".to_string();
        let store = Arc::new(InMemoryRuleStore::new(vec![rule, other]));
        ConduitServer::new(&config, store).unwrap()
    }

    fn request(method: &str, path: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    #[test]
    fn test_api_prefix_matching() {
        let server = server(1024);
        assert!(server.is_api_path("/api"));
        assert!(server.is_api_path("/api/health"));
        assert!(!server.is_api_path("/api-rule/x"));
        assert!(!server.is_api_path("/echo/api"));
    }

    #[tokio::test]
    async fn test_api_prefix_goes_to_fallback() {
        let response = server(1024).handle(request("GET", "/api/health", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-conduit-trace").is_none());
    }

    #[tokio::test]
    async fn test_unmatched_path_goes_to_fallback() {
        let response = server(1024).handle(request("GET", "/nothing/here", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("x-conduit-trace").is_none());
    }

    #[tokio::test]
    async fn test_matched_path_is_forwarded() {
        // GET against a POST rule: answered by the pipeline, not the fallback.
        let response = server(1024).handle(request("GET", "/echo", "")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(response.headers().get("x-conduit-trace").is_some());
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let response = server(4).handle(request("POST", "/echo", "too large")).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_custom_fallback() {
        struct Teapot;

        #[async_trait::async_trait]
        impl Fallback for Teapot {
            async fn handle(&self, _req: Request<Bytes>) -> Response<Full<Bytes>> {
                json_response(StatusCode::IM_A_TEAPOT, &json!({}))
            }
        }

        let server = server(1024).with_fallback(Arc::new(Teapot));
        let response = server.handle(request("GET", "/unknown", "")).await;
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }
}
