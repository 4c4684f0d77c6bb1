//! Prometheus metrics for the forwarding engine.
//!
//! Tracks forwards per rule, fall-throughs, stage failures, script execution and
//! upstream latency.
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{debug, info};

lazy_static! {
    /// Requests that matched a rule, by final status
    pub static ref FORWARDS_TOTAL: CounterVec = register_counter_vec!(
        "conduit_forwards_total",
        "Total number of requests handled by a forward rule",
        &["rule", "status"]
    )
    .unwrap();

    /// Requests handed to the fallback
    pub static ref FALLTHROUGH_TOTAL: CounterVec = register_counter_vec!(
        "conduit_fallthrough_total",
        "Total number of requests passed to the fallback handler",
        &["reason"]  // reason: api_prefix|no_rule
    )
    .unwrap();

    /// Pipeline failures by the stage that failed
    pub static ref STAGE_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "conduit_stage_failures_total",
        "Total number of pipeline stage failures",
        &["stage", "kind"]
    )
    .unwrap();

    /// Script execution duration
    pub static ref SCRIPT_EXECUTION_DURATION_MS: HistogramVec = register_histogram_vec!(
        "conduit_script_execution_duration_ms",
        "Histogram of script execution time in milliseconds",
        &["role", "result"],  // result: value|empty|<error kind>
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]
    )
    .unwrap();

    /// Upstream request duration
    pub static ref UPSTREAM_REQUEST_DURATION_MS: HistogramVec = register_histogram_vec!(
        "conduit_upstream_request_duration_ms",
        "Duration of upstream requests including the full response body",
        &["rule", "status"]
    )
    .unwrap();

    /// End-to-end duration of forwarded requests
    pub static ref REQUEST_DURATION_MS: HistogramVec = register_histogram_vec!(
        "conduit_request_duration_ms",
        "Total forwarded request duration including scripts",
        &["outcome"],  // outcome: forwarded|rejected|failed
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 30000.0]
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

pub fn record_forward(rule: &str, status: u16) {
    FORWARDS_TOTAL
        .with_label_values(&[rule, &status.to_string()])
        .inc();
}

pub fn record_fallthrough(reason: &str) {
    FALLTHROUGH_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_stage_failure(stage: &str, kind: &str) {
    STAGE_FAILURES_TOTAL.with_label_values(&[stage, kind]).inc();
}

pub fn record_script_execution(role: &str, result: &str, duration: Duration) {
    SCRIPT_EXECUTION_DURATION_MS
        .with_label_values(&[role, result])
        .observe(duration.as_secs_f64() * 1000.0);
}

/// `status` is the upstream status code, or "error" when no response arrived.
pub fn record_upstream_duration(rule: &str, status: &str, duration: Duration) {
    UPSTREAM_REQUEST_DURATION_MS
        .with_label_values(&[rule, status])
        .observe(duration.as_secs_f64() * 1000.0);
}

pub fn record_request_duration(outcome: &str, duration: Duration) {
    REQUEST_DURATION_MS
        .with_label_values(&[outcome])
        .observe(duration.as_secs_f64() * 1000.0);
}

fn metrics_response(req: &Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    let (status, content_type, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match collect_metrics() {
            Ok(text) => (StatusCode::OK, "text/plain; version=0.0.4", text),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                format!("Failed to encode metrics: {e}"),
            ),
        },
        _ => (StatusCode::NOT_FOUND, "text/plain", "Not found".to_string()),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Serve `GET /metrics` on `addr` until the task is dropped.
pub async fn serve_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            let service = service_fn(|req| async move {
                Ok::<_, std::convert::Infallible>(metrics_response(&req))
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Metrics connection error: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collection() {
        record_forward("echo", 200);
        record_fallthrough("no_rule");
        record_stage_failure("header-validation", "blocked");

        let metrics = collect_metrics().unwrap();
        assert!(metrics.contains("conduit_forwards_total"));
        assert!(metrics.contains("conduit_fallthrough_total"));
        assert!(metrics.contains("conduit_stage_failures_total"));
    }

    #[test]
    fn test_script_metrics() {
        record_script_execution("header", "value", Duration::from_micros(1500));
        record_script_execution("response", "timeout", Duration::from_millis(100));

        let metrics = collect_metrics().unwrap();
        assert!(metrics.contains("conduit_script_execution_duration_ms"));
    }

    #[test]
    fn test_duration_metrics() {
        record_upstream_duration("echo", "200", Duration::from_millis(12));
        record_upstream_duration("echo", "error", Duration::from_secs(30));
        record_request_duration("forwarded", Duration::from_millis(15));

        let metrics = collect_metrics().unwrap();
        assert!(metrics.contains("conduit_upstream_request_duration_ms"));
        assert!(metrics.contains("conduit_request_duration_ms"));
    }

    #[test]
    fn test_multiple_rules_same_metric() {
        record_forward("rule-a", 200);
        record_forward("rule-b", 502);
        record_forward("rule-a", 200);

        let value = FORWARDS_TOTAL.with_label_values(&["rule-a", "200"]).get();
        assert!(value >= 2.0);
    }

    #[tokio::test]
    async fn test_serve_metrics_endpoint() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        record_forward("served", 200);
        let server = tokio::spawn(serve_metrics(addr));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("conduit_forwards_total"));

        let missing = reqwest::get(format!("http://{addr}/other")).await.unwrap();
        assert_eq!(missing.status(), 404);
        server.abort();
    }
}
