//! Header sanitation and the JSON view of headers handed to scripts.
//!
//! Inbound headers are cleaned before any script sees them; upstream response
//! headers lose their framing and encoding headers before they reach the client.

use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::Response;
use serde_json::{Map, Value};
use tracing::debug;

pub static CONTENT_TYPE_JSON: HeaderValue = HeaderValue::from_static("application/json");

/// Inbound headers never forwarded upstream.
const DROPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "cdn-loop",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    // Upstream bodies are relayed undecoded, so ask for identity.
    "accept-encoding",
];

/// Inbound header prefixes never forwarded upstream.
const DROPPED_REQUEST_PREFIXES: &[&str] = &[
    "x-forwarded-",
    "x-real-ip",
    "forwarded",
    "via",
    "cf-",
    "x-envoy-",
];

/// Remove proxy, hop-by-hop and client-network headers.
pub fn sanitize_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut clean = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if DROPPED_REQUEST_HEADERS.contains(&lower)
            || DROPPED_REQUEST_PREFIXES.iter().any(|p| lower.starts_with(p))
        {
            continue;
        }
        clean.append(name.clone(), value.clone());
    }
    clean
}

/// Strip headers that no longer describe the body being sent to the client.
pub fn strip_response_headers(headers: &mut HeaderMap, body_changed: bool) {
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);
    headers.remove(header::CONTENT_ENCODING);
    if body_changed {
        headers.remove(header::CONTENT_LENGTH);
    }
}

/// Headers as a JSON object. A header sent once is a string; a repeated header is
/// an array of its values in order, so `set-cookie` and friends survive a round trip
/// through [`json_to_headers`]. Values that are not valid UTF-8 are decoded lossily.
pub fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for name in headers.keys() {
        let mut values: Vec<Value> = headers
            .get_all(name)
            .iter()
            .map(|v| Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let value = if values.len() == 1 {
            values.remove(0)
        } else {
            Value::Array(values)
        };
        map.insert(name.as_str().to_string(), value);
    }
    Value::Object(map)
}

/// Rebuild a header map from a script result.
///
/// Strings are used as-is, numbers and booleans are stringified, arrays become
/// repeated headers, `null` drops the header. Invalid names or values are skipped.
pub fn json_to_headers(value: &Map<String, Value>) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(value.len());
    for (key, raw) in value {
        let Ok(name) = HeaderName::from_bytes(key.trim().as_bytes()) else {
            debug!(header = %key, "Dropping script header with invalid name");
            continue;
        };
        let values = match raw {
            Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
            other => scalar_text(other).into_iter().collect::<Vec<_>>(),
        };
        for text in values {
            match HeaderValue::from_str(&text) {
                Ok(v) => {
                    headers.append(name.clone(), v);
                }
                Err(_) => debug!(header = %key, "Dropping script header with invalid value"),
            }
        }
    }
    headers
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Insert helpers for headers whose name is only known at runtime.
pub trait ConduitHeadersExt {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue);

    /// Returns false if `value` is not a valid header value.
    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool;
}

impl<B> ConduitHeadersExt for Response<B> {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue) {
        self.headers_mut().insert(name.clone(), value.clone());
    }

    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool {
        match HeaderValue::from_str(value) {
            Ok(header_value) => {
                self.headers_mut().insert(name.clone(), header_value);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use serde_json::json;

    fn map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn test_sanitize_drops_proxy_headers() {
        let headers = map(&[
            ("host", "conduit.local"),
            ("connection", "keep-alive"),
            ("content-length", "12"),
            ("cdn-loop", "cloudflare"),
            ("transfer-encoding", "chunked"),
            ("x-forwarded-for", "10.0.0.1"),
            ("x-forwarded-proto", "https"),
            ("x-real-ip", "10.0.0.1"),
            ("forwarded", "for=10.0.0.1"),
            ("via", "1.1 edge"),
            ("cf-ray", "abc"),
            ("x-envoy-upstream", "svc"),
            ("accept-encoding", "gzip"),
            ("accept", "application/json"),
            ("x-api-key", "k-123"),
            ("authorization", "Bearer t"),
        ]);

        let clean = sanitize_request_headers(&headers);
        let names: Vec<&str> = clean.keys().map(HeaderName::as_str).collect();
        assert_eq!(names, vec!["accept", "x-api-key", "authorization"]);
    }

    #[test]
    fn test_strip_response_headers() {
        let mut headers = map(&[
            ("transfer-encoding", "chunked"),
            ("connection", "close"),
            ("content-encoding", "gzip"),
            ("content-length", "42"),
            ("content-type", "application/json"),
        ]);
        let mut changed = headers.clone();

        strip_response_headers(&mut headers, false);
        assert!(headers.contains_key("content-length"));
        assert!(!headers.contains_key("content-encoding"));
        assert_eq!(headers.len(), 2);

        strip_response_headers(&mut changed, true);
        assert!(!changed.contains_key("content-length"));
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn test_headers_to_json_keeps_repeats_apart() {
        let headers = map(&[("accept", "a/b"), ("x-tag", "one"), ("x-tag", "two")]);
        assert_eq!(
            headers_to_json(&headers),
            json!({"accept": "a/b", "x-tag": ["one", "two"]})
        );
    }

    #[test]
    fn test_repeated_set_cookie_round_trips() {
        let headers = map(&[
            ("set-cookie", "a=1; Path=/"),
            ("set-cookie", "b=2; Path=/"),
            ("content-type", "text/plain"),
        ]);
        let json = headers_to_json(&headers);
        let rebuilt = json_to_headers(json.as_object().unwrap());

        let cookies: Vec<&str> = rebuilt
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(cookies, vec!["a=1; Path=/", "b=2; Path=/"]);
        assert_eq!(rebuilt["content-type"], "text/plain");
    }

    #[test]
    fn test_json_to_headers_coerces_values() {
        let value = json!({
            "x-count": 3,
            "x-flag": true,
            "set-cookie": ["a=1", "b=2"],
            "x-removed": null,
            "bad name": "x",
            "x-bad-value": "line\nbreak",
        });
        let headers = json_to_headers(value.as_object().unwrap());
        assert_eq!(headers["x-count"], "3");
        assert_eq!(headers["x-flag"], "true");
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
        assert!(!headers.contains_key("x-removed"));
        assert!(!headers.contains_key("x-bad-value"));
        assert_eq!(headers.len(), 4);
    }

    #[test]
    fn test_set_header_value() {
        let mut response = Response::new(Full::new(Bytes::new()));
        let name = HeaderName::from_static("x-conduit-trace");
        assert!(response.set_header_value(&name, "eyJ9"));
        assert_eq!(response.headers()[&name], "eyJ9");
        assert!(!response.set_header_value(&name, "invalid\nvalue"));

        response.set_header(&header::CONTENT_TYPE, &CONTENT_TYPE_JSON);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }
}
