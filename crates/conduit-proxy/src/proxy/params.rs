//! Parameter views for the param script: query strings and request bodies as JSON.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use hyper::header::{HeaderMap, CONTENT_TYPE};
use serde_json::{Map, Value};

/// Decode a query string into an object. A key seen more than once becomes an array.
pub fn query_to_json(query: Option<&str>) -> Value {
    let mut map = Map::new();
    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key);
        let value = Value::String(decode_component(value));
        match map.get_mut(&key) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key, value);
            }
        }
    }
    Value::Object(map)
}

/// Encode a script result back into a query string.
///
/// Objects encode key by key (arrays repeat the key, `null` drops it); a string is
/// taken as an already-encoded query.
pub fn json_to_query(value: &Value) -> String {
    match value {
        Value::String(raw) => raw.trim_start_matches('?').to_string(),
        Value::Object(map) => {
            let mut pairs = Vec::with_capacity(map.len());
            for (key, v) in map {
                let items: Vec<&Value> = match v {
                    Value::Array(items) => items.iter().collect(),
                    other => vec![other],
                };
                for item in items {
                    if let Some(text) = query_text(item) {
                        pairs.push(format!(
                            "{}={}",
                            urlencoding::encode(key),
                            urlencoding::encode(&text)
                        ));
                    }
                }
            }
            pairs.join("&")
        }
        _ => String::new(),
    }
}

fn query_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Body as seen by the param script.
///
/// Empty bodies are `{}`. JSON bodies are parsed; form bodies decode like a query;
/// other UTF-8 text is a string; binary bodies are base64 text.
pub fn body_to_json(headers: &HeaderMap, body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Object(Map::new());
    }
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        if let Ok(text) = std::str::from_utf8(body) {
            return query_to_json(Some(text));
        }
    }
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return value;
    }
    match std::str::from_utf8(body) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::String(STANDARD.encode(body)),
    }
}

/// Encode a param script result as the outgoing body.
///
/// Form requests keep form encoding for objects; strings go out as raw text;
/// everything else is JSON. Returns the body and the content type to set, if any.
pub fn json_to_body(headers: &HeaderMap, value: &Value) -> (Bytes, Option<&'static str>) {
    let is_form = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("application/x-www-form-urlencoded"));

    match value {
        Value::String(text) => (Bytes::from(text.clone()), None),
        Value::Object(_) if is_form => (Bytes::from(json_to_query(value)), None),
        other => (
            Bytes::from(serde_json::to_vec(other).unwrap_or_default()),
            Some("application/json"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;
    use serde_json::json;

    fn content_type(ct: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(ct).unwrap());
        headers
    }

    #[test]
    fn test_query_to_json() {
        assert_eq!(query_to_json(None), json!({}));
        assert_eq!(query_to_json(Some("")), json!({}));
        assert_eq!(
            query_to_json(Some("q=hello+world&page=2&flag")),
            json!({"q": "hello world", "page": "2", "flag": ""})
        );
        assert_eq!(
            query_to_json(Some("name=caf%C3%A9&a%26b=1")),
            json!({"name": "café", "a&b": "1"})
        );
    }

    #[test]
    fn test_repeated_query_keys_become_arrays() {
        assert_eq!(
            query_to_json(Some("tag=a&tag=b&tag=c&x=1")),
            json!({"tag": ["a", "b", "c"], "x": "1"})
        );
    }

    #[test]
    fn test_json_to_query() {
        assert_eq!(json_to_query(&json!({"q": "hello world"})), "q=hello%20world");
        assert_eq!(json_to_query(&json!({"page": 2, "skip": null})), "page=2");
        assert_eq!(json_to_query(&json!({"tag": ["a", "b"]})), "tag=a&tag=b");
        assert_eq!(json_to_query(&json!("?raw=1&x=y")), "raw=1&x=y");
        assert_eq!(json_to_query(&json!(42)), "");
    }

    #[test]
    fn test_body_to_json() {
        let json_headers = content_type("application/json");
        assert_eq!(body_to_json(&json_headers, b""), json!({}));
        assert_eq!(body_to_json(&json_headers, b"{\"a\":1}"), json!({"a": 1}));
        assert_eq!(
            body_to_json(&content_type("application/x-www-form-urlencoded"), b"a=1&b=two+words"),
            json!({"a": "1", "b": "two words"})
        );
        assert_eq!(
            body_to_json(&content_type("text/plain"), b"just text"),
            json!("just text")
        );
        assert_eq!(
            body_to_json(&HeaderMap::new(), &[0xff, 0x00, 0x10]),
            json!(STANDARD.encode([0xff, 0x00, 0x10]))
        );
    }

    #[test]
    fn test_json_to_body() {
        let (body, ct) = json_to_body(&content_type("application/json"), &json!({"a": 1}));
        assert_eq!(&body[..], b"{\"a\":1}");
        assert_eq!(ct, Some("application/json"));

        let (body, ct) = json_to_body(&content_type("application/x-www-form-urlencoded"), &json!({"a": "x y"}));
        assert_eq!(&body[..], b"a=x%20y");
        assert_eq!(ct, None);

        let (body, ct) = json_to_body(&HeaderMap::new(), &json!("raw text"));
        assert_eq!(&body[..], b"raw text");
        assert_eq!(ct, None);
    }
}
