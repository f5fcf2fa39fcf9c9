//! HTTP handlers for the bucket and object routes.
//!
//! Handlers are thin: they pull parameters out of the request, call the
//! [`crate::storage::backend::ObjectStore`] in [`crate::AppState`], and turn
//! the result (or the error) into a response.  Every failure is logged here
//! with the operation, bucket and key before it is translated to a status.

use std::collections::HashMap;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::errors::ProxyError;

pub mod bucket;
pub mod object;

/// Parse a raw query string into a map of percent-decoded pairs.
///
/// Parameters without a value (`?flag`) map to an empty string; the last
/// occurrence of a repeated name wins.
pub fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                map.insert(decode_component(k), decode_component(v));
            } else if !part.is_empty() {
                map.insert(decode_component(part), String::new());
            }
        }
    }
    map
}

fn decode_component(raw: &str) -> String {
    // Form encoding sends spaces as '+'.
    let raw = raw.replace('+', " ");
    percent_encoding::percent_decode_str(&raw)
        .decode_utf8_lossy()
        .into_owned()
}

/// Fetch a non-empty query parameter.
pub(crate) fn query_param<'q>(query: &'q HashMap<String, String>, name: &str) -> Option<&'q str> {
    query
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}

/// Serialize `value` as a `200 OK` JSON response.
pub(crate) fn json_response<T: Serialize>(value: &T) -> Result<Response, ProxyError> {
    let body = serde_json::to_vec(value)?;
    Ok((
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_pairs_and_flags() {
        let q = parse_query(Some("key=a%2Fb.txt&flag&prefix=docs%20x"));
        assert_eq!(q.get("key").map(String::as_str), Some("a/b.txt"));
        assert_eq!(q.get("flag").map(String::as_str), Some(""));
        assert_eq!(q.get("prefix").map(String::as_str), Some("docs x"));
    }

    #[test]
    fn test_parse_query_plus_is_space() {
        let q = parse_query(Some("key=my+file.txt"));
        assert_eq!(q.get("key").map(String::as_str), Some("my file.txt"));
    }

    #[test]
    fn test_parse_query_empty() {
        assert!(parse_query(None).is_empty());
        assert!(parse_query(Some("")).is_empty());
    }

    #[test]
    fn test_query_param_skips_blank_values() {
        let q = parse_query(Some("key=&other=%20&name=x"));
        assert_eq!(query_param(&q, "key"), None);
        assert_eq!(query_param(&q, "other"), None);
        assert_eq!(query_param(&q, "name"), Some("x"));
        assert_eq!(query_param(&q, "missing"), None);
    }
}
