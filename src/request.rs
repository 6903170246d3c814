//! Read-only view over one inbound request.
//!
//! `params`, `query`, `cookies` and `body` are derived on first access and
//! cached for the rest of the request.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST};
use http::request::Parts;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{BodyError, Result};

/// A query parameter. Keys that occur once are scalars, repeated keys keep
/// every value in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum QueryValue {
    One(String),
    Many(Vec<String>),
}

/// Parsed request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// No body, or not a JSON request.
    Absent,
    Json(Map<String, Value>),
}

#[derive(Debug)]
pub struct Request {
    parts: Parts,
    raw_params: Vec<(String, String)>,
    raw_body: Result<Bytes, BodyError>,
    extensions: Mutex<http::Extensions>,

    params: OnceLock<BTreeMap<String, String>>,
    query: OnceLock<BTreeMap<String, QueryValue>>,
    cookies: OnceLock<BTreeMap<String, String>>,
    body: OnceLock<Result<Body, BodyError>>,
}

impl Request {
    /// `body` holds the drained body bytes, or the error draining failed with.
    pub fn new(
        mut parts: Parts,
        params: Vec<(String, String)>,
        body: Result<Bytes, BodyError>,
    ) -> Self {
        let extensions = std::mem::take(&mut parts.extensions);
        Self {
            parts,
            raw_params: params,
            raw_body: body,
            extensions: Mutex::new(extensions),
            params: OnceLock::new(),
            query: OnceLock::new(),
            cookies: OnceLock::new(),
            body: OnceLock::new(),
        }
    }

    /// The `Host` header, or the authority of an absolute request URI.
    pub fn host(&self) -> &str {
        self.parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.parts.uri.authority().map(|a| a.as_str()))
            .unwrap_or("")
    }

    pub fn method(&self) -> &str {
        self.parts.method.as_str()
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn protocol(&self) -> &str {
        self.parts.uri.scheme_str().unwrap_or("http")
    }

    /// First value of a header field, or `""`.
    pub fn get(&self, field: &str) -> &str {
        self.parts
            .headers
            .get(field)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn headers(&self) -> &http::HeaderMap {
        &self.parts.headers
    }

    /// Per-request storage shared by every middleware of the chain.
    pub fn extensions(&self) -> MutexGuard<'_, http::Extensions> {
        self.extensions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        self.params
            .get_or_init(|| self.raw_params.iter().cloned().collect())
    }

    pub fn query(&self) -> &BTreeMap<String, QueryValue> {
        self.query
            .get_or_init(|| parse_query(self.parts.uri.query().unwrap_or("")))
    }

    /// Cookies by name. A repeated name keeps its last value.
    pub fn cookies(&self) -> &BTreeMap<String, String> {
        self.cookies.get_or_init(|| {
            let mut cookies = BTreeMap::new();
            for line in self.parts.headers.get_all(COOKIE) {
                if let Ok(line) = line.to_str() {
                    cookies.extend(parse_cookies(line));
                }
            }
            cookies
        })
    }

    /// Parses the body as a JSON object when the request says it is JSON
    /// and is not empty.
    pub fn body(&self) -> Result<&Body> {
        self.body
            .get_or_init(|| self.parse_body())
            .as_ref()
            .map_err(|e| e.clone().into())
    }

    fn parse_body(&self) -> Result<Body, BodyError> {
        if !has_json_body(&self.parts.headers) {
            return Ok(Body::Absent);
        }

        let bytes = self.raw_body.as_ref().map_err(Clone::clone)?;
        if bytes.is_empty() {
            return Ok(Body::Absent);
        }

        serde_json::from_slice::<Map<String, Value>>(bytes)
            .map(Body::Json)
            .map_err(|e| BodyError::Decode(e.to_string()))
    }
}

/// Whether the headers announce a non-empty JSON body. Other bodies are
/// never read.
pub(crate) fn has_json_body(headers: &http::HeaderMap) -> bool {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    let declared_empty = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|len| len.trim() == "0");
    is_json && !declared_empty
}

fn parse_query(query: &str) -> BTreeMap<String, QueryValue> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        grouped.entry(key.into_owned()).or_default().push(value.into_owned());
    }

    grouped
        .into_iter()
        .map(|(key, mut values)| {
            let value = if values.len() == 1 {
                QueryValue::One(values.remove(0))
            } else {
                QueryValue::Many(values)
            };
            (key, value)
        })
        .collect()
}

fn parse_cookies(line: &str) -> Vec<(String, String)> {
    line.split(';')
        .filter_map(|part| {
            let part = part.trim();
            let (name, value) = part.split_once('=')?;
            let name = name.trim();
            if name.is_empty() || !name.bytes().all(is_token_byte) {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            if !value.bytes().all(is_cookie_value_byte) {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b)
}

fn is_cookie_value_byte(b: u8) -> bool {
    (0x20..0x7f).contains(&b) && b != b'"' && b != b';' && b != b'\\'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(builder: http::request::Builder, body: &'static str) -> Request {
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        Request::new(parts, Vec::new(), Ok(Bytes::from_static(body.as_bytes())))
    }

    #[test]
    fn test_identity_fields() {
        let req = request(
            http::Request::builder()
                .method("PATCH")
                .uri("/things/1?x=y")
                .header("Host", "example.com:8080")
                .header("X-Custom", "yes"),
            "",
        );

        assert_eq!(req.method(), "PATCH");
        assert_eq!(req.path(), "/things/1");
        assert_eq!(req.host(), "example.com:8080");
        assert_eq!(req.protocol(), "http");
        assert_eq!(req.get("x-custom"), "yes");
        assert_eq!(req.get("missing"), "");
    }

    #[test]
    fn test_fields_are_memoized() {
        let (parts, ()) = http::Request::builder()
            .uri("/?a=1")
            .body(())
            .unwrap()
            .into_parts();
        let req = Request::new(
            parts,
            vec![("id".to_string(), "7".to_string())],
            Ok(Bytes::new()),
        );

        assert!(req.params.get().is_none());
        assert!(req.query.get().is_none());
        assert!(req.cookies.get().is_none());
        assert!(req.body.get().is_none());

        let first = req.params() as *const _;
        req.query();
        req.cookies();
        req.body().unwrap();

        assert!(req.params.get().is_some());
        assert!(req.query.get().is_some());
        assert!(req.cookies.get().is_some());
        assert!(req.body.get().is_some());
        assert_eq!(first, req.params() as *const _);
        assert_eq!(req.params()["id"], "7");
    }

    #[test]
    fn test_query_scalar_and_list() {
        let req = request(http::Request::builder().uri("/?foo=a&foo=b&bar=c&e=%20x"), "");

        assert_eq!(
            req.query()["foo"],
            QueryValue::Many(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(req.query()["bar"], QueryValue::One("c".to_string()));
        assert_eq!(req.query()["e"], QueryValue::One(" x".to_string()));
        assert_eq!(
            serde_json::to_string(req.query()).unwrap(),
            r#"{"bar":"c","e":" x","foo":["a","b"]}"#
        );
    }

    #[test]
    fn test_cookies_last_value_wins() {
        let req = request(
            http::Request::builder()
                .uri("/")
                .header("Cookie", "a=1; b=\"two\"")
                .header("Cookie", "a=3; bad name=x"),
            "",
        );

        assert_eq!(req.cookies().len(), 2);
        assert_eq!(req.cookies()["a"], "3");
        assert_eq!(req.cookies()["b"], "two");
    }

    #[test]
    fn test_json_body() {
        let req = request(
            http::Request::builder()
                .method("POST")
                .uri("/")
                .header("Content-Type", "application/json; charset=utf-8"),
            r#"{"x":1}"#,
        );

        let Body::Json(map) = req.body().unwrap() else {
            panic!("expected a json body");
        };
        assert_eq!(map["x"], 1);
    }

    #[test]
    fn test_absent_body() {
        let plain = request(
            http::Request::builder()
                .method("POST")
                .uri("/")
                .header("Content-Type", "text/plain"),
            r#"{"x":1}"#,
        );
        let empty = request(
            http::Request::builder()
                .method("POST")
                .uri("/")
                .header("Content-Type", "application/json")
                .header("Content-Length", "0"),
            "",
        );

        assert_eq!(plain.body().unwrap(), &Body::Absent);
        assert_eq!(empty.body().unwrap(), &Body::Absent);
    }

    #[test]
    fn test_body_errors_repeat() {
        let malformed = request(
            http::Request::builder()
                .method("POST")
                .uri("/")
                .header("Content-Type", "application/json"),
            "[1, 2]",
        );
        assert!(malformed.body().is_err());
        assert!(malformed.body().is_err());

        let (parts, ()) = http::Request::builder()
            .method("POST")
            .uri("/")
            .header("Content-Type", "application/json")
            .body(())
            .unwrap()
            .into_parts();
        let broken = Request::new(parts, Vec::new(), Err(BodyError::Read("reset".to_string())));
        assert_eq!(
            broken.body().unwrap_err().to_string(),
            "read request body: reset"
        );
    }
}
