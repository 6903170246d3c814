//! Outbound side of an exchange.
//!
//! Writes behave like an immediate-write HTTP writer: the first status wins,
//! the first body write implies `200 OK` and freezes the header block.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, LOCATION, VARY};
use http::{HeaderMap, StatusCode};
use http_body_util::Full;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::format::sprintf;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Something `send` knows how to write.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Html(Bytes),
    Binary(Bytes),
    Json(Value),
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Html(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Html(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(b))
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}

#[derive(Debug, Default)]
struct State {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    body_started: bool,
}

#[derive(Debug, Default)]
pub struct Response {
    state: Mutex<State>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self, code: u16) -> Result<()> {
        let code = StatusCode::from_u16(code)
            .map_err(|_| Error::InvalidArgument(format!("invalid status code {}", code)))?;
        let mut state = self.state();
        match state.status {
            Some(current) => debug!(%current, ignored = %code, "status already written"),
            None => state.status = Some(code),
        }
        Ok(())
    }

    /// Replaces every value of `field`.
    pub fn set(&self, field: &str, value: &str) -> Result<()> {
        let (name, value) = header(field, value)?;
        self.with_headers(|headers| {
            headers.insert(name, value);
        });
        Ok(())
    }

    /// Adds a value to `field`, keeping earlier ones.
    pub fn append(&self, field: &str, value: &str) -> Result<()> {
        let (name, value) = header(field, value)?;
        self.with_headers(|headers| {
            headers.append(name, value);
        });
        Ok(())
    }

    /// Sets `Content-Type`.
    pub fn content_type(&self, mime: &str) -> Result<()> {
        self.set(CONTENT_TYPE.as_str(), mime)
    }

    pub fn vary(&self, field: &str) -> Result<()> {
        self.set(VARY.as_str(), field)
    }

    /// Writes the status, then `Location`.
    pub fn redirect(&self, code: u16, location: &str) -> Result<()> {
        self.status(code)?;
        self.set(LOCATION.as_str(), location)
    }

    pub fn json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.write(JSON_CONTENT_TYPE, &encoded);
        Ok(())
    }

    /// Formats `args` into `format` printf-style.
    pub fn text(&self, format: &str, args: &[Value]) {
        self.write(TEXT_CONTENT_TYPE, sprintf(format, args).as_bytes());
    }

    pub fn html(&self, data: &[u8]) {
        self.write(HTML_CONTENT_TYPE, data);
    }

    pub fn binary(&self, data: &[u8]) {
        self.write(BINARY_CONTENT_TYPE, data);
    }

    /// Strings are written as html, bytes as binary, anything else as json.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        match payload.into() {
            Payload::Html(data) => self.html(&data),
            Payload::Binary(data) => self.binary(&data),
            Payload::Json(value) => self.json(&value)?,
        }
        Ok(())
    }

    /// Current value of a response header, mostly for inspection in tests.
    pub fn header(&self, field: &str) -> Option<String> {
        self.state()
            .headers
            .get(field)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    fn with_headers(&self, f: impl FnOnce(&mut HeaderMap)) {
        let mut state = self.state();
        if state.body_started {
            debug!("headers already written");
            return;
        }
        f(&mut state.headers);
    }

    fn write(&self, content_type: &'static str, data: &[u8]) {
        let mut state = self.state();
        if !state.body_started {
            state
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            state.status.get_or_insert(StatusCode::OK);
            state.body_started = true;
        }
        state.body.extend_from_slice(data);
    }

    /// Builds the HTTP response from everything written so far.
    pub fn finish(&self) -> http::Response<Full<Bytes>> {
        let mut state = self.state();
        let mut response = http::Response::new(Full::new(state.body.split().freeze()));
        *response.status_mut() = state.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = std::mem::take(&mut state.headers);
        response
    }
}

fn header(field: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(field.as_bytes())
        .map_err(|_| Error::Header(format!("invalid header name {:?}", field)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| Error::Header(format!("invalid value for header {}", name)))?;
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::json;

    async fn body_of(res: &Response) -> (http::response::Parts, Bytes) {
        let (parts, body) = res.finish().into_parts();
        (parts, body.collect().await.unwrap().to_bytes())
    }

    async fn assert_written(write: impl Fn(&Response), content_type: &str, expected: &[u8]) {
        let res = Response::new();
        write(&res);
        let (parts, body) = body_of(&res).await;

        assert_eq!(parts.status, StatusCode::OK);
        assert_eq!(parts.headers[CONTENT_TYPE], content_type);
        assert_eq!(&body[..], expected);
    }

    #[tokio::test]
    async fn test_content_types() {
        assert_written(|r| r.json(&json!({"a": 1})).unwrap(), JSON_CONTENT_TYPE, br#"{"a":1}"#).await;
        assert_written(|r| r.text("%s!", &[json!("hi")]), TEXT_CONTENT_TYPE, b"hi!").await;
        assert_written(|r| r.html(b"<p>"), HTML_CONTENT_TYPE, b"<p>").await;
        assert_written(|r| r.binary(&[1, 2]), BINARY_CONTENT_TYPE, &[1, 2]).await;
    }

    #[tokio::test]
    async fn test_send_dispatches_by_shape() {
        assert_written(|r| r.send("<b>").unwrap(), HTML_CONTENT_TYPE, b"<b>").await;
        assert_written(|r| r.send(vec![9u8]).unwrap(), BINARY_CONTENT_TYPE, &[9]).await;
        assert_written(|r| r.send(json!([true])).unwrap(), JSON_CONTENT_TYPE, b"[true]").await;
    }

    #[tokio::test]
    async fn test_first_status_wins() {
        let res = Response::new();
        res.status(404).unwrap();
        res.status(500).unwrap();
        res.text("missing", &[]);

        let (parts, _) = body_of(&res).await;
        assert_eq!(parts.status, StatusCode::NOT_FOUND);
        assert!(res.status(99).is_err());
    }

    #[tokio::test]
    async fn test_set_and_append() {
        let res = Response::new();
        res.set("X-One", "a").unwrap();
        res.set("X-One", "b").unwrap();
        res.append("X-Many", "a").unwrap();
        res.append("X-Many", "b").unwrap();
        res.vary("Origin").unwrap();
        res.vary("Accept").unwrap();
        res.content_type("image/png").unwrap();

        let (parts, _) = body_of(&res).await;
        assert_eq!(parts.headers["x-one"], "b");
        let many: Vec<_> = parts.headers.get_all("x-many").iter().collect();
        assert_eq!(many, vec!["a", "b"]);
        assert_eq!(parts.headers["vary"], "Accept");
        assert_eq!(parts.headers["content-type"], "image/png");
        assert!(res.set("bad header", "x").is_err());
    }

    #[tokio::test]
    async fn test_headers_freeze_after_body() {
        let res = Response::new();
        res.html(b"a");
        res.set("X-Late", "1").unwrap();
        res.html(b"b");

        let (parts, body) = body_of(&res).await;
        assert!(parts.headers.get("x-late").is_none());
        assert_eq!(&body[..], b"ab");
    }

    #[tokio::test]
    async fn test_redirect() {
        let res = Response::new();
        res.redirect(302, "/elsewhere").unwrap();

        let (parts, body) = body_of(&res).await;
        assert_eq!(parts.status, StatusCode::FOUND);
        assert_eq!(parts.headers[LOCATION], "/elsewhere");
        assert!(body.is_empty());
    }
}
