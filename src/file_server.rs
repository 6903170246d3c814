//! Serves files from a [`FileSystem`] over HTTP.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED, LOCATION};
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::Full;
use tracing::debug;

use crate::filesystem::{FileSystem, Metadata};

const INDEX_PAGE: &str = "index.html";

pub struct FileServer {
    fs: Arc<dyn FileSystem>,
}

impl FileServer {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// Answers a request for `path`, the part of the URL below the mount
    /// point. `query` is carried over to redirects.
    pub fn serve(
        &self,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
    ) -> http::Response<Full<Bytes>> {
        let upath = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        if upath.ends_with("/index.html") {
            return local_redirect("./", query);
        }

        let name = clean(&upath);
        let meta = match self.fs.metadata(Path::new(&name)) {
            Ok(meta) => meta,
            Err(err) => return error_response(&err),
        };

        if meta.is_dir && !upath.ends_with('/') {
            return local_redirect(&format!("{}/", base(&upath)), query);
        }
        if !meta.is_dir && upath.ends_with('/') {
            return local_redirect(&format!("../{}", base(&upath)), query);
        }

        if meta.is_dir {
            let index = format!("{}/{}", name.trim_end_matches('/'), INDEX_PAGE);
            return match self.fs.metadata(Path::new(&index)) {
                Ok(index_meta) if !index_meta.is_dir => self.serve_file(&index, &index_meta, headers),
                _ => self.list_dir(&name, &meta, headers),
            };
        }

        self.serve_file(&name, &meta, headers)
    }

    fn serve_file(&self, name: &str, meta: &Metadata, headers: &HeaderMap) -> http::Response<Full<Bytes>> {
        if not_modified(meta, headers) {
            return with_last_modified(status_only(StatusCode::NOT_MODIFIED), meta);
        }

        let data = match self.fs.read(Path::new(name)) {
            Ok(data) => data,
            Err(err) => return error_response(&err),
        };

        let content_type = content_type(name, &data);
        let mut response = http::Response::new(Full::new(Bytes::from(data)));
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
        with_last_modified(response, meta)
    }

    fn list_dir(&self, name: &str, meta: &Metadata, headers: &HeaderMap) -> http::Response<Full<Bytes>> {
        if not_modified(meta, headers) {
            return with_last_modified(status_only(StatusCode::NOT_MODIFIED), meta);
        }

        let entries = match self.fs.read_dir(Path::new(name)) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(error = %err, dir = name, "reading directory");
                return plain(StatusCode::INTERNAL_SERVER_ERROR, "Error reading directory");
            }
        };

        let mut html = String::from("<!doctype html>\n<meta name=\"viewport\" content=\"width=device-width\">\n<pre>\n");
        for entry in entries {
            let mut label = entry.name;
            if entry.is_dir {
                label.push('/');
            }
            html.push_str(&format!(
                "<a href=\"{}\">{}</a>\n",
                escape_html(&escape_href(&label)),
                escape_html(&label)
            ));
        }
        html.push_str("</pre>\n");

        let mut response = http::Response::new(Full::new(Bytes::from(html)));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        with_last_modified(response, meta)
    }
}

/// Lexically cleans a slash-separated absolute path.
pub fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn base(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

fn content_type(name: &str, data: &[u8]) -> String {
    match mime_guess::from_path(name).first() {
        Some(mime) if mime.type_() == mime_guess::mime::TEXT => {
            format!("{}; charset=utf-8", mime.essence_str())
        }
        Some(mime) => mime.essence_str().to_string(),
        None => sniff(data).to_string(),
    }
}

fn sniff(data: &[u8]) -> &'static str {
    let head = &data[..data.len().min(512)];
    let textual = match std::str::from_utf8(head) {
        Ok(s) => !s.chars().any(|c| c.is_control() && !c.is_whitespace()),
        // A multibyte sequence may be cut at the window edge.
        Err(e) => e.error_len().is_none() && e.valid_up_to() + 4 > head.len(),
    };
    if textual {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

fn not_modified(meta: &Metadata, headers: &HeaderMap) -> bool {
    let (Some(modified), Some(since)) = (
        meta.modified.and_then(truncate_to_seconds),
        headers
            .get(IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok()),
    ) else {
        return false;
    };
    modified <= since
}

fn truncate_to_seconds(time: SystemTime) -> Option<SystemTime> {
    let secs = time.duration_since(UNIX_EPOCH).ok()?.as_secs();
    // Zero means unknown.
    (secs > 0).then(|| UNIX_EPOCH + Duration::from_secs(secs))
}

fn with_last_modified(mut response: http::Response<Full<Bytes>>, meta: &Metadata) -> http::Response<Full<Bytes>> {
    if let Some(modified) = meta.modified.and_then(truncate_to_seconds) {
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
            response.headers_mut().insert(LAST_MODIFIED, value);
        }
    }
    response
}

fn local_redirect(location: &str, query: Option<&str>) -> http::Response<Full<Bytes>> {
    let location = match query {
        Some(q) if !q.is_empty() => format!("{}?{}", location, q),
        _ => location.to_string(),
    };
    let mut response = status_only(StatusCode::MOVED_PERMANENTLY);
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}

fn error_response(err: &io::Error) -> http::Response<Full<Bytes>> {
    match err.kind() {
        io::ErrorKind::NotFound => plain(StatusCode::NOT_FOUND, "404 page not found"),
        io::ErrorKind::PermissionDenied => plain(StatusCode::FORBIDDEN, "403 Forbidden"),
        _ => {
            debug!(error = %err, "serving file");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Server Error")
        }
    }
}

pub(crate) fn plain(status: StatusCode, message: &str) -> http::Response<Full<Bytes>> {
    let mut response = http::Response::new(Full::new(Bytes::from(format!("{}\n", message))));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    response
}

fn status_only(status: StatusCode) -> http::Response<Full<Bytes>> {
    let mut response = http::Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_href(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b"-._~/!$&'()*+,;=:@".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    // A leading segment with a colon would parse as a scheme.
    if out.split('/').next().is_some_and(|first| first.contains(':')) {
        out.insert_str(0, "./");
    }
    out
}
