//! Static file serving from a site's live release.
//!
//! Every lookup goes through [`resolve_within`], the same containment check
//! the deploy extractor uses. Anything that escapes the release, lexically
//! or through a symlink, is answered as a plain 404.

use std::fs;
use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{HeaderValue, Method, Response, StatusCode, header};
use tracing::debug;

use nimbus_core::containment::{ContainmentError, resolve_within};

use crate::error::{RouteError, RouteResult};

pub const INDEX_FILE: &str = "index.html";

/// Prefix of files reserved for the dynamic runtime. Never served.
const RESERVED_PREFIX: &str = "_worker.";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Infer a content type from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" | "text" | "md" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "webmanifest" => "application/manifest+json",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

/// Decode `%XX` escapes. `None` on a truncated or non-hex escape, a decoded
/// NUL, or a result that is not UTF-8.
pub fn percent_decode(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).copied().and_then(hex_value)?;
            let lo = bytes.get(i + 2).copied().and_then(hex_value)?;
            out.push((hi << 4) | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    if out.contains(&0) {
        return None;
    }
    String::from_utf8(out).ok()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Only GET and HEAD reach the file system.
pub fn check_method(method: &Method) -> RouteResult<()> {
    if method == Method::GET || method == Method::HEAD {
        Ok(())
    } else {
        Err(RouteError::MethodNotAllowed)
    }
}

/// A file found inside the release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFile {
    pub path: PathBuf,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

fn not_found(err: ContainmentError) -> RouteError {
    debug!(error = %err, "static path rejected");
    RouteError::FileNotFound
}

fn is_reserved(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(RESERVED_PREFIX))
}

/// Locate and read the file addressed by `request_path` under `root`.
///
/// Blocking: call from a blocking task.
pub fn load(root: &Path, request_path: &str) -> RouteResult<StaticFile> {
    let decoded = percent_decode(request_path).ok_or(RouteError::BadPath)?;
    let relative = Path::new(decoded.trim_start_matches('/'));

    let mut resolved = resolve_within(root, relative)
        .map_err(not_found)?
        .ok_or(RouteError::FileNotFound)?;

    if resolved.is_dir() {
        let index = relative.join(INDEX_FILE);
        resolved = resolve_within(root, &index)
            .map_err(not_found)?
            .ok_or(RouteError::FileNotFound)?;
    }

    if !resolved.is_file() || is_reserved(&resolved) || is_reserved(relative) {
        return Err(RouteError::FileNotFound);
    }

    let body = fs::read(&resolved).map_err(|e| {
        debug!(path = %resolved.display(), error = %e, "static read failed");
        RouteError::FileNotFound
    })?;
    Ok(StaticFile {
        content_type: content_type_for(&resolved),
        path: resolved,
        body,
    })
}

/// Render a found file. HEAD keeps the headers and drops the body.
pub fn file_response(file: StaticFile, method: &Method) -> Response<Body> {
    let length = file.body.len();
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(file.body)
    };
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(file.content_type),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    response
}
