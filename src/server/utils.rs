//! Small helpers shared by the request handlers.

use crate::http::request::RequestFrame;
use std::{collections::HashMap, path::Path, time::SystemTime};

/// Content codings the server can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

/// The preferred coding from `Accept-Encoding`: gzip over deflate, and
/// never one the client rejected with `q=0`.
pub fn accepted_encoding(request: &RequestFrame) -> Option<Encoding> {
    let mut gzip = false;
    let mut deflate = false;

    for value in request.headers.get_all("Accept-Encoding") {
        let mut parts = value.split(';');
        let name = parts.next().unwrap_or_default().trim();
        let rejected = parts.any(|param| matches!(param.trim(), "q=0" | "q=0.0" | "q=0.00" | "q=0.000"));
        if rejected {
            continue;
        }

        match name.to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => gzip = true,
            "deflate" => deflate = true,
            "*" => gzip = true,
            _ => {}
        }
    }

    match (gzip, deflate) {
        (true, _) => Some(Encoding::Gzip),
        (false, true) => Some(Encoding::Deflate),
        _ => None,
    }
}

/// MIME type for `path`, looking at route overrides first.
pub fn mime_type(path: &Path, overrides: &HashMap<String, String>) -> String {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if let Some(kind) = overrides.get(&extension) {
        return kind.clone();
    }

    match extension.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "md" | "markdown" => "text/markdown",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
    .to_owned()
}

/// Types worth compressing and worth a `charset` parameter.
pub fn is_text_mime(kind: &str) -> bool {
    let kind = kind.split(';').next().unwrap_or_default().trim();
    kind.starts_with("text/")
        || matches!(
            kind,
            "application/javascript" | "application/json" | "application/xml" | "image/svg+xml"
        )
}

/// `Content-Type` value, with `charset` for textual types.
pub fn content_type(kind: &str, char_set: &str) -> String {
    match is_text_mime(kind) && !kind.contains("charset") && !char_set.is_empty() {
        true => format!("{kind}; charset={char_set}"),
        false => kind.to_owned(),
    }
}

#[inline]
pub fn http_date(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}

#[inline]
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value.trim()).ok()
}

/// Random boundary for multipart bodies.
pub fn generate_boundary() -> String {
    let mut boundary = String::with_capacity(32);
    boundary.push_str("----maker");
    boundary.extend(std::iter::repeat_with(fastrand::alphanumeric).take(22));
    boundary
}

pub fn escape_html(src: &str) -> String {
    let mut result = String::with_capacity(src.len());
    for ch in src.chars() {
        match ch {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&#39;"),
            ch => result.push(ch),
        }
    }
    result
}

/// Percent-encodes a path, keeping `/` and unreserved characters.
pub fn encode_path(src: &str) -> String {
    src.split('/')
        .map(crate::http::query::Query::encode)
        .collect::<Vec<_>>()
        .join("/")
}

/// Generated body for error statuses without a configured page.
pub fn error_page(status: u16, reason: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>{status} {reason}</title></head>\
         <body><h1>{status} {reason}</h1></body></html>"
    )
}

/// Part header of a `multipart/byteranges` body.
pub fn byterange_header(boundary: &str, kind: &str, start: u64, end: u64, size: u64) -> String {
    format!("\r\n--{boundary}\r\nContent-Type: {kind}\r\nContent-Range: bytes {start}-{end}/{size}\r\n\r\n")
}

/// Closing delimiter of a `multipart/byteranges` body.
pub fn byterange_footer(boundary: &str) -> String {
    format!("\r\n--{boundary}--\r\n")
}

/// Total length of a `multipart/byteranges` body for `ranges`.
pub fn byteranges_length(boundary: &str, kind: &str, ranges: &[(u64, u64)], size: u64) -> u64 {
    let parts: u64 = ranges
        .iter()
        .map(|&(start, end)| byterange_header(boundary, kind, start, end, size).len() as u64 + end - start + 1)
        .sum();

    parts + byterange_footer(boundary).len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::types::Method;

    #[test]
    fn encodings() {
        #[rustfmt::skip]
        let cases = [
            (vec![],                                 None),
            (vec!["gzip", "deflate"],                Some(Encoding::Gzip)),
            (vec!["deflate"],                        Some(Encoding::Deflate)),
            (vec!["gzip;q=0", "deflate"],            Some(Encoding::Deflate)),
            (vec!["br"],                             None),
            (vec!["*"],                              Some(Encoding::Gzip)),
        ];

        for (values, expected) in cases {
            let mut request = RequestFrame::new(Method::Get, "/");
            for value in &values {
                request.headers.append("Accept-Encoding", value);
            }
            assert_eq!(accepted_encoding(&request), expected, "{values:?}");
        }
    }

    #[test]
    fn mime() {
        let mut overrides = HashMap::new();
        overrides.insert("txt".to_string(), "text/x-custom".to_string());

        #[rustfmt::skip]
        let cases = [
            ("index.HTML",  "text/html"),
            ("a/b/app.js",  "application/javascript"),
            ("notes.txt",   "text/x-custom"),
            ("blob",        "application/octet-stream"),
        ];
        for (path, expected) in cases {
            assert_eq!(mime_type(Path::new(path), &overrides), expected);
        }

        assert_eq!(content_type("text/html", "utf-8"), "text/html; charset=utf-8");
        assert_eq!(content_type("image/png", "utf-8"), "image/png");
        assert!(is_text_mime("application/json; charset=utf-8"));
    }

    #[test]
    fn text_helpers() {
        assert_eq!(escape_html("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
        assert_eq!(encode_path("/a b/c#d"), "/a%20b/c%23d");
        assert_eq!(generate_boundary().len(), 31);

        let date = http_date(SystemTime::UNIX_EPOCH);
        assert_eq!(date, "Thu, 01 Jan 1970 00:00:00 GMT");
        assert_eq!(parse_http_date(&date), Some(SystemTime::UNIX_EPOCH));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn byteranges() {
        let ranges = [(0, 9), (50, 59)];
        let total = byteranges_length("B", "text/plain", &ranges, 100);

        let mut body = String::new();
        for (start, end) in ranges {
            body.push_str(&byterange_header("B", "text/plain", start, end, 100));
            body.push_str(&"x".repeat((end - start + 1) as usize));
        }
        body.push_str(&byterange_footer("B"));

        assert_eq!(total, body.len() as u64);
    }
}
