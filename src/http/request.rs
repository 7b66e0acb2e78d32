//! Inbound (server) and outbound (client) request messages.

use crate::{
    http::{
        content::ContentFrame,
        query::{self, Query},
        types::{HeaderMap, Method, Version},
    },
    ErrorKind,
};
use std::{borrow::Cow, fmt::Write, path::PathBuf};

/// Ranges accepted in one `Range` header.
pub const MAX_RANGES: usize = 16;

/// Authentication scheme declared by a route or found in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Bearer,
}

/// Credentials decoded from the `Authorization` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub kind: AuthType,
    /// Bearer token, or the raw `user:password` pair for basic auth.
    pub token: String,
    pub username: String,
    pub password: String,
    /// Set once the route's authorization callback accepted them.
    pub authorized: bool,
}

/// HTTP request as read by a server connection or built by a client.
///
/// Every field is public: route callbacks inspect and rewrite it freely.
///
/// # Examples
/// ```
/// use maker_net::{Method, RequestFrame};
///
/// let mut request = RequestFrame::new(Method::Post, "/upload?dry=1");
/// request.headers.append("Content-Type", "text/plain");
/// request.content.assign("hello");
///
/// assert_eq!(request.location, "/upload");
/// assert_eq!(request.query, "dry=1");
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestFrame {
    pub method: Method,
    pub version: Version,
    /// Percent-decoded request path, possibly rewritten by an alias.
    pub location: String,
    /// Location as received, before alias or redirect rewriting.
    pub referrer: String,
    /// Filesystem path resolved for the location by static routes.
    pub path: PathBuf,
    /// Raw query string without the leading `?`.
    pub query: String,
    pub headers: HeaderMap,
    pub cookies: HeaderMap,
    pub content: ContentFrame,
    pub user: Credentials,
    /// Captures of the route pattern; index 0 is the whole match.
    pub matches: Vec<String>,
    /// Peer address, or the value of the route's proxy header.
    pub address: String,
}

impl RequestFrame {
    /// Builds an outbound request; `target` may carry a query string.
    pub fn new(method: Method, target: &str) -> Self {
        let (location, query) = match target.split_once('?') {
            Some((location, query)) => (location, query),
            None => (target, ""),
        };

        Self {
            method,
            location: location.to_owned(),
            referrer: location.to_owned(),
            query: query.to_owned(),
            ..Self::default()
        }
    }

    /// Resets the frame between pipelined requests, removing uploaded files.
    pub fn cleanup(&mut self) {
        self.method = Method::Get;
        self.version = Version::Http11;
        self.location.clear();
        self.referrer.clear();
        self.path.clear();
        self.query.clear();
        self.headers.clear();
        self.cookies.clear();
        self.content.cleanup();
        self.user = Credentials::default();
        self.matches.clear();
    }

    /// Header value as it appeared on the wire (comma-split values rejoined).
    #[inline]
    pub fn get_header(&self, name: &str) -> Option<Cow<'_, str>> {
        match self.headers.get_all(name) {
            [] => None,
            [single] => Some(Cow::Borrowed(single.as_str())),
            many => Some(Cow::Owned(many.join(", "))),
        }
    }

    #[inline]
    pub fn get_cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name)
    }

    /// Decoded query parameters.
    pub fn query_args(&self, limit: usize) -> Result<Vec<(String, String)>, query::Error> {
        Query::parse(&self.query, limit)
    }

    /// Whether the peer asked to keep the connection open.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }

        match self.version {
            Version::Http11 => true,
            Version::Http10 => self.headers.has_token("Connection", "keep-alive"),
        }
    }

    /// Byte ranges from the `Range` header resolved against `size`, as
    /// inclusive `(start, end)` pairs.
    ///
    /// A missing or malformed header yields no ranges (the whole resource
    /// is served). Ranges starting past the end are dropped; if none is
    /// left the request is unsatisfiable. More than [`MAX_RANGES`] ranges
    /// are ignored as a whole.
    pub fn get_ranges(&self, size: u64) -> Result<Vec<(u64, u64)>, ErrorKind> {
        let Some(value) = self
            .get_header("Range")
            .and_then(|value| value.trim().strip_prefix("bytes=").map(str::to_owned))
        else {
            return Ok(Vec::new());
        };

        if value.split(',').count() > MAX_RANGES {
            return Ok(Vec::new());
        }

        let mut ranges = Vec::new();
        for item in value.split(',').map(str::trim) {
            let Some((start, end)) = item.split_once('-') else {
                return Ok(Vec::new());
            };
            let (start, end) = (start.trim(), end.trim());

            let range = match (start.parse::<u64>(), end.parse::<u64>()) {
                (Ok(start), Ok(end)) if start <= end => (start, end.min(size.saturating_sub(1))),
                (Ok(start), Err(_)) if end.is_empty() => (start, size.saturating_sub(1)),
                (Err(_), Ok(suffix)) if start.is_empty() && suffix > 0 => {
                    (size.saturating_sub(suffix), size.saturating_sub(1))
                }
                _ => return Ok(Vec::new()),
            };

            if range.0 < size {
                ranges.push(range);
            }
        }

        match ranges.is_empty() {
            true => Err(ErrorKind::RangeNotSatisfiable),
            false => Ok(ranges),
        }
    }

    /// The first requested range, see [`get_ranges`](Self::get_ranges).
    #[inline]
    pub fn get_range(&self, size: u64) -> Result<Option<(u64, u64)>, ErrorKind> {
        self.get_ranges(size).map(|ranges| ranges.first().copied())
    }

    /// Serializes the request line and headers for a client connection.
    pub fn compose(&self, buffer: &mut String) -> Result<(), ErrorKind> {
        let location = match self.location.is_empty() {
            true => "/",
            false => self.location.as_str(),
        };
        if location.bytes().any(|byte| byte <= b' ' || byte == 0x7f) {
            return Err(ErrorKind::InvalidUrl);
        }

        buffer.push_str(self.method.as_str());
        buffer.push(' ');
        buffer.push_str(location);
        if !self.query.is_empty() {
            buffer.push('?');
            buffer.push_str(&self.query);
        }
        buffer.push(' ');
        buffer.push_str(self.version.as_str());
        buffer.push_str("\r\n");

        for (name, values) in self.headers.iter() {
            for value in values {
                let _ = write!(buffer, "{name}: {value}\r\n");
            }
        }

        if !self.cookies.is_empty() {
            buffer.push_str("Cookie: ");
            for (index, (name, values)) in self.cookies.iter().enumerate() {
                if index > 0 {
                    buffer.push_str("; ");
                }
                let _ = write!(buffer, "{name}={}", values.first().map_or("", String::as_str));
            }
            buffer.push_str("\r\n");
        }

        buffer.push_str("\r\n");
        Ok(())
    }
}
