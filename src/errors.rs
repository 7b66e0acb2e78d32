//! Error taxonomy shared by the parser, the codec, the server and the client.

use crate::query;
use std::{fmt, io};
use thiserror::Error;

/// Every failure the engine can surface.
///
/// Variants fall into five groups: parse errors, transport errors,
/// resource errors, policy errors and WebSocket errors. Each one maps to
/// an HTTP status through [`ErrorKind::status`], which is what a server
/// connection answers with before closing.
#[derive(Debug, Error, PartialEq)]
pub enum ErrorKind {
    #[error("malformed request line")]
    InvalidRequestLine,
    #[error("unknown HTTP method")]
    InvalidMethod,
    #[error("invalid request target")]
    InvalidUrl,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("malformed status line")]
    InvalidStatusLine,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("header block exceeds the configured size")]
    HeadersTooLarge,
    #[error("too many header lines")]
    TooManyHeaders,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("malformed chunked body")]
    InvalidChunk,
    #[error("malformed multipart body")]
    InvalidMultipart,
    #[error("invalid query string: {0}")]
    Query(query::Error),

    #[error("socket operation timed out")]
    Timeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("i/o failure: {0}")]
    Io(IoError),

    #[error("resource not found")]
    NotFound,
    #[error("resource cannot be stored")]
    Unprocessable,
    #[error("resource is unavailable")]
    ResourceUnavailable,

    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("authorization required")]
    Unauthorized,
    #[error("access forbidden")]
    Forbidden,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("too many uploaded resources")]
    TooManyResources,
    #[error("requested range not satisfiable")]
    RangeNotSatisfiable,
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("invalid route pattern: {0}")]
    InvalidPattern(String),

    #[error("websocket handshake failed")]
    HandshakeFailed,
    #[error("websocket protocol violation: {0}")]
    WebSocket(&'static str),
    #[error("websocket message too large")]
    MessageTooLarge,

    #[error("service temporarily unavailable")]
    ServiceUnavailable,
}

macro_rules! error_statuses {
    ($($name:ident => $status:literal, $code:literal;)*) => {
        impl ErrorKind {
            /// HTTP status answered when this error ends a request.
            pub const fn status(&self) -> u16 {
                match self { $(Self::$name { .. } => $status,)* }
            }

            /// Stable machine-readable tag, sent in the `X-Error` header.
            pub const fn code(&self) -> &'static str {
                match self { $(Self::$name { .. } => $code,)* }
            }
        }
    };
}

error_statuses! {
    InvalidRequestLine => 400, "INVALID_REQUEST_LINE";
    InvalidMethod => 400, "INVALID_METHOD";
    InvalidUrl => 400, "INVALID_URL";
    UnsupportedVersion => 505, "UNSUPPORTED_VERSION";
    InvalidStatusLine => 502, "INVALID_STATUS_LINE";
    InvalidHeader => 400, "INVALID_HEADER";
    HeadersTooLarge => 431, "HEADERS_TOO_LARGE";
    TooManyHeaders => 431, "TOO_MANY_HEADERS";
    InvalidContentLength => 400, "INVALID_CONTENT_LENGTH";
    InvalidChunk => 400, "INVALID_CHUNK";
    InvalidMultipart => 400, "INVALID_MULTIPART";
    Query => 400, "INVALID_QUERY";

    Timeout => 408, "TIMEOUT";
    ConnectionClosed => 400, "CONNECTION_CLOSED";
    Io => 500, "IO_ERROR";

    NotFound => 404, "NOT_FOUND";
    Unprocessable => 422, "UNPROCESSABLE";
    ResourceUnavailable => 500, "RESOURCE_UNAVAILABLE";

    MethodNotAllowed => 405, "METHOD_NOT_ALLOWED";
    Unauthorized => 401, "UNAUTHORIZED";
    Forbidden => 403, "FORBIDDEN";
    PayloadTooLarge => 413, "PAYLOAD_TOO_LARGE";
    TooManyResources => 413, "TOO_MANY_RESOURCES";
    RangeNotSatisfiable => 416, "RANGE_NOT_SATISFIABLE";
    TooManyRedirects => 508, "TOO_MANY_REDIRECTS";
    InvalidPattern => 500, "INVALID_PATTERN";

    HandshakeFailed => 400, "HANDSHAKE_FAILED";
    WebSocket => 400, "WEBSOCKET_PROTOCOL";
    MessageTooLarge => 413, "MESSAGE_TOO_LARGE";

    ServiceUnavailable => 503, "SERVICE_UNAVAILABLE";
}

impl ErrorKind {
    /// Transport failures end the connection silently: there is no
    /// peer left to answer.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionClosed | Self::Io(_))
    }
}

impl From<query::Error> for ErrorKind {
    fn from(err: query::Error) -> Self {
        ErrorKind::Query(err)
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ErrorKind::ConnectionClosed,
            _ => ErrorKind::Io(IoError(err)),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ErrorKind {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ErrorKind::Timeout
    }
}

/// `io::Error` wrapper comparable by kind, so results can be asserted on.
#[derive(Debug)]
pub struct IoError(pub io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Canned answer of the overflow workers, written without a connection.
pub(crate) const SERVICE_UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
    Connection: close\r\n\
    Content-Length: 0\r\n\
    X-Error: SERVICE_UNAVAILABLE\r\n\r\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        #[rustfmt::skip]
        let cases = [
            (ErrorKind::InvalidMethod,      400, "INVALID_METHOD"),
            (ErrorKind::HeadersTooLarge,    431, "HEADERS_TOO_LARGE"),
            (ErrorKind::PayloadTooLarge,    413, "PAYLOAD_TOO_LARGE"),
            (ErrorKind::Unauthorized,       401, "UNAUTHORIZED"),
            (ErrorKind::TooManyRedirects,   508, "TOO_MANY_REDIRECTS"),
            (ErrorKind::WebSocket("rsv"),   400, "WEBSOCKET_PROTOCOL"),
            (ErrorKind::Query(query::Error::Empty), 400, "INVALID_QUERY"),
        ];

        for (err, status, code) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn io_conversion() {
        let closed: ErrorKind = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(closed, ErrorKind::ConnectionClosed);
        assert!(closed.is_transport());

        let timeout: ErrorKind = io::Error::from(io::ErrorKind::TimedOut).into();
        assert_eq!(timeout, ErrorKind::Timeout);

        let other: ErrorKind = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert_eq!(other.status(), 500);
        assert!(!ErrorKind::NotFound.is_transport());
    }
}
