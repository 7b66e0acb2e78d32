//! Response messages and cookies.

use crate::{
    errors::ErrorKind,
    http::{
        content::ContentFrame,
        types::{HeaderMap, StatusCode, Version},
    },
    BodyWriter, WriteBuffer,
};
use std::fmt::Write;

/// A `Set-Cookie` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// `Strict`, `Lax` or `None`; empty to omit.
    pub same_site: String,
    /// Pre-formatted RFC 1123 date; empty for a session cookie.
    pub expires: String,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_owned(),
            value: value.to_owned(),
            ..Self::default()
        }
    }

    /// Appends the `Set-Cookie` value (without the header name).
    pub fn compose(&self, buffer: &mut String) {
        let _ = write!(buffer, "{}={}", self.name, self.value);
        if !self.domain.is_empty() {
            let _ = write!(buffer, "; Domain={}", self.domain);
        }
        if !self.path.is_empty() {
            let _ = write!(buffer, "; Path={}", self.path);
        }
        if !self.expires.is_empty() {
            let _ = write!(buffer, "; Expires={}", self.expires);
        }
        if !self.same_site.is_empty() {
            let _ = write!(buffer, "; SameSite={}", self.same_site);
        }
        if self.secure {
            buffer.push_str("; Secure");
        }
        if self.http_only {
            buffer.push_str("; HttpOnly");
        }
    }

    /// Parses a `Set-Cookie` value; unknown attributes are ignored.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie::new(name, value.trim());
        for attribute in parts {
            let (key, value) = match attribute.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (attribute.trim(), ""),
            };

            match key.to_ascii_lowercase().as_str() {
                "domain" => cookie.domain = value.to_owned(),
                "path" => cookie.path = value.to_owned(),
                "expires" => cookie.expires = value.to_owned(),
                "samesite" => cookie.same_site = value.to_owned(),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }
        Some(cookie)
    }
}

/// HTTP response built by route callbacks or read by a client.
///
/// Provides a fluent interface for the common cases; every field stays
/// public for everything else. `Content-Length`, `Date` and connection
/// headers are added by the connection when the response is composed.
///
/// # Examples
/// ```
/// use maker_net::{Cookie, ResponseFrame, StatusCode};
///
/// let mut resp = ResponseFrame::new();
/// resp.status(StatusCode::Ok)
///     .header("Content-Type", "text/html")
///     .set_cookie(Cookie::new("sid", "42"))
///     .body("<h1>Hello World</h1>");
///
/// assert_eq!(resp.status_code, Some(200));
/// assert_eq!(resp.content.data, b"<h1>Hello World</h1>");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ResponseFrame {
    /// `None` until a status is chosen.
    pub status_code: Option<u16>,
    pub version: Version,
    pub headers: HeaderMap,
    /// Unique by name; see [`set_cookie`](Self::set_cookie).
    pub cookies: Vec<Cookie>,
    /// The response reports a failure produced by the engine.
    pub error: bool,
    pub content: ContentFrame,
}

impl ResponseFrame {
    #[inline(always)]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status_code = Some(status.as_u16());
        self
    }

    /// Sets any numeric status, registered or not.
    #[inline]
    pub fn set_status(&mut self, code: u16) -> &mut Self {
        self.status_code = Some(code);
        self
    }

    /// Replaces the values of a header.
    #[inline]
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the body.
    pub fn body<T: WriteBuffer>(&mut self, data: T) -> &mut Self {
        self.content.data.clear();
        data.write_to(&mut self.content.data);
        self.content.length = self.content.data.len();
        self.content.limited = true;
        self
    }

    /// Replaces the body with whatever the closure writes.
    ///
    /// ```
    /// use maker_net::{ResponseFrame, StatusCode};
    /// use std::io::Write;
    ///
    /// let mut resp = ResponseFrame::new();
    /// resp.status(StatusCode::Ok).body_with(|w| {
    ///     w.write("user_");
    ///     w.write(123);
    ///     let _ = write!(w, "_online:{}", true);
    /// });
    /// assert_eq!(resp.content.data, b"user_123_online:true");
    /// ```
    pub fn body_with<F: FnOnce(&mut BodyWriter)>(&mut self, f: F) -> &mut Self {
        self.content.data.clear();
        f(&mut BodyWriter(&mut self.content.data));
        self.content.length = self.content.data.len();
        self.content.limited = true;
        self
    }

    /// Turns the response into an engine error report.
    pub fn set_error(&mut self, err: &ErrorKind) -> &mut Self {
        self.status_code = Some(err.status());
        self.error = true;
        self.headers.insert("X-Error", err.code());
        self
    }

    /// Adds a cookie, replacing any previous one with the same name.
    pub fn set_cookie(&mut self, cookie: Cookie) -> &mut Self {
        match self.cookies.iter_mut().find(|c| c.name == cookie.name) {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
        self
    }

    #[inline]
    pub fn get_cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    #[inline(always)]
    pub const fn is_undefined(&self) -> bool {
        self.status_code.is_none()
    }

    /// Status below 400.
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self.status_code, Some(code) if code < 400)
    }

    pub fn cleanup(&mut self) {
        self.status_code = None;
        self.version = Version::Http11;
        self.headers.clear();
        self.cookies.clear();
        self.error = false;
        self.content.cleanup();
    }

    #[inline]
    pub(crate) const fn number_to_bytes(mut n: u128) -> ([u8; 39], usize) {
        let mut buffer = [b'0'; 39];
        let mut i = 39;

        if n == 0 {
            return (buffer, 38);
        }

        while n > 0 {
            i -= 1;
            buffer[i] = b'0' + (n % 10) as u8;
            n /= 10;
        }

        (buffer, i)
    }
}

pub mod write {
    use super::*;
    use std::{borrow::Cow, rc::Rc, sync::Arc};

    /// Writer handed to [`ResponseFrame::body_with`].
    ///
    /// Accepts any [`WriteBuffer`] value and implements [`std::io::Write`].
    #[derive(Debug)]
    pub struct BodyWriter<'a>(pub(crate) &'a mut Vec<u8>);

    impl BodyWriter<'_> {
        /// Appends content to the response body.
        #[inline]
        pub fn write<T: WriteBuffer>(&mut self, value: T) {
            value.write_to(self.0);
        }
    }

    impl std::io::Write for BodyWriter<'_> {
        #[inline]
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        #[inline]
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Values that can be written into a message body.
    ///
    /// Implemented for strings, bytes, booleans, chars and integer types.
    /// Floating-point numbers are left out on purpose: format them
    /// yourself with the precision you need.
    ///
    /// # Example
    /// ```
    /// use maker_net::WriteBuffer;
    ///
    /// struct MyString(String);
    ///
    /// impl WriteBuffer for MyString {
    ///     fn write_to(&self, buffer: &mut Vec<u8>) {
    ///         buffer.extend_from_slice(self.0.as_bytes())
    ///     }
    /// }
    /// ```
    pub trait WriteBuffer {
        /// Writes the value's representation directly to the buffer.
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (bytes, $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let closure = $conn;
                    closure(self, buffer);
                }
            })*
        };
        (number($type:ty), $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    $conn(*self as $type, buffer);
                }
            })*
        };
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }
    impl WriteBuffer for str {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self.as_bytes());
        }
    }
    impl WriteBuffer for [u8] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        bytes, |value: &str, buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value.as_bytes());
        } => String, Box<str>, Cow<'_, str>, Arc<str>, Rc<str>
    }
    impl_write_buffer! {
        bytes, |value: &[u8], buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value);
        } => Vec<u8>, Box<[u8]>, Cow<'_, [u8]>, Arc<[u8]>, Rc<[u8]>
    }
    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        number(u128), write_unsigned => u8, u16, u32, u64, u128, usize
    }
    impl_write_buffer! {
        number(i128), write_signed => i8, i16, i32, i64, i128, isize
    }
    impl WriteBuffer for bool {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(match self {
                true => b"true",
                false => b"false",
            });
        }
    }
    impl WriteBuffer for char {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            let mut buf = [0u8; 4];
            buffer.extend_from_slice(self.encode_utf8(&mut buf).as_bytes());
        }
    }

    #[inline(always)]
    fn write_unsigned(value: u128, buffer: &mut Vec<u8>) {
        let (arr, start) = ResponseFrame::number_to_bytes(value);
        buffer.extend_from_slice(&arr[start..]);
    }

    #[inline(always)]
    fn write_signed(value: i128, buffer: &mut Vec<u8>) {
        if value < 0 {
            buffer.push(b'-');
        }

        let (arr, start) = ResponseFrame::number_to_bytes(value.unsigned_abs());
        buffer.extend_from_slice(&arr[start..]);
    }
}

#[cfg(test)]
mod cookie_tests {
    use super::*;

    #[test]
    fn compose() {
        #[rustfmt::skip]
        let cases = [
            (Cookie::new("sid", "42"), "sid=42"),
            (
                Cookie {
                    domain: "example.com".into(),
                    path: "/".into(),
                    expires: "Wed, 21 Oct 2015 07:28:00 GMT".into(),
                    same_site: "Lax".into(),
                    secure: true,
                    http_only: true,
                    ..Cookie::new("sid", "42")
                },
                "sid=42; Domain=example.com; Path=/; Expires=Wed, 21 Oct 2015 07:28:00 GMT; \
                 SameSite=Lax; Secure; HttpOnly",
            ),
        ];

        for (cookie, expected) in cases {
            let mut buffer = String::new();
            cookie.compose(&mut buffer);
            assert_eq!(buffer, expected);

            assert_eq!(Cookie::parse(&buffer), Some(cookie));
        }
    }

    #[test]
    fn parse_invalid() {
        assert_eq!(Cookie::parse("novalue"), None);
        assert_eq!(Cookie::parse("=x"), None);
        assert_eq!(
            Cookie::parse("a=b; unknown; max-age=3").map(|c| c.value),
            Some("b".to_string())
        );
    }
}

#[cfg(test)]
mod builder_tests {
    use super::*;

    #[test]
    fn fluent() {
        let mut resp = ResponseFrame::new();
        assert!(resp.is_undefined());

        resp.status(StatusCode::Created)
            .header("X-Id", "1")
            .header("x-id", "2")
            .body(42u32);

        assert_eq!(resp.status_code, Some(201));
        assert_eq!(resp.headers.get_all("X-Id"), ["2".to_string()]);
        assert_eq!(resp.content.data, b"42");
        assert_eq!(resp.content.length, 2);
        assert!(resp.is_ok());
    }

    #[test]
    fn body_values() {
        #[rustfmt::skip]
        let cases: [(fn(&mut ResponseFrame), &[u8]); 6] = [
            (|r: &mut ResponseFrame| { r.body("text"); },            b"text"),
            (|r: &mut ResponseFrame| { r.body(String::from("s")); }, b"s"),
            (|r: &mut ResponseFrame| { r.body(&b"\x00\x01"[..]); },  b"\x00\x01"),
            (|r: &mut ResponseFrame| { r.body(-17i64); },            b"-17"),
            (|r: &mut ResponseFrame| { r.body(0usize); },            b"0"),
            (|r: &mut ResponseFrame| { r.body('✓'); },               "✓".as_bytes()),
        ];

        for (write, expected) in cases {
            let mut resp = ResponseFrame::new();
            write(&mut resp);
            assert_eq!(resp.content.data, expected);
        }
    }

    #[test]
    fn cookies_are_unique() {
        let mut resp = ResponseFrame::new();
        resp.set_cookie(Cookie::new("a", "1"))
            .set_cookie(Cookie::new("b", "2"))
            .set_cookie(Cookie::new("a", "3"));

        assert_eq!(resp.cookies.len(), 2);
        assert_eq!(resp.get_cookie("a").map(|c| c.value.as_str()), Some("3"));
    }

    #[test]
    fn errors() {
        let mut resp = ResponseFrame::new();
        resp.set_error(&ErrorKind::PayloadTooLarge);

        assert_eq!(resp.status_code, Some(413));
        assert!(resp.error);
        assert!(!resp.is_ok());
        assert_eq!(resp.headers.get("x-error"), Some("PAYLOAD_TOO_LARGE"));

        resp.cleanup();
        assert!(resp.is_undefined());
        assert!(!resp.error);
    }
}
