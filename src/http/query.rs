//! URL query strings and `application/x-www-form-urlencoded` bodies.

use memchr::memchr;
use std::{error, fmt};

/// Query string parser with percent-decoding.
///
/// # Examples
/// ```rust
/// use maker_net::query::Query;
///
/// let params = Query::parse("name=john%20doe&age=25&city", 10).unwrap();
/// assert_eq!(params.len(), 3);
/// assert_eq!(params[0], ("name".to_string(), "john doe".to_string()));
/// assert_eq!(params[2], ("city".to_string(), String::new()));
///
/// // Handle limits
/// assert!(Query::parse("a=1&b=2", 1).is_err());
/// ```
pub struct Query;

impl Query {
    /// Parses `query` (an optional leading `?` is skipped) into ordered
    /// `(key, value)` pairs. `+` decodes to a space.
    ///
    /// Empty segments (`a=1&&b=2`) are skipped.
    pub fn parse(query: &str, limit: usize) -> Result<Vec<(String, String)>, Error> {
        let data = query.strip_prefix('?').unwrap_or(query).as_bytes();
        if data.is_empty() {
            return Err(Error::Empty);
        }

        let mut result = Vec::new();
        let mut start = 0;
        while start < data.len() {
            let end = memchr(b'&', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());

            if end > start {
                if result.len() >= limit {
                    return Err(Error::OverLimit(limit));
                }

                let segment = &data[start..end];
                let (key, value) = match memchr(b'=', segment) {
                    Some(index) => (&segment[..index], &segment[index + 1..]),
                    None => (segment, &b""[..]),
                };

                result.push((decode(key, true)?, decode(value, true)?));
            }
            start = end + 1;
        }

        Ok(result)
    }

    /// Percent-encodes `value` for use inside a query string or form body.
    pub fn encode(value: &str) -> String {
        let mut result = String::with_capacity(value.len());
        for &byte in value.as_bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    result.push(byte as char)
                }
                _ => {
                    result.push('%');
                    result.push(HEX[(byte >> 4) as usize] as char);
                    result.push(HEX[(byte & 0x0f) as usize] as char);
                }
            }
        }
        result
    }
}

const HEX: &[u8; 16] = b"0123456789ABCDEF";

#[inline(always)]
fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Percent-decodes `src`; `plus_as_space` enables form semantics.
///
/// Fails on truncated escapes and on results that are not UTF-8.
pub fn decode(src: &[u8], plus_as_space: bool) -> Result<String, Error> {
    if memchr(b'%', src).is_none() && !(plus_as_space && memchr(b'+', src).is_some()) {
        return simdutf8::basic::from_utf8(src)
            .map(str::to_owned)
            .map_err(|_| Error::Encoding);
    }

    let mut result = Vec::with_capacity(src.len());
    let mut index = 0;
    while index < src.len() {
        match src[index] {
            b'%' => {
                let high = src.get(index + 1).copied().and_then(hex_value);
                let low = src.get(index + 2).copied().and_then(hex_value);
                match (high, low) {
                    (Some(high), Some(low)) => result.push(high << 4 | low),
                    _ => return Err(Error::Encoding),
                }
                index += 3;
            }
            b'+' if plus_as_space => {
                result.push(b' ');
                index += 1;
            }
            byte => {
                result.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8(result).map_err(|_| Error::Encoding)
}

/// Error types that can occur during query parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The number of parameters exceeded the specified limit.
    OverLimit(usize),

    /// The query string is empty or contains only a '?' character.
    Empty,

    /// A `%` escape is truncated or the decoded bytes are not UTF-8.
    Encoding,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OverLimit(limit) => {
                write!(f, "Query parameter limit exceeded: limit={}", limit)
            }
            Error::Empty => {
                write!(f, "Query string is empty or contains no parameters")
            }
            Error::Encoding => write!(f, "Invalid percent-encoding"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(src: &[(&str, &str)]) -> Vec<(String, String)> {
        src.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse() {
        #[rustfmt::skip]
        let cases = [
            ("a=1&b=2",              pairs(&[("a", "1"), ("b", "2")])),
            ("?a=1&b=2",             pairs(&[("a", "1"), ("b", "2")])),
            ("flag&empty=&=val",     pairs(&[("flag", ""), ("empty", ""), ("", "val")])),
            ("a=1&&b=2&",            pairs(&[("a", "1"), ("b", "2")])),
            ("q=hello+world%21",     pairs(&[("q", "hello world!")])),
            ("mail=user%40host.com", pairs(&[("mail", "user@host.com")])),
            ("k%C3%A9y=%E2%9C%93",   pairs(&[("kéy", "✓")])),
        ];

        for (line, expected) in cases {
            assert_eq!(Query::parse(line, 8), Ok(expected), "{line}");
        }
    }

    #[test]
    fn errors() {
        assert_eq!(Query::parse("a&a", 1), Err(Error::OverLimit(1)));
        assert_eq!(Query::parse("", 10), Err(Error::Empty));
        assert_eq!(Query::parse("?", 10), Err(Error::Empty));
        assert_eq!(Query::parse("a=%4", 10), Err(Error::Encoding));
        assert_eq!(Query::parse("a=%ff", 10), Err(Error::Encoding));
    }

    #[test]
    fn encode_decode() {
        let src = "a b/c?d=é";
        let encoded = Query::encode(src);

        assert_eq!(encoded, "a%20b%2Fc%3Fd%3D%C3%A9");
        assert_eq!(decode(encoded.as_bytes(), false).as_deref(), Ok(src));
        assert_eq!(decode(b"a+b", false).as_deref(), Ok("a+b"));
    }
}
