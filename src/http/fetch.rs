//! Options for one-shot outbound requests made with [`crate::client::fetch`].

use crate::http::{content::Resource, types::HeaderMap, types::Method};
use std::time::Duration;

/// Redirect chains longer than this always fail.
pub const MAX_REDIRECTS: usize = 128;

/// Request options for [`crate::client::fetch`].
///
/// # Examples
/// ```
/// use maker_net::{FetchFrame, Method};
///
/// let frame = FetchFrame::new(Method::Post)
///     .header("Content-Type", "application/json")
///     .body(r#"{"id":1}"#)
///     .max_redirects(3);
///
/// assert_eq!(frame.max_redirects, 3);
/// ```
#[derive(Debug, Clone)]
pub struct FetchFrame {
    pub method: Method,
    pub headers: HeaderMap,
    pub cookies: HeaderMap,
    pub body: Vec<u8>,
    /// Parts sent as `multipart/form-data` instead of `body`.
    pub resources: Vec<Resource>,
    /// Budget for connecting, sending and receiving.
    pub timeout: Duration,
    /// Largest response body kept in memory.
    pub max_size: usize,
    /// Redirects to follow; clamped to [`MAX_REDIRECTS`].
    pub max_redirects: usize,
}

impl Default for FetchFrame {
    fn default() -> Self {
        Self {
            method: Method::Get,
            headers: HeaderMap::new(),
            cookies: HeaderMap::new(),
            body: Vec::new(),
            resources: Vec::new(),
            timeout: Duration::from_secs(30),
            max_size: 64 * 1024 * 1024,
            max_redirects: 32,
        }
    }
}

impl FetchFrame {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn max_redirects(mut self, count: usize) -> Self {
        self.max_redirects = count.min(MAX_REDIRECTS);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let frame = FetchFrame::new(Method::Put)
            .header("Accept", "text/plain")
            .cookie("sid", "1")
            .cookie("sid", "2")
            .resource(Resource::from_memory("field", "value"))
            .max_redirects(1000);

        assert_eq!(frame.method, Method::Put);
        assert_eq!(frame.headers.get("accept"), Some("text/plain"));
        assert_eq!(frame.cookies.get_all("sid"), ["2".to_string()]);
        assert_eq!(frame.resources.len(), 1);
        assert_eq!(frame.max_redirects, MAX_REDIRECTS);
    }
}
