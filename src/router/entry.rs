//! Per-route configuration and callback slots.

use crate::{
    errors::ErrorKind,
    http::{
        request::{AuthType, Credentials},
        types::Method,
        web_codec::Opcode,
    },
    server::{connection::Connection, web_socket::WebSocketFrame},
};
use regex::Regex;
use std::{collections::HashMap, fmt, future::Future, path::PathBuf, pin::Pin, sync::Arc, time::Duration};

/// Future returned by request callbacks. Resolving to `true` means the
/// callback produced the response and default handling is skipped.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// `GET`/`POST`/... override.
pub type RequestCallback = Arc<dyn for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync>;
/// Appends raw `Name: value\r\n` lines to the response head.
pub type HeadersCallback = Arc<dyn Fn(&Connection, &mut String) -> bool + Send + Sync>;
/// Accepts or rejects decoded credentials.
pub type AuthorizeCallback = Arc<dyn Fn(&Connection, &Credentials) -> bool + Send + Sync>;
/// Decides whether an upgrade request is accepted; may add response headers.
pub type InitiateCallback = Arc<dyn Fn(&mut Connection) -> bool + Send + Sync>;
/// WebSocket open and close notifications.
pub type WebSocketCallback = Arc<dyn Fn(&Arc<WebSocketFrame>) + Send + Sync>;
/// One complete WebSocket message.
pub type ReceiveCallback = Arc<dyn Fn(&Arc<WebSocketFrame>, Opcode, &[u8]) + Send + Sync>;

/// WebSocket lifecycle callbacks, shared by server routes and clients.
#[derive(Clone, Default)]
pub struct WebSocketCallbacks {
    pub connect: Option<WebSocketCallback>,
    pub receive: Option<ReceiveCallback>,
    pub disconnect: Option<WebSocketCallback>,
}

/// Optional handler slots of a route.
#[derive(Clone, Default)]
pub struct RouteCallbacks {
    pub get: Option<RequestCallback>,
    pub post: Option<RequestCallback>,
    pub put: Option<RequestCallback>,
    pub patch: Option<RequestCallback>,
    pub delete: Option<RequestCallback>,
    pub options: Option<RequestCallback>,
    pub headers: Option<HeadersCallback>,
    pub authorize: Option<AuthorizeCallback>,
    pub web_socket_initiate: Option<InitiateCallback>,
    pub web_socket: WebSocketCallbacks,
}

impl RouteCallbacks {
    /// The override for `method`; `HEAD` shares the `GET` slot.
    pub fn for_method(&self, method: Method) -> Option<&RequestCallback> {
        match method {
            Method::Get | Method::Head => self.get.as_ref(),
            Method::Post => self.post.as_ref(),
            Method::Put => self.put.as_ref(),
            Method::Patch => self.patch.as_ref(),
            Method::Delete => self.delete.as_ref(),
            Method::Options => self.options.as_ref(),
        }
    }
}

impl fmt::Debug for RouteCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<&str> = [
            ("get", self.get.is_some()),
            ("post", self.post.is_some()),
            ("put", self.put.is_some()),
            ("patch", self.patch.is_some()),
            ("delete", self.delete.is_some()),
            ("options", self.options.is_some()),
            ("headers", self.headers.is_some()),
            ("authorize", self.authorize.is_some()),
            ("web_socket_initiate", self.web_socket_initiate.is_some()),
            ("web_socket_connect", self.web_socket.connect.is_some()),
            ("web_socket_receive", self.web_socket.receive.is_some()),
            ("web_socket_disconnect", self.web_socket.disconnect.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect();

        f.debug_tuple("RouteCallbacks").field(&set).finish()
    }
}

/// Content-encoding settings.
#[derive(Debug, Clone)]
pub struct Compression {
    pub enabled: bool,
    /// Smaller bodies are sent as is.
    pub min_length: usize,
    /// 0 (fastest) to 9 (smallest).
    pub quality_level: u32,
    /// zlib memory level; the deflate backend chooses its own.
    pub memory_level: u8,
    /// zlib strategy; the deflate backend chooses its own.
    pub tune: u8,
    /// File name patterns eligible for compression. Empty means the
    /// built-in list of textual types.
    pub files: Vec<Regex>,
}

impl Default for Compression {
    fn default() -> Self {
        Self {
            enabled: false,
            min_length: 1024,
            quality_level: 6,
            memory_level: 8,
            tune: 0,
            files: Vec::new(),
        }
    }
}

/// Authentication requirements.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub kind: AuthType,
    pub realm: String,
    /// Methods that require credentials. Empty means all but `OPTIONS`.
    pub methods: Vec<Method>,
}

/// Page served for error statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFile {
    /// `0` matches any error status.
    pub status_code: u16,
    /// Location under `files_directory`.
    pub pattern: String,
}

/// One route: a location pattern, its configuration and its callbacks.
///
/// # Examples
/// ```
/// use maker_net::MapRouter;
///
/// let mut router = MapRouter::new();
/// router.base.files_directory = "./public".into();
/// router.base.allow_directory_listing = true;
///
/// let route = router.route("/static", Default::default(), "/.*", true).unwrap();
/// assert!(route.allow_directory_listing);
/// assert_eq!(route.files_directory, std::path::Path::new("./public"));
/// ```
#[derive(Debug, Clone)]
pub struct RouterEntry {
    /// Compiled pattern, `None` on the base route (which matches anything).
    pub location: Option<Regex>,
    pub pattern: String,
    /// Higher levels are tried first.
    pub level: usize,

    pub files_directory: PathBuf,
    /// Replaces the request location before serving.
    pub alias: String,
    /// Answers every request with `302 Found` to this location.
    pub redirect: String,
    pub index_files: Vec<String>,
    /// Locations tried, in order, when the requested file is missing.
    pub try_files: Vec<String>,
    /// File name patterns answered with 404.
    pub hidden_files: Vec<Regex>,
    pub error_files: Vec<ErrorFile>,
    /// Extension (without dot) to MIME type, ahead of the built-in table.
    pub mime_types: HashMap<String, String>,
    pub disallowed_methods: Vec<Method>,
    pub compression: Compression,
    pub auth: Auth,
    /// `Cache-Control: max-age` for static files, in seconds; 0 omits it.
    pub static_file_max_age: u64,
    pub web_socket_timeout: Duration,
    pub allow_directory_listing: bool,
    pub allow_web_socket: bool,
    pub allow_send_file: bool,
    /// Header holding the client address when behind a proxy.
    pub proxy_ip_address: String,
    pub access_control_allow_origin: String,

    pub callbacks: RouteCallbacks,
}

impl Default for RouterEntry {
    fn default() -> Self {
        Self {
            location: None,
            pattern: String::new(),
            level: 0,
            files_directory: PathBuf::new(),
            alias: String::new(),
            redirect: String::new(),
            index_files: vec!["index.html".into(), "index.htm".into()],
            try_files: Vec::new(),
            hidden_files: Vec::new(),
            error_files: Vec::new(),
            mime_types: HashMap::new(),
            disallowed_methods: Vec::new(),
            compression: Compression::default(),
            auth: Auth::default(),
            static_file_max_age: 0,
            web_socket_timeout: Duration::from_secs(30),
            allow_directory_listing: false,
            allow_web_socket: false,
            allow_send_file: true,
            proxy_ip_address: String::new(),
            access_control_allow_origin: String::new(),
            callbacks: RouteCallbacks::default(),
        }
    }
}

impl RouterEntry {
    /// A route for `pattern` with default configuration.
    pub fn new(pattern: &str) -> Result<Self, ErrorKind> {
        let mut entry = Self::default();
        entry.set_pattern(pattern)?;
        Ok(entry)
    }

    /// A route for `pattern` inheriting every setting of `base` except
    /// its callbacks.
    pub fn from(base: &RouterEntry, pattern: &str) -> Result<Self, ErrorKind> {
        let mut entry = Self {
            callbacks: RouteCallbacks::default(),
            ..base.clone()
        };
        entry.level = 0;
        entry.set_pattern(pattern)?;
        Ok(entry)
    }

    fn set_pattern(&mut self, pattern: &str) -> Result<(), ErrorKind> {
        self.location = Some(Regex::new(pattern).map_err(|err| ErrorKind::InvalidPattern(err.to_string()))?);
        self.pattern = pattern.to_owned();
        Ok(())
    }

    /// A pattern without regex syntax.
    #[inline]
    pub fn is_literal(&self) -> bool {
        regex::escape(&self.pattern) == self.pattern
    }

    /// Whether requests with `method` must carry credentials.
    pub fn requires_auth(&self, method: Method) -> bool {
        self.auth.kind != AuthType::None
            && method != Method::Options
            && (self.auth.methods.is_empty() || self.auth.methods.contains(&method))
    }

    /// Methods the route answers to, for `Allow`.
    pub fn allowed_methods(&self) -> impl Iterator<Item = Method> + '_ {
        Method::ALL
            .into_iter()
            .filter(move |method| !self.disallowed_methods.contains(method))
    }

    pub fn on_get<F>(&mut self, callback: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.callbacks.get = Some(Arc::new(callback));
        self
    }

    pub fn on_post<F>(&mut self, callback: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.callbacks.post = Some(Arc::new(callback));
        self
    }

    pub fn on_put<F>(&mut self, callback: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.callbacks.put = Some(Arc::new(callback));
        self
    }

    pub fn on_patch<F>(&mut self, callback: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.callbacks.patch = Some(Arc::new(callback));
        self
    }

    pub fn on_delete<F>(&mut self, callback: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.callbacks.delete = Some(Arc::new(callback));
        self
    }

    pub fn on_options<F>(&mut self, callback: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Connection) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.callbacks.options = Some(Arc::new(callback));
        self
    }

    pub fn on_headers<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Connection, &mut String) -> bool + Send + Sync + 'static,
    {
        self.callbacks.headers = Some(Arc::new(callback));
        self
    }

    pub fn on_authorize<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Connection, &Credentials) -> bool + Send + Sync + 'static,
    {
        self.callbacks.authorize = Some(Arc::new(callback));
        self
    }

    pub fn on_web_socket_initiate<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&mut Connection) -> bool + Send + Sync + 'static,
    {
        self.callbacks.web_socket_initiate = Some(Arc::new(callback));
        self
    }

    pub fn on_web_socket_connect<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Arc<WebSocketFrame>) + Send + Sync + 'static,
    {
        self.allow_web_socket = true;
        self.callbacks.web_socket.connect = Some(Arc::new(callback));
        self
    }

    pub fn on_web_socket_receive<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Arc<WebSocketFrame>, Opcode, &[u8]) + Send + Sync + 'static,
    {
        self.allow_web_socket = true;
        self.callbacks.web_socket.receive = Some(Arc::new(callback));
        self
    }

    pub fn on_web_socket_disconnect<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Arc<WebSocketFrame>) + Send + Sync + 'static,
    {
        self.allow_web_socket = true;
        self.callbacks.web_socket.disconnect = Some(Arc::new(callback));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inheritance() {
        let mut base = RouterEntry::default();
        base.files_directory = "/srv".into();
        base.level = 3;
        base.compression.enabled = true;
        base.on_get(|_| Box::pin(async { true }));

        let entry = RouterEntry::from(&base, "^/api/(\\d+)$").unwrap();
        assert_eq!(entry.files_directory, PathBuf::from("/srv"));
        assert!(entry.compression.enabled);
        assert_eq!(entry.level, 0);
        assert!(entry.callbacks.get.is_none());
        assert!(!entry.is_literal());

        assert!(RouterEntry::new("/about").unwrap().is_literal());
        assert!(matches!(RouterEntry::new("(/x"), Err(ErrorKind::InvalidPattern(_))));
    }

    #[test]
    fn auth_and_methods() {
        let mut entry = RouterEntry::default();
        assert!(!entry.requires_auth(Method::Get));

        entry.auth.kind = AuthType::Basic;
        assert!(entry.requires_auth(Method::Get));
        assert!(!entry.requires_auth(Method::Options));

        entry.auth.methods = vec![Method::Post];
        assert!(!entry.requires_auth(Method::Get));
        assert!(entry.requires_auth(Method::Post));

        entry.disallowed_methods = vec![Method::Put, Method::Delete];
        let allowed: Vec<Method> = entry.allowed_methods().collect();
        assert!(!allowed.contains(&Method::Put));
        assert!(allowed.contains(&Method::Get));
    }
}
