//! Outbound HTTP/1.1: a single-connection [`Client`], a keep-alive
//! [`Pool`] and the one-shot [`fetch`] helper.
//!
//! Only plain `http://` URLs are handled; TLS belongs to the stream
//! handed to [`Client::from_stream`].

use crate::{
    errors::ErrorKind,
    http::{
        content::Resource,
        fetch::{FetchFrame, MAX_REDIRECTS},
        parser::{Chunked, Parser, Progress},
        request::RequestFrame,
        response::ResponseFrame,
        types::{Method, Version},
        web_codec::{accept_key, generate_key, Role, WebCodec},
    },
    limits::{ConnLimits, ReqLimits, RespLimits, WebSocketLimits},
    net::{Socket, Stream},
    router::entry::WebSocketCallbacks,
    server::{
        connection::has_body,
        utils,
        web_socket::{self, WebSocketFrame},
    },
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::net::TcpStream;

/// How the body of the current response ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(usize),
    Chunked,
    UntilClose,
    Done,
}

/// One client connection.
///
/// [`send`](Self::send) writes a request and reads the response head
/// into [`response`](Self::response); [`fetch`](Self::fetch) then reads
/// the body.
///
/// # Examples
/// ```no_run
/// # async fn run() -> Result<(), maker_net::ErrorKind> {
/// use maker_net::{client::Client, Method, RequestFrame};
///
/// let mut client = Client::connect("127.0.0.1", 8080).await?;
/// client.send(RequestFrame::new(Method::Get, "/status")).await?;
/// client.fetch().await?;
/// println!("{}", client.response.content.get_text());
/// # Ok(())
/// # }
/// ```
pub struct Client {
    pub response: ResponseFrame,
    /// Idle limit of an upgraded tunnel.
    pub web_socket_timeout: Duration,
    /// Largest response body [`fetch`](Self::fetch) keeps in memory.
    pub max_size: usize,

    socket: Socket,
    parser: Parser,
    buffer: Vec<u8>,
    framing: Framing,
    /// The peer closed its side.
    closed: bool,
    host: String,
    port: u16,
    req_limits: ReqLimits,
    web_socket_limits: WebSocketLimits,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("framing", &self.framing)
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Opens a TCP connection to `host:port` with default limits.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ErrorKind> {
        let limits = ConnLimits::default();
        let stream = tokio::time::timeout(limits.socket_write_timeout, TcpStream::connect((host, port))).await??;
        Ok(Self::from_stream(stream, host, port))
    }

    /// Runs over an established stream; `host` and `port` fill the
    /// `Host` header.
    pub fn from_stream<S: Stream>(stream: S, host: &str, port: u16) -> Self {
        let conn_limits = ConnLimits::default();
        let req_limits = ReqLimits::default();

        Self {
            response: ResponseFrame::new(),
            web_socket_timeout: Duration::from_secs(30),
            max_size: req_limits.max_request_size,

            socket: Socket::new(stream, &conn_limits, req_limits.max_net_buffer),
            parser: Parser::new(&req_limits),
            buffer: Vec::new(),
            framing: Framing::Done,
            closed: false,
            host: host.to_owned(),
            port,
            req_limits,
            web_socket_limits: WebSocketLimits::default(),
        }
    }

    /// `host:port` this client talks to; the pool key.
    #[inline]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Writes `request` and reads the response head.
    ///
    /// `Host`, `Accept`, `Content-Length` and `Connection` are filled in
    /// when absent. With `request.content.resources` set the body is sent
    /// as `multipart/form-data`, files streamed from disk; otherwise
    /// `request.content.data` is the body.
    pub async fn send(&mut self, mut request: RequestFrame) -> Result<(), ErrorKind> {
        if self.framing != Framing::Done {
            return Err(ErrorKind::ResourceUnavailable);
        }
        self.response.cleanup();
        self.parser.prepare_for_next();

        let resources = std::mem::take(&mut request.content.resources);
        let boundary = utils::generate_boundary();
        let parts = match resources.is_empty() {
            true => Vec::new(),
            false => multipart_parts(&resources, &boundary).await?,
        };

        let headers = &mut request.headers;
        if !headers.contains("Host") {
            let host = match self.port {
                80 => self.host.clone(),
                port => format!("{}:{port}", self.host),
            };
            headers.insert("Host", &host);
        }
        if !headers.contains("Accept") {
            headers.insert("Accept", "*/*");
        }
        if !headers.contains("Connection") {
            headers.insert("Connection", "Keep-Alive");
        }

        let length = match parts.is_empty() {
            true => request.content.data.len() as u64,
            false => {
                request
                    .headers
                    .insert("Content-Type", &format!("multipart/form-data; boundary={boundary}"));
                parts.iter().map(|part| part.length()).sum::<u64>() + closing(&boundary).len() as u64
            }
        };
        let sends_body = length > 0 || matches!(request.method, Method::Post | Method::Put | Method::Patch);
        if sends_body && !request.headers.contains("Content-Length") {
            request.headers.insert("Content-Length", &length.to_string());
        }

        let mut head = String::new();
        request.compose(&mut head)?;
        self.socket.write_queued(head.as_bytes()).await?;

        match parts.is_empty() {
            true => self.socket.write_queued(&request.content.data).await?,
            false => {
                for part in &parts {
                    self.write_part(part).await?;
                }
                self.socket.write_queued(closing(&boundary).as_bytes()).await?;
            }
        }
        self.socket.flush().await?;

        tracing::debug!(method = request.method.as_str(), location = %request.location, host = %self.host, "request sent");
        self.read_head(request.method).await
    }

    async fn write_part(&mut self, part: &Part<'_>) -> Result<(), ErrorKind> {
        self.socket.write_queued(part.head.as_bytes()).await?;

        match part.resource.is_in_memory {
            true => self.socket.write_queued(&part.resource.contents).await?,
            false => {
                let mut file = tokio::fs::File::open(&part.resource.path).await?;
                let sent = self
                    .socket
                    .write_file_queued(&mut file, 0, part.size, RespLimits::default().file_chunk_size)
                    .await?;
                if sent != part.size {
                    return Err(ErrorKind::ResourceUnavailable);
                }
            }
        }

        self.socket.write_queued(b"\r\n").await
    }

    async fn read_head(&mut self, method: Method) -> Result<(), ErrorKind> {
        let mut scanned = 0;

        loop {
            if !self.buffer.is_empty() {
                if let Progress::Complete(end) = self.parser.parse_response(&self.buffer, scanned, &mut self.response)? {
                    self.buffer.drain(..end);
                    scanned = 0;

                    let status = self.response.status_code.unwrap_or(0);
                    if (100..200).contains(&status) && status != 101 {
                        self.response.cleanup();
                        continue;
                    }
                    break;
                }
                scanned = self.buffer.len();
            }

            if self.socket.read_queued(&mut self.buffer, self.req_limits.max_net_buffer).await? == 0 {
                return Err(ErrorKind::ConnectionClosed);
            }
        }

        let status = self.response.status_code.unwrap_or(0);
        let headers = &self.response.headers;
        self.framing = if method == Method::Head || !has_body(status) {
            Framing::Done
        } else if headers.has_token("Transfer-Encoding", "chunked") {
            self.parser.prepare_for_chunked();
            Framing::Chunked
        } else if let Some(value) = headers.get("Content-Length") {
            let length = value.trim().parse().map_err(|_| ErrorKind::InvalidContentLength)?;
            Framing::Length(length)
        } else {
            Framing::UntilClose
        };
        Ok(())
    }

    /// Appends the next piece of the response body to `out`; `false`
    /// once the body is complete.
    pub async fn fetch_next(&mut self, out: &mut Vec<u8>) -> Result<bool, ErrorKind> {
        loop {
            match self.framing {
                Framing::Done => return Ok(false),
                Framing::Length(0) => {
                    self.framing = Framing::Done;
                    return Ok(false);
                }
                Framing::Length(remaining) => {
                    self.fill().await?;
                    let take = remaining.min(self.buffer.len());
                    out.extend(self.buffer.drain(..take));
                    self.framing = Framing::Length(remaining - take);
                    return Ok(true);
                }
                Framing::Chunked => {
                    self.fill().await?;
                    match self.parser.parse_decode_chunked(&mut self.buffer)? {
                        Chunked::Partial { decoded } => {
                            out.extend_from_slice(&self.buffer[..decoded]);
                            self.buffer.clear();
                            if decoded > 0 {
                                return Ok(true);
                            }
                        }
                        Chunked::Complete { decoded, leftover } => {
                            out.extend_from_slice(&self.buffer[..decoded]);
                            self.buffer.truncate(decoded + leftover);
                            self.buffer.drain(..decoded);
                            self.framing = Framing::Done;
                            return Ok(true);
                        }
                    }
                }
                Framing::UntilClose => {
                    if self.buffer.is_empty() {
                        let count = self.socket.read_queued(&mut self.buffer, self.req_limits.max_net_buffer).await?;
                        if count == 0 {
                            self.framing = Framing::Done;
                            self.closed = true;
                            return Ok(false);
                        }
                    }
                    out.append(&mut self.buffer);
                    return Ok(true);
                }
            }
        }
    }

    async fn fill(&mut self) -> Result<(), ErrorKind> {
        if self.buffer.is_empty() {
            let count = self.socket.read_queued(&mut self.buffer, self.req_limits.max_net_buffer).await?;
            if count == 0 {
                return Err(ErrorKind::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Reads the whole response body into `response.content.data`, up to
    /// [`max_size`](Self::max_size).
    pub async fn fetch(&mut self) -> Result<(), ErrorKind> {
        let mut data = std::mem::take(&mut self.response.content.data);
        while self.fetch_next(&mut data).await? {
            if data.len() > self.max_size {
                return Err(ErrorKind::PayloadTooLarge);
            }
        }

        self.response.content.assign(data);
        Ok(())
    }

    /// Whether the connection may serve another request: the body was
    /// read to its end, the server did not ask to close, and it did not
    /// advertise an alternative service to move to.
    pub fn manage_keep_alive(&self) -> bool {
        let headers = &self.response.headers;
        let alternative = headers
            .get_all("Alt-Svc")
            .iter()
            .any(|value| !value.trim().eq_ignore_ascii_case("clear"));

        let alive = match self.response.version {
            Version::Http11 => !headers.has_token("Connection", "close"),
            Version::Http10 => headers.has_token("Connection", "keep-alive"),
        };

        !self.closed && self.framing == Framing::Done && alive && !alternative
    }

    /// Performs the WebSocket handshake on `location` and starts the
    /// frame pump in a background task.
    ///
    /// The returned frame sends masked messages; `callbacks` see what the
    /// server sends. The tunnel ends on a close handshake, a protocol
    /// error or [`web_socket_timeout`](Self::web_socket_timeout) of
    /// silence; [`WebSocketFrame::closed`] resolves then.
    pub async fn upgrade(mut self, location: &str, callbacks: WebSocketCallbacks) -> Result<Arc<WebSocketFrame>, ErrorKind> {
        let key = generate_key();
        let mut request = RequestFrame::new(Method::Get, location);
        request.headers.insert("Upgrade", "websocket");
        request.headers.insert("Connection", "Upgrade");
        request.headers.insert("Sec-WebSocket-Key", &key);
        request.headers.insert("Sec-WebSocket-Version", "13");

        self.send(request).await?;

        let accepted = self.response.headers.get("Sec-WebSocket-Accept").map(str::trim);
        if self.response.status_code != Some(101) || accepted != Some(accept_key(&key).as_str()) {
            tracing::warn!(status = ?self.response.status_code, location, "websocket handshake refused");
            return Err(ErrorKind::HandshakeFailed);
        }

        let frame = WebSocketFrame::new(Role::Client);
        let codec = WebCodec::new(&self.web_socket_limits, Role::Client);
        let max_read = self.req_limits.max_net_buffer;
        let Client {
            mut socket,
            buffer,
            web_socket_timeout,
            ..
        } = self;
        socket.set_read_timeout(web_socket_timeout);

        let tunnel = frame.clone();
        tokio::spawn(async move {
            if let Err(err) = web_socket::pump(&tunnel, &mut socket, codec, &buffer, &callbacks, max_read).await {
                tracing::debug!(%err, "websocket client closed");
            }
        });

        Ok(frame)
    }
}

/// One multipart part ready to be written.
struct Part<'a> {
    head: String,
    resource: &'a Resource,
    size: u64,
}

impl Part<'_> {
    /// Bytes on the wire: head, contents and the trailing CRLF.
    fn length(&self) -> u64 {
        self.head.len() as u64 + self.size + 2
    }
}

async fn multipart_parts<'a>(resources: &'a [Resource], boundary: &str) -> Result<Vec<Part<'a>>, ErrorKind> {
    let mut parts = Vec::with_capacity(resources.len());

    for resource in resources {
        let size = match resource.is_in_memory {
            true => resource.contents.len() as u64,
            false => tokio::fs::metadata(&resource.path)
                .await
                .map_err(|_| ErrorKind::ResourceUnavailable)?
                .len(),
        };

        let mut head = format!("--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"", resource.key);
        if !resource.name.is_empty() {
            head.push_str(&format!("; filename=\"{}\"", resource.name));
        }
        head.push_str("\r\n");
        if !resource.kind.is_empty() {
            head.push_str(&format!("Content-Type: {}\r\n", resource.kind));
        }
        head.push_str("\r\n");

        parts.push(Part { head, resource, size });
    }
    Ok(parts)
}

#[inline]
fn closing(boundary: &str) -> String {
    format!("--{boundary}--\r\n")
}

/// An `http://` URL with the pieces a request needs.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Url {
    inner: url::Url,
    host: String,
    port: u16,
    target: String,
}

impl Url {
    fn parse(url: &str) -> Result<Self, ErrorKind> {
        Self::from_inner(url::Url::parse(url).map_err(|_| ErrorKind::InvalidUrl)?)
    }

    fn from_inner(inner: url::Url) -> Result<Self, ErrorKind> {
        if inner.scheme() != "http" {
            return Err(ErrorKind::InvalidUrl);
        }

        let host = match inner.host() {
            Some(url::Host::Ipv6(address)) => address.to_string(),
            Some(host) => host.to_string(),
            None => return Err(ErrorKind::InvalidUrl),
        };
        if host.is_empty() {
            return Err(ErrorKind::InvalidUrl);
        }
        let port = inner.port_or_known_default().ok_or(ErrorKind::InvalidUrl)?;

        let mut target = inner.path().to_owned();
        if let Some(query) = inner.query() {
            target.push('?');
            target.push_str(query);
        }

        Ok(Self { inner, host, port, target })
    }

    /// Resolves a `Location` header against this URL: absolute,
    /// protocol-relative, absolute-path and relative forms.
    fn join(&self, location: &str) -> Result<Self, ErrorKind> {
        let inner = self.inner.join(location.trim()).map_err(|_| ErrorKind::InvalidUrl)?;
        Self::from_inner(inner)
    }
}

/// Idle client connections keyed by `host:port`.
#[derive(Debug)]
pub struct Pool {
    clients: Mutex<HashMap<String, Vec<Client>>>,
    /// Idle connections kept per address.
    pub max_idle: usize,
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            max_idle: 8,
        }
    }
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// An idle connection to `host:port`, if any.
    pub fn pop(&self, host: &str, port: u16) -> Option<Client> {
        let mut clients = self.clients.lock().ok()?;
        clients.get_mut(&format!("{host}:{port}"))?.pop()
    }

    /// Keeps `client` for reuse when [`Client::manage_keep_alive`] allows.
    pub fn push(&self, client: Client) -> bool {
        if !client.manage_keep_alive() {
            return false;
        }
        let Ok(mut clients) = self.clients.lock() else {
            return false;
        };

        let idle = clients.entry(client.address()).or_default();
        match idle.len() < self.max_idle {
            true => {
                idle.push(client);
                true
            }
            false => false,
        }
    }

    /// Idle connections across all addresses.
    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .map(|clients| clients.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn checkout(&self, url: &Url) -> Result<Client, ErrorKind> {
        match self.pop(&url.host, url.port) {
            Some(client) => Ok(client),
            None => Client::connect(&url.host, url.port).await,
        }
    }

    /// Requests `url`, following redirects, reusing pooled connections.
    ///
    /// `303`, and `301`/`302` after a `POST`, continue as a bodiless
    /// `GET`; `307`/`308` repeat the request as is.
    pub async fn fetch(&self, url: &str, frame: FetchFrame) -> Result<ResponseFrame, ErrorKind> {
        let budget = frame.timeout;
        tokio::time::timeout(budget, self.fetch_inner(url, frame)).await?
    }

    async fn fetch_inner(&self, url: &str, mut frame: FetchFrame) -> Result<ResponseFrame, ErrorKind> {
        let mut url = Url::parse(url)?;
        let max_redirects = frame.max_redirects.min(MAX_REDIRECTS);
        let mut redirects = 0;

        loop {
            let mut request = RequestFrame::new(frame.method, &url.target);
            request.headers = frame.headers.clone();
            request.cookies = frame.cookies.clone();
            request.content.data = frame.body.clone();
            request.content.resources = frame.resources.clone();

            let mut client = self.checkout(&url).await?;
            client.max_size = frame.max_size;
            client.send(request).await?;
            client.fetch().await?;

            let response = std::mem::take(&mut client.response);
            let status = response.status_code.unwrap_or(0);
            let location = response.headers.get("Location").map(str::to_owned);
            client.response.version = response.version;
            client.response.headers = response.headers.clone();
            self.push(client);

            let Some(location) = location.filter(|_| matches!(status, 301 | 302 | 303 | 307 | 308)) else {
                return Ok(response);
            };

            redirects += 1;
            if redirects > max_redirects {
                return Err(ErrorKind::TooManyRedirects);
            }

            if status == 303 || (matches!(status, 301 | 302) && frame.method == Method::Post) {
                frame.method = Method::Get;
                frame.body.clear();
                frame.resources.clear();
                frame.headers.remove("Content-Type");
                frame.headers.remove("Content-Length");
            }

            tracing::debug!(status, %location, redirects, "following redirect");
            url = url.join(&location)?;
        }
    }
}

/// Requests `url` once with a fresh pool; see [`Pool::fetch`].
///
/// # Examples
/// ```no_run
/// # async fn run() -> Result<(), maker_net::ErrorKind> {
/// use maker_net::{client, FetchFrame, Method};
///
/// let response = client::fetch("http://127.0.0.1:8080/", FetchFrame::new(Method::Get)).await?;
/// assert!(response.is_ok());
/// # Ok(())
/// # }
/// ```
pub async fn fetch(url: &str, frame: FetchFrame) -> Result<ResponseFrame, ErrorKind> {
    Pool::new().fetch(url, frame).await
}
