//! Server-side connection state machine.
//!
//! One [`Connection`] serves one accepted socket: it reads a request
//! head, routes it, lets the route callbacks and default handlers build
//! the response, writes it, drains whatever body is left and starts over
//! while keep-alive allows. A successful WebSocket upgrade leaves this
//! loop for good and hands the socket to the tunnel pump.

use crate::{
    cache::HrmCache,
    errors::ErrorKind,
    http::{
        content::Resource,
        parser::{header_param, Chunked, Parser, Progress},
        request::RequestFrame,
        response::{Cookie, ResponseFrame},
        types::{reason_phrase, Method, Version},
        web_codec::{Role, WebCodec},
    },
    limits::AllLimits,
    net::{Socket, Stream},
    router::{
        entry::RouterEntry,
        map::{MapRouter, RouteId},
    },
    server::{
        paths, resources, routing,
        utils::{self},
        web_socket::{self, WebSocketFrame},
    },
};
use std::{
    io::Write,
    path::Path,
    sync::Arc,
    time::{Instant, SystemTime},
};
use tokio::io::AsyncWriteExt;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Headers written by the connection itself; user copies are ignored.
const MANAGED: [&str; 5] = ["Date", "Connection", "Keep-Alive", "Content-Length", "Transfer-Encoding"];

#[derive(Debug)]
struct Info {
    created: Instant,
    /// Responses left before `Connection: close`.
    reuses: usize,
    close: bool,
    responded: bool,
    continue_sent: bool,
    /// The body in flight uses chunked framing.
    chunked: bool,
    /// Ranges were already resolved against a file.
    ranges_resolved: bool,
    peer: String,
}

/// One client connection, handed to route callbacks.
///
/// Callbacks read [`request`](Self::request), fill
/// [`response`](Self::response) and return `true`; the connection then
/// composes and sends it. Bodies are not read up front: use
/// [`fetch_content`](Self::fetch_content), [`fetch`](Self::fetch) or
/// [`store`](Self::store).
///
/// # Examples
/// ```no_run
/// use maker_net::{MapRouter, StatusCode};
///
/// let mut router = MapRouter::new();
/// router
///     .post("^/echo$", |conn| Box::pin(async move {
///         if conn.fetch_content().await.is_err() {
///             return false;
///         }
///         let body = std::mem::take(&mut conn.request.content.data);
///         conn.response.status(StatusCode::Ok).body(body);
///         true
///     }))
///     .unwrap();
/// ```
pub struct Connection {
    pub request: RequestFrame,
    pub response: ResponseFrame,
    pub route: RouteId,

    router: Arc<MapRouter>,
    cache: Arc<HrmCache>,
    parser: Parser,
    pub(crate) socket: Socket,
    pub(crate) web_socket: Option<Arc<WebSocketFrame>>,
    info: Info,
    /// Bytes read from the socket and not consumed yet.
    buffer: Vec<u8>,
    pub(crate) limits: AllLimits,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("request", &self.request)
            .field("response", &self.response)
            .field("route", &self.route)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new<S: Stream>(
        stream: S,
        router: Arc<MapRouter>,
        cache: Arc<HrmCache>,
        limits: AllLimits,
        peer: String,
    ) -> Self {
        Self {
            request: RequestFrame::default(),
            response: ResponseFrame::new(),
            route: RouteId::Base,

            socket: Socket::new(stream, &limits.conn, limits.req.max_net_buffer),
            parser: Parser::new(&limits.req),
            router,
            cache,
            web_socket: None,
            info: Info {
                created: Instant::now(),
                reuses: 0,
                close: false,
                responded: false,
                continue_sent: false,
                chunked: false,
                ranges_resolved: false,
                peer,
            },
            buffer: Vec::new(),
            limits,
        }
    }

    #[inline]
    pub fn router(&self) -> &Arc<MapRouter> {
        &self.router
    }

    /// The route the current request resolved to.
    #[inline]
    pub fn entry(&self) -> &RouterEntry {
        self.router.entry(self.route)
    }

    /// The tunnel opened by a successful upgrade.
    #[inline]
    pub fn web_socket(&self) -> Option<&Arc<WebSocketFrame>> {
        self.web_socket.as_ref()
    }

    /// Whether the response (or at least its head) was written.
    #[inline]
    pub fn is_responded(&self) -> bool {
        self.info.responded
    }

    /// Forces `Connection: close` on the current response.
    #[inline]
    pub fn close(&mut self) {
        self.info.close = true;
    }

    /// Marks the buffered body as final: `Range` is not applied to it
    /// again.
    #[inline]
    pub(crate) fn resolve_ranges(&mut self) {
        self.info.ranges_resolved = true;
    }
}

impl Connection {
    /// Serves requests until the peer leaves, keep-alive ends or an
    /// error aborts the connection.
    pub(crate) async fn run(&mut self) {
        match self.impl_run().await {
            Ok(()) => {}
            Err(err) if err.is_transport() => tracing::debug!(%err, peer = %self.info.peer, "connection dropped"),
            Err(err) => {
                tracing::warn!(%err, peer = %self.info.peer, "request aborted");
                if !self.info.responded {
                    if let Err(err) = self.abort(&err).await {
                        tracing::debug!(%err, "error response not delivered");
                    }
                }
            }
        }

        self.socket.shutdown().await;
        self.reset();
    }

    async fn impl_run(&mut self) -> Result<(), ErrorKind> {
        self.info.reuses = self.router.keep_alive_max_count;

        loop {
            if !self.read_request().await? {
                return Ok(());
            }

            let prefetch = self.buffer.len();
            self.request
                .content
                .prepare(&self.request.headers, prefetch, self.limits.req.max_request_size)?;

            routing::on_request_open(self).await?;

            if let Some(frame) = self.web_socket.take() {
                return self.run_web_socket(frame).await;
            }
            self.next().await?;

            if self.info.close {
                return Ok(());
            }
            if !self.request.content.is_finalized() {
                self.fetch(|_| true, true).await?;
            }
            self.reset();
        }
    }

    /// Reads and parses the next request head. `false` on a clean end:
    /// EOF or an idle timeout with nothing buffered.
    async fn read_request(&mut self) -> Result<bool, ErrorKind> {
        let mut scanned = 0;

        loop {
            if !self.buffer.is_empty() {
                match self.parser.parse_request(&self.buffer, scanned, &mut self.request)? {
                    Progress::Complete(end) => {
                        self.buffer.drain(..end);
                        self.request.address.clone_from(&self.info.peer);
                        return Ok(true);
                    }
                    Progress::Partial => scanned = self.buffer.len(),
                }
            }

            let idle = self.buffer.iter().all(|byte| matches!(byte, b'\r' | b'\n'));
            match self.socket.read_queued(&mut self.buffer, self.limits.req.max_net_buffer).await {
                Ok(0) if idle => return Ok(false),
                Ok(0) => return Err(ErrorKind::ConnectionClosed),
                Ok(_) => {}
                Err(ErrorKind::Timeout) if idle => return Ok(false),
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_web_socket(&mut self, frame: Arc<WebSocketFrame>) -> Result<(), ErrorKind> {
        let router = self.router.clone();
        let entry = router.entry(self.route);
        self.socket.set_read_timeout(entry.web_socket_timeout);

        let codec = WebCodec::new(&self.limits.web_socket, Role::Server);
        let leftover = std::mem::take(&mut self.buffer);
        let result = web_socket::pump(
            &frame,
            &mut self.socket,
            codec,
            &leftover,
            &entry.callbacks.web_socket,
            self.limits.req.max_net_buffer,
        )
        .await;

        if let Err(err) = result {
            tracing::debug!(%err, location = %self.request.location, "websocket closed");
        }
        Ok(())
    }

    /// Answers `err` and marks the connection for closing.
    async fn abort(&mut self, err: &ErrorKind) -> Result<(), ErrorKind> {
        self.info.close = true;
        self.response.cleanup();
        self.response.set_error(err);
        self.next().await
    }

    fn reset(&mut self) {
        self.request.cleanup();
        self.response.cleanup();
        self.parser.prepare_for_next();
        self.route = RouteId::Base;
        self.info.responded = false;
        self.info.continue_sent = false;
        self.info.chunked = false;
        self.info.ranges_resolved = false;
    }
}

// Request bodies
impl Connection {
    /// Appends the next piece of the request body to `out`.
    ///
    /// Returns `false` once the body is complete. Chunked bodies are
    /// decoded; `Expect: 100-continue` is answered before the first read.
    /// A failed read leaves the stream out of sync, so the connection
    /// closes after the current response.
    pub async fn fetch_next(&mut self, out: &mut Vec<u8>) -> Result<bool, ErrorKind> {
        let result = self.read_body(out).await;
        if result.is_err() {
            self.info.close = true;
        }
        result
    }

    async fn read_body(&mut self, out: &mut Vec<u8>) -> Result<bool, ErrorKind> {
        loop {
            let content = &self.request.content;
            if content.exceeds {
                return Err(ErrorKind::PayloadTooLarge);
            }
            if content.is_finalized() {
                return Ok(false);
            }

            if self.buffer.is_empty() {
                self.fill().await?;
            }

            if !self.request.content.limited {
                let decoded = match self.parser.parse_decode_chunked(&mut self.buffer)? {
                    Chunked::Partial { decoded } => {
                        out.extend_from_slice(&self.buffer[..decoded]);
                        self.buffer.clear();
                        decoded
                    }
                    Chunked::Complete { decoded, leftover } => {
                        out.extend_from_slice(&self.buffer[..decoded]);
                        self.buffer.truncate(decoded + leftover);
                        self.buffer.drain(..decoded);
                        self.request.content.offset += decoded;
                        self.request.content.finalize();
                        return Ok(true);
                    }
                };

                let content = &mut self.request.content;
                content.prefetch = 0;
                content.offset += decoded;
                if content.offset > self.limits.req.max_request_size {
                    content.exceeds = true;
                    return Err(ErrorKind::PayloadTooLarge);
                }
                if decoded > 0 {
                    return Ok(true);
                }
                continue;
            }

            let content = &mut self.request.content;
            let take = (content.length - content.offset).min(self.buffer.len());
            out.extend(self.buffer.drain(..take));
            content.offset += take;
            content.prefetch = content.prefetch.saturating_sub(take);
            return Ok(true);
        }
    }

    async fn fill(&mut self) -> Result<(), ErrorKind> {
        if !self.info.continue_sent && self.request.headers.has_token("Expect", "100-continue") {
            self.info.continue_sent = true;
            self.socket.write_queued(CONTINUE).await?;
            self.socket.flush().await?;
        }

        match self.socket.read_queued(&mut self.buffer, self.limits.req.max_net_buffer).await? {
            0 => Err(ErrorKind::ConnectionClosed),
            _ => Ok(()),
        }
    }

    /// Streams the body to `callback` piece by piece, stopping early when
    /// it returns `false`. With `eat` the body is read and discarded.
    pub async fn fetch<F: FnMut(&[u8]) -> bool>(&mut self, mut callback: F, eat: bool) -> Result<(), ErrorKind> {
        let mut chunk = Vec::new();
        while self.fetch_next(&mut chunk).await? {
            if !eat && !callback(&chunk) {
                return Ok(());
            }
            chunk.clear();
        }
        Ok(())
    }

    /// Buffers the whole body into `request.content.data`, up to the
    /// `max_heap_buffer` limit.
    pub async fn fetch_content(&mut self) -> Result<(), ErrorKind> {
        let max = self.limits.req.max_heap_buffer;
        let content = &self.request.content;
        if content.exceeds || (content.limited && content.length > max) {
            self.info.close = true;
            return Err(ErrorKind::PayloadTooLarge);
        }

        let mut data = std::mem::take(&mut self.request.content.data);
        while self.fetch_next(&mut data).await? {
            if data.len() > max {
                self.info.close = true;
                return Err(ErrorKind::PayloadTooLarge);
            }
        }

        self.request.content.data = data;
        Ok(())
    }

    /// Saves the body as resources: one per part for `multipart/*`
    /// bodies, a single one otherwise. Files go to the router's temporary
    /// directory, or stay in memory without one. With `eat` the body is
    /// discarded.
    pub async fn store(&mut self, eat: bool) -> Result<(), ErrorKind> {
        if eat {
            return self.fetch(|_| true, true).await;
        }

        let kind = self
            .request
            .get_header("Content-Type")
            .map(|value| value.into_owned())
            .unwrap_or_default();
        let directory = self.router.temporary_directory.clone();

        if kind.get(..10).is_some_and(|prefix| prefix.eq_ignore_ascii_case("multipart/")) {
            let boundary = header_param(&kind, "boundary").ok_or(ErrorKind::InvalidMultipart)?;
            self.parser
                .prepare_for_multipart(&boundary, directory, false, self.router.max_uploadable_resources);

            let mut chunk = Vec::new();
            while self.fetch_next(&mut chunk).await? {
                let resources = &mut self.request.content.resources;
                self.parser.multipart_parse(&chunk, |part| {
                    if let Some(part) = part {
                        resources.push(part);
                    }
                })?;
                chunk.clear();
            }

            return match self.parser.is_multipart_finished() {
                true => Ok(()),
                false => Err(ErrorKind::InvalidMultipart),
            };
        }

        let mut resource = match &directory {
            Some(directory) => Resource {
                path: directory.join(format!("upload-{:016x}", fastrand::u64(..))),
                ..Resource::default()
            },
            None => Resource::from_memory("", Vec::new()),
        };
        resource.kind = kind;

        let result = match resource.is_in_memory {
            true => {
                let mut data = Vec::new();
                let result = self.fetch_all(&mut data).await;
                resource.length = data.len();
                resource.contents = data;
                result
            }
            false => self.store_file(&mut resource).await,
        };

        if result.is_err() && !resource.is_in_memory {
            let _ = tokio::fs::remove_file(&resource.path).await;
        }
        result?;

        self.request.content.resources.push(resource);
        Ok(())
    }

    async fn fetch_all(&mut self, data: &mut Vec<u8>) -> Result<(), ErrorKind> {
        while self.fetch_next(data).await? {}
        Ok(())
    }

    async fn store_file(&mut self, resource: &mut Resource) -> Result<(), ErrorKind> {
        let mut file = tokio::fs::File::create(&resource.path)
            .await
            .map_err(|_| ErrorKind::Unprocessable)?;

        let mut chunk = Vec::new();
        while self.fetch_next(&mut chunk).await? {
            file.write_all(&chunk).await?;
            resource.length += chunk.len();
            chunk.clear();
        }
        file.flush().await?;
        Ok(())
    }
}

// Responses
impl Connection {
    /// Sets the session cookie configured on the router.
    pub fn set_session(&mut self, value: &str) {
        let session = &self.router.session;
        let expires = match session.expires.is_zero() {
            true => String::new(),
            false => utils::http_date(SystemTime::now() + session.expires),
        };

        let cookie = Cookie {
            domain: session.domain.clone(),
            path: session.path.clone(),
            same_site: session.same_site.clone(),
            expires,
            secure: session.secure,
            http_only: session.http_only,
            ..Cookie::new(&session.name, value)
        };
        self.response.set_cookie(cookie);
    }

    /// Finishes the current request: serves an error page for failures
    /// without a body, then composes and sends the response. Does nothing
    /// once the response was sent.
    pub async fn next(&mut self) -> Result<(), ErrorKind> {
        if self.info.responded {
            return Ok(());
        }

        let status = *self.response.status_code.get_or_insert(200);
        if status >= 400 && self.response.content.data.is_empty() {
            self.load_error_page(status).await;
        }

        self.compose_response().await
    }

    async fn load_error_page(&mut self, status: u16) {
        let router = self.router.clone();
        let entry = router.entry(self.route);

        let page = entry
            .error_files
            .iter()
            .find(|page| page.status_code == status)
            .or_else(|| entry.error_files.iter().find(|page| page.status_code == 0));

        if let Some(page) = page {
            if let Ok(path) = paths::construct(&entry.files_directory, &page.pattern) {
                if let Ok(data) = tokio::fs::read(&path).await {
                    let kind = utils::mime_type(&path, &entry.mime_types);
                    self.response
                        .header("Content-Type", &utils::content_type(&kind, &router.char_set))
                        .content
                        .assign(data);
                    return;
                }
                tracing::debug!(path = %path.display(), "error page missing");
            }
        }

        let page = utils::error_page(status, reason_phrase(status));
        self.response
            .header("Content-Type", &utils::content_type("text/html", &router.char_set))
            .content
            .assign(page);
    }

    /// Composes the in-memory response and writes it.
    ///
    /// Byte ranges apply to `200` answers of `GET` requests that opt in
    /// with `Accept-Ranges: bytes`, unless `If-Range` names another
    /// `ETag`/`Last-Modified` than the response carries. Otherwise the
    /// body is compressed when the route enables it. Small bodies travel
    /// in the same write as the head.
    pub async fn compose_response(&mut self) -> Result<(), ErrorKind> {
        let router = self.router.clone();
        let entry = router.entry(self.route);

        let mut body = std::mem::take(&mut self.response.content.data);
        let status = *self.response.status_code.get_or_insert(200);

        if !body.is_empty() && !self.response.headers.contains("Content-Type") {
            self.response
                .headers
                .insert("Content-Type", &utils::content_type("text/plain", &router.char_set));
        }

        if status == 200 && self.is_ranged() {
            body = self.apply_ranges(body);
        } else if status == 200 || status == 201 {
            let kind = self.response.headers.get("Content-Type").unwrap_or_default().to_owned();
            if let Some(encoding) = resources::compressed(entry, &self.request, None, &kind, body.len() as u64) {
                if let Some(compressed) = resources::compress(&body, encoding, entry.compression.quality_level) {
                    body = compressed;
                    self.response.headers.insert("Content-Encoding", encoding.as_str());
                    self.response.headers.insert("Vary", "Accept-Encoding");
                }
            }
        }

        let mut head = self.compose_head(Some(body.len() as u64));
        let with_body = self.request.method != Method::Head && has_body(self.response.status_code.unwrap_or(200));

        let result = match with_body && body.len() <= self.limits.resp.inline_body_size {
            true => {
                head.extend_from_slice(&body);
                self.socket.write_queued(&head).await
            }
            false => match self.socket.write_queued(&head).await {
                Ok(()) if with_body && !body.is_empty() => self.socket.write_queued(&body).await,
                other => other,
            },
        };
        self.cache.push(head);
        self.info.responded = true;
        result?;

        self.socket.flush().await
    }

    fn is_ranged(&self) -> bool {
        let headers = &self.response.headers;
        if self.info.ranges_resolved
            || self.request.method != Method::Get
            || !self.request.headers.contains("Range")
            || !headers.get("Accept-Ranges").is_some_and(|value| value.trim().eq_ignore_ascii_case("bytes"))
        {
            return false;
        }

        let modified = headers.get("Last-Modified").and_then(utils::parse_http_date);
        resources::if_range_matches(&self.request, headers.get("ETag"), modified)
    }

    fn apply_ranges(&mut self, body: Vec<u8>) -> Vec<u8> {
        let size = body.len() as u64;
        match self.request.get_ranges(size) {
            Ok(ranges) if ranges.len() == 1 => {
                let (start, end) = ranges[0];
                self.response
                    .set_status(206)
                    .header("Content-Range", &format!("bytes {start}-{end}/{size}"));
                body[start as usize..=end as usize].to_vec()
            }
            Ok(ranges) if ranges.len() > 1 => {
                let kind = self.response.headers.get("Content-Type").unwrap_or("text/plain").to_owned();
                let boundary = utils::generate_boundary();

                let mut output = Vec::with_capacity(utils::byteranges_length(&boundary, &kind, &ranges, size) as usize);
                for &(start, end) in &ranges {
                    output.extend_from_slice(utils::byterange_header(&boundary, &kind, start, end, size).as_bytes());
                    output.extend_from_slice(&body[start as usize..=end as usize]);
                }
                output.extend_from_slice(utils::byterange_footer(&boundary).as_bytes());

                self.response
                    .set_status(206)
                    .header("Content-Type", &format!("multipart/byteranges; boundary={boundary}"));
                output
            }
            Ok(_) => body,
            Err(err) => {
                self.response
                    .set_error(&err)
                    .header("Content-Range", &format!("bytes */{size}"));
                Vec::new()
            }
        }
    }

    /// Serializes the status line and headers. `None` announces a chunked
    /// body, or a close-delimited one for HTTP/1.0.
    pub(crate) fn compose_head(&mut self, length: Option<u64>) -> Vec<u8> {
        let mut head = self.cache.pop();
        let status = *self.response.status_code.get_or_insert(200);

        let _ = write!(head, "HTTP/1.1 {status} {}\r\n", reason_phrase(status));
        let _ = write!(head, "Date: {}\r\n", utils::http_date(SystemTime::now()));

        let upgrade = status == 101;
        let streamed = length.is_none() && has_body(status) && !upgrade;
        if streamed && self.request.version == Version::Http10 {
            // no chunked coding for HTTP/1.0: the close ends the body
            self.info.close = true;
        }
        self.info.chunked = streamed && self.request.version != Version::Http10;

        if !upgrade {
            match self.keep_alive() {
                true => {
                    let _ = write!(
                        head,
                        "Connection: keep-alive\r\nKeep-Alive: timeout={}, max={}\r\n",
                        self.limits.conn.socket_read_timeout.as_secs(),
                        self.info.reuses
                    );
                }
                false => head.extend_from_slice(b"Connection: close\r\n"),
            }

            if !self.response.headers.contains("Accept-Ranges") {
                head.extend_from_slice(b"Accept-Ranges: none\r\n");
            }

            if let (true, Some(length)) = (has_body(status), length) {
                let _ = write!(head, "Content-Length: {length}\r\n");
            }
            if self.info.chunked {
                head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
            }
        }

        let mut line = String::new();
        for cookie in &self.response.cookies {
            line.clear();
            cookie.compose(&mut line);
            let _ = write!(head, "Set-Cookie: {line}\r\n");
        }

        for (name, values) in self.response.headers.iter() {
            if !upgrade && MANAGED.iter().any(|managed| managed.eq_ignore_ascii_case(name)) {
                continue;
            }
            for value in values {
                let _ = write!(head, "{name}: {value}\r\n");
            }
        }

        let router = self.router.clone();
        if let Some(callback) = &router.entry(self.route).callbacks.headers {
            let mut extra = String::new();
            if callback(self, &mut extra) {
                head.extend_from_slice(extra.as_bytes());
            }
        }

        head.extend_from_slice(b"\r\n");

        tracing::debug!(
            method = self.request.method.as_str(),
            location = %self.request.location,
            status,
            "response"
        );
        head
    }

    /// Decides `Connection: keep-alive` for the response being composed.
    fn keep_alive(&mut self) -> bool {
        let alive = !self.info.close
            && self.info.reuses > 1
            && self.request.is_keep_alive()
            && self.info.created.elapsed() < self.limits.conn.connection_lifetime
            && !self.request.content.exceeds;

        match alive {
            true => self.info.reuses -= 1,
            false => self.info.close = true,
        }
        alive
    }

    /// Writes the response head now; the body follows with
    /// [`write_body`](Self::write_body) or, when `length` is `None`,
    /// with [`write_chunk`](Self::write_chunk). HTTP/1.0 peers get an
    /// unframed body ended by closing the connection.
    pub async fn write_head(&mut self, length: Option<u64>) -> Result<(), ErrorKind> {
        let head = self.compose_head(length);
        let result = self.socket.write_queued(&head).await;
        self.cache.push(head);
        self.info.responded = true;
        result
    }

    #[inline]
    pub async fn write_body(&mut self, data: &[u8]) -> Result<(), ErrorKind> {
        self.socket.write_queued(data).await
    }

    /// Writes one chunk of a chunked body; empty chunks are skipped.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), ErrorKind> {
        if data.is_empty() {
            return Ok(());
        }
        if !self.info.chunked {
            return self.socket.write_queued(data).await;
        }

        let mut frame = Vec::with_capacity(data.len() + 12);
        let _ = write!(frame, "{:x}\r\n", data.len());
        frame.extend_from_slice(data);
        frame.extend_from_slice(b"\r\n");
        self.socket.write_queued(&frame).await
    }

    /// Terminates a chunked body.
    pub async fn finish_chunks(&mut self) -> Result<(), ErrorKind> {
        if self.info.chunked {
            self.socket.write_queued(b"0\r\n\r\n").await?;
        }
        self.socket.flush().await
    }

    /// Streams `length` bytes of the file at `path` from `offset`.
    pub(crate) async fn write_file(&mut self, path: &Path, offset: u64, length: u64) -> Result<(), ErrorKind> {
        let mut file = tokio::fs::File::open(path).await?;
        let sent = self
            .socket
            .write_file_queued(&mut file, offset, length, self.limits.resp.file_chunk_size)
            .await?;

        match sent == length {
            true => Ok(()),
            false => Err(ErrorKind::ResourceUnavailable),
        }
    }

    #[inline]
    pub(crate) async fn flush(&mut self) -> Result<(), ErrorKind> {
        self.socket.flush().await
    }
}

/// Statuses that never carry a body.
#[inline]
pub(crate) const fn has_body(status: u16) -> bool {
    !matches!(status, 100..=199 | 204 | 304)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tools::{exchange, parse_responses},
        StatusCode,
    };

    fn echo_router() -> MapRouter {
        let mut router = MapRouter::new();
        router
            .post("^/echo$", |conn| {
                Box::pin(async move {
                    if let Err(err) = conn.fetch_content().await {
                        conn.response.set_error(&err);
                        return true;
                    }
                    let body = std::mem::take(&mut conn.request.content.data);
                    conn.response.status(StatusCode::Ok).body(body);
                    true
                })
            })
            .unwrap();
        router
            .get("^/hello$", |conn| {
                Box::pin(async move {
                    conn.set_session("abc");
                    conn.response.status(StatusCode::Ok).body("hello");
                    true
                })
            })
            .unwrap();
        router.sort();
        router
    }

    #[tokio::test]
    async fn pipelined_keep_alive() {
        let input = b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n\
            POST /echo HTTP/1.1\r\nContent-Length: 4\r\n\r\nping\
            POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n\
            GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n";

        let output = exchange(echo_router(), AllLimits::default(), input).await;
        let responses = parse_responses(&output);

        #[rustfmt::skip]
        let expected: [(u16, &[u8], &str); 4] = [
            (200, b"hello", "keep-alive"),
            (200, b"ping",  "keep-alive"),
            (200, b"abcde", "keep-alive"),
            (200, b"hello", "close"),
        ];

        assert_eq!(responses.len(), expected.len());
        for (response, (status, body, connection)) in responses.iter().zip(expected) {
            assert_eq!(response.status_code, Some(status));
            assert_eq!(response.content.data, body);
            assert_eq!(response.headers.get("Connection"), Some(connection));
        }

        let session = responses[0].get_cookie("sid").unwrap();
        assert_eq!(session.value, "abc");
        assert!(session.http_only);
        assert_eq!(session.path, "/");
    }

    #[tokio::test]
    async fn unread_bodies_are_drained() {
        let input = b"POST /hello HTTP/1.1\r\nContent-Length: 5\r\n\r\nxxxxx\
            GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n";

        let output = exchange(echo_router(), AllLimits::default(), input).await;
        let responses = parse_responses(&output);

        // POST on a GET-only route with no file behind it
        assert_eq!(responses[0].status_code, Some(404));
        assert_eq!(responses[1].content.data, b"hello");
    }

    #[tokio::test]
    async fn keep_alive_budget() {
        let mut router = echo_router();
        router.keep_alive_max_count = 2;

        let input = b"GET /hello HTTP/1.1\r\n\r\nGET /hello HTTP/1.1\r\n\r\nGET /hello HTTP/1.1\r\n\r\n";
        let output = exchange(router, AllLimits::default(), input).await;
        let responses = parse_responses(&output);

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].headers.get("Connection"), Some("keep-alive"));
        assert_eq!(responses[1].headers.get("Connection"), Some("close"));
    }

    #[tokio::test]
    async fn errors_close_the_connection() {
        #[rustfmt::skip]
        let cases: [(&[u8], u16, &str); 4] = [
            (b"BREW /pot HTTP/1.1\r\n\r\n",                                   400, "INVALID_METHOD"),
            (b"GET / HTTP/2.0\r\n\r\n",                                       505, "UNSUPPORTED_VERSION"),
            (b"POST /echo HTTP/1.1\r\nContent-Length: 99999999999\r\n\r\n",   413, "PAYLOAD_TOO_LARGE"),
            (b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n", 400, "INVALID_CHUNK"),
        ];

        for (input, status, code) in cases {
            let output = exchange(echo_router(), AllLimits::default(), input).await;
            let responses = parse_responses(&output);

            assert_eq!(responses.len(), 1, "{}", String::from_utf8_lossy(input));
            assert_eq!(responses[0].status_code, Some(status));
            assert_eq!(responses[0].headers.get("Connection"), Some("close"));
            assert!(responses[0].content.get_text().contains(&status.to_string()));
            assert_eq!(responses[0].headers.get("X-Error"), Some(code));
        }
    }

    #[tokio::test]
    async fn headers_too_large() {
        let mut limits = AllLimits::default();
        limits.req.max_header_size = 64;

        let input = format!("GET /hello HTTP/1.1\r\nX-Long: {}\r\n\r\n", "a".repeat(100));
        let output = exchange(echo_router(), limits, input.as_bytes()).await;
        let responses = parse_responses(&output);

        assert_eq!(responses[0].status_code, Some(431));
    }

    #[tokio::test]
    async fn heap_limit() {
        let mut limits = AllLimits::default();
        limits.req.max_heap_buffer = 4;

        let input = b"POST /echo HTTP/1.1\r\nContent-Length: 8\r\nConnection: close\r\n\r\n12345678";
        let output = exchange(echo_router(), limits, input).await;
        let responses = parse_responses(&output);

        assert_eq!(responses[0].status_code, Some(413));
    }

    #[tokio::test]
    async fn in_memory_ranges() {
        let mut router = echo_router();
        router
            .get("^/ranged$", |conn| {
                Box::pin(async move {
                    conn.response
                        .status(StatusCode::Ok)
                        .header("Accept-Ranges", "bytes")
                        .header("ETag", "\"v1\"")
                        .body("hello");
                    true
                })
            })
            .unwrap();
        router.sort();

        let input = b"GET /ranged HTTP/1.1\r\nRange: bytes=1-3\r\n\r\n\
            GET /ranged HTTP/1.1\r\nRange: bytes=0-0,4-\r\n\r\n\
            GET /ranged HTTP/1.1\r\nRange: bytes=10-\r\n\r\n\
            GET /ranged HTTP/1.1\r\nRange: bytes=1-3\r\nIf-Range: \"v0\"\r\n\r\n\
            GET /ranged HTTP/1.1\r\nRange: bytes=1-3\r\nIf-Range: \"v1\"\r\n\r\n\
            GET /hello HTTP/1.1\r\nRange: bytes=1-3\r\nConnection: close\r\n\r\n";

        let output = exchange(router, AllLimits::default(), input).await;
        let responses = parse_responses(&output);
        assert_eq!(responses.len(), 6);

        assert_eq!(responses[0].status_code, Some(206));
        assert_eq!(responses[0].content.data, b"ell");
        assert_eq!(responses[0].headers.get("Content-Range"), Some("bytes 1-3/5"));

        assert_eq!(responses[1].status_code, Some(206));
        let kind = responses[1].headers.get("Content-Type").unwrap();
        assert!(kind.starts_with("multipart/byteranges; boundary="));
        let body = responses[1].content.get_text();
        assert!(body.contains("Content-Range: bytes 0-0/5\r\n\r\nh"));
        assert!(body.contains("Content-Range: bytes 4-4/5\r\n\r\no"));

        assert_eq!(responses[2].status_code, Some(416));
        assert_eq!(responses[2].headers.get("Content-Range"), Some("bytes */5"));

        #[rustfmt::skip]
        let whole: [(usize, u16, &[u8]); 3] = [
            (3, 200, b"hello"),
            (4, 206, b"ell"),
            (5, 200, b"hello"),
        ];
        for (index, status, body) in whole {
            assert_eq!(responses[index].status_code, Some(status), "{index}");
            assert_eq!(responses[index].content.data, body, "{index}");
        }
        assert_eq!(responses[5].headers.get("Accept-Ranges"), Some("none"));
    }

    #[tokio::test]
    async fn http10_streams_until_close() {
        let mut router = MapRouter::new();
        router
            .get("^/stream$", |conn| {
                Box::pin(async move {
                    conn.response.set_status(200).header("Content-Type", "text/plain");
                    if conn.write_head(None).await.is_err() {
                        return true;
                    }
                    for part in [b"one,".as_slice(), b"two"] {
                        if conn.write_chunk(part).await.is_err() {
                            return true;
                        }
                    }
                    let _ = conn.finish_chunks().await;
                    true
                })
            })
            .unwrap();
        router.sort();

        let input = b"GET /stream HTTP/1.0\r\nConnection: keep-alive\r\n\r\nGET /stream HTTP/1.0\r\n\r\n";
        let output = exchange(router, AllLimits::default(), input).await;

        let mut response = ResponseFrame::new();
        let mut parser = Parser::new(&crate::limits::ReqLimits::default());
        let end = match parser.parse_response(&output, 0, &mut response).unwrap() {
            Progress::Complete(end) => end,
            Progress::Partial => panic!("incomplete head"),
        };

        assert_eq!(response.status_code, Some(200));
        assert_eq!(response.headers.get("Transfer-Encoding"), None);
        assert_eq!(response.headers.get("Content-Length"), None);
        assert_eq!(response.headers.get("Connection"), Some("close"));
        // the second request is never answered
        assert_eq!(&output[end..], b"one,two");
    }

    #[tokio::test]
    async fn store_resources() {
        let directory = std::env::temp_dir().join(format!("maker_net_store_{}", fastrand::u64(..)));
        std::fs::create_dir_all(&directory).unwrap();

        let mut router = MapRouter::new();
        router.temporary_directory = Some(directory.clone());
        router
            .put("^/upload$", |conn| {
                Box::pin(async move {
                    let result = conn.store(false).await;
                    let resource = &conn.request.content.resources[0];
                    let stored = std::fs::read(&resource.path).unwrap_or_default();
                    conn.response
                        .status(StatusCode::Ok)
                        .body(format!("{result:?} {} {}", resource.length, String::from_utf8_lossy(&stored)));
                    true
                })
            })
            .unwrap();
        router.sort();

        let input = b"PUT /upload HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 6\r\n\
            Connection: close\r\n\r\nstored";
        let output = exchange(router, AllLimits::default(), input).await;
        let responses = parse_responses(&output);

        assert_eq!(responses[0].content.get_text(), "Ok(()) 6 stored");
        // uploads are removed with the request
        assert_eq!(std::fs::read_dir(&directory).unwrap().count(), 0);
        std::fs::remove_dir_all(directory).unwrap();
    }

    #[tokio::test]
    async fn streamed_response_with_extra_headers() {
        let mut router = MapRouter::new();
        router
            .get("^/stream$", |conn| {
                Box::pin(async move {
                    let before = conn.is_responded();
                    conn.response.set_status(200).header("Content-Type", "text/plain");
                    if conn.write_head(None).await.is_err() {
                        return true;
                    }

                    let state = format!("{before}/{}", conn.is_responded());
                    for part in [b"one,".as_slice(), b"two,", state.as_bytes()] {
                        if conn.write_chunk(part).await.is_err() {
                            return true;
                        }
                    }
                    let _ = conn.finish_chunks().await;
                    true
                })
            })
            .unwrap()
            .on_headers(|_: &Connection, extra: &mut String| {
                extra.push_str("X-Served-By: maker_net\r\n");
                true
            });
        router.sort();

        let input = b"GET /stream HTTP/1.1\r\n\r\nGET /stream HTTP/1.1\r\nConnection: close\r\n\r\n";
        let output = exchange(router, AllLimits::default(), input).await;
        let responses = parse_responses(&output);

        assert_eq!(responses.len(), 2);
        for response in &responses {
            assert_eq!(response.headers.get("Transfer-Encoding"), Some("chunked"));
            assert_eq!(response.headers.get("X-Served-By"), Some("maker_net"));
            assert_eq!(response.content.data, b"one,two,false/true");
        }
    }
}
