use crate::{
    cache::HrmCache,
    errors::SERVICE_UNAVAILABLE,
    limits::{AllLimits, ConnLimits, ReqLimits, RespLimits, ServerLimits, WaitStrategy, WebSocketLimits},
    router::map::MapRouter,
    server::connection::Connection,
};
use crossbeam::queue::SegQueue;
use socket2::SockRef;
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    task::yield_now,
    time::{sleep as tokio_sleep, timeout},
};

/// An HTTP/1.1 server driving a [`MapRouter`].
///
/// Accepted sockets go to a queue served by a fixed pool of worker tasks;
/// when the queue is full the overflow gets an immediate `503`.
///
/// # Examples
///
/// ```no_run
/// use maker_net::{MapRouter, Server, StatusCode};
/// use tokio::net::TcpListener;
///
/// #[tokio::main]
/// async fn main() {
///     let mut router = MapRouter::new();
///     router
///         .get("^/$", |conn| Box::pin(async move {
///             conn.response.status(StatusCode::Ok).body("Hello world!");
///             true
///         }))
///         .unwrap();
///
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .router(router)
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener)
            .field("pending", &self.stream_queue.len())
            .field("server_limits", &self.server_limits)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts accepting connections. Runs until the task is dropped.
    pub async fn launch(self) {
        loop {
            let value = match self.listener.accept().await {
                Ok(value) => value,
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                    continue;
                }
            };

            match self.stream_queue.len() < self.server_limits.max_pending_connections {
                true => self.stream_queue.push(value),
                false => {
                    tracing::warn!(peer = %value.1, "connection queue full");
                    self.error_queue.push(value)
                }
            }
        }
    }

    #[inline]
    async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(value) = queue.pop() {
                return value;
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

/// Builder for configuring and creating [`Server`] instances.
#[derive(Debug, Default)]
pub struct ServerBuilder {
    listener: Option<TcpListener>,
    router: Option<MapRouter>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    web_socket_limits: Option<WebSocketLimits>,
}

impl ServerBuilder {
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the routing table. It is sorted when the server is built.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn router(mut self, router: MapRouter) -> Self {
        self.router = Some(router);
        self
    }

    /// Configures the worker pool and the overflow policy.
    ///
    /// ```no_run
    /// # #[tokio::main]
    /// # async fn main() {
    /// use maker_net::{limits::ServerLimits, MapRouter, Server};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .router(MapRouter::new())
    ///     .server_limits(ServerLimits {
    ///         max_connections: 2500,
    ///         max_pending_connections: 10000,
    ///         ..ServerLimits::default()
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures socket timeouts and the connection lifetime.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing and body limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures the header buffer pool and file streaming.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Configures WebSocket frame and message sizes.
    #[inline(always)]
    pub fn web_socket_limits(mut self, limits: WebSocketLimits) -> Self {
        self.web_socket_limits = Some(limits);
        self
    }

    /// Finalizes the builder, spawning the worker tasks.
    ///
    /// # Panics
    ///
    /// When `listener` or `router` was not called, or outside a tokio
    /// runtime.
    #[track_caller]
    pub fn build(self) -> Server {
        let (listener, mut router, limits) = self.get_all_parts();
        router.sort();

        let router = Arc::new(router);
        let cache = Arc::new(HrmCache::new(&limits.resp));
        let stream_queue = Arc::new(SegQueue::new());
        let error_queue = Arc::new(SegQueue::new());

        for _ in 0..limits.server.max_connections {
            Self::spawn_worker(&stream_queue, &router, &cache, &limits);
        }
        match limits.server.count_503_handlers {
            0 => Self::spawn_quiet_alarmist(&error_queue, &limits),
            count => {
                for _ in 0..count {
                    Self::spawn_alarmist(&error_queue, &limits);
                }
            }
        }

        tracing::debug!(
            workers = limits.server.max_connections,
            routes = router.groups.iter().map(|group| group.routes.len()).sum::<usize>(),
            "server built"
        );

        Server {
            listener,
            stream_queue,
            error_queue,
            server_limits: limits.server,
        }
    }

    fn spawn_worker(queue: &TcpQueue, router: &Arc<MapRouter>, cache: &Arc<HrmCache>, limits: &AllLimits) {
        let queue = queue.clone();
        let router = router.clone();
        let cache = cache.clone();
        let limits = limits.clone();

        tokio::spawn(async move {
            loop {
                let (stream, addr) = Server::get_stream(&queue, &limits.server.wait_strategy).await;

                if let Err(err) = SockRef::from(&stream).set_keepalive(true) {
                    tracing::debug!(%err, peer = %addr, "tcp keep-alive not applied");
                }

                let mut conn = Connection::new(
                    stream,
                    router.clone(),
                    cache.clone(),
                    limits.clone(),
                    addr.ip().to_string(),
                );
                conn.run().await;
            }
        });
    }

    fn spawn_alarmist(queue: &TcpQueue, limits: &AllLimits) {
        let queue = queue.clone();
        let server_limits = limits.server.clone();
        let write_timeout = limits.conn.socket_write_timeout;

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = Server::get_stream(&queue, &server_limits.wait_strategy).await;

                let _ = timeout(write_timeout, async {
                    stream.write_all(SERVICE_UNAVAILABLE).await?;
                    stream.shutdown().await
                })
                .await;
            }
        });
    }

    fn spawn_quiet_alarmist(queue: &TcpQueue, limits: &AllLimits) {
        let queue = queue.clone();
        let server_limits = limits.server.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = Server::get_stream(&queue, &server_limits.wait_strategy).await;

                drop(stream);
            }
        });
    }

    #[track_caller]
    fn get_all_parts(self) -> (TcpListener, MapRouter, AllLimits) {
        (
            self.listener
                .expect("The `listener` method must be called to create"),
            self.router
                .expect("The `router` method must be called to create"),
            AllLimits {
                server: self.server_limits.unwrap_or_default(),
                conn: self.connection_limits.unwrap_or_default(),
                req: self.request_limits.unwrap_or_default(),
                resp: self.response_limits.unwrap_or_default(),
                web_socket: self.web_socket_limits.unwrap_or_default(),
            },
        )
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tools::parse_responses, StatusCode};
    use tokio::io::AsyncReadExt;

    async fn start(router: MapRouter, server_limits: ServerLimits) -> SocketAddr {
        let server = Server::builder()
            .listener(TcpListener::bind("127.0.0.1:0").await.unwrap())
            .router(router)
            .server_limits(server_limits)
            .build();
        let address = server.local_addr().unwrap();
        tokio::spawn(server.launch());
        address
    }

    async fn request(address: SocketAddr, input: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(address).await.unwrap();
        stream.write_all(input).await.unwrap();

        let mut output = Vec::new();
        stream.read_to_end(&mut output).await.unwrap();
        output
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let mut router = MapRouter::new();
        router
            .get("^/peer$", |conn| Box::pin(async move {
                let address = conn.request.address.clone();
                conn.response.status(StatusCode::Ok).body(address);
                true
            }))
            .unwrap();

        let limits = ServerLimits {
            max_connections: 2,
            ..ServerLimits::default()
        };
        let address = start(router, limits).await;

        let output = request(address, b"GET /peer HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        let responses = parse_responses(&output);

        assert_eq!(responses[0].status_code, Some(200));
        assert_eq!(responses[0].content.data, b"127.0.0.1");
    }

    #[tokio::test]
    async fn overflow_gets_503() {
        let limits = ServerLimits {
            max_connections: 0,
            max_pending_connections: 0,
            count_503_handlers: 1,
            ..ServerLimits::default()
        };
        let address = start(MapRouter::new(), limits).await;

        // nothing is sent: unread input would turn the close into a reset
        let output = request(address, b"").await;
        let responses = parse_responses(&output);

        assert_eq!(responses[0].status_code, Some(503));
        assert_eq!(responses[0].headers.get("X-Error"), Some("SERVICE_UNAVAILABLE"));
    }
}
