//! Engine configuration: limits, timeouts and buffer policies
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Slowloris attacks
//! - Header flooding
//! - Oversized uploads and WebSocket messages
//!
//! Route-level behaviour (files directory, compression, auth, ...) is not
//! configured here but on [`RouterEntry`](crate::router::entry::RouterEntry).
//!
//! # Examples
//!
//! ```no_run
//! use maker_net::{Server, MapRouter, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .router(MapRouter::new())
//!         .server_limits(ServerLimits {
//!             max_connections: 5000, // Higher concurrency
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 96,                    // More headers for complex APIs
//!             max_request_size: 512 * 1024 * 1024, // Large uploads
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls server-level concurrency, queueing, and performance behavior.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   Yes   /----------------\   No   [-------------]
/// [ Add to queue ] <====== | Queue if full? | =====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \==================\\          //====================\
///                            V          V                    ||
/// [---------]   Yes   /--------------------------\   No   [------]
/// [ Worker  ] <====== | Is there a free worker?  | =====> [ Wait ]
/// [---------]         \--------------------------/        [------]
/// ```
///
/// Workers are long-lived tasks created once by
/// [`ServerBuilder::build`](crate::ServerBuilder::build). Each one pulls an
/// accepted socket from the shared queue, drives its connection state
/// machine to the end and goes back to the queue.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker tasks, i.e. connections served at once (default: `100`).
    pub max_connections: usize,

    /// Maximum number of accepted sockets waiting for a worker (default: `250`).
    ///
    /// When the queue is full, new connections receive an immediate `503`.
    pub max_pending_connections: usize,

    /// How idle workers wait for the queue (default: `Sleep(50μs)`).
    pub wait_strategy: WaitStrategy,

    /// Dedicated workers answering `503` to overflowing sockets (default: `1`).
    ///
    /// Set to 0 to silently close those sockets instead.
    pub count_503_handlers: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,

            _priv: (),
        }
    }
}

/// Strategy for worker task waiting when no connections are available
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]
    ///
    /// Lowest latency, but keeps a core busy.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`]
    Sleep(Duration),
}

/// Per-socket timeouts.
///
/// Timeouts surface as [`ErrorKind::Timeout`](crate::ErrorKind::Timeout)
/// and abort the current request; they are never retried.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum duration to wait for reading data from socket (default: `5 seconds`)
    ///
    /// Also bounds the idle time between two keep-alive requests, and is
    /// advertised in the `Keep-Alive` response header.
    pub socket_read_timeout: Duration,

    /// Maximum duration of a single write (default: `10 seconds`)
    pub socket_write_timeout: Duration,

    /// Maximum lifetime of connection from establishment to closure (default: `2 minutes`)
    ///
    /// A connection older than this is answered with `Connection: close`
    /// on its next response. WebSocket tunnels are not affected.
    pub connection_lifetime: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(5),
            socket_write_timeout: Duration::from_secs(10),
            connection_lifetime: Duration::from_secs(120),

            _priv: (),
        }
    }
}

/// HTTP request parsing and body limits
///
/// 🔧 **You MAY need to increase these if you see:**
/// - `413 Payload Too Large` for legitimate uploads
/// - `431 Request Header Fields Too Large`
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum size of request line plus headers (default: `16 KB`)
    ///
    /// Exceeding it answers `431`.
    pub max_header_size: usize,

    /// Maximum number of header lines (default: `64`)
    pub header_count: usize,

    /// Largest body buffered in memory by
    /// [`Connection::fetch_content`](crate::Connection::fetch_content)
    /// (default: `1 MB`). Bigger bodies must be streamed or stored.
    pub max_heap_buffer: usize,

    /// Largest body accepted at all (default: `64 MB`)
    ///
    /// A larger declared `Content-Length` marks the content as `exceeds`
    /// and answers `413`.
    pub max_request_size: usize,

    /// Size of one socket read (default: `8 KB`)
    pub max_net_buffer: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_header_size: 16 * 1024,
            header_count: 64,
            max_heap_buffer: 1024 * 1024,
            max_request_size: 64 * 1024 * 1024,
            max_net_buffer: 8 * 1024,

            _priv: (),
        }
    }
}

/// Response composition and buffer pooling limits.
///
/// # Buffer Management
///
/// Header buffers come from the shared [`HrmCache`](crate::HrmCache). A
/// returned buffer is recycled as follows:
/// ```rust
/// # use maker_net::limits::RespLimits;
/// # let limits = RespLimits::default();
/// # let mut buffer: Vec<u8> = Vec::with_capacity(limits.default_capacity);
/// #
/// if buffer.capacity() > limits.max_capacity {
///     buffer = Vec::with_capacity(limits.default_capacity);
/// } else {
///     buffer.clear();
/// }
/// ```
/// and the pool itself never holds more than `pool_capacity` buffers.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial capacity of a pooled buffer (default: `1024 B`)
    pub default_capacity: usize,
    /// Largest capacity a buffer may keep when recycled (default: `8192 B`)
    pub max_capacity: usize,
    /// Number of idle buffers kept by the pool (default: `256`)
    pub pool_capacity: usize,

    /// Bodies up to this size are written together with the headers
    /// in a single write (default: `768 B`)
    pub inline_body_size: usize,

    /// Read size used when a file is streamed in chunks (default: `64 KB`)
    pub file_chunk_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 8 * 1024,
            pool_capacity: 256,
            inline_body_size: 768,
            file_chunk_size: 64 * 1024,

            _priv: (),
        }
    }
}

/// WebSocket framing limits, shared by server tunnels and client upgrades.
#[derive(Debug, Clone)]
pub struct WebSocketLimits {
    /// Largest single frame payload (default: `1 MB`)
    pub max_frame_size: u64,
    /// Largest reassembled message (default: `4 MB`)
    pub max_message_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for WebSocketLimits {
    fn default() -> Self {
        Self {
            max_frame_size: 1024 * 1024,
            max_message_size: 4 * 1024 * 1024,

            _priv: (),
        }
    }
}

/// Every limit a connection needs, cloned once per worker.
#[derive(Debug, Clone, Default)]
pub(crate) struct AllLimits {
    pub(crate) server: ServerLimits,
    pub(crate) conn: ConnLimits,
    pub(crate) req: ReqLimits,
    pub(crate) resp: RespLimits,
    pub(crate) web_socket: WebSocketLimits,
}
