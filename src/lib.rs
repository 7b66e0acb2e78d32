//! maker_net - incremental HTTP/1.1 and WebSocket protocol engine
//!
//! A server and a client built on one set of protocol pieces: a
//! byte-at-a-time tolerant parser, a regex router with per-route policy,
//! static file serving and a WebSocket frame codec.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, pipelining, chunked bodies, `100-continue`
//! - **HTTP/1.0**: keep-alive only when asked for
//! - **WebSocket**: RFC 6455 handshake, fragmentation, ping/pong and close
//!
//! # Server Features
//!
//! - **Routing** - route groups by host and path, regex captures, per-route callbacks
//! - **Static files** - index files, directory listings, `ETag`/`Last-Modified`, byte ranges
//! - **Uploads** - `multipart/form-data` to memory or temporary files, `PUT`/`DELETE`
//! - **Policy** - Basic/Bearer auth, method allow-lists, redirects, aliases, CORS
//! - **Compression** - gzip and deflate by `Accept-Encoding`
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use maker_net::{MapRouter, Server, StatusCode};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut router = MapRouter::new();
//!     router
//!         .get("^/$", |conn| Box::pin(async move {
//!             conn.response.status(StatusCode::Ok).body("Hello World!");
//!             true
//!         }))
//!         .unwrap();
//!
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .router(router)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//! Static files with captures:
//! ```no_run
//! use maker_net::{MapRouter, Server, StatusCode};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut router = MapRouter::new();
//!     router.base.files_directory = "./public".into();
//!     router.base.allow_directory_listing = true;
//!
//!     router
//!         .get(r"^/api/users/(\d+)$", |conn| Box::pin(async move {
//!             let id = conn.request.matches[1].clone();
//!             conn.response.status(StatusCode::Ok).body(id);
//!             true
//!         }))
//!         .unwrap();
//!
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .router(router)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//! Advanced configuration:
//! ```no_run
//! use maker_net::{MapRouter, Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .router(MapRouter::new())
//!         .server_limits(ServerLimits {
//!             max_connections: 5000,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 64,
//!             max_request_size: 16 * 1024 * 1024,
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! # Logging
//!
//! Everything is reported through [`tracing`]: accept failures at `error`,
//! aborted requests at `warn`, and per-request detail at `debug`/`trace`.
//! Install any subscriber to see it.

pub mod http {
    pub mod content;
    pub mod fetch;
    pub mod parser;
    pub mod query;
    pub mod request;
    pub mod response;
    pub mod types;
    pub mod web_codec;
}
pub mod router {
    pub mod entry;
    pub mod group;
    pub mod map;
}
pub mod server {
    pub mod connection;
    pub(crate) mod logical;
    pub mod paths;
    pub mod permissions;
    pub(crate) mod resources;
    pub(crate) mod routing;
    pub(crate) mod server_impl;
    pub mod utils;
    pub mod web_socket;

    #[cfg(test)]
    mod scenarios;
}
pub(crate) mod cache;
pub mod client;
pub mod errors;
pub mod limits;
pub mod net;

pub use crate::{
    cache::HrmCache,
    client::{Client, Pool},
    errors::ErrorKind,
    http::{
        content::{ContentFrame, Resource},
        fetch::FetchFrame,
        query,
        request::{AuthType, Credentials, RequestFrame},
        response::{
            write::{BodyWriter, WriteBuffer},
            Cookie, ResponseFrame,
        },
        types::{HeaderMap, Method, StatusCode, Version},
        web_codec::Opcode,
    },
    router::{
        entry::{RouterEntry, WebSocketCallbacks},
        map::{MapRouter, RouteId},
    },
    server::{
        connection::Connection,
        server_impl::{Server, ServerBuilder},
        web_socket::WebSocketFrame,
    },
};

#[cfg(test)]
pub(crate) mod tools {
    use crate::{
        cache::HrmCache,
        http::{
            parser::{Chunked, Parser, Progress},
            response::ResponseFrame,
        },
        limits::{AllLimits, ReqLimits},
        router::map::MapRouter,
        server::connection::{has_body, Connection},
    };
    use std::sync::Arc;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
        task::JoinHandle,
    };

    /// Serves one in-memory connection; the returned end is the client.
    pub fn spawn_connection(mut router: MapRouter, limits: AllLimits) -> (DuplexStream, JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(1 << 20);
        router.sort();

        let cache = Arc::new(HrmCache::new(&limits.resp));
        let mut conn = Connection::new(server, Arc::new(router), cache, limits, "127.0.0.1".to_owned());
        let task = tokio::spawn(async move { conn.run().await });
        (client, task)
    }

    /// Writes `input`, half-closes, and returns everything the server sent.
    pub async fn exchange(router: MapRouter, limits: AllLimits, input: &[u8]) -> Vec<u8> {
        let (mut client, task) = spawn_connection(router, limits);
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        task.await.unwrap();
        output
    }

    /// Splits raw server output into responses with their bodies.
    pub fn parse_responses(mut output: &[u8]) -> Vec<ResponseFrame> {
        let mut responses = Vec::new();

        while !output.is_empty() {
            let mut parser = Parser::new(&ReqLimits::default());
            let mut response = ResponseFrame::new();
            let end = match parser.parse_response(output, 0, &mut response).unwrap() {
                Progress::Complete(end) => end,
                Progress::Partial => panic!("truncated response: {:?}", String::from_utf8_lossy(output)),
            };
            output = &output[end..];

            let status = response.status_code.unwrap();
            if status == 101 {
                responses.push(response);
                break;
            }

            if !has_body(status) {
                responses.push(response);
                continue;
            }

            if response.headers.has_token("Transfer-Encoding", "chunked") {
                parser.prepare_for_chunked();
                let mut body = output.to_vec();
                match parser.parse_decode_chunked(&mut body).unwrap() {
                    Chunked::Complete { decoded, leftover } => {
                        output = &output[output.len() - leftover..];
                        body.truncate(decoded);
                    }
                    Chunked::Partial { .. } => panic!("unterminated chunked body"),
                }
                response.content.assign(body);
            } else {
                let length: usize = response
                    .headers
                    .get("Content-Length")
                    .map_or(0, |value| value.trim().parse().unwrap());
                response.content.assign(output[..length].to_vec());
                output = &output[length..];
            }

            responses.push(response);
        }

        responses
    }
}
