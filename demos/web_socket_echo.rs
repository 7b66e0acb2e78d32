//! WebSocket echo on `ws://127.0.0.1:8080/echo`.
use maker_net::{MapRouter, Opcode, Server, WebSocketFrame};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "maker_net=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut router = MapRouter::new();
    router.base.allow_web_socket = true;

    router
        .web_socket_receive("^/echo$", |frame: &Arc<WebSocketFrame>, opcode: Opcode, payload: &[u8]| {
            frame.send(opcode, payload);
        })
        .unwrap()
        .on_web_socket_connect(|frame: &Arc<WebSocketFrame>| {
            frame.send_text("connected");
        })
        .on_web_socket_disconnect(|_: &Arc<WebSocketFrame>| {
            tracing::info!("peer left");
        });

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .router(router)
        .build()
        .launch()
        .await;
}
