use maker_net::{MapRouter, Server, StatusCode};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "maker_net=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut router = MapRouter::new();
    router
        .get("^/$", |conn| Box::pin(async move {
            conn.response
                .status(StatusCode::Ok)
                .header("Content-Type", "text/plain")
                .body("Hello, world!");
            true
        }))
        .unwrap();

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .router(router)
        .build()
        .launch()
        .await;
}
