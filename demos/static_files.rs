//! Serves the current directory with listings, ranges and gzip.
//!
//! `cargo run --example static_files -- ./public`
use maker_net::{MapRouter, Server};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "maker_net=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let root = std::env::args().nth(1).unwrap_or_else(|| ".".to_owned());

    let mut router = MapRouter::new();
    router.base.files_directory = root.into();
    router.base.allow_directory_listing = true;
    router.base.static_file_max_age = 60;
    router.base.compression.enabled = true;
    router.base.hidden_files.push(regex::Regex::new(r"/\.").unwrap());

    tracing::info!(root = %router.base.files_directory.display(), "serving files on 127.0.0.1:8080");

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .router(router)
        .build()
        .launch()
        .await;
}
