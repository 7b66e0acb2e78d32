//! `cargo run --example client_fetch -- http://127.0.0.1:8080/`
use maker_net::{client, FetchFrame, Method};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), maker_net::ErrorKind> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "maker_net=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8080/".to_owned());

    let frame = FetchFrame::new(Method::Get)
        .header("User-Agent", "maker_net-demo")
        .max_redirects(5);
    let response = client::fetch(&url, frame).await?;

    println!("{} {:?}", response.version.as_str(), response.status_code);
    for (name, values) in response.headers.iter() {
        for value in values {
            println!("{name}: {value}");
        }
    }
    println!();
    println!("{}", response.content.get_text());
    Ok(())
}
