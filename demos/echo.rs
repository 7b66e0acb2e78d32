//! Answers every POST with the request body as JSON, and every GET with
//! the parsed query string.
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
        .post("^/", |conn| Box::pin(async move {
            if let Err(err) = conn.fetch_content().await {
                conn.response.set_error(&err);
                return true;
            }

            let body = conn.request.content.get_text().into_owned();
            let result = format!(r#"{{"url": {:?}, "body": {body:?}}}"#, conn.request.location);
            conn.response
                .status(StatusCode::Ok)
                .header("Content-Type", "application/json")
                .body(result);
            true
        }))
        .unwrap()
        .on_get(|conn| Box::pin(async move {
            let args = match conn.request.query_args(64) {
                Ok(args) => args,
                Err(err) => {
                    conn.response.set_error(&err.into());
                    return true;
                }
            };

            conn.response.status(StatusCode::Ok).body_with(|body| {
                for (name, value) in &args {
                    body.write(name.as_str());
                    body.write(" = ");
                    body.write(value.as_str());
                    body.write("\n");
                }
            });
            true
        }));

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .router(router)
        .build()
        .launch()
        .await;
}
