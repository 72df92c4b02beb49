use std::sync::Arc;

use clap::Parser;
use coedit_server::{ServerState, server};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Args {
    /// Address to listen on.
    #[clap(long, default_value = "localhost:5000")]
    host: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let state = Arc::new(ServerState::from_env().await.expect("Init server state"));

    info!("Starting server on http://{}", args.host);

    let listener = tokio::net::TcpListener::bind(&args.host)
        .await
        .expect("Unable to bind to host");
    axum::serve(listener, server(state).layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(async { tokio::signal::ctrl_c().await.expect("Listen to ctrlc") })
        .await
        .unwrap();

    info!("Server has shut down");
}
