use std::net::SocketAddr;

use tracing::info;

use linkbook_web::server::{serve, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let addr: SocketAddr = std::env::var("LINKBOOK_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let cfg = ServerConfig::from_env();
    info!("Starting Linkbook API on http://{} (db: {})", addr, cfg.db_path);

    serve(addr, cfg).await
}
