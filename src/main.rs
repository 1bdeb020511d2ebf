use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wiretap::{CertificateAuthority, HttpProtocol, LogMiddleware, MitmServer, ProxyConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ProxyConfig::from_env()?;
    info!(
        host = %config.host,
        port = config.port,
        ca_dir = %config.ca_dir.display(),
        "starting wiretap v{}",
        wiretap::VERSION
    );

    let ca = Arc::new(
        CertificateAuthority::init(&config.ca_dir)
            .await
            .context("failed to initialize certificate authority")?,
    );

    let http = HttpProtocol::new(Arc::clone(&ca))
        .with_buffer_size(config.buffer_size)
        .with_timeout(config.timeout)
        .with_keep_alive(config.keep_alive);

    let server = Arc::new(MitmServer::new(
        &config,
        vec![Arc::new(http)],
        vec![Arc::new(LogMiddleware)],
    ));

    // Ctrl-C triggers a graceful stop; in-flight connections get the grace
    // window to drain.
    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            stopper.stop();
        }
    });

    server.run().await
}
