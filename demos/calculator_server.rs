//! Calculator server over QUIC.
//!
//! `CALCNET_ADDR` (default `127.0.0.1:50051`), `CALCNET_CERT` and `CALCNET_KEY`
//! select the endpoint and certificate; `CALCNET_SERVER_THREADS` sizes the
//! runtime.

use anyhow::Result;
use calcnet::{runtime, Calculator, CalculatorConfig, RpcConfig, RpcServer};
use std::env;
use std::time::Duration;
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let threads = runtime::server_worker_threads();
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()?
        .block_on(serve(threads))
}

async fn serve(threads: usize) -> Result<()> {
    let addr = env::var("CALCNET_ADDR").unwrap_or_else(|_| "127.0.0.1:50051".to_string());
    let cert = env::var("CALCNET_CERT").unwrap_or_else(|_| "certs/test_cert.pem".to_string());
    let key = env::var("CALCNET_KEY").unwrap_or_else(|_| "certs/test_key.pem".to_string());

    let config = RpcConfig::new(cert, addr)
        .with_key_path(key)
        .with_server_name("localhost")
        .with_default_deadline(Duration::from_secs(30));

    let mut server = RpcServer::new(Calculator::new(CalculatorConfig::default()), config);
    let quic_server = server.bind()?;
    info!(threads, addr = ?server.socket_addr, "serving Calculator");

    server.start(quic_server).await?;
    Ok(())
}
