//! Calculator client over QUIC.
//!
//! Usage: `calculator_client <usecase>` where the usecase is one of `unary`,
//! `server_streaming`, `client_streaming`, `bidi_streaming`, `deadline` or
//! `errors`. `CALCNET_ADDR` and `CALCNET_CERT` locate the server.

use anyhow::{bail, Result};
use calcnet::*;
use futures::{stream, StreamExt};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let usecase = env::args().nth(1).unwrap_or_else(|| "unary".to_string());
    let addr: SocketAddr = env::var("CALCNET_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:50051".to_string())
        .parse()?;
    let cert = env::var("CALCNET_CERT").unwrap_or_else(|_| "certs/test_cert.pem".to_string());

    let config = RpcConfig::new(cert, "0.0.0.0:0").with_server_name("localhost");
    let client = CalculatorClient::new(RpcClient::connect(addr, config).await?);

    match usecase.as_str() {
        "unary" => unary(&client).await,
        "server_streaming" => server_streaming(&client).await,
        "client_streaming" => client_streaming(&client).await,
        "bidi_streaming" => bidi_streaming(&client).await,
        "deadline" => deadline(&client).await,
        "errors" => errors(&client).await,
        other => bail!("unknown usecase {other:?}"),
    }
}

async fn unary(client: &CalculatorClient<RpcClient>) -> Result<()> {
    let response = client
        .sum(SumRequest {
            first: 3,
            second: 10,
        })
        .await?;
    info!(sum = response.sum, "3 + 10");
    Ok(())
}

async fn server_streaming(client: &CalculatorClient<RpcClient>) -> Result<()> {
    let number = 1_239_039_284;
    let mut factors = client
        .prime_decomposition(PrimeDecompositionRequest { number })
        .await?;
    while let Some(response) = factors.receive().await? {
        info!(number, factor = response.prime_factor, "prime factor");
    }
    Ok(())
}

async fn client_streaming(client: &CalculatorClient<RpcClient>) -> Result<()> {
    let numbers = stream::iter((1..=4).map(|number| ComputeAverageRequest { number }));
    let response = client.compute_average(numbers).await?;
    info!(average = response.average, "average of 1..=4");
    Ok(())
}

async fn bidi_streaming(client: &CalculatorClient<RpcClient>) -> Result<()> {
    let numbers = stream::iter([1, 5, 3, 6, 2, 20])
        .then(|number| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ComputeMaxRequest { number }
        });
    let mut maxima = client.compute_max(numbers).await?.into_stream().boxed();
    while let Some(response) = maxima.next().await {
        info!(max = response?.max, "new maximum");
    }
    Ok(())
}

async fn deadline(client: &CalculatorClient<RpcClient>) -> Result<()> {
    for timeout in [Duration::from_secs(5), Duration::from_secs(1)] {
        let request = SumRequest {
            first: 3,
            second: 10,
        };
        match client.sum_with_deadline(request, timeout).await {
            Ok(response) => info!(?timeout, sum = response.sum, "finished in time"),
            Err(status) if status.is_deadline_exceeded() => {
                warn!(?timeout, "deadline exceeded")
            }
            Err(status) if status.code() == Code::Cancelled => {
                warn!(?timeout, message = status.message(), "call cancelled")
            }
            Err(status) => return Err(status.into()),
        }
    }
    Ok(())
}

async fn errors(client: &CalculatorClient<RpcClient>) -> Result<()> {
    for number in [10, -2] {
        match client.square_root(SquareRootRequest { number }).await {
            Ok(response) => info!(number, root = response.root, "square root"),
            Err(status) => match status.code() {
                Code::InvalidArgument => warn!(number, message = status.message(), "rejected"),
                code => warn!(number, %code, message = status.message(), "failed"),
            },
        }
    }
    Ok(())
}
