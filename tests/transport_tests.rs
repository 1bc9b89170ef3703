//! Calls routed through the frame codec and both transport bridges, using
//! in-memory streams in place of QUIC.

use async_trait::async_trait;
use calcnet::transport::memory::MemoryConnection;
use calcnet::*;
use futures::{stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn config() -> RpcConfig {
    RpcConfig::new("certs/test_cert.pem", "127.0.0.1:0").with_server_name("localhost")
}

fn remote<S: CalculatorService>(service: S) -> CalculatorClient<RpcClient> {
    let server = RpcServer::new(service, config());
    let connection = MemoryConnection::new(server);
    CalculatorClient::new(RpcClient::with_connection(Box::new(connection), config()))
}

fn fast_calculator() -> Calculator {
    Calculator::new(CalculatorConfig::new().with_work_step(Duration::from_millis(20)))
}

/// Delegates to [`Calculator`] but parks `prime_decomposition` until the call
/// is cancelled, recording that it noticed.
struct CancelWatcher {
    inner: Calculator,
    noticed: Arc<AtomicBool>,
    done: Arc<Notify>,
}

#[async_trait]
impl CalculatorService for CancelWatcher {
    async fn sum(&self, request: SumRequest) -> Result<SumResponse, Status> {
        self.inner.sum(request).await
    }

    async fn square_root(&self, request: SquareRootRequest) -> Result<SquareRootResponse, Status> {
        self.inner.square_root(request).await
    }

    async fn prime_decomposition(
        &self,
        _request: PrimeDecompositionRequest,
        responses: &ResponseSink<PrimeDecompositionResponse>,
    ) -> Result<(), Status> {
        responses.send(PrimeDecompositionResponse { prime_factor: 2 })?;
        responses.context().terminated().await;
        self.noticed
            .store(responses.context().is_cancelled(), Ordering::SeqCst);
        self.done.notify_one();
        Ok(())
    }

    async fn compute_average(
        &self,
        requests: &mut RequestStream<ComputeAverageRequest>,
    ) -> Result<ComputeAverageResponse, Status> {
        self.inner.compute_average(requests).await
    }

    async fn compute_max(
        &self,
        requests: &mut RequestStream<ComputeMaxRequest>,
        responses: &ResponseSink<ComputeMaxResponse>,
    ) -> Result<(), Status> {
        self.inner.compute_max(requests, responses).await
    }

    async fn sum_with_deadline(
        &self,
        ctx: &CallContext,
        request: SumRequest,
    ) -> Result<SumResponse, Status> {
        self.inner.sum_with_deadline(ctx, request).await
    }
}

#[tokio::test]
async fn unary_calls_cross_the_wire() {
    let client = remote(Calculator::default());
    let response = client
        .sum(SumRequest {
            first: 3,
            second: 10,
        })
        .await
        .unwrap();
    assert_eq!(response.sum, 13);

    let response = client
        .square_root(SquareRootRequest { number: 81 })
        .await
        .unwrap();
    assert_eq!(response.root, 9.0);
}

#[tokio::test]
async fn invalid_argument_keeps_its_classification() {
    let status = remote(Calculator::default())
        .square_root(SquareRootRequest { number: -9 })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message(), "received a negative number: -9");
}

#[tokio::test]
async fn server_streaming_over_the_wire() {
    let factors: Vec<i64> = remote(Calculator::default())
        .prime_decomposition(PrimeDecompositionRequest { number: 360 })
        .await
        .unwrap()
        .into_stream()
        .map(|response| response.unwrap().prime_factor)
        .collect()
        .await;
    assert_eq!(factors, vec![2, 2, 2, 3, 3, 5]);
}

#[tokio::test]
async fn client_streaming_over_the_wire() {
    let requests = stream::iter((1..=4).map(|number| ComputeAverageRequest { number }));
    let response = remote(Calculator::default())
        .compute_average(requests)
        .await
        .unwrap();
    assert_eq!(response.average, 2.5);
}

#[tokio::test]
async fn bidirectional_streaming_over_the_wire() {
    let requests = stream::iter([1, 5, 3, 6, 2, 20].map(|number| ComputeMaxRequest { number }));
    let maxima: Vec<i64> = remote(Calculator::default())
        .compute_max(requests)
        .await
        .unwrap()
        .into_stream()
        .map(|response| response.unwrap().max)
        .collect()
        .await;
    assert_eq!(maxima, vec![1, 5, 6, 20]);
}

#[tokio::test]
async fn deadline_is_enforced_across_the_wire() {
    let client = remote(fast_calculator());
    let request = SumRequest {
        first: 3,
        second: 10,
    };

    let response = client
        .sum_with_deadline(request, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.sum, 13);

    let status = client
        .sum_with_deadline(request, Duration::from_millis(25))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded, "{status}");
}

#[tokio::test]
async fn dropping_the_receiver_cancels_the_remote_handler() {
    let noticed = Arc::new(AtomicBool::new(false));
    let done = Arc::new(Notify::new());
    let client = remote(CancelWatcher {
        inner: Calculator::default(),
        noticed: noticed.clone(),
        done: done.clone(),
    });

    let mut factors = client
        .prime_decomposition(PrimeDecompositionRequest { number: 12 })
        .await
        .unwrap();
    assert_eq!(factors.receive().await.unwrap().unwrap().prime_factor, 2);
    drop(factors);

    tokio::time::timeout(Duration::from_secs(2), done.notified())
        .await
        .expect("handler should observe the cancellation");
    assert!(noticed.load(Ordering::SeqCst));
}
