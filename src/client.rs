//! Caller-side driver: one entry point per calculator operation.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::channel::{self, ClientCall, RequestSender, ResponseReceiver};
use crate::deadline::Deadline;
use crate::errors::RpcError;
use crate::messages::*;
use crate::service::{methods, CalculatorService, Method};
use crate::status::Status;

/// Opens typed calls to a calculator, wherever it runs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open<M: Method>(
        &self,
        deadline: Deadline,
    ) -> Result<ClientCall<M::Request, M::Response>, RpcError>;
}

/// Serves every call in-process by spawning the handler on the current
/// runtime.
pub struct LocalConnector<S> {
    service: Arc<S>,
}

impl<S: CalculatorService> LocalConnector<S> {
    pub fn new(service: S) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

impl<S> Clone for LocalConnector<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

#[async_trait]
impl<S: CalculatorService> Connector for LocalConnector<S> {
    async fn open<M: Method>(
        &self,
        deadline: Deadline,
    ) -> Result<ClientCall<M::Request, M::Response>, RpcError> {
        let (client, server) = channel::open(deadline);
        tokio::spawn(M::serve(self.service.clone(), server));
        debug!(method = M::OPERATION.name(), "opened in-process call");
        Ok(client)
    }
}

pub struct CalculatorClient<C> {
    connector: C,
    default_deadline: Option<Duration>,
}

impl<C: Connector> CalculatorClient<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            default_deadline: None,
        }
    }

    /// Deadline for calls that do not take an explicit one.
    pub fn with_default_deadline(mut self, timeout: Duration) -> Self {
        self.default_deadline = Some(timeout);
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub async fn sum(&self, request: SumRequest) -> Result<SumResponse, Status> {
        self.unary::<methods::Sum>(request, self.deadline()).await
    }

    pub async fn square_root(
        &self,
        request: SquareRootRequest,
    ) -> Result<SquareRootResponse, Status> {
        self.unary::<methods::SquareRoot>(request, self.deadline()).await
    }

    /// Starts a decomposition; factors arrive on the returned receiver.
    pub async fn prime_decomposition(
        &self,
        request: PrimeDecompositionRequest,
    ) -> Result<ResponseReceiver<PrimeDecompositionResponse>, Status> {
        let ClientCall {
            requests,
            responses,
        } = self
            .start::<methods::PrimeDecomposition>(self.deadline())
            .await?;
        send_single(&requests, request);
        Ok(responses)
    }

    /// Streams every request, half-closes, and waits for the single average.
    pub async fn compute_average<S>(&self, requests: S) -> Result<ComputeAverageResponse, Status>
    where
        S: Stream<Item = ComputeAverageRequest> + Send + 'static,
    {
        let ClientCall {
            requests: sender,
            mut responses,
        } = self.start::<methods::ComputeAverage>(self.deadline()).await?;
        spawn_sender(sender, requests);
        single_response(&mut responses).await
    }

    /// Streams requests from a background task while new maxima arrive on the
    /// returned receiver.
    pub async fn compute_max<S>(
        &self,
        requests: S,
    ) -> Result<ResponseReceiver<ComputeMaxResponse>, Status>
    where
        S: Stream<Item = ComputeMaxRequest> + Send + 'static,
    {
        let ClientCall {
            requests: sender,
            responses,
        } = self.start::<methods::ComputeMax>(self.deadline()).await?;
        spawn_sender(sender, requests);
        Ok(responses)
    }

    pub async fn sum_with_deadline(
        &self,
        request: SumRequest,
        timeout: Duration,
    ) -> Result<SumResponse, Status> {
        self.unary::<methods::SumWithDeadline>(request, Deadline::after(timeout)).await
    }

    fn deadline(&self) -> Deadline {
        Deadline::from_timeout(self.default_deadline)
    }

    async fn start<M: Method>(
        &self,
        deadline: Deadline,
    ) -> Result<ClientCall<M::Request, M::Response>, Status> {
        self.connector
            .open::<M>(deadline)
            .await
            .map_err(Status::from)
    }

    async fn unary<M: Method>(
        &self,
        request: M::Request,
        deadline: Deadline,
    ) -> Result<M::Response, Status> {
        let ClientCall {
            requests,
            mut responses,
        } = self.start::<M>(deadline).await?;
        send_single(&requests, request);
        single_response(&mut responses).await
    }
}

fn send_single<Req>(requests: &RequestSender<Req>, request: Req) {
    // A rejected send means the call already ended; the receiver reports why.
    if let Err(err) = requests.send(request) {
        debug!(%err, "request not sent");
    }
    requests.close_send();
}

/// Receives exactly one response followed by successful completion.
async fn single_response<Resp>(responses: &mut ResponseReceiver<Resp>) -> Result<Resp, Status> {
    let response = responses
        .receive()
        .await?
        .ok_or_else(|| Status::internal("call completed without a response"))?;
    match responses.receive().await? {
        None => Ok(response),
        Some(_) => Err(Status::internal("expected a single response")),
    }
}

fn spawn_sender<Req, S>(sender: RequestSender<Req>, requests: S) -> JoinHandle<()>
where
    Req: Send + 'static,
    S: Stream<Item = Req> + Send + 'static,
{
    tokio::spawn(async move {
        let mut requests = Box::pin(requests);
        while let Some(request) = requests.next().await {
            if let Err(err) = sender.send(request) {
                debug!(%err, "stopped streaming requests");
                break;
            }
        }
        sender.close_send();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CallContext, RequestStream, ResponseSink};
    use crate::status::Code;
    use futures::stream;

    /// Handlers that fail or stall on purpose.
    struct Misbehaving;

    #[async_trait]
    impl CalculatorService for Misbehaving {
        async fn sum(&self, request: SumRequest) -> Result<SumResponse, Status> {
            Ok(SumResponse {
                sum: request.first + request.second,
            })
        }

        async fn square_root(
            &self,
            _request: SquareRootRequest,
        ) -> Result<SquareRootResponse, Status> {
            Err(Status::unknown("not today"))
        }

        async fn prime_decomposition(
            &self,
            _request: PrimeDecompositionRequest,
            responses: &ResponseSink<PrimeDecompositionResponse>,
        ) -> Result<(), Status> {
            responses.context().terminated().await;
            Ok(())
        }

        async fn compute_average(
            &self,
            _requests: &mut RequestStream<ComputeAverageRequest>,
        ) -> Result<ComputeAverageResponse, Status> {
            Err(Status::internal("gave up early"))
        }

        async fn compute_max(
            &self,
            _requests: &mut RequestStream<ComputeMaxRequest>,
            _responses: &ResponseSink<ComputeMaxResponse>,
        ) -> Result<(), Status> {
            Ok(())
        }

        async fn sum_with_deadline(
            &self,
            ctx: &CallContext,
            request: SumRequest,
        ) -> Result<SumResponse, Status> {
            ctx.terminated().await;
            self.sum(request).await
        }
    }

    fn client() -> CalculatorClient<LocalConnector<Misbehaving>> {
        CalculatorClient::new(LocalConnector::new(Misbehaving))
    }

    #[tokio::test]
    async fn unary_errors_keep_their_code() {
        let status = client()
            .square_root(SquareRootRequest { number: 4 })
            .await
            .unwrap_err();
        assert_eq!(status, Status::unknown("not today"));
    }

    #[tokio::test]
    async fn early_service_failure_reaches_the_caller() {
        let requests = stream::iter((0..1000).map(|number| ComputeAverageRequest { number }));
        let status = client().compute_average(requests).await.unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "gave up early");
    }

    #[tokio::test]
    async fn default_deadline_bounds_streaming_calls() {
        let client = client().with_default_deadline(Duration::from_millis(50));
        let mut factors = client
            .prime_decomposition(PrimeDecompositionRequest { number: 12 })
            .await
            .unwrap();
        let status = factors.receive().await.unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn bidirectional_call_can_finish_without_responses() {
        let mut maxima = client()
            .compute_max(stream::iter(vec![ComputeMaxRequest { number: 1 }]))
            .await
            .unwrap();
        assert_eq!(maxima.receive().await, Ok(None));
    }
}
