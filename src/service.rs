//! The calculator capability set and the drivers that run it on a call.
//!
//! Handlers implement [`CalculatorService`] with plain typed signatures. The
//! `serve_*` drivers adapt one handler invocation onto a [`ServerCall`] for
//! each interaction pattern and guarantee the call gets exactly one terminal
//! signal: `Ok` completes the response flow, `Err` fails the call.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::channel::{CallContext, RequestStream, ResponseSink, ServerCall};
use crate::messages::*;
use crate::status::Status;

#[async_trait]
pub trait CalculatorService: Send + Sync + 'static {
    async fn sum(&self, request: SumRequest) -> Result<SumResponse, Status>;

    async fn square_root(&self, request: SquareRootRequest)
        -> Result<SquareRootResponse, Status>;

    /// Emits one response per prime factor.
    async fn prime_decomposition(
        &self,
        request: PrimeDecompositionRequest,
        responses: &ResponseSink<PrimeDecompositionResponse>,
    ) -> Result<(), Status>;

    /// Consumes requests until the caller half-closes, then answers once.
    async fn compute_average(
        &self,
        requests: &mut RequestStream<ComputeAverageRequest>,
    ) -> Result<ComputeAverageResponse, Status>;

    async fn compute_max(
        &self,
        requests: &mut RequestStream<ComputeMaxRequest>,
        responses: &ResponseSink<ComputeMaxResponse>,
    ) -> Result<(), Status>;

    async fn sum_with_deadline(
        &self,
        ctx: &CallContext,
        request: SumRequest,
    ) -> Result<SumResponse, Status>;
}

async fn single_request<Req>(requests: &mut RequestStream<Req>) -> Result<Req, Status> {
    requests
        .receive()
        .await?
        .ok_or_else(|| Status::invalid_argument("call closed without a request"))
}

fn finish<Resp>(responses: &ResponseSink<Resp>, result: Result<(), Status>) {
    match result {
        Ok(()) => {
            responses.close_send();
        }
        Err(status) => {
            debug!(code = %status.code(), message = status.message(), "handler returned an error");
            responses.fail(status);
        }
    }
}

pub async fn serve_unary<Req, Resp, F, Fut>(call: ServerCall<Req, Resp>, handler: F)
where
    F: FnOnce(CallContext, Req) -> Fut,
    Fut: Future<Output = Result<Resp, Status>>,
{
    let ServerCall {
        mut requests,
        responses,
    } = call;

    let result = match single_request(&mut requests).await {
        Ok(request) => match handler(responses.context().clone(), request).await {
            Ok(response) => responses.send(response).map_err(Status::from),
            Err(status) => Err(status),
        },
        Err(status) => Err(status),
    };
    finish(&responses, result);
}

pub async fn serve_server_streaming<Req, Resp, F>(call: ServerCall<Req, Resp>, handler: F)
where
    F: for<'a> FnOnce(Req, &'a ResponseSink<Resp>) -> BoxFuture<'a, Result<(), Status>>,
{
    let ServerCall {
        mut requests,
        responses,
    } = call;

    let result = match single_request(&mut requests).await {
        Ok(request) => handler(request, &responses).await,
        Err(status) => Err(status),
    };
    finish(&responses, result);
}

pub async fn serve_client_streaming<Req, Resp, F>(call: ServerCall<Req, Resp>, handler: F)
where
    F: for<'a> FnOnce(&'a mut RequestStream<Req>) -> BoxFuture<'a, Result<Resp, Status>>,
{
    let ServerCall {
        mut requests,
        responses,
    } = call;

    let result = match handler(&mut requests).await {
        Ok(response) => responses.send(response).map_err(Status::from),
        Err(status) => Err(status),
    };
    finish(&responses, result);
}

pub async fn serve_bidirectional<Req, Resp, F>(call: ServerCall<Req, Resp>, handler: F)
where
    F: for<'a> FnOnce(
        &'a mut RequestStream<Req>,
        &'a ResponseSink<Resp>,
    ) -> BoxFuture<'a, Result<(), Status>>,
{
    let ServerCall {
        mut requests,
        responses,
    } = call;

    let result = handler(&mut requests, &responses).await;
    finish(&responses, result);
}

/// A single operation of the calculator, with its message types and the
/// driver that serves it. Connectors use this to open typed calls.
pub trait Method: Send + Sync + 'static {
    const OPERATION: Operation;

    type Request: Serialize + DeserializeOwned + fmt::Debug + Send + 'static;
    type Response: Serialize + DeserializeOwned + fmt::Debug + Send + 'static;

    fn serve<S: CalculatorService>(
        service: Arc<S>,
        call: ServerCall<Self::Request, Self::Response>,
    ) -> BoxFuture<'static, ()>;
}

pub mod methods {
    use super::*;

    pub struct Sum;
    pub struct SquareRoot;
    pub struct PrimeDecomposition;
    pub struct ComputeAverage;
    pub struct ComputeMax;
    pub struct SumWithDeadline;

    impl Method for Sum {
        const OPERATION: Operation = Operation::Sum;
        type Request = SumRequest;
        type Response = SumResponse;

        fn serve<S: CalculatorService>(
            service: Arc<S>,
            call: ServerCall<SumRequest, SumResponse>,
        ) -> BoxFuture<'static, ()> {
            Box::pin(serve_unary(call, move |_, request| async move {
                service.sum(request).await
            }))
        }
    }

    impl Method for SquareRoot {
        const OPERATION: Operation = Operation::SquareRoot;
        type Request = SquareRootRequest;
        type Response = SquareRootResponse;

        fn serve<S: CalculatorService>(
            service: Arc<S>,
            call: ServerCall<SquareRootRequest, SquareRootResponse>,
        ) -> BoxFuture<'static, ()> {
            Box::pin(serve_unary(call, move |_, request| async move {
                service.square_root(request).await
            }))
        }
    }

    impl Method for PrimeDecomposition {
        const OPERATION: Operation = Operation::PrimeDecomposition;
        type Request = PrimeDecompositionRequest;
        type Response = PrimeDecompositionResponse;

        fn serve<S: CalculatorService>(
            service: Arc<S>,
            call: ServerCall<PrimeDecompositionRequest, PrimeDecompositionResponse>,
        ) -> BoxFuture<'static, ()> {
            Box::pin(serve_server_streaming(call, move |request, responses| {
                Box::pin(async move { service.prime_decomposition(request, responses).await })
            }))
        }
    }

    impl Method for ComputeAverage {
        const OPERATION: Operation = Operation::ComputeAverage;
        type Request = ComputeAverageRequest;
        type Response = ComputeAverageResponse;

        fn serve<S: CalculatorService>(
            service: Arc<S>,
            call: ServerCall<ComputeAverageRequest, ComputeAverageResponse>,
        ) -> BoxFuture<'static, ()> {
            Box::pin(serve_client_streaming(call, move |requests| {
                Box::pin(async move { service.compute_average(requests).await })
            }))
        }
    }

    impl Method for ComputeMax {
        const OPERATION: Operation = Operation::ComputeMax;
        type Request = ComputeMaxRequest;
        type Response = ComputeMaxResponse;

        fn serve<S: CalculatorService>(
            service: Arc<S>,
            call: ServerCall<ComputeMaxRequest, ComputeMaxResponse>,
        ) -> BoxFuture<'static, ()> {
            Box::pin(serve_bidirectional(call, move |requests, responses| {
                Box::pin(async move { service.compute_max(requests, responses).await })
            }))
        }
    }

    impl Method for SumWithDeadline {
        const OPERATION: Operation = Operation::SumWithDeadline;
        type Request = SumRequest;
        type Response = SumResponse;

        fn serve<S: CalculatorService>(
            service: Arc<S>,
            call: ServerCall<SumRequest, SumResponse>,
        ) -> BoxFuture<'static, ()> {
            Box::pin(serve_unary(call, move |ctx, request| async move {
                service.sum_with_deadline(&ctx, request).await
            }))
        }
    }
}
