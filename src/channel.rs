//! The call channel: one in-flight RPC modelled as two independent,
//! unidirectional message flows plus a single terminal status.
//!
//! Every interaction pattern is a specialization of the same channel. Unary
//! and server-streaming callers send one request and half-close right away,
//! client-streaming services send one response before completing, and
//! bidirectional calls use both flows freely.
//!
//! Each flow is a FIFO with exactly one producer and one consumer, enforced by
//! ownership: the halves returned by [`open`] are not `Clone` and receiving
//! takes `&mut self`.

use futures::Stream;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::Notify;
use tracing::debug;

use crate::deadline::Deadline;
use crate::errors::RpcError;
use crate::status::Status;

/// One of the two flows of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Caller to service.
    Requests,
    /// Service to caller.
    Responses,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Requests => f.write_str("request"),
            Direction::Responses => f.write_str("response"),
        }
    }
}

/// Lifecycle of a single flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Open,
    /// The sender is done but the receiver has not drained the buffer yet.
    HalfClosed,
    Closed,
}

/// Terminal status of a call. Set at most once.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Completed,
    Failed(Status),
}

enum Next<T> {
    Message(T),
    End,
    Empty,
}

struct FlowInner<T> {
    queue: VecDeque<T>,
    state: FlowState,
}

struct Flow<T> {
    direction: Direction,
    inner: Mutex<FlowInner<T>>,
    ready: Notify,
}

impl<T> Flow<T> {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            inner: Mutex::new(FlowInner {
                queue: VecDeque::new(),
                state: FlowState::Open,
            }),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowInner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, message: T) -> Result<(), RpcError> {
        {
            let mut inner = self.lock();
            if inner.state != FlowState::Open {
                return Err(RpcError::ChannelClosed(self.direction));
            }
            inner.queue.push_back(message);
        }
        self.ready.notify_one();
        Ok(())
    }

    fn try_next(&self) -> Next<T> {
        let mut inner = self.lock();
        match inner.queue.pop_front() {
            Some(message) => {
                if inner.queue.is_empty() && inner.state == FlowState::HalfClosed {
                    inner.state = FlowState::Closed;
                }
                Next::Message(message)
            }
            None if inner.state == FlowState::Open => Next::Empty,
            None => {
                inner.state = FlowState::Closed;
                Next::End
            }
        }
    }

    /// Waits for the next message; `None` once the flow is closed and drained.
    async fn next(&self) -> Option<T> {
        loop {
            match self.try_next() {
                Next::Message(message) => return Some(message),
                Next::End => return None,
                // Single consumer: a permit stored by `notify_one` is never lost.
                Next::Empty => self.ready.notified().await,
            }
        }
    }

    fn close(&self) -> bool {
        {
            let mut inner = self.lock();
            if inner.state != FlowState::Open {
                return false;
            }
            inner.state = if inner.queue.is_empty() {
                FlowState::Closed
            } else {
                FlowState::HalfClosed
            };
        }
        self.ready.notify_one();
        true
    }

    fn abort(&self) {
        {
            let mut inner = self.lock();
            inner.queue.clear();
            inner.state = FlowState::Closed;
        }
        self.ready.notify_one();
    }

    fn state(&self) -> FlowState {
        self.lock().state
    }
}

/// Type-erased control over a flow, so the shared call state does not need
/// to know the message types.
trait FlowControl: Send + Sync {
    fn close(&self) -> bool;
    fn abort(&self);
    fn state(&self) -> FlowState;
}

impl<T: Send> FlowControl for Flow<T> {
    fn close(&self) -> bool {
        Flow::close(self)
    }

    fn abort(&self) {
        Flow::abort(self)
    }

    fn state(&self) -> FlowState {
        Flow::state(self)
    }
}

struct CallCore {
    requests: Arc<dyn FlowControl>,
    responses: Arc<dyn FlowControl>,
    outcome: OnceLock<CallOutcome>,
    terminated: Notify,
    deadline: Deadline,
}

impl CallCore {
    fn complete(&self) -> bool {
        if self.outcome.set(CallOutcome::Completed).is_err() {
            return false;
        }
        self.responses.close();
        self.terminated.notify_waiters();
        debug!("call completed");
        true
    }

    fn fail(&self, status: Status) -> bool {
        let code = status.code();
        if self.outcome.set(CallOutcome::Failed(status)).is_err() {
            return false;
        }
        self.responses.abort();
        self.requests.abort();
        self.terminated.notify_waiters();
        debug!(%code, "call failed");
        true
    }
}

/// Shared, read-mostly view of a call: its deadline, its terminal status and
/// the state of both flows.
#[derive(Clone)]
pub struct CallContext {
    core: Arc<CallCore>,
}

impl CallContext {
    pub fn deadline(&self) -> Deadline {
        self.core.deadline
    }

    pub fn outcome(&self) -> Option<CallOutcome> {
        self.core.outcome.get().cloned()
    }

    pub fn is_terminated(&self) -> bool {
        self.core.outcome.get().is_some()
    }

    /// Resolves once the call has a terminal status.
    pub async fn terminated(&self) {
        loop {
            // Registered on creation, so a notification between the check and
            // the await is not missed.
            let notified = self.core.terminated.notified();
            if self.is_terminated() {
                return;
            }
            notified.await;
        }
    }

    /// True once the call has failed, whichever side failed it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.core.outcome.get(), Some(CallOutcome::Failed(_)))
    }

    pub fn flow_state(&self, direction: Direction) -> FlowState {
        match direction {
            Direction::Requests => self.core.requests.state(),
            Direction::Responses => self.core.responses.state(),
        }
    }

    /// Terminates the call with `status`, discarding any undelivered
    /// responses. Returns false if the call already had a terminal status.
    pub fn fail(&self, status: Status) -> bool {
        self.core.fail(status)
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("deadline", &self.core.deadline)
            .field("outcome", &self.core.outcome.get())
            .field("requests", &self.core.requests.state())
            .field("responses", &self.core.responses.state())
            .finish()
    }
}

/// Caller end of the request flow.
pub struct RequestSender<Req> {
    flow: Arc<Flow<Req>>,
    ctx: CallContext,
}

impl<Req> RequestSender<Req> {
    pub fn send(&self, message: Req) -> Result<(), RpcError> {
        self.flow.push(message)
    }

    /// Half-closes the request flow. Idempotent.
    pub fn close_send(&self) {
        if self.flow.close() {
            debug!("request flow half-closed");
        }
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }
}

impl<Req> Drop for RequestSender<Req> {
    fn drop(&mut self) {
        self.flow.close();
    }
}

/// Caller end of the response flow.
pub struct ResponseReceiver<Resp> {
    flow: Arc<Flow<Resp>>,
    ctx: CallContext,
    expired: Option<Status>,
}

impl<Resp> ResponseReceiver<Resp> {
    /// Waits for the next response.
    ///
    /// Returns `Ok(None)` once the service has completed and every buffered
    /// response has been delivered, and `Err` with the terminal status if the
    /// call failed. Once the call's deadline elapses without a terminal
    /// signal the call is failed with `DeadlineExceeded`, and responses still
    /// buffered at that point are never delivered.
    pub async fn receive(&mut self) -> Result<Option<Resp>, Status> {
        if let Some(status) = &self.expired {
            return Err(status.clone());
        }

        let next = match self.ctx.deadline().instant() {
            Some(at) => {
                if self.ctx.deadline().is_elapsed() {
                    if let Some(status) = self.expire() {
                        return Err(status);
                    }
                }
                match tokio::time::timeout_at(at, self.flow.next()).await {
                    Ok(next) => next,
                    Err(_) => match self.expire() {
                        Some(status) => return Err(status),
                        None => self.flow.next().await,
                    },
                }
            }
            None => self.flow.next().await,
        };

        match next {
            Some(message) => Ok(Some(message)),
            None => match self.ctx.outcome() {
                Some(CallOutcome::Failed(status)) => Err(status),
                _ => Ok(None),
            },
        }
    }

    /// Fails the call with `DeadlineExceeded` unless it already has a
    /// terminal status.
    fn expire(&mut self) -> Option<Status> {
        let status = Status::deadline_exceeded("deadline elapsed before the call completed");
        if !self.ctx.fail(status.clone()) {
            return None;
        }
        self.expired = Some(status.clone());
        Some(status)
    }

    /// Cancels the call from the caller side.
    pub fn cancel(&self) -> bool {
        self.ctx.fail(Status::cancelled("call cancelled by the caller"))
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Adapts the receiver into a stream that ends after the terminal
    /// status; a failure is yielded as the last item.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Resp, Status>> + Send
    where
        Resp: Send + 'static,
    {
        async_stream::stream! {
            loop {
                match self.receive().await {
                    Ok(Some(message)) => yield Ok(message),
                    Ok(None) => break,
                    Err(status) => {
                        yield Err(status);
                        break;
                    }
                }
            }
        }
    }
}

impl<Resp> Drop for ResponseReceiver<Resp> {
    fn drop(&mut self) {
        if !self.ctx.is_terminated() {
            self.ctx.fail(Status::cancelled("caller dropped the call"));
        }
    }
}

/// Service end of the request flow.
pub struct RequestStream<Req> {
    flow: Arc<Flow<Req>>,
    ctx: CallContext,
}

impl<Req> RequestStream<Req> {
    /// Waits for the next request. `Ok(None)` means the caller half-closed;
    /// `Err` carries the status the call was terminated with.
    pub async fn receive(&mut self) -> Result<Option<Req>, Status> {
        match self.flow.next().await {
            Some(message) => Ok(Some(message)),
            None => match self.ctx.outcome() {
                Some(CallOutcome::Failed(status)) => Err(status),
                _ => Ok(None),
            },
        }
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }
}

/// Service end of the response flow. Owns the call's terminal signal.
pub struct ResponseSink<Resp> {
    flow: Arc<Flow<Resp>>,
    ctx: CallContext,
}

impl<Resp> ResponseSink<Resp> {
    pub fn send(&self, message: Resp) -> Result<(), RpcError> {
        self.flow.push(message)
    }

    /// Completes the call successfully. Idempotent; returns false if the call
    /// was already terminated.
    pub fn close_send(&self) -> bool {
        self.ctx.core.complete()
    }

    /// Fails the call, discarding buffered responses.
    pub fn fail(&self, status: Status) -> bool {
        self.ctx.fail(status)
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }
}

impl<Resp> Drop for ResponseSink<Resp> {
    fn drop(&mut self) {
        if !self.ctx.is_terminated() {
            self.ctx
                .fail(Status::internal("service dropped the call without a terminal status"));
        }
    }
}

/// Caller half of a call.
pub struct ClientCall<Req, Resp> {
    pub requests: RequestSender<Req>,
    pub responses: ResponseReceiver<Resp>,
}

impl<Req, Resp> ClientCall<Req, Resp> {
    pub fn context(&self) -> CallContext {
        self.responses.ctx.clone()
    }
}

/// Service half of a call.
pub struct ServerCall<Req, Resp> {
    pub requests: RequestStream<Req>,
    pub responses: ResponseSink<Resp>,
}

impl<Req, Resp> ServerCall<Req, Resp> {
    pub fn context(&self) -> CallContext {
        self.responses.ctx.clone()
    }
}

/// Opens a call and returns its two halves.
pub fn open<Req, Resp>(deadline: Deadline) -> (ClientCall<Req, Resp>, ServerCall<Req, Resp>)
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let requests = Arc::new(Flow::<Req>::new(Direction::Requests));
    let responses = Arc::new(Flow::<Resp>::new(Direction::Responses));
    let ctx = CallContext {
        core: Arc::new(CallCore {
            requests: requests.clone(),
            responses: responses.clone(),
            outcome: OnceLock::new(),
            terminated: Notify::new(),
            deadline,
        }),
    };

    let client = ClientCall {
        requests: RequestSender {
            flow: requests.clone(),
            ctx: ctx.clone(),
        },
        responses: ResponseReceiver {
            flow: responses.clone(),
            ctx: ctx.clone(),
            expired: None,
        },
    };
    let server = ServerCall {
        requests: RequestStream {
            flow: requests,
            ctx: ctx.clone(),
        },
        responses: ResponseSink {
            flow: responses,
            ctx,
        },
    };
    (client, server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn requests_arrive_in_send_order() {
        let (client, mut server) = open::<u32, u32>(Deadline::none());
        for n in 0..5 {
            client.requests.send(n).unwrap();
        }
        client.requests.close_send();

        let mut received = Vec::new();
        while let Some(n) = server.requests.receive().await.unwrap() {
            received.push(n);
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn close_send_is_idempotent() {
        let (client, mut server) = open::<u32, u32>(Deadline::none());
        client.requests.send(7).unwrap();
        client.requests.close_send();
        client.requests.close_send();

        assert_eq!(server.requests.receive().await.unwrap(), Some(7));
        assert_eq!(server.requests.receive().await.unwrap(), None);
        assert_eq!(server.requests.receive().await.unwrap(), None);
        assert!(!client.context().is_terminated());
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (client, _server) = open::<u32, u32>(Deadline::none());
        client.requests.close_send();
        let err = client.requests.send(1).unwrap_err();
        assert!(matches!(err, RpcError::ChannelClosed(Direction::Requests)));
    }

    #[tokio::test]
    async fn half_closed_flow_closes_once_drained() {
        let (client, mut server) = open::<u32, u32>(Deadline::none());
        let ctx = client.context();
        client.requests.send(1).unwrap();
        client.requests.send(2).unwrap();
        client.requests.close_send();
        assert_eq!(ctx.flow_state(Direction::Requests), FlowState::HalfClosed);

        server.requests.receive().await.unwrap();
        assert_eq!(ctx.flow_state(Direction::Requests), FlowState::HalfClosed);
        server.requests.receive().await.unwrap();
        assert_eq!(ctx.flow_state(Direction::Requests), FlowState::Closed);
        assert_eq!(ctx.flow_state(Direction::Responses), FlowState::Open);
    }

    #[tokio::test]
    async fn blocked_receiver_wakes_on_completion() {
        let (mut client, server) = open::<u32, u32>(Deadline::none());
        let waiter = tokio::spawn(async move { client.responses.receive().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.responses.close_send());

        let result = waiter.await.unwrap();
        assert_eq!(result, Ok(None));
    }

    #[tokio::test]
    async fn completion_keeps_buffered_responses() {
        let (mut client, server) = open::<u32, u32>(Deadline::none());
        server.responses.send(1).unwrap();
        server.responses.send(2).unwrap();
        server.responses.close_send();

        assert_eq!(client.responses.receive().await, Ok(Some(1)));
        assert_eq!(client.responses.receive().await, Ok(Some(2)));
        assert_eq!(client.responses.receive().await, Ok(None));
    }

    #[tokio::test]
    async fn fail_discards_buffered_responses() {
        let (mut client, server) = open::<u32, u32>(Deadline::none());
        server.responses.send(1).unwrap();
        server.responses.send(2).unwrap();
        assert!(server.responses.fail(Status::invalid_argument("bad input")));

        let err = client.responses.receive().await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "bad input");
        assert_eq!(client.responses.receive().await.unwrap_err().code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn exactly_one_terminal_signal() {
        let (mut client, server) = open::<u32, u32>(Deadline::none());
        assert!(server.responses.close_send());
        assert!(!server.responses.fail(Status::internal("late")));
        assert!(!server.responses.close_send());
        assert_eq!(client.responses.receive().await, Ok(None));
        assert_eq!(client.context().outcome(), Some(CallOutcome::Completed));
    }

    #[tokio::test]
    async fn no_response_after_response_side_closes() {
        let (mut client, server) = open::<u32, u32>(Deadline::none());
        server.responses.close_send();
        let err = server.responses.send(9).unwrap_err();
        assert!(matches!(err, RpcError::ChannelClosed(Direction::Responses)));
        assert_eq!(client.responses.receive().await, Ok(None));
    }

    #[tokio::test]
    async fn failure_unblocks_service_receive() {
        let (client, mut server) = open::<u32, u32>(Deadline::none());
        let waiter = tokio::spawn(async move { server.requests.receive().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.responses.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert!(matches!(
            client.requests.send(1),
            Err(RpcError::ChannelClosed(Direction::Requests))
        ));
    }

    #[tokio::test]
    async fn caller_deadline_fails_the_call() {
        let (mut client, server) = open::<u32, u32>(Deadline::after(Duration::from_millis(30)));

        let err = client.responses.receive().await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(server.context().is_cancelled());
        assert!(server.responses.send(1).is_err());
        assert_eq!(client.responses.receive().await.unwrap_err().code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn buffered_response_is_not_delivered_after_the_deadline() {
        let (mut client, server) = open::<u32, u32>(Deadline::after(Duration::from_millis(30)));
        server.responses.send(1).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let err = client.responses.receive().await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert_eq!(
            server.context().outcome(),
            Some(CallOutcome::Failed(err.clone()))
        );
        assert_eq!(client.responses.receive().await, Err(err));
    }

    #[tokio::test]
    async fn completion_before_the_deadline_keeps_buffered_responses() {
        let (mut client, server) = open::<u32, u32>(Deadline::after(Duration::from_millis(30)));
        server.responses.send(1).unwrap();
        server.responses.close_send();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(client.responses.receive().await, Ok(Some(1)));
        assert_eq!(client.responses.receive().await, Ok(None));
    }

    #[tokio::test]
    async fn terminated_resolves_on_failure() {
        let (client, server) = open::<u32, u32>(Deadline::none());
        let ctx = server.context();
        let waiter = tokio::spawn(async move { ctx.terminated().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        client.responses.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("terminated() should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_the_sink_fails_the_call() {
        let (mut client, server) = open::<u32, u32>(Deadline::none());
        drop(server);
        let err = client.responses.receive().await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn dropping_the_receiver_cancels_the_call() {
        let (client, server) = open::<u32, u32>(Deadline::none());
        drop(client);
        assert!(server.context().is_cancelled());
        assert_eq!(server.context().check_deadline().unwrap_err().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn dropping_the_sender_half_closes_requests() {
        let (client, mut server) = open::<u32, u32>(Deadline::none());
        let ClientCall { requests, responses } = client;
        requests.send(3).unwrap();
        drop(requests);

        assert_eq!(server.requests.receive().await, Ok(Some(3)));
        assert_eq!(server.requests.receive().await, Ok(None));
        drop(responses);
    }

    #[tokio::test]
    async fn into_stream_ends_after_completion() {
        let (client, server) = open::<u32, u32>(Deadline::none());
        server.responses.send(4).unwrap();
        server.responses.close_send();

        let items: Vec<_> = client.responses.into_stream().collect().await;
        assert_eq!(items, vec![Ok(4)]);
    }

    #[tokio::test]
    async fn into_stream_yields_failure_last() {
        let (client, server) = open::<u32, u32>(Deadline::none());
        let responses = client.responses.into_stream();
        server.responses.fail(Status::internal("boom"));

        let items: Vec<_> = responses.collect().await;
        assert_eq!(items, vec![Err(Status::internal("boom"))]);
    }
}
