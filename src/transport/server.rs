use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::wire::{Frame, FramedStream};
use super::{canonicalize_path, limits, StreamAdapter};
use crate::channel::{self, ClientCall};
use crate::config::RpcConfig;
use crate::deadline::Deadline;
use crate::errors::RpcError;
use crate::messages::Operation;
use crate::service::{methods, CalculatorService, Method};
use crate::status::Status;

type Framed = FramedStream<Box<dyn StreamAdapter>>;

/// Serves a [`CalculatorService`] over QUIC, one call per bidirectional
/// stream.
pub struct RpcServer<S> {
    service: Arc<S>,
    pub config: RpcConfig,
    pub socket_addr: Option<SocketAddr>,
}

impl<S> Clone for RpcServer<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            config: self.config.clone(),
            socket_addr: self.socket_addr,
        }
    }
}

impl<S: CalculatorService> RpcServer<S> {
    pub fn new(service: S, config: RpcConfig) -> Self {
        Self {
            service: Arc::new(service),
            config,
            socket_addr: None,
        }
    }

    pub fn bind(&mut self) -> Result<s2n_quic::Server, RpcError> {
        let cert_path = canonicalize_path(&self.config.cert_path)?;
        let key_path =
            self.config.key_path.as_ref().ok_or_else(|| {
                RpcError::ConfigError("Server key path not configured".to_string())
            })?;
        let key_path = canonicalize_path(key_path)?;

        let server = s2n_quic::Server::builder()
            .with_tls((cert_path.as_path(), key_path.as_path()))
            .map_err(|e| RpcError::TlsError(format!("{:?}", e)))?
            .with_limits(limits(self.config.max_concurrent_calls)?)
            .map_err(|e| RpcError::ConfigError(format!("Failed to apply limits: {:?}", e)))?
            .with_io(self.config.bind_address.as_str())
            .map_err(|e| RpcError::ConfigError(format!("{:?}", e)))?
            .start()
            .map_err(|e| RpcError::ConfigError(format!("{:?}", e)))?;

        let local_addr = server.local_addr().map_err(|_err| {
            RpcError::ConfigError("Could not retrieve local_addr() from server".to_string())
        })?;

        self.socket_addr = Some(local_addr);
        info!(%local_addr, "calculator server listening");
        Ok(server)
    }

    /// Accepts connections until the endpoint shuts down.
    pub async fn start(&self, mut server: s2n_quic::Server) -> Result<(), RpcError> {
        while let Some(mut connection) = server.accept().await {
            let this = self.clone();
            tokio::spawn(async move {
                loop {
                    match connection.accept_bidirectional_stream().await {
                        Ok(Some(stream)) => {
                            let this = this.clone();
                            tokio::spawn(async move { this.handle_stream(Box::new(stream)).await });
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!(%err, "connection closed");
                            break;
                        }
                    }
                }
            });
        }

        Ok(())
    }

    /// Binds and serves in one go.
    pub async fn serve(mut self) -> Result<(), RpcError> {
        let server = self.bind()?;
        self.start(server).await
    }

    /// Runs one call to completion on `stream`.
    pub async fn handle_stream(&self, stream: Box<dyn StreamAdapter>) {
        let mut framed = FramedStream::new(stream);

        let (method, timeout_ms) = match framed.receive_frame().await {
            Ok(Some(Frame::Open { method, timeout_ms })) => (method, timeout_ms),
            Ok(Some(_)) => {
                warn!("stream did not start with an open frame");
                let status = Status::internal("expected an open frame");
                let _ = framed.send_frame(&Frame::Failed(status)).await;
                let _ = framed.close().await;
                return;
            }
            Ok(None) => {
                debug!("stream finished before a call was opened");
                return;
            }
            Err(err) => {
                warn!(%err, "failed to read call header");
                return;
            }
        };

        let timeout = timeout_ms
            .map(Duration::from_millis)
            .or(self.config.default_deadline);
        let deadline = Deadline::from_timeout(timeout);

        let result = match Operation::from_name(&method) {
            Some(operation) => self.dispatch(operation, &mut framed, deadline).await,
            None => Err(RpcError::UnknownMethod(method)),
        };

        if let Err(err) = result {
            warn!(%err, "call ended by a transport error");
            let _ = framed.send_frame(&Frame::Failed(Status::from(err))).await;
        }
        let _ = framed.close().await;
    }

    async fn dispatch(
        &self,
        operation: Operation,
        framed: &mut Framed,
        deadline: Deadline,
    ) -> Result<(), RpcError> {
        debug!(
            %operation,
            pattern = ?operation.pattern(),
            remaining = ?deadline.remaining(),
            "serving remote call"
        );
        let service = self.service.clone();
        match operation {
            Operation::Sum => serve_remote::<methods::Sum, S>(service, framed, deadline).await,
            Operation::SquareRoot => {
                serve_remote::<methods::SquareRoot, S>(service, framed, deadline).await
            }
            Operation::PrimeDecomposition => {
                serve_remote::<methods::PrimeDecomposition, S>(service, framed, deadline).await
            }
            Operation::ComputeAverage => {
                serve_remote::<methods::ComputeAverage, S>(service, framed, deadline).await
            }
            Operation::ComputeMax => {
                serve_remote::<methods::ComputeMax, S>(service, framed, deadline).await
            }
            Operation::SumWithDeadline => {
                serve_remote::<methods::SumWithDeadline, S>(service, framed, deadline).await
            }
        }
    }
}

/// Plays the caller's part of a local call on behalf of the remote peer.
async fn serve_remote<M, S>(
    service: Arc<S>,
    framed: &mut Framed,
    deadline: Deadline,
) -> Result<(), RpcError>
where
    M: Method,
    S: CalculatorService,
{
    let (client, server) = channel::open::<M::Request, M::Response>(deadline);
    tokio::spawn(M::serve(service, server));

    let ClientCall {
        requests,
        mut responses,
    } = client;
    let mut inbound_open = true;

    loop {
        tokio::select! {
            frame = framed.receive_frame(), if inbound_open => match frame? {
                Some(Frame::Message(payload)) => {
                    let request: M::Request = bincode::deserialize(&payload)?;
                    if let Err(err) = requests.send(request) {
                        debug!(%err, "dropping request for a finished call");
                    }
                }
                Some(Frame::HalfClose) => requests.close_send(),
                Some(Frame::Failed(status)) => {
                    debug!(code = %status.code(), "peer abandoned the call");
                    responses.context().fail(status);
                    return Ok(());
                }
                Some(Frame::Open { .. }) => {
                    return Err(RpcError::ProtocolError("call is already open".into()));
                }
                None => {
                    requests.close_send();
                    inbound_open = false;
                }
            },
            next = responses.receive() => {
                let frame = match next {
                    Ok(Some(response)) => Frame::Message(bincode::serialize(&response)?),
                    Ok(None) => Frame::HalfClose,
                    Err(status) => Frame::Failed(status),
                };
                let terminal = !matches!(frame, Frame::Message(_));
                framed.send_frame(&frame).await?;
                if terminal {
                    return Ok(());
                }
            }
        }
    }
}
