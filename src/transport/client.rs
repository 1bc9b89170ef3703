use async_trait::async_trait;
use s2n_quic::{client::Connect, Client};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::wire::{Frame, FramedStream};
use super::{limits, ConnectionAdapter, StreamAdapter};
use crate::channel::{
    self, CallContext, CallOutcome, ClientCall, RequestStream, ResponseSink, ServerCall,
};
use crate::client::Connector;
use crate::config::RpcConfig;
use crate::deadline::Deadline;
use crate::errors::RpcError;
use crate::service::Method;
use crate::status::Status;

type Framed = FramedStream<Box<dyn StreamAdapter>>;

/// Opens calculator calls on a remote server.
pub struct RpcClient {
    connection: Arc<Mutex<Box<dyn ConnectionAdapter>>>,
    config: RpcConfig,
}

impl RpcClient {
    pub async fn connect(connect_addr: SocketAddr, config: RpcConfig) -> Result<Self, RpcError> {
        let client = Client::builder()
            .with_tls(config.cert_path.as_path())
            .map_err(|e| RpcError::TlsError(format!("{:?}", e)))?
            .with_limits(limits(config.max_concurrent_calls)?)
            .map_err(|e| RpcError::ConfigError(format!("Failed to apply client limits: {:?}", e)))?
            .with_io(config.bind_address.as_str())
            .map_err(|e| RpcError::ConfigError(format!("{:?}", e)))?
            .start()
            .map_err(|e| RpcError::ConfigError(format!("{:?}", e)))?;

        let connect = Connect::new(connect_addr).with_server_name(config.server_name.as_str());
        let mut connection = client
            .connect(connect)
            .await
            .map_err(|e| RpcError::ConnectionError(e.to_string()))?;

        if config.keep_alive_interval.is_some() {
            connection
                .keep_alive(true)
                .map_err(|e| RpcError::ConfigError(e.to_string()))?;
        }
        info!(%connect_addr, "connected to calculator server");

        Ok(Self::with_connection(Box::new(connection), config))
    }

    /// Uses an already established connection.
    pub fn with_connection(connection: Box<dyn ConnectionAdapter>, config: RpcConfig) -> Self {
        Self {
            connection: Arc::new(Mutex::new(connection)),
            config,
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for RpcClient {
    async fn open<M: Method>(
        &self,
        deadline: Deadline,
    ) -> Result<ClientCall<M::Request, M::Response>, RpcError> {
        let deadline = if deadline.is_set() {
            deadline
        } else {
            Deadline::from_timeout(self.config.default_deadline)
        };

        let stream = {
            let mut connection = self.connection.lock().await;
            connection.open_bidirectional_stream().await?
        };
        let mut framed = FramedStream::new(stream);
        let timeout_ms = deadline
            .remaining()
            .map(|left| u64::try_from(left.as_millis()).unwrap_or(u64::MAX));
        framed
            .send_frame(&Frame::Open {
                method: M::OPERATION.name().to_string(),
                timeout_ms,
            })
            .await?;

        let (client, server) = channel::open(deadline);
        tokio::spawn(forward::<M>(framed, server));
        debug!(method = M::OPERATION.name(), ?timeout_ms, "opened remote call");
        Ok(client)
    }
}

/// Plays the service's part of a local call by relaying to the remote peer.
async fn forward<M: Method>(mut framed: Framed, call: ServerCall<M::Request, M::Response>) {
    let ServerCall {
        mut requests,
        responses,
    } = call;

    if let Err(err) = relay::<M>(&mut framed, &mut requests, &responses).await {
        warn!(method = M::OPERATION.name(), %err, "remote call failed");
        responses.fail(Status::from(err));
    }
    let _ = framed.close().await;
}

async fn relay<M: Method>(
    framed: &mut Framed,
    requests: &mut RequestStream<M::Request>,
    responses: &ResponseSink<M::Response>,
) -> Result<(), RpcError> {
    let ctx = responses.context().clone();
    let mut outbound_open = true;

    loop {
        tokio::select! {
            next = requests.receive(), if outbound_open => match next {
                Ok(Some(request)) => {
                    framed.send_frame(&Frame::Message(bincode::serialize(&request)?)).await?;
                }
                Ok(None) => {
                    framed.send_frame(&Frame::HalfClose).await?;
                    outbound_open = false;
                }
                Err(status) => {
                    framed.send_frame(&Frame::Failed(status)).await?;
                    return Ok(());
                }
            },
            _ = ctx.terminated() => return abandon(framed, &ctx).await,
            frame = framed.receive_frame() => match frame? {
                Some(Frame::Message(payload)) => {
                    if responses.send(bincode::deserialize(&payload)?).is_err() {
                        return abandon(framed, &ctx).await;
                    }
                }
                Some(Frame::HalfClose) => {
                    responses.close_send();
                    return Ok(());
                }
                Some(Frame::Failed(status)) => {
                    responses.fail(status);
                    return Ok(());
                }
                Some(Frame::Open { .. }) => {
                    return Err(RpcError::ProtocolError("server sent an open frame".into()));
                }
                None => {
                    return Err(RpcError::ConnectionError(
                        "stream finished before the call completed".into(),
                    ));
                }
            }
        }
    }
}

/// Forwards a local failure so the server stops working on the call.
async fn abandon(framed: &mut Framed, ctx: &CallContext) -> Result<(), RpcError> {
    if let Some(CallOutcome::Failed(status)) = ctx.outcome() {
        debug!(code = %status.code(), "telling the server to stop");
        framed.send_frame(&Frame::Failed(status)).await?;
    }
    Ok(())
}
