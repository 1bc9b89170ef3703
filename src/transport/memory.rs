//! In-process stand-ins for QUIC streams and connections.
//!
//! Calls still go through the full framing path, which makes these useful for
//! exercising the transport without certificates or sockets.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{ConnectionAdapter, RpcServer, StreamAdapter};
use crate::errors::RpcError;
use crate::service::CalculatorService;

pub struct MemoryStream {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Two connected stream ends.
pub fn duplex() -> (MemoryStream, MemoryStream) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryStream {
            tx: Some(a_tx),
            rx: b_rx,
        },
        MemoryStream {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl StreamAdapter for MemoryStream {
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RpcError::StreamError("stream already finished".into()))?;
        tx.send(data)
            .map_err(|_| RpcError::StreamError("peer went away".into()))
    }

    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), RpcError> {
        self.tx.take();
        Ok(())
    }
}

/// A connection whose every stream is served by `server` on the current
/// runtime.
pub struct MemoryConnection<S> {
    server: RpcServer<S>,
}

impl<S: CalculatorService> MemoryConnection<S> {
    pub fn new(server: RpcServer<S>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl<S: CalculatorService> ConnectionAdapter for MemoryConnection<S> {
    async fn open_bidirectional_stream(&mut self) -> Result<Box<dyn StreamAdapter>, RpcError> {
        let (local, remote) = duplex();
        let server = self.server.clone();
        tokio::spawn(async move { server.handle_stream(Box::new(remote)).await });
        Ok(Box::new(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closing_one_end_finishes_the_other() {
        let (mut a, mut b) = duplex();
        a.send_bytes(Bytes::from_static(b"abc")).await.unwrap();
        a.close().await.unwrap();

        assert_eq!(b.receive_bytes().await.unwrap(), Some(Bytes::from_static(b"abc")));
        assert_eq!(b.receive_bytes().await.unwrap(), None);
        assert!(a.send_bytes(Bytes::from_static(b"late")).await.is_err());
    }
}
