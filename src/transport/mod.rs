//! Carries calls over QUIC bidirectional streams.
//!
//! One call maps to one stream. Both ends translate between the local call
//! channel and length-prefixed [`wire::Frame`]s, so half-close and failure
//! travel across the connection exactly as they do in-process.

use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::RpcError;

pub mod client;
pub mod memory;
pub mod server;
pub mod wire;

pub use client::RpcClient;
pub use server::RpcServer;

/// Byte-level view of one bidirectional stream.
#[async_trait]
pub trait StreamAdapter: Send {
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError>;

    /// `None` once the peer has finished sending.
    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError>;

    /// Finishes the sending side.
    async fn close(&mut self) -> Result<(), RpcError> {
        Ok(())
    }
}

#[async_trait]
impl StreamAdapter for s2n_quic::stream::BidirectionalStream {
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError> {
        self.send(data)
            .await
            .map_err(|err| RpcError::StreamError(err.to_string()))
    }

    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError> {
        self.receive()
            .await
            .map_err(|err| RpcError::StreamError(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), RpcError> {
        s2n_quic::stream::BidirectionalStream::close(self)
            .await
            .map_err(|err| RpcError::StreamError(err.to_string()))
    }
}

#[async_trait]
impl<T> StreamAdapter for Box<T>
where
    T: StreamAdapter + ?Sized,
{
    async fn send_bytes(&mut self, data: Bytes) -> Result<(), RpcError> {
        (**self).send_bytes(data).await
    }

    async fn receive_bytes(&mut self) -> Result<Option<Bytes>, RpcError> {
        (**self).receive_bytes().await
    }

    async fn close(&mut self) -> Result<(), RpcError> {
        (**self).close().await
    }
}

/// Opens streams on an established connection.
#[async_trait]
pub trait ConnectionAdapter: Send {
    async fn open_bidirectional_stream(&mut self) -> Result<Box<dyn StreamAdapter>, RpcError>;
}

#[async_trait]
impl ConnectionAdapter for s2n_quic::Connection {
    async fn open_bidirectional_stream(&mut self) -> Result<Box<dyn StreamAdapter>, RpcError> {
        let stream = s2n_quic::Connection::open_bidirectional_stream(self)
            .await
            .map_err(|e| RpcError::StreamError(e.to_string()))?;
        Ok(Box::new(stream))
    }
}

fn canonicalize_path(path: &Path) -> Result<PathBuf, RpcError> {
    fs::canonicalize(path).map_err(|e| {
        RpcError::ConfigError(format!("Failed to canonicalize {}: {e}", path.display()))
    })
}

/// Connection limits shared by both ends.
fn limits(max_concurrent_calls: u64) -> Result<s2n_quic::provider::limits::Limits, RpcError> {
    s2n_quic::provider::limits::Limits::new()
        .with_max_open_local_bidirectional_streams(max_concurrent_calls)
        .map_err(|e| RpcError::ConfigError(format!("Failed to set stream limits: {:?}", e)))?
        .with_max_open_remote_bidirectional_streams(max_concurrent_calls)
        .map_err(|e| RpcError::ConfigError(format!("Failed to set stream limits: {:?}", e)))?
        .with_max_ack_delay(std::time::Duration::from_millis(5))
        .map_err(|e| RpcError::ConfigError(format!("Failed to set ACK delay: {:?}", e)))
}
