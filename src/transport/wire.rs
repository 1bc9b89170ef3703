//! Frame format: a little-endian `u32` length followed by a bincode-encoded
//! [`Frame`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::StreamAdapter;
use crate::errors::RpcError;
use crate::status::Status;

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame of every stream, sent by the caller.
    Open {
        method: String,
        timeout_ms: Option<u64>,
    },
    /// One bincode-encoded request or response.
    Message(Vec<u8>),
    /// The sender will send no more messages. From the service this is also
    /// successful completion.
    HalfClose,
    /// Terminal failure, or cancellation when sent by the caller.
    Failed(Status),
}

pub fn encode_frame(frame: &Frame) -> Result<Bytes, RpcError> {
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(RpcError::ProtocolError(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            body.len()
        )));
    }
    let mut buffer = BytesMut::with_capacity(4 + body.len());
    buffer.put_u32_le(body.len() as u32);
    buffer.extend_from_slice(&body);
    Ok(buffer.freeze())
}

/// Reassembles frames from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, RpcError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > MAX_FRAME_LEN {
            return Err(RpcError::ProtocolError(format!(
                "peer announced a {len} byte frame"
            )));
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }

        self.buffer.advance(4);
        let body = self.buffer.split_to(len);
        Ok(Some(bincode::deserialize(&body)?))
    }
}

/// A stream adapter that speaks in frames.
pub struct FramedStream<S> {
    stream: S,
    decoder: FrameDecoder,
}

impl<S: StreamAdapter> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), RpcError> {
        let bytes = encode_frame(frame)?;
        self.stream.send_bytes(bytes).await
    }

    /// `None` when the peer finished its side on a frame boundary.
    pub async fn receive_frame(&mut self) -> Result<Option<Frame>, RpcError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            match self.stream.receive_bytes().await? {
                Some(chunk) => self.decoder.push(&chunk),
                None if self.decoder.is_empty() => return Ok(None),
                None => {
                    return Err(RpcError::ProtocolError(
                        "stream ended in the middle of a frame".into(),
                    ))
                }
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), RpcError> {
        self.stream.close().await
    }
}
