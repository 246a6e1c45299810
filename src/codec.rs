//! Serialization strategies and message framing.
//!
//! A connection carries, after the plaintext option preamble, a stream of
//! messages. Each message is a header record followed by a body record,
//! both encoded by the negotiated [CodecKind] and individually length
//! delimited with a big-endian `u32` prefix. [FrameReader] and
//! [FrameWriter] own one end of the stream each; writers stage a whole
//! message in one buffer and flush it per message.

use std::fmt;

use bytes::{BufMut, BytesMut};
use log::*;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::RpcError;

/// The header record prefixing every body on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Header {
    /// In "Service.Method" format.
    pub service_method: String,
    /// Monotonic per-client identifier correlating a response to its call.
    pub seq: u64,
    /// Empty on success.
    pub error: String,
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.error.is_empty() {
            write!(f, "[{} seq={}]", self.service_method, self.seq)
        } else {
            write!(f, "[{} seq={} err={}]", self.service_method, self.seq, self.error)
        }
    }
}

/// A registered serialization strategy, negotiated by tag in the option
/// preamble. Unknown tags reject the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecKind {
    Msgpack,
    Json,
}

impl CodecKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "application/msgpack" => Some(Self::Msgpack),
            "application/json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Msgpack => "application/msgpack",
            Self::Json => "application/json",
        }
    }

    pub fn encode<T: Serialize>(&self, v: &T) -> Result<Vec<u8>, RpcError> {
        match self {
            Self::Msgpack => match rmp_serde::encode::to_vec_named(v) {
                Ok(buf) => Ok(buf),
                Err(e) => {
                    error!("rpc codec: msgpack encode error: {}", e);
                    Err(RpcError::Encode(e.to_string()))
                }
            },
            Self::Json => match serde_json::to_vec(v) {
                Ok(buf) => Ok(buf),
                Err(e) => {
                    error!("rpc codec: json encode error: {}", e);
                    Err(RpcError::Encode(e.to_string()))
                }
            },
        }
    }

    pub fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, RpcError> {
        match self {
            Self::Msgpack => match rmp_serde::decode::from_slice(buf) {
                Ok(v) => Ok(v),
                Err(e) => {
                    warn!("rpc codec: msgpack decode error: {}", e);
                    Err(RpcError::Decode(e.to_string()))
                }
            },
            Self::Json => match serde_json::from_slice(buf) {
                Ok(v) => Ok(v),
                Err(e) => {
                    warn!("rpc codec: json decode error: {}", e);
                    Err(RpcError::Decode(e.to_string()))
                }
            },
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Upper bound for a single header or body record.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Reads the inbound side of a connection: header record, then body record.
pub struct FrameReader<R> {
    kind: CodecKind,
    r: BufReader<R>,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(kind: CodecKind, r: R) -> Self {
        Self { kind, r: BufReader::new(r) }
    }

    /// Take over an already-buffered reader, keeping any bytes it holds
    /// beyond the handshake.
    pub fn from_buffered(kind: CodecKind, r: BufReader<R>) -> Self {
        Self { kind, r }
    }

    /// Consume the next header record.
    pub async fn read_header(&mut self) -> Result<Header, RpcError> {
        let buf = self.read_record().await?;
        self.kind.decode(&buf)
    }

    /// Consume the body record paired with the last header. The caller
    /// decodes the raw bytes, or drops them to discard the body.
    pub async fn read_body(&mut self) -> Result<Vec<u8>, RpcError> {
        self.read_record().await
    }

    async fn read_record(&mut self) -> Result<Vec<u8>, RpcError> {
        let mut len_buf = [0u8; 4];
        self.r.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            return Err(RpcError::Decode(format!("record length {} too large", len)));
        }
        let mut buf = vec![0u8; len];
        self.r.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Writes the outbound side of a connection under the caller's send lock.
/// A failed write shuts the transport down.
pub struct FrameWriter<W> {
    kind: CodecKind,
    w: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(kind: CodecKind, w: W) -> Self {
        Self { kind, w }
    }

    /// Write one header-then-body message and flush it.
    pub async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), RpcError> {
        let head = self.kind.encode(header)?;
        let mut buf = BytesMut::with_capacity(8 + head.len() + body.len());
        buf.put_u32(head.len() as u32);
        buf.extend_from_slice(&head);
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(body);
        if let Err(e) = self.write_all_flush(&buf).await {
            warn!("rpc codec: write {} err: {}", header, e);
            let _ = self.w.shutdown().await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn write_all_flush(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.w.write_all(buf).await?;
        self.w.flush().await
    }

    pub async fn close(&mut self) -> Result<(), RpcError> {
        self.w.shutdown().await?;
        Ok(())
    }
}
