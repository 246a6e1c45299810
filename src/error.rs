use std::time::Duration;

/// The error type shared by the client and server sides.
///
/// `Clone + PartialEq` because a terminal connection error is fanned out to
/// every pending call, and because error frames carry errors as display
/// strings in the message header.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// The client has been closed, or the connection dropped underneath it.
    #[error("connection is shut down")]
    Shutdown,
    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),
    #[error("rpc server: request handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),
    /// A synchronous call was cancelled before its response arrived.
    #[error("rpc client: call failed: deadline exceeded")]
    Canceled,
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),
    #[error("rpc server: service/method request ill-formed: {0}")]
    InvalidServiceMethod(String),
    #[error("rpc: service already defined: {0}")]
    ServiceAlreadyDefined(String),
    #[error("rpc: {0} is not a valid service name")]
    InvalidServiceName(String),
    #[error("invalid codec type {0}")]
    InvalidCodec(String),
    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),
    #[error("rpc client: invalid rpc address {0}, expect protocol@addr")]
    InvalidAddress(String),
    #[error("rpc client: unexpected HTTP response: {0}")]
    HttpConnect(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("reading body {0}")]
    ReadBody(String),
    #[error("io error: {0}")]
    Io(String),
    /// An error string reported by the peer in a response header, passed
    /// through verbatim.
    #[error("{0}")]
    Remote(String),
}

impl From<std::io::Error> for RpcError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
