//! The client side: the call multiplexer and connection establishment.
//!
//! One [RpcClient] owns one connection. Submitted calls are assigned a
//! strictly increasing sequence number, parked in the pending table and
//! written to the transport under the send lock; a background receive loop
//! reads response frames and demultiplexes them back to the waiting calls
//! by seq. Completion moves the [Call] out of the pending table and sends
//! it through its done channel, so a call can never complete twice.
//!
//! Lock ordering: `sending` before `mu` whenever both are held. `mu` alone
//! guards the pending table and the lifecycle flags; `sending` alone
//! serializes codec writes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::{fmt, io};

use crossfire::{mpsc, AsyncRx, MTx};
use futures::{pin_mut, select, FutureExt};
use log::*;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::{CodecKind, FrameReader, FrameWriter, Header};
use crate::config::{parse_options, RpcOption};
use crate::error::RpcError;
use crate::net::{UnifyAddr, UnifyReadHalf, UnifyStream, UnifyWriteHalf};

/// Sender half of a call's completion channel.
pub type CallTx = MTx<Call>;
/// Receiver half of a call's completion channel.
pub type CallRx = AsyncRx<Call>;

/// Allocate a completion channel for [RpcClient::submit]. The send side
/// never blocks, so delivering a completed call cannot stall the receive
/// loop; the sender is clonable for fanning several calls into one
/// receiver.
pub fn call_channel() -> (CallTx, CallRx) {
    mpsc::unbounded_async()
}

/// One outstanding invocation.
///
/// The pending table owns the `Call` by value from just before its frame
/// is written until the response (or a terminal error) takes it back out;
/// whoever removes it completes it, exactly once.
pub struct Call {
    pub seq: u64,
    pub service_method: String,
    /// Encoded argument record, consumed when the request frame is written.
    pub args: Vec<u8>,
    /// Raw encoded reply record, decoded by the waiter via [Call::result].
    pub reply: Vec<u8>,
    pub error: Option<RpcError>,
    codec: CodecKind,
    done: Option<CallTx>,
}

impl Call {
    /// Deliver the call through its done channel. Consumes the call, so a
    /// second completion is unrepresentable.
    fn complete(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(self);
        }
    }

    /// Decode the reply, or surface the call's terminal error.
    pub fn result<R: DeserializeOwned>(mut self) -> Result<R, RpcError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        match self.codec.decode(&self.reply) {
            Ok(r) => Ok(r),
            Err(RpcError::Decode(s)) => Err(RpcError::ReadBody(s)),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Call({} seq={})", self.service_method, self.seq)
    }
}

struct Pending {
    seq: u64,
    calls: HashMap<u64, Call>,
    /// The user asked to close; sticky.
    closing: bool,
    /// The peer or transport forced the close; sticky.
    shutdown: bool,
}

struct ClientInner {
    codec: CodecKind,
    sending: AsyncMutex<FrameWriter<UnifyWriteHalf>>,
    mu: Mutex<Pending>,
}

impl ClientInner {
    /// Assign a seq and park the call. Fails once the client is closing or
    /// shut down.
    fn register_call(&self, mut call: Call) -> Result<u64, Call> {
        let mut p = self.mu.lock().unwrap();
        if p.closing || p.shutdown {
            call.error = Some(RpcError::Shutdown);
            return Err(call);
        }
        let seq = p.seq;
        p.seq += 1;
        call.seq = seq;
        p.calls.insert(seq, call);
        Ok(seq)
    }

    /// Atomically take a pending call back out. `None` means another path
    /// (receiver, sender failure handling, cancellation) already took it.
    fn remove_call(&self, seq: u64) -> Option<Call> {
        let mut p = self.mu.lock().unwrap();
        p.calls.remove(&seq)
    }

    /// Flag the client shut down and fail every pending call with `err`.
    /// Takes `sending` first so it interleaves safely with `send`.
    async fn terminate_calls(&self, err: RpcError) {
        let _sending = self.sending.lock().await;
        let mut p = self.mu.lock().unwrap();
        p.shutdown = true;
        for (_, mut call) in p.calls.drain() {
            call.error = Some(err.clone());
            call.complete();
        }
    }

    /// Register then write the request frame, all under the send lock so
    /// request frames hit the wire whole and in registration order.
    async fn send(&self, mut call: Call) -> u64 {
        let mut w = self.sending.lock().await;

        let service_method = call.service_method.clone();
        let args = std::mem::take(&mut call.args);
        let seq = match self.register_call(call) {
            Err(call) => {
                call.complete();
                return 0;
            }
            Ok(seq) => seq,
        };

        let header = Header { service_method, seq, error: String::new() };
        if let Err(e) = w.write(&header, &args).await {
            warn!("rpc client: send {} err: {}", header, e);
            // the receiver may have taken the call meanwhile, in which
            // case it already handled it
            if let Some(mut call) = self.remove_call(seq) {
                call.error = Some(e);
                call.complete();
            }
        }
        seq
    }

    /// Demultiplex inbound frames back to their waiters until the
    /// connection dies or the close channel fires, then cascade the
    /// terminal error to everything still pending.
    async fn receive_loop(
        self: Arc<Self>, mut reader: FrameReader<UnifyReadHalf>, close_rx: AsyncRx<()>,
    ) {
        let err = 'recv: loop {
            let header = {
                let read_f = reader.read_header().fuse();
                pin_mut!(read_f);
                let close_f = close_rx.recv().fuse();
                pin_mut!(close_f);
                select! {
                    r = read_f => match r {
                        Ok(h) => h,
                        Err(e) => {
                            debug!("rpc client: read header err: {}", e);
                            break 'recv e;
                        }
                    },
                    _ = close_f => break 'recv RpcError::Shutdown,
                }
            };
            trace!("rpc client: recv response {}", header);
            match self.remove_call(header.seq) {
                // seq unknown: the send path failed partway and already
                // removed the call; discard the body
                None => {
                    if let Err(e) = reader.read_body().await {
                        break 'recv e;
                    }
                }
                Some(mut call) if !header.error.is_empty() => {
                    call.error = Some(RpcError::Remote(header.error.clone()));
                    let r = reader.read_body().await;
                    call.complete();
                    if let Err(e) = r {
                        break 'recv e;
                    }
                }
                Some(mut call) => match reader.read_body().await {
                    Ok(body) => {
                        call.reply = body;
                        call.complete();
                    }
                    Err(e) => {
                        call.error = Some(RpcError::ReadBody(e.to_string()));
                        call.complete();
                        break 'recv e;
                    }
                },
            }
        };
        self.terminate_calls(err).await;
    }
}

/// A client-side connection.
///
/// Dropping the client stops its receive loop and fails any calls still in
/// flight with [RpcError::Shutdown].
pub struct RpcClient {
    inner: Arc<ClientInner>,
    close_tx: MTx<()>,
}

impl RpcClient {
    /// Handshake over a fresh stream: write the option preamble, then
    /// start the receive loop.
    pub async fn new(stream: UnifyStream, opt: RpcOption) -> Result<Self, RpcError> {
        let (rh, wh) = stream.into_split();
        Self::from_parts(BufReader::new(rh), wh, opt).await
    }

    /// Like [RpcClient::new] but over pre-split halves, so an upgrade
    /// exchange (HTTP CONNECT) can keep its buffered reader.
    pub(crate) async fn from_parts(
        reader: BufReader<UnifyReadHalf>, mut writer: UnifyWriteHalf, opt: RpcOption,
    ) -> Result<Self, RpcError> {
        let kind = match CodecKind::from_tag(&opt.codec_type) {
            Some(kind) => kind,
            None => {
                error!("rpc client: invalid codec type {}", opt.codec_type);
                return Err(RpcError::InvalidCodec(opt.codec_type.clone()));
            }
        };
        let mut line = match serde_json::to_vec(&opt) {
            Ok(line) => line,
            Err(e) => return Err(RpcError::Encode(e.to_string())),
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            error!("rpc client: options error: {}", e);
            return Err(e.into());
        }

        let inner = Arc::new(ClientInner {
            codec: kind,
            sending: AsyncMutex::new(FrameWriter::new(kind, writer)),
            mu: Mutex::new(Pending {
                seq: 1, // 0 is reserved for invalid calls
                calls: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });
        let (close_tx, close_rx) = mpsc::unbounded_async();
        tokio::spawn(inner.clone().receive_loop(FrameReader::from_buffered(kind, reader), close_rx));
        Ok(Self { inner, close_tx })
    }

    /// Whether the client can still take new calls.
    pub fn is_available(&self) -> bool {
        let p = self.inner.mu.lock().unwrap();
        !p.shutdown && !p.closing
    }

    /// Asynchronous entry: encode `args`, register the call and write its
    /// frame. The completed [Call] arrives on the channel `done` feeds;
    /// the returned seq is 0 if the call already failed before
    /// registration.
    pub async fn submit<A: Serialize>(&self, service_method: &str, args: &A, done: CallTx) -> u64 {
        let mut call = Call {
            seq: 0,
            service_method: service_method.to_string(),
            args: Vec::new(),
            reply: Vec::new(),
            error: None,
            codec: self.inner.codec,
            done: Some(done),
        };
        match self.inner.codec.encode(args) {
            Ok(buf) => call.args = buf,
            Err(e) => {
                // encoding failed before send, report to this call only
                call.error = Some(e);
                call.complete();
                return 0;
            }
        }
        self.inner.send(call).await
    }

    /// Synchronous entry: submit and wait for the completion. Cancelling
    /// the returned future removes the call from the pending table; a
    /// response arriving later for that seq is discarded.
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self, service_method: &str, args: &A,
    ) -> Result<R, RpcError> {
        let (tx, rx) = call_channel();
        let seq = self.submit(service_method, args, tx).await;
        let mut guard = RemoveOnDrop { inner: &self.inner, seq, armed: true };
        let r = rx.recv().await;
        guard.armed = false;
        match r {
            Ok(call) => call.result(),
            Err(_) => Err(RpcError::Shutdown),
        }
    }

    /// [RpcClient::call] bounded by a deadline. On expiry the pending
    /// entry is dropped and a cancellation error returned.
    pub async fn call_timeout<A: Serialize, R: DeserializeOwned>(
        &self, service_method: &str, args: &A, timeout: std::time::Duration,
    ) -> Result<R, RpcError> {
        match tokio::time::timeout(timeout, self.call(service_method, args)).await {
            Ok(r) => r,
            // the inner call future was dropped, which removed the call
            Err(_) => Err(RpcError::Canceled),
        }
    }

    /// Close the connection. Sticky and idempotent: the second close
    /// returns [RpcError::Shutdown].
    pub async fn close(&self) -> Result<(), RpcError> {
        {
            let mut p = self.inner.mu.lock().unwrap();
            if p.closing {
                return Err(RpcError::Shutdown);
            }
            p.closing = true;
        }
        let _ = self.close_tx.send(());
        let mut w = self.inner.sending.lock().await;
        w.close().await
    }
}

struct RemoveOnDrop<'a> {
    inner: &'a ClientInner,
    seq: u64,
    armed: bool,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            // best-effort removal on cancellation
            let _ = self.inner.remove_call(self.seq);
        }
    }
}

/// Connect to an RPC server over `network` ("tcp" or "unix").
pub async fn dial(
    network: &str, address: &str, opt: Option<RpcOption>,
) -> Result<RpcClient, RpcError> {
    dial_timeout(RpcClient::new, network, address, opt).await
}

/// Route `protocol@addr`: "http" upgrades over tcp, anything else dials
/// that protocol directly.
pub async fn xdial(rpc_addr: &str, opt: Option<RpcOption>) -> Result<RpcClient, RpcError> {
    let (protocol, addr) = match rpc_addr.split_once('@') {
        Some(parts) => parts,
        None => return Err(RpcError::InvalidAddress(rpc_addr.to_string())),
    };
    match protocol {
        "http" => crate::http::dial_http("tcp", addr, opt).await,
        _ => dial(protocol, addr, opt).await,
    }
}

/// Open the stream with `ConnectTimeout`, then race the connection
/// construction against the same timeout on a background task. If the
/// timer wins the construction task is aborted and its stream dropped.
pub(crate) async fn dial_timeout<F, Fut>(
    f: F, network: &str, address: &str, opt: Option<RpcOption>,
) -> Result<RpcClient, RpcError>
where
    F: FnOnce(UnifyStream, RpcOption) -> Fut,
    Fut: Future<Output = Result<RpcClient, RpcError>> + Send + 'static,
{
    let opt = parse_options(opt);
    let connect_timeout = opt.connect_timeout;
    let addr = UnifyAddr::for_network(network, address)?;
    let stream = match UnifyStream::connect_timeout(&addr, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
            return Err(RpcError::ConnectTimeout(connect_timeout));
        }
        Err(e) => return Err(e.into()),
    };

    let mut handle = tokio::spawn(f(stream, opt));
    if connect_timeout.is_zero() {
        return match handle.await {
            Ok(r) => r,
            Err(e) => Err(RpcError::Io(e.to_string())),
        };
    }
    tokio::select! {
        r = &mut handle => match r {
            Ok(r) => r,
            Err(e) => Err(RpcError::Io(e.to_string())),
        },
        _ = tokio::time::sleep(connect_timeout) => {
            handle.abort();
            Err(RpcError::ConnectTimeout(connect_timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::time::Duration;

    use crate::net::UnifyListener;

    // a constructor that hangs, standing in for a peer that accepts the
    // connection but never finishes the handshake
    async fn slow_new_client(
        stream: UnifyStream, _opt: RpcOption,
    ) -> Result<RpcClient, RpcError> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(stream);
        Err(RpcError::Shutdown)
    }

    #[tokio::test]
    async fn test_dial_connect_timeout() {
        let addr = UnifyAddr::from_str("127.0.0.1:0").expect("addr");
        let mut listener = UnifyListener::bind(&addr).await.expect("bind");
        let listen_addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            while let Ok(stream) = listener.accept().await {
                // hold the connection open without answering
                tokio::spawn(async move {
                    let _stream = stream;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                });
            }
        });

        let opt = RpcOption { connect_timeout: Duration::from_secs(1), ..Default::default() };
        let start = std::time::Instant::now();
        let r = dial_timeout(slow_new_client, "tcp", &listen_addr, Some(opt)).await;
        match r {
            Err(e) => assert!(e.to_string().contains("connect timeout"), "got {}", e),
            Ok(_) => panic!("expected connect timeout"),
        }
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // nothing listens here
        let r = dial("tcp", "127.0.0.1:1", None).await;
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn test_xdial_invalid_format() {
        let r = xdial("127.0.0.1:1234", None).await;
        assert_eq!(r.err(), Some(RpcError::InvalidAddress("127.0.0.1:1234".to_string())));
    }
}
