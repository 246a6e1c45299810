//! The server side: service registry, accept loop and the per-connection
//! read-dispatch-write pipeline.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use log::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::codec::{CodecKind, FrameReader, FrameWriter, Header};
use crate::config::{RpcOption, MAGIC_NUMBER};
use crate::error::RpcError;
use crate::net::{UnifyListener, UnifyReadHalf, UnifyStream, UnifyWriteHalf};
use crate::service::{MethodType, Service};

/// An RPC server: a registry of services plus connection handling.
///
/// Servers are cheap to construct and fully isolated from each other;
/// the process-wide instance behind [default_server] is just one of them.
pub struct RpcServer {
    pub(crate) services: RwLock<HashMap<String, Arc<Service>>>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self { services: RwLock::new(HashMap::new()) }
    }

    /// Publish a service. Registration is one-shot per name; a second
    /// registration under the same name fails and leaves the first intact.
    pub fn register(&self, svc: Service) -> Result<(), RpcError> {
        let mut services = self.services.write().unwrap();
        if services.contains_key(svc.name()) {
            return Err(RpcError::ServiceAlreadyDefined(svc.name().to_string()));
        }
        services.insert(svc.name().to_string(), Arc::new(svc));
        Ok(())
    }

    /// Resolve `"Service.Method"`, splitting on the last dot.
    pub fn find_service(
        &self, service_method: &str,
    ) -> Result<(Arc<Service>, Arc<MethodType>), RpcError> {
        let dot = match service_method.rfind('.') {
            Some(dot) => dot,
            None => {
                return Err(RpcError::InvalidServiceMethod(service_method.to_string()));
            }
        };
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);
        let svc = self
            .services
            .read()
            .unwrap()
            .get(service_name)
            .cloned()
            .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?;
        let mtype = svc
            .method(method_name)
            .ok_or_else(|| RpcError::MethodNotFound(method_name.to_string()))?;
        Ok((svc, mtype))
    }

    pub(crate) fn service_list(&self) -> Vec<Arc<Service>> {
        let mut services: Vec<_> = self.services.read().unwrap().values().cloned().collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    /// Accept connections until the listener fails, serving each on its
    /// own task.
    pub async fn accept(self: Arc<Self>, mut listener: UnifyListener) {
        loop {
            match listener.accept().await {
                Err(e) => {
                    warn!("rpc server: accept error: {}", e);
                    return;
                }
                Ok(stream) => {
                    debug!("rpc server: connection {}", stream);
                    let server = self.clone();
                    tokio::spawn(server.serve_conn(stream));
                }
            }
        }
    }

    /// Serve one raw connection: option preamble, then the codec loop.
    pub async fn serve_conn(self: Arc<Self>, stream: UnifyStream) {
        let (rh, wh) = stream.into_split();
        self.serve_parts(BufReader::new(rh), wh).await;
    }

    pub(crate) async fn serve_parts(
        self: Arc<Self>, mut reader: BufReader<UnifyReadHalf>, writer: UnifyWriteHalf,
    ) {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Err(e) => {
                error!("rpc server: option error: {}", e);
                return;
            }
            Ok(0) => {
                debug!("rpc server: connection closed before option");
                return;
            }
            Ok(_) => {}
        }
        let opt: RpcOption = match serde_json::from_str(&line) {
            Err(e) => {
                error!("rpc server: option error: {}", e);
                return;
            }
            Ok(o) => o,
        };
        if opt.magic_number != MAGIC_NUMBER {
            error!("rpc server: {}", RpcError::InvalidMagic(opt.magic_number));
            return;
        }
        let kind = match CodecKind::from_tag(&opt.codec_type) {
            Some(kind) => kind,
            None => {
                error!("rpc server: {}", RpcError::InvalidCodec(opt.codec_type.clone()));
                return;
            }
        };
        self.serve_codec(
            FrameReader::from_buffered(kind, reader),
            FrameWriter::new(kind, writer),
            kind,
            opt.handle_timeout,
        )
        .await;
    }

    /// The read-dispatch-write loop. The read path never blocks on a
    /// handler; responses go out under the send lock in completion order
    /// and clients demultiplex them by seq. On loop exit every outstanding
    /// handler is awaited before the codec closes.
    async fn serve_codec(
        self: Arc<Self>, mut reader: FrameReader<UnifyReadHalf>,
        writer: FrameWriter<UnifyWriteHalf>, kind: CodecKind, handle_timeout: Duration,
    ) {
        let sending = Arc::new(Mutex::new(writer));
        let mut handlers: JoinSet<()> = JoinSet::new();
        loop {
            let mut header = match reader.read_header().await {
                Err(e) => {
                    // EOF or a fatal frame error, not recoverable
                    trace!("rpc server: read header error: {}", e);
                    break;
                }
                Ok(h) => h,
            };
            trace!("rpc server: recv request {}", header);
            let mtype = match self.find_service(&header.service_method) {
                Ok((_, mtype)) => mtype,
                Err(e) => {
                    // the body frame must still be consumed to keep the
                    // stream aligned
                    if reader.read_body().await.is_err() {
                        break;
                    }
                    header.error = e.to_string();
                    send_response(&sending, &header, invalid_body(kind)).await;
                    continue;
                }
            };
            let argv = match reader.read_body().await {
                Err(e) => {
                    trace!("rpc server: read body error: {}", e);
                    break;
                }
                Ok(b) => b,
            };
            let sending = sending.clone();
            handlers.spawn(async move {
                handle_request(kind, mtype, header, argv, sending, handle_timeout).await;
            });
        }
        // drain outstanding handlers, then close the codec
        while handlers.join_next().await.is_some() {}
        let mut w = sending.lock().await;
        let _ = w.close().await;
    }
}

/// Invoke the method with `HandleTimeout` enforced, then send exactly one
/// response frame. When the timer wins the race the method future is
/// dropped and its late completion cannot produce a second frame.
async fn handle_request(
    kind: CodecKind, mtype: Arc<MethodType>, mut header: Header, argv: Vec<u8>,
    sending: Arc<Mutex<FrameWriter<UnifyWriteHalf>>>, handle_timeout: Duration,
) {
    let result = if handle_timeout.is_zero() {
        mtype.call(kind, &argv).await
    } else {
        tokio::select! {
            r = mtype.call(kind, &argv) => r,
            _ = tokio::time::sleep(handle_timeout) => {
                Err(RpcError::HandleTimeout(handle_timeout))
            }
        }
    };
    match result {
        Ok(body) => {
            send_response(&sending, &header, body).await;
        }
        Err(e) => {
            header.error = e.to_string();
            send_response(&sending, &header, invalid_body(kind)).await;
        }
    }
}

/// Placeholder body sent with error responses.
fn invalid_body(kind: CodecKind) -> Vec<u8> {
    kind.encode(&()).unwrap_or_default()
}

async fn send_response(
    sending: &Mutex<FrameWriter<UnifyWriteHalf>>, header: &Header, body: Vec<u8>,
) {
    let mut w = sending.lock().await;
    if let Err(e) = w.write(header, &body).await {
        error!("rpc server: write response error: {}", e);
    }
}

static DEFAULT_SERVER: OnceLock<Arc<RpcServer>> = OnceLock::new();

/// The lazily-initialized process-wide server used by the free functions
/// below. Tests needing isolation construct their own [RpcServer].
pub fn default_server() -> Arc<RpcServer> {
    DEFAULT_SERVER.get_or_init(|| Arc::new(RpcServer::new())).clone()
}

/// Register a service with the default server.
pub fn register(svc: Service) -> Result<(), RpcError> {
    default_server().register(svc)
}

/// Accept connections on the default server.
pub async fn accept(listener: UnifyListener) {
    default_server().accept(listener).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    struct Foo;

    #[derive(Serialize, Deserialize)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    impl Foo {
        fn sum(&self, args: Args) -> Result<i32, RpcError> {
            Ok(args.num1 + args.num2)
        }
    }

    fn foo_service() -> Service {
        Service::build(Foo)
            .method("Sum", |foo, args: Args| async move { foo.sum(args) })
            .finish()
            .expect("service")
    }

    #[test]
    fn test_service_discovery() {
        let server = RpcServer::new();
        server.register(foo_service()).expect("register");

        let (svc, _mtype) = server.find_service("Foo.Sum").expect("find");
        assert_eq!(svc.name(), "Foo");

        // the private helper was never registered
        assert_eq!(
            server.find_service("Foo.sum").err(),
            Some(RpcError::MethodNotFound("sum".to_string()))
        );
        assert_eq!(
            server.find_service("Bar.Sum").err(),
            Some(RpcError::ServiceNotFound("Bar".to_string()))
        );
        assert_eq!(
            server.find_service("NoDot").err(),
            Some(RpcError::InvalidServiceMethod("NoDot".to_string()))
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let server = RpcServer::new();
        server.register(foo_service()).expect("register");
        assert_eq!(
            server.register(foo_service()).err(),
            Some(RpcError::ServiceAlreadyDefined("Foo".to_string()))
        );
        // the first registration stays intact
        assert!(server.find_service("Foo.Sum").is_ok());
    }

    #[test]
    fn test_split_on_last_dot() {
        let server = RpcServer::new();
        server.register(foo_service()).expect("register");
        // "a.Foo" is the service part when splitting on the last dot
        assert_eq!(
            server.find_service("a.Foo.Sum").err(),
            Some(RpcError::ServiceNotFound("a.Foo".to_string()))
        );
    }
}
