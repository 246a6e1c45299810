//! # geerpc
//!
//! A small general-purpose RPC runtime with symmetric client and server
//! implementations over stream transports (tcp & unix socket).
//!
//! A connection starts with a plaintext JSON option preamble negotiating
//! the codec, then carries length-delimited header+body frames. The client
//! multiplexes many concurrent calls onto one connection, correlating
//! responses by sequence number; the server resolves each request against
//! its service registry and handles it on its own task, bounded by an
//! optional per-request timeout.
//!
//! ## Example
//!
//! ```no_run
//! use geerpc::{dial, RpcError, RpcServer, Service, UnifyAddr, UnifyListener};
//! use serde::{Deserialize, Serialize};
//! use std::str::FromStr;
//! use std::sync::Arc;
//!
//! struct Foo;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     num1: i32,
//!     num2: i32,
//! }
//!
//! impl Foo {
//!     fn sum(&self, args: Args) -> Result<i32, RpcError> {
//!         Ok(args.num1 + args.num2)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RpcError> {
//!     // server
//!     let server = Arc::new(RpcServer::new());
//!     let svc = Service::build(Foo)
//!         .method("Sum", |foo, args: Args| async move { foo.sum(args) })
//!         .finish()?;
//!     server.register(svc)?;
//!     let addr = UnifyAddr::from_str("127.0.0.1:0").unwrap();
//!     let listener = UnifyListener::bind(&addr).await?;
//!     let server_addr = listener.local_addr()?;
//!     tokio::spawn(server.accept(listener));
//!
//!     // client
//!     let client = dial("tcp", &server_addr, None).await?;
//!     let reply: i32 = client.call("Foo.Sum", &Args { num1: 1, num2: 2 }).await?;
//!     assert_eq!(reply, 3);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod server;
pub mod service;

pub use client::{call_channel, dial, xdial, Call, CallRx, CallTx, RpcClient};
pub use codec::{CodecKind, Header};
pub use config::{parse_options, RpcOption, MAGIC_NUMBER};
pub use error::RpcError;
pub use http::{accept_http, dial_http, CONNECTED, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};
pub use net::{UnifyAddr, UnifyListener, UnifyStream};
pub use server::{accept, default_server, register, RpcServer};
pub use service::{MethodType, Service, ServiceBuilder};
