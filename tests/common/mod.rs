#![allow(dead_code)]

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use captains_log::*;
use rstest::*;
use serde::{Deserialize, Serialize};

use geerpc::{RpcError, RpcServer, Service, UnifyAddr, UnifyListener};

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

pub struct TestRunner {
    rt: tokio::runtime::Runtime,
}

impl fmt::Debug for TestRunner {
    fn fmt(&self, _f: &mut fmt::Formatter) -> fmt::Result {
        Ok(())
    }
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/geerpc_test.log", Level::Trace).test().build().expect("log");
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap(),
        }
    }

    pub fn block_on<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
        self.rt.block_on(f);
    }
}

pub struct Foo;

#[derive(Serialize, Deserialize)]
pub struct FooArgs {
    pub num1: i32,
    pub num2: i32,
}

impl Foo {
    fn sum(&self, args: FooArgs) -> Result<i32, RpcError> {
        Ok(args.num1 + args.num2)
    }

    async fn sleep(&self, args: FooArgs) -> Result<i32, RpcError> {
        tokio::time::sleep(Duration::from_millis(args.num1 as u64)).await;
        Ok(args.num1 + args.num2)
    }

    fn fail(&self, _args: FooArgs) -> Result<i32, RpcError> {
        Err(RpcError::Remote("deliberate failure".to_string()))
    }
}

pub fn foo_service() -> Service {
    Service::build(Foo)
        .method("Sum", |foo, args: FooArgs| async move { foo.sum(args) })
        .method("Sleep", |foo, args: FooArgs| async move { foo.sleep(args).await })
        .method("Fail", |foo, args: FooArgs| async move { foo.fail(args) })
        .finish()
        .expect("build Foo service")
}

/// Bind an address for the requested transport, unique per test run.
pub fn test_bind_addr(is_tcp: bool, tag: &str) -> String {
    if is_tcp {
        "127.0.0.1:0".to_string()
    } else {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/tmp/geerpc-test-{}-{}.sock", tag, timestamp)
    }
}

/// Start an isolated server with `Foo` registered, returning its address.
pub async fn start_server(bind_addr: &str) -> (Arc<RpcServer>, String) {
    let server = Arc::new(RpcServer::new());
    server.register(foo_service()).expect("register");
    let addr: UnifyAddr = bind_addr.parse().expect("addr");
    let listener = UnifyListener::bind(&addr).await.expect("bind");
    let actual_addr = listener.local_addr().expect("local addr");
    tokio::spawn(server.clone().accept(listener));
    (server, actual_addr)
}
