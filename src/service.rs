//! Service registration building blocks.
//!
//! A service is a receiver value plus the set of its remotely callable
//! methods. Registration is static: each method is registered by name with
//! a handler closure, and the call signature contract is enforced by the
//! trait bounds of [ServiceBuilder::method] at compile time. Anything not
//! registered (a private method, a helper with the wrong shape) is simply
//! not dispatchable and lookups answer "can't find method".

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use log::*;
use serde::{de::DeserializeOwned, Serialize};

use crate::codec::CodecKind;
use crate::error::RpcError;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Decode the raw argument record, invoke the method, encode the reply.
/// The synchronous part surfaces argument decode errors before the
/// invocation future is built.
type MethodFn = Box<
    dyn Fn(CodecKind, &[u8]) -> Result<BoxFuture<Result<Vec<u8>, RpcError>>, RpcError>
        + Send
        + Sync,
>;

/// One dispatchable method of a service.
pub struct MethodType {
    func: MethodFn,
    num_calls: AtomicU64,
}

impl MethodType {
    /// How many times the method has been invoked.
    #[inline]
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Construct a fresh argument value from `argv`, invoke the method and
    /// return the encoded reply. The call counter moves once per
    /// invocation; a decode failure is not an invocation.
    pub(crate) async fn call(&self, kind: CodecKind, argv: &[u8]) -> Result<Vec<u8>, RpcError> {
        let fut = (self.func)(kind, argv)?;
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        fut.await
    }
}

/// A named receiver with its registered methods.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    /// Start building a service for a receiver. The service name is the
    /// receiver's concrete type name and must begin with an uppercase
    /// letter.
    pub fn build<T: Send + Sync + 'static>(rcvr: T) -> ServiceBuilder<T> {
        ServiceBuilder {
            name: short_type_name::<T>().to_string(),
            rcvr: Arc::new(rcvr),
            methods: HashMap::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn method(&self, name: &str) -> Option<Arc<MethodType>> {
        self.methods.get(name).cloned()
    }

    pub fn methods(&self) -> impl Iterator<Item = (&str, &Arc<MethodType>)> {
        self.methods.iter().map(|(k, v)| (k.as_str(), v))
    }
}

pub struct ServiceBuilder<T> {
    name: String,
    rcvr: Arc<T>,
    methods: HashMap<String, Arc<MethodType>>,
}

impl<T: Send + Sync + 'static> ServiceBuilder<T> {
    /// Register one method under `name`.
    ///
    /// The handler receives the shared receiver and a freshly decoded
    /// argument value, and resolves to the reply or an error; the error's
    /// display string travels back in the response header.
    pub fn method<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let rcvr = self.rcvr.clone();
        let func: MethodFn = Box::new(move |kind: CodecKind, argv: &[u8]| {
            let args: A = kind.decode(argv)?;
            let fut = f(rcvr.clone(), args);
            let invoke: BoxFuture<Result<Vec<u8>, RpcError>> = Box::pin(async move {
                let reply = fut.await?;
                kind.encode(&reply)
            });
            Ok(invoke)
        });
        let mtype = Arc::new(MethodType { func, num_calls: AtomicU64::new(0) });
        if self.methods.insert(name.to_string(), mtype).is_some() {
            warn!("rpc server: method {}.{} registered twice", self.name, name);
        }
        self
    }

    /// Validate the service name and seal the method set.
    pub fn finish(self) -> Result<Service, RpcError> {
        if !is_exported(&self.name) {
            return Err(RpcError::InvalidServiceName(self.name));
        }
        for m in self.methods.keys() {
            info!("rpc server: register {}.{}", self.name, m);
        }
        Ok(Service { name: self.name, methods: self.methods })
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

fn is_exported(name: &str) -> bool {
    match name.chars().next() {
        Some(c) => c.is_uppercase(),
        None => false,
    }
}
