//! Method registry.
//!
//! Maps 64-bit method ids to handlers. The registry is populated before
//! the acceptor starts and then only read, so connection tasks share it
//! through an `Arc` without locking.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use weft_frame::method_id;

use crate::context::RpcContext;

/// Boxed future a handler returns; yields the response body.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Vec<u8>> + Send + 'static>>;

type HandlerFn = dyn Fn(RpcContext, Vec<u8>) -> HandlerFuture + Send + Sync;

/// Conversion from a handler's return value to the canonical response
/// body. Lets handlers return strings or any owned byte shape without
/// hand-converting at every return site.
pub trait IntoBody {
    fn into_body(self) -> Vec<u8>;
}

impl IntoBody for Vec<u8> {
    fn into_body(self) -> Vec<u8> {
        self
    }
}

impl IntoBody for String {
    fn into_body(self) -> Vec<u8> {
        self.into_bytes()
    }
}

impl IntoBody for &'static str {
    fn into_body(self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl IntoBody for &'static [u8] {
    fn into_body(self) -> Vec<u8> {
        self.to_vec()
    }
}

impl IntoBody for Box<[u8]> {
    fn into_body(self) -> Vec<u8> {
        self.into_vec()
    }
}

impl IntoBody for () {
    fn into_body(self) -> Vec<u8> {
        Vec::new()
    }
}

/// Method id → handler map.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<u64, Arc<HandlerFn>>,
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.handlers.len())
            .finish()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the hash of `name`.
    pub fn register<F, Fut, B>(&mut self, name: &str, handler: F)
    where
        F: Fn(RpcContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = B> + Send + 'static,
        B: IntoBody,
    {
        let id = method_id(name);
        debug!(name, method_id = id, "registering method");
        self.register_id(id, handler);
    }

    /// Register a handler under a precomputed method id.
    pub fn register_id<F, Fut, B>(&mut self, id: u64, handler: F)
    where
        F: Fn(RpcContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = B> + Send + 'static,
        B: IntoBody,
    {
        let boxed: Arc<HandlerFn> = Arc::new(move |ctx, body| {
            let fut = handler(ctx, body);
            Box::pin(async move { fut.await.into_body() })
        });
        self.handlers.insert(id, boxed);
    }

    /// Constant-time lookup.
    pub(crate) fn find(&self, id: u64) -> Option<Arc<HandlerFn>> {
        self.handlers.get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_by_name_and_find_by_hash() {
        let mut registry = MethodRegistry::new();
        registry.register("Example.Echo", |_ctx, body| async move { body });

        assert!(registry.contains(method_id("Example.Echo")));
        assert!(!registry.contains(method_id("Example.Missing")));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn id_registration_matches_name_registration() {
        const UPPER: u64 = method_id("Example.Upper");

        let mut registry = MethodRegistry::new();
        registry.register_id(UPPER, |_ctx, body| async move {
            String::from_utf8_lossy(&body).to_ascii_uppercase()
        });
        assert!(registry.contains(method_id("Example.Upper")));
    }

    #[test]
    fn into_body_conversions() {
        assert_eq!(vec![1u8, 2].into_body(), vec![1, 2]);
        assert_eq!(String::from("ab").into_body(), b"ab".to_vec());
        assert_eq!("cd".into_body(), b"cd".to_vec());
        assert_eq!((&b"ef"[..]).into_body(), b"ef".to_vec());
        assert_eq!(vec![9u8].into_boxed_slice().into_body(), vec![9]);
        assert_eq!(().into_body(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn later_registration_wins() {
        let mut registry = MethodRegistry::new();
        registry.register("Example.Echo", |_ctx, _body| async { "first" });
        registry.register("Example.Echo", |_ctx, _body| async { "second" });
        assert_eq!(registry.len(), 1);
    }
}
