#![deny(unsafe_code)]

//! Server side of weft.
//!
//! A [`RpcServer`] binds a listener, accepts connections, builds a
//! transport per connection through the configured factory, and runs a
//! [`RpcConnection`] engine for each. Handlers live in a
//! [`MethodRegistry`], keyed by the 64-bit FNV-1a hash of their name, and
//! receive an [`RpcContext`] plus the (already decrypted) request body.
//!
//! Dispatch policy: every request runs on its own spawned task, so the
//! frame loop keeps reading while handlers are in flight. This is what
//! makes `Cancel` able to reach a running handler and lets many calls on
//! one connection overlap.

mod connection;
mod context;
mod registry;
mod server;

pub use connection::RpcConnection;
pub use context::RpcContext;
pub use registry::{HandlerFuture, IntoBody, MethodRegistry};
pub use server::{BoundServer, RpcServer, RpcServerConfig};
