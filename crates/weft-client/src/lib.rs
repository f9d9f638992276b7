#![deny(unsafe_code)]

//! Client side of weft.
//!
//! An [`RpcClient`] multiplexes any number of concurrent calls over one
//! connection: each call takes a fresh stream id, registers a pending
//! waiter, and a single reader task demultiplexes responses back to the
//! waiters. Connecting is lazy; the first call or ping dials out.
//!
//! [`RpcClientPool`] keeps a bounded set of clients to one target and
//! hands out round-robin leases; because clients multiplex freely, many
//! leases can share one client.

mod client;
mod pool;

pub use client::{CallError, RpcClient, RpcClientConfig, CLOSED_MESSAGE};
pub use pool::{ClientLease, ClientPoolConfig, RpcClientPool};
