#![deny(unsafe_code)]

//! weft: a binary, stream-multiplexed RPC framework.
//!
//! Request/response pairs travel over a single ordered byte transport;
//! concurrent calls share the connection through 32-bit stream ids and
//! methods are addressed by the 64-bit FNV-1a hash of their name. The
//! transport is plain TCP or TLS, and on TLS an optional AES-256-GCM
//! layer (keyed through the TLS exporter) encrypts frame bodies.
//!
//! ```no_run
//! use weft::{RpcClient, RpcServer};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = RpcServer::new("127.0.0.1", 4433);
//! server.register("Example.Echo", |_ctx, body| async move { body });
//! tokio::spawn(server.serve());
//!
//! let client = RpcClient::new("127.0.0.1", 4433);
//! let reply = client.call_named("Example.Echo", b"hello").await?;
//! assert_eq!(reply, b"hello");
//! # Ok(())
//! # }
//! ```

pub use weft_frame::{
    decode_error_body, encode_error_body, fnv1a64, method_id, FrameFlags, FrameHeader, FrameType,
    HeaderError, WireError, CODE_BAD_PAYLOAD, CODE_UNKNOWN_METHOD, HEADER_LEN, MAGIC, VERSION,
};

pub use weft_transport::{
    AppCipher, CryptoError, PeerIdentity, RpcStream, StreamFactory, StreamOptions, TcpFactory,
    TlsClientConfig, TlsFactory, TlsIdentity, TlsServerConfig,
};

pub use weft_server::{
    BoundServer, IntoBody, MethodRegistry, RpcConnection, RpcContext, RpcServer, RpcServerConfig,
};

pub use weft_client::{
    CallError, ClientLease, ClientPoolConfig, RpcClient, RpcClientConfig, RpcClientPool,
    CLOSED_MESSAGE,
};
