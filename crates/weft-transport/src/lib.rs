#![deny(unsafe_code)]

//! Byte transports for weft.
//!
//! An [`RpcStream`] is a bidirectional ordered byte channel that knows how
//! to move whole frames: `send_frame` writes a header and body contiguously
//! under the connection write lock, `read_frame` blocks until a full frame
//! (or orderly EOF) arrives. Streams come in two flavors, plain TCP and
//! TLS; a [`StreamFactory`] picks the flavor per connection.
//!
//! TLS streams additionally expose the peer's certificate identity and a
//! 32-byte application secret derived through the TLS exporter, which keys
//! the optional [`AppCipher`] body encryption layer.

mod crypto;
mod factory;
mod stream;
mod tls;

pub use crypto::{AppCipher, CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
pub use factory::{StreamFactory, TcpFactory, TlsFactory};
pub use stream::{PeerIdentity, RpcStream, StreamOptions};
pub use tls::{TlsClientConfig, TlsIdentity, TlsServerConfig, EXPORTER_LABEL};
