//! Stream factories.
//!
//! A factory turns a dialed or accepted TCP socket into an [`RpcStream`]
//! of the configured flavor. The client pool, client engine, and server
//! acceptor all construct transports exclusively through this trait.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tracing::debug;

use crate::stream::{RpcStream, StreamOptions};
use crate::tls::{self, TlsClientConfig, TlsServerConfig};

#[async_trait]
pub trait StreamFactory: Send + Sync {
    /// Dial `host:port` and produce a ready stream (TLS handshake
    /// included, where applicable).
    async fn connect(&self, host: &str, port: u16, opts: StreamOptions)
        -> io::Result<Arc<RpcStream>>;

    /// Wrap an accepted socket into a ready stream.
    async fn accept(&self, socket: TcpStream, opts: StreamOptions) -> io::Result<Arc<RpcStream>>;
}

/// Plain TCP, no identity, no application secret.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFactory;

impl TcpFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StreamFactory for TcpFactory {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        opts: StreamOptions,
    ) -> io::Result<Arc<RpcStream>> {
        let socket = TcpStream::connect((host, port)).await?;
        socket.set_nodelay(true)?;
        debug!(host, port, "tcp connected");
        Ok(RpcStream::plain(socket, opts))
    }

    async fn accept(&self, socket: TcpStream, opts: StreamOptions) -> io::Result<Arc<RpcStream>> {
        socket.set_nodelay(true)?;
        Ok(RpcStream::plain(socket, opts))
    }
}

/// TLS on either or both ends. A factory built with only a client (or
/// only a server) configuration refuses the other role.
pub struct TlsFactory {
    client: Option<ClientSide>,
    server: Option<Arc<rustls::ServerConfig>>,
}

struct ClientSide {
    config: Arc<rustls::ClientConfig>,
    server_name: Option<String>,
    /// Whether the configuration carries a client certificate.
    client_auth: bool,
}

impl std::fmt::Debug for TlsFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsFactory")
            .field("client", &self.client.is_some())
            .field("server", &self.server.is_some())
            .finish()
    }
}

impl TlsFactory {
    /// Client-only factory.
    pub fn client(config: TlsClientConfig) -> io::Result<Self> {
        Ok(Self {
            client: Some(ClientSide::build(config)?),
            server: None,
        })
    }

    /// Server-only factory.
    pub fn server(config: TlsServerConfig) -> io::Result<Self> {
        Ok(Self {
            client: None,
            server: Some(Arc::new(config.into_rustls()?)),
        })
    }

    /// Factory for endpoints that play both roles.
    pub fn new(client: TlsClientConfig, server: TlsServerConfig) -> io::Result<Self> {
        Ok(Self {
            client: Some(ClientSide::build(client)?),
            server: Some(Arc::new(server.into_rustls()?)),
        })
    }
}

impl ClientSide {
    fn build(config: TlsClientConfig) -> io::Result<Self> {
        let server_name = config.server_name.clone();
        let client_auth = config.identity.is_some();
        Ok(Self {
            config: Arc::new(config.into_rustls()?),
            server_name,
            client_auth,
        })
    }
}

#[async_trait]
impl StreamFactory for TlsFactory {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        opts: StreamOptions,
    ) -> io::Result<Arc<RpcStream>> {
        let client = self.client.as_ref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "tls factory has no client configuration",
            )
        })?;

        let name = client.server_name.as_deref().unwrap_or(host);
        let name = ServerName::try_from(name.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let socket = TcpStream::connect((host, port)).await?;
        socket.set_nodelay(true)?;
        debug!(host, port, "tcp connected, starting tls handshake");
        tls::connect(socket, client.config.clone(), name, client.client_auth, opts).await
    }

    async fn accept(&self, socket: TcpStream, opts: StreamOptions) -> io::Result<Arc<RpcStream>> {
        let config = self.server.as_ref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "tls factory has no server configuration",
            )
        })?;
        socket.set_nodelay(true)?;
        tls::accept(socket, config.clone(), opts).await
    }
}
