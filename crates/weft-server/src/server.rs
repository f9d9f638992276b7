//! Listener and accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use weft_transport::{StreamFactory, StreamOptions, TcpFactory};

use crate::connection::RpcConnection;
use crate::registry::{IntoBody, MethodRegistry};
use crate::RpcContext;

/// Pause after a failed accept before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct RpcServerConfig {
    pub host: String,
    pub port: u16,
    /// Builds the per-connection transport (plain TCP or TLS).
    pub factory: Arc<dyn StreamFactory>,
    pub stream_options: StreamOptions,
    /// Encrypt response bodies when the transport exports an app secret.
    pub encrypt_responses: bool,
}

impl std::fmt::Debug for RpcServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("stream_options", &self.stream_options)
            .field("encrypt_responses", &self.encrypt_responses)
            .finish_non_exhaustive()
    }
}

impl RpcServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            factory: Arc::new(TcpFactory::new()),
            stream_options: StreamOptions::default(),
            encrypt_responses: false,
        }
    }
}

/// RPC server: a registry plus an acceptor.
pub struct RpcServer {
    registry: MethodRegistry,
    config: RpcServerConfig,
}

impl RpcServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_config(RpcServerConfig::new(host, port))
    }

    pub fn with_config(config: RpcServerConfig) -> Self {
        Self {
            registry: MethodRegistry::new(),
            config,
        }
    }

    pub fn registry(&mut self) -> &mut MethodRegistry {
        &mut self.registry
    }

    /// Register a handler by method name.
    pub fn register<F, Fut, B>(&mut self, name: &str, handler: F)
    where
        F: Fn(RpcContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = B> + Send + 'static,
        B: IntoBody,
    {
        self.registry.register(name, handler);
    }

    /// Register a handler by precomputed method id.
    pub fn register_id<F, Fut, B>(&mut self, id: u64, handler: F)
    where
        F: Fn(RpcContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = B> + Send + 'static,
        B: IntoBody,
    {
        self.registry.register_id(id, handler);
    }

    /// Bind the listener. The registry is frozen at this point; further
    /// registration is not possible.
    pub async fn bind(self) -> io::Result<BoundServer> {
        let addr = (self.config.host.as_str(), self.config.port);
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %listener.local_addr()?,
            methods = self.registry.len(),
            "server listening"
        );
        Ok(BoundServer {
            listener,
            registry: Arc::new(self.registry),
            config: self.config,
        })
    }

    /// Bind and serve forever.
    pub async fn serve(self) -> io::Result<()> {
        self.bind().await?.serve().await
    }
}

/// A server with a bound listener.
pub struct BoundServer {
    listener: TcpListener,
    registry: Arc<MethodRegistry>,
    config: RpcServerConfig,
}

impl BoundServer {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Each connection gets its transport built and its
    /// engine run on a detached task, so a slow TLS handshake never
    /// stalls the acceptor.
    pub async fn serve(self) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!(%peer_addr, "accepted connection");
                    let factory = self.config.factory.clone();
                    let opts = self.config.stream_options;
                    let registry = self.registry.clone();
                    let encrypt = self.config.encrypt_responses;
                    tokio::spawn(async move {
                        match factory.accept(socket, opts).await {
                            Ok(stream) => {
                                RpcConnection::new(stream, registry, encrypt).run().await;
                            }
                            Err(err) => {
                                warn!(%err, %peer_addr, "transport setup failed");
                            }
                        }
                    });
                }
                Err(err) => {
                    warn!(%err, "accept failed, backing off");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}
