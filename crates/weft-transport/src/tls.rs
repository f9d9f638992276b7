//! TLS transport.
//!
//! rustls (via tokio-rustls) owns the record layer and handshake; this
//! module builds the client/server configurations, wraps handshaken
//! streams into [`RpcStream`]s, extracts the peer's certificate identity,
//! and derives the 32-byte application secret through the TLS exporter.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::stream::{PeerIdentity, RpcStream, StreamOptions, StreamParts};

/// Exporter label for the application secret. Both ends of a connection
/// must use the same label to derive the same 32 bytes.
pub const EXPORTER_LABEL: &[u8] = b"EXPORTER-weft-app-secret";

static PROVIDER_INIT: Once = Once::new();

/// Process-wide one-shot: install the ring crypto provider as the rustls
/// default. Racing installs elsewhere in the process are tolerated.
fn ensure_crypto_provider() {
    PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// A certificate chain plus its private key.
pub struct TlsIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_chain_len", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Load a PEM certificate chain and PEM private key from disk.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> io::Result<Self> {
        let cert_chain = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        Ok(Self { cert_chain, key })
    }
}

/// Client-side TLS configuration.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// SNI / verification name. Defaults to the dialed host.
    pub server_name: Option<String>,
    /// PEM file of trust anchors.
    pub ca_file: Option<PathBuf>,
    /// In-memory trust anchors (appended to `ca_file`'s).
    pub ca_certs: Vec<CertificateDer<'static>>,
    /// Client certificate for mutual TLS.
    pub identity: Option<TlsIdentity>,
}

impl TlsClientConfig {
    pub(crate) fn into_rustls(self) -> io::Result<rustls::ClientConfig> {
        ensure_crypto_provider();

        let mut roots = RootCertStore::empty();
        if let Some(path) = &self.ca_file {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(invalid_input)?;
            }
        }
        for cert in self.ca_certs {
            roots.add(cert).map_err(invalid_input)?;
        }
        if roots.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "client TLS config has no trust anchors",
            ));
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        let config = match self.identity {
            Some(identity) => builder
                .with_client_auth_cert(identity.cert_chain, identity.key)
                .map_err(invalid_input)?,
            None => builder.with_no_client_auth(),
        };
        Ok(config)
    }
}

/// Server-side TLS configuration.
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    /// Server certificate chain and key.
    pub identity: TlsIdentity,
    /// PEM file of anchors used to verify client certificates.
    pub ca_file: Option<PathBuf>,
    /// In-memory anchors for client certificates.
    pub ca_certs: Vec<CertificateDer<'static>>,
    /// Demand and verify a client certificate during the handshake.
    pub require_client_cert: bool,
}

impl TlsServerConfig {
    pub fn new(identity: TlsIdentity) -> Self {
        Self {
            identity,
            ca_file: None,
            ca_certs: Vec::new(),
            require_client_cert: false,
        }
    }

    pub(crate) fn into_rustls(self) -> io::Result<rustls::ServerConfig> {
        ensure_crypto_provider();

        let builder = rustls::ServerConfig::builder();
        let config = if self.require_client_cert {
            let mut roots = RootCertStore::empty();
            if let Some(path) = &self.ca_file {
                for cert in load_certs(path)? {
                    roots.add(cert).map_err(invalid_input)?;
                }
            }
            for cert in self.ca_certs {
                roots.add(cert).map_err(invalid_input)?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(invalid_input)?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        }
        .with_single_cert(self.identity.cert_chain, self.identity.key)
        .map_err(invalid_input)?;
        Ok(config)
    }
}

/// Handshake as the initiator and wrap the session. `client_auth` says
/// whether we presented a certificate of our own.
pub(crate) async fn connect(
    socket: TcpStream,
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
    client_auth: bool,
    opts: StreamOptions,
) -> io::Result<Arc<RpcStream>> {
    let connector = TlsConnector::from(config);
    let stream = connector.connect(server_name, socket).await?;

    let (_, conn) = stream.get_ref();
    let peer = identity_from_chain(conn.peer_certificates());
    let app_key = export_app_key(conn.export_keying_material([0u8; 32], EXPORTER_LABEL, None));
    debug!(
        authenticated = peer.as_ref().map(|p| p.authenticated),
        has_app_key = app_key.is_some(),
        "tls client handshake complete"
    );

    Ok(RpcStream::from_parts(
        StreamParts {
            io: Box::new(stream),
            tls: true,
            mutual: client_auth && peer.is_some(),
            peer,
            app_key,
        },
        opts,
    ))
}

/// Handshake as the acceptor and wrap the session.
pub(crate) async fn accept(
    socket: TcpStream,
    config: Arc<rustls::ServerConfig>,
    opts: StreamOptions,
) -> io::Result<Arc<RpcStream>> {
    let acceptor = TlsAcceptor::from(config);
    let stream = acceptor.accept(socket).await?;

    let (_, conn) = stream.get_ref();
    let peer = identity_from_chain(conn.peer_certificates());
    let app_key = export_app_key(conn.export_keying_material([0u8; 32], EXPORTER_LABEL, None));
    debug!(
        authenticated = peer.as_ref().map(|p| p.authenticated),
        has_app_key = app_key.is_some(),
        "tls server handshake complete"
    );

    Ok(RpcStream::from_parts(
        StreamParts {
            io: Box::new(stream),
            tls: true,
            // A verified client certificate makes the session mutual.
            mutual: peer.is_some(),
            peer,
            app_key,
        },
        opts,
    ))
}

fn export_app_key(result: Result<[u8; 32], rustls::Error>) -> Option<[u8; 32]> {
    match result {
        Ok(key) => Some(key),
        Err(err) => {
            // TLS 1.2 without extended master secret refuses to export.
            warn!(%err, "tls exporter unavailable, body encryption disabled");
            None
        }
    }
}

/// Build a [`PeerIdentity`] from the verified peer chain. rustls only
/// surfaces certificates that passed the configured verifier, so a present
/// chain means an authenticated peer.
fn identity_from_chain(chain: Option<&[CertificateDer<'static>]>) -> Option<PeerIdentity> {
    let leaf = chain?.first()?;
    let (_, cert) = match X509Certificate::from_der(leaf.as_ref()) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(%err, "failed to parse peer certificate");
            return None;
        }
    };

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let dns_sans = cert
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some((*dns).to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Some(PeerIdentity {
        authenticated: true,
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        common_name,
        dns_sans,
        pem: pem_encode_cert(leaf.as_ref()),
    })
}

fn pem_encode_cert(der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut pem = String::with_capacity(encoded.len() + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        // Chunks come from an ASCII base64 string.
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader).collect()
}

fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no private key found in {}", path.display()),
        )
    })
}

fn invalid_input(err: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err)
}
