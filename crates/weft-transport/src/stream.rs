//! The `RpcStream` byte channel.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use weft_frame::{FrameFlags, FrameHeader, HEADER_LEN};

use crate::crypto::AppCipher;

/// Identity of the TLS peer, extracted from its certificate after the
/// handshake. Absent on plain TCP and on TLS connections where the peer
/// presented no certificate.
#[derive(Debug, Clone, Default)]
pub struct PeerIdentity {
    /// True when the certificate chain was verified against configured
    /// trust anchors.
    pub authenticated: bool,
    pub subject: String,
    pub issuer: String,
    pub common_name: String,
    pub dns_sans: Vec<String>,
    /// The peer's leaf certificate, PEM-encoded.
    pub pem: String,
}

/// Per-stream I/O options.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Bound on any individual read or write. Expiry is reported as a
    /// `TimedOut` I/O error and tears the connection down.
    pub timeout: Option<Duration>,
    /// Upper bound on the `length` field of incoming frames. Violations
    /// are connection-level protocol errors.
    pub max_frame_len: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

/// Object-safe alias for the underlying duplex.
pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// Everything `RpcStream::from_parts` needs from a transport constructor.
pub(crate) struct StreamParts {
    pub io: Box<dyn AsyncReadWrite>,
    pub tls: bool,
    /// Both endpoints presented verified certificates.
    pub mutual: bool,
    pub peer: Option<PeerIdentity>,
    pub app_key: Option<[u8; 32]>,
}

/// A bidirectional ordered byte channel carrying frames.
///
/// The read half is owned by exactly one reader loop at a time; the write
/// half doubles as the connection write lock, so a header and its body are
/// always contiguous on the wire even with many concurrent senders.
pub struct RpcStream {
    read: Mutex<ReadHalf<Box<dyn AsyncReadWrite>>>,
    write: Mutex<WriteHalf<Box<dyn AsyncReadWrite>>>,
    opts: StreamOptions,
    tls: bool,
    mutual: bool,
    peer: Option<Arc<PeerIdentity>>,
    app_key: Option<[u8; 32]>,
    app_cipher: Option<AppCipher>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("tls", &self.tls)
            .field("authenticated", &self.peer.as_ref().map(|p| p.authenticated))
            .field("has_app_key", &self.app_key.is_some())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RpcStream {
    /// Wrap an accepted or connected TCP socket.
    pub fn plain(socket: TcpStream, opts: StreamOptions) -> Arc<Self> {
        Self::from_parts(
            StreamParts {
                io: Box::new(socket),
                tls: false,
                mutual: false,
                peer: None,
                app_key: None,
            },
            opts,
        )
    }

    pub(crate) fn from_parts(parts: StreamParts, opts: StreamOptions) -> Arc<Self> {
        let (read, write) = tokio::io::split(parts.io);
        let app_cipher = parts.app_key.as_ref().map(AppCipher::new);
        Arc::new(Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            opts,
            tls: parts.tls,
            mutual: parts.mutual,
            peer: parts.peer.map(Arc::new),
            app_key: parts.app_key,
            app_cipher,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// TLS peer identity, if the transport authenticated one.
    pub fn peer_identity(&self) -> Option<&Arc<PeerIdentity>> {
        self.peer.as_ref()
    }

    /// The 32-byte application secret exported from the TLS session.
    /// `None` on plain TCP.
    pub fn app_secret_key(&self) -> Option<&[u8; 32]> {
        self.app_key.as_ref()
    }

    /// Body cipher keyed from the exported application secret.
    pub fn app_cipher(&self) -> Option<&AppCipher> {
        self.app_cipher.as_ref()
    }

    /// Informational flag bits describing this transport, OR-ed into
    /// outgoing request/response headers.
    pub fn wire_flags(&self) -> FrameFlags {
        let mut flags = FrameFlags::empty();
        if self.tls {
            flags |= FrameFlags::TLS;
            if self.mutual {
                flags |= FrameFlags::MTLS;
            }
        }
        flags
    }

    async fn timed<T>(
        &self,
        fut: impl std::future::Future<Output = io::Result<T>>,
    ) -> io::Result<T> {
        match self.opts.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "socket timeout"))),
            None => fut.await,
        }
    }

    /// Write a frame: header, then body, contiguously under the write lock.
    pub async fn send_frame(&self, hdr: &FrameHeader, body: &[u8]) -> io::Result<()> {
        debug_assert_eq!(hdr.length as usize, body.len());
        let head = hdr.to_bytes();
        let mut write = self.write.lock().await;
        self.timed(write.write_all(&head)).await?;
        if !body.is_empty() {
            self.timed(write.write_all(body)).await?;
        }
        self.timed(write.flush()).await
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on orderly close at a frame boundary. A short
    /// read inside a frame, a magic/version mismatch, or a `length` above
    /// the configured bound is an error; callers treat all of them as
    /// terminal for the connection.
    pub async fn read_frame(&self) -> io::Result<Option<(FrameHeader, Vec<u8>)>> {
        let mut read = self.read.lock().await;

        let mut head = [0u8; HEADER_LEN];
        if !read_full(self, &mut read, &mut head).await? {
            return Ok(None);
        }

        let hdr = FrameHeader::decode(&head)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if hdr.length > self.opts.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame length {} exceeds limit {}",
                    hdr.length, self.opts.max_frame_len
                ),
            ));
        }

        let mut body = vec![0u8; hdr.length as usize];
        if !body.is_empty() && !read_full(self, &mut read, &mut body).await? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eof inside frame body",
            ));
        }
        Ok(Some((hdr, body)))
    }

    /// Close the write half. Idempotent and safe from any task; the peer
    /// observes EOF and tears down, which in turn completes our reader.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down transport");
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
    }
}

/// Accumulate exactly `buf.len()` bytes. Returns `Ok(false)` when EOF
/// arrives before the first byte, `UnexpectedEof` when it arrives after.
async fn read_full(
    stream: &RpcStream,
    read: &mut ReadHalf<Box<dyn AsyncReadWrite>>,
    buf: &mut [u8],
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.timed(read.read(&mut buf[filled..])).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eof mid-frame",
            ));
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_frame::FrameType;

    fn pair(opts: StreamOptions) -> (Arc<RpcStream>, Arc<RpcStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mk = |io| {
            RpcStream::from_parts(
                StreamParts {
                    io: Box::new(io) as Box<dyn AsyncReadWrite>,
                    tls: false,
                    mutual: false,
                    peer: None,
                    app_key: None,
                },
                opts,
            )
        };
        (mk(a), mk(b))
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (left, right) = pair(StreamOptions::default());
        let hdr = FrameHeader::request(3, weft_frame::method_id("Example.Echo"), 5);
        left.send_frame(&hdr, b"hello").await.unwrap();

        let (got, body) = right.read_frame().await.unwrap().unwrap();
        assert_eq!(got, hdr);
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn orderly_close_at_boundary_reads_none() {
        let (left, right) = pair(StreamOptions::default());
        left.shutdown().await;
        assert!(right.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_header_is_an_error() {
        let (a, b) = tokio::io::duplex(1024);
        let stream = RpcStream::from_parts(
            StreamParts {
                io: Box::new(b) as Box<dyn AsyncReadWrite>,
                tls: false,
                mutual: false,
                peer: None,
                app_key: None,
            },
            StreamOptions::default(),
        );
        // Write half a header, then close.
        {
            use tokio::io::AsyncWriteExt;
            let mut a = a;
            a.write_all(&[0x55, 0x52, 0x50, 0x43, 1, 0, 0])
                .await
                .unwrap();
            a.shutdown().await.unwrap();
        }
        let err = stream.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn bad_magic_is_invalid_data() {
        let (a, b) = tokio::io::duplex(1024);
        let stream = RpcStream::from_parts(
            StreamParts {
                io: Box::new(b) as Box<dyn AsyncReadWrite>,
                tls: false,
                mutual: false,
                peer: None,
                app_key: None,
            },
            StreamOptions::default(),
        );
        {
            use tokio::io::AsyncWriteExt;
            let mut a = a;
            let mut bytes = FrameHeader::ping(1).to_bytes();
            bytes[0] = 0x00;
            a.write_all(&bytes).await.unwrap();
        }
        let err = stream.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected() {
        let opts = StreamOptions {
            timeout: None,
            max_frame_len: 16,
        };
        let (left, right) = pair(opts);
        let hdr = FrameHeader::new(FrameType::Request, 1, 0, 17);
        left.send_frame(&hdr, &[0u8; 17]).await.unwrap();
        let err = right.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn read_times_out_when_no_data_arrives() {
        let opts = StreamOptions {
            timeout: Some(Duration::from_millis(20)),
            max_frame_len: 1024,
        };
        let (_left, right) = pair(opts);
        let err = right.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn concurrent_writers_keep_frames_contiguous() {
        let (left, right) = pair(StreamOptions::default());

        let mut tasks = Vec::new();
        for i in 0..16u32 {
            let left = left.clone();
            tasks.push(tokio::spawn(async move {
                let body = vec![i as u8; 512];
                let hdr = FrameHeader::request(i + 1, 0, body.len() as u32);
                left.send_frame(&hdr, &body).await.unwrap();
            }));
        }

        for _ in 0..16 {
            let (hdr, body) = right.read_frame().await.unwrap().unwrap();
            assert_eq!(body.len(), 512);
            assert!(body.iter().all(|&b| b == body[0]));
            assert_eq!(hdr.stream_id, body[0] as u32 + 1);
        }
        for t in tasks {
            t.await.unwrap();
        }
    }
}
