//! The client engine.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use weft_frame::{decode_error_body, method_id, FrameFlags, FrameHeader, FrameType};
use weft_transport::{CryptoError, RpcStream, StreamFactory, StreamOptions, TcpFactory};

/// Error message every pending call observes when the connection dies
/// underneath it.
pub const CLOSED_MESSAGE: &str = "Connection closed by peer (timeout/idle)";

#[derive(Clone)]
pub struct RpcClientConfig {
    pub host: String,
    pub port: u16,
    /// Builds the transport on first use (plain TCP or TLS).
    pub factory: Arc<dyn StreamFactory>,
    pub stream_options: StreamOptions,
    /// When set, a background task pings at this cadence and closes the
    /// client on failure.
    pub ping_interval: Option<Duration>,
    /// Encrypt non-empty request bodies when the transport exports an
    /// application secret. Silently disabled otherwise.
    pub encrypt_bodies: bool,
}

impl std::fmt::Debug for RpcClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("stream_options", &self.stream_options)
            .field("ping_interval", &self.ping_interval)
            .field("encrypt_bodies", &self.encrypt_bodies)
            .finish_non_exhaustive()
    }
}

impl RpcClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            factory: Arc::new(TcpFactory::new()),
            stream_options: StreamOptions::default(),
            ping_interval: None,
            encrypt_bodies: false,
        }
    }
}

/// Why a call failed.
#[derive(Debug)]
pub enum CallError {
    /// The transport could not be established.
    Connect(io::Error),
    /// The request could not be written.
    Io(io::Error),
    /// The server answered with an `ERROR`-flagged response.
    Remote { code: u32, message: String },
    /// Body encryption or decryption failed.
    Crypto(CryptoError),
    /// The connection died while the call was pending.
    Closed { message: String },
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Connect(err) => write!(f, "connect failed: {err}"),
            CallError::Io(err) => write!(f, "i/o failed: {err}"),
            CallError::Remote { code, message } => write!(f, "remote error {code}: {message}"),
            CallError::Crypto(err) => write!(f, "{err}"),
            CallError::Closed { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Connect(err) | CallError::Io(err) => Some(err),
            CallError::Crypto(err) => Some(err),
            _ => None,
        }
    }
}

type ReplyTx = oneshot::Sender<Result<Vec<u8>, CallError>>;

/// Waiter tagged with the connection generation it was issued on, so a
/// dying connection's teardown never touches a successor's calls.
struct PendingCall {
    generation: u64,
    tx: ReplyTx,
}

struct PingWaiter {
    generation: u64,
    tx: oneshot::Sender<()>,
}

/// A multiplexing RPC client over one lazily-established connection.
pub struct RpcClient {
    config: RpcClientConfig,
    /// Connect lock and handle. Held for the duration of dialing so
    /// concurrent first callers observe one established stream.
    stream: tokio::sync::Mutex<Option<Arc<RpcStream>>>,
    /// Bumped on every successful connect, under the connect lock.
    generation: AtomicU64,
    next_stream_id: AtomicU32,
    running: AtomicBool,
    pending: Mutex<HashMap<u32, PendingCall>>,
    pings: Mutex<HashMap<u32, PingWaiter>>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl RpcClient {
    pub fn new(host: impl Into<String>, port: u16) -> Arc<Self> {
        Self::with_config(RpcClientConfig::new(host, port))
    }

    pub fn with_config(config: RpcClientConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            stream: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            next_stream_id: AtomicU32::new(1),
            running: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            pings: Mutex::new(HashMap::new()),
        })
    }

    /// Call a method by its 64-bit id.
    pub async fn call(self: &Arc<Self>, method: u64, body: &[u8]) -> Result<Vec<u8>, CallError> {
        let (stream, generation) = self.ensure_connected().await?;
        let sid = self.next_stream_id();
        debug!(
            method_id = method,
            stream_id = sid,
            body_len = body.len(),
            "issuing call"
        );

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(sid, PendingCall { generation, tx });

        let mut flags = stream.wire_flags();
        let mut payload = std::borrow::Cow::Borrowed(body);
        if self.config.encrypt_bodies && !body.is_empty() {
            if let Some(cipher) = stream.app_cipher() {
                match cipher.seal(body) {
                    Ok(sealed) => {
                        payload = std::borrow::Cow::Owned(sealed);
                        flags |= FrameFlags::ENCRYPTED;
                    }
                    Err(err) => {
                        self.pending.lock().remove(&sid);
                        return Err(CallError::Crypto(err));
                    }
                }
            }
        }

        let hdr = FrameHeader::request(sid, method, payload.len() as u32).with(flags);
        if let Err(err) = stream.send_frame(&hdr, &payload).await {
            warn!(stream_id = sid, %err, "request write failed");
            self.pending.lock().remove(&sid);
            return Err(CallError::Io(err));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CallError::Closed {
                message: CLOSED_MESSAGE.into(),
            }),
        }
    }

    /// Call a method by name; the id is hashed at the call site.
    pub async fn call_named(
        self: &Arc<Self>,
        name: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, CallError> {
        let id = method_id(name);
        debug!(name, method_id = id, "calling by name");
        self.call(id, body).await
    }

    /// Round-trip a ping. `false` on any failure, including teardown
    /// while the pong is outstanding.
    pub async fn ping(self: &Arc<Self>) -> bool {
        let (stream, generation) = match self.ensure_connected().await {
            Ok(connected) => connected,
            Err(err) => {
                warn!(%err, "ping connect failed");
                return false;
            }
        };

        let sid = self.next_stream_id();
        let (tx, rx) = oneshot::channel();
        self.pings.lock().insert(sid, PingWaiter { generation, tx });

        let hdr = FrameHeader::ping(sid).with(stream.wire_flags());
        if let Err(err) = stream.send_frame(&hdr, &[]).await {
            warn!(stream_id = sid, %err, "ping write failed");
            self.pings.lock().remove(&sid);
            return false;
        }

        rx.await.is_ok()
    }

    /// Shut the connection down. Pending calls complete through the
    /// reader's teardown fan-out; a later call dials fresh.
    pub async fn close(&self) {
        self.running.store(false, Ordering::Relaxed);
        let stream = self.stream.lock().await.take();
        if let Some(stream) = stream {
            info!("closing client");
            stream.shutdown().await;
        }
    }

    /// Stream ids are monotonically increasing and never 0.
    fn next_stream_id(&self) -> u32 {
        let mut sid = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        if sid == 0 {
            sid = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        }
        sid
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<(Arc<RpcStream>, u64), CallError> {
        let mut guard = self.stream.lock().await;
        if let Some(stream) = guard.as_ref() {
            return Ok((stream.clone(), self.generation.load(Ordering::Relaxed)));
        }

        info!(
            host = %self.config.host,
            port = self.config.port,
            "connecting"
        );
        let stream = self
            .config
            .factory
            .connect(
                &self.config.host,
                self.config.port,
                self.config.stream_options,
            )
            .await
            .map_err(CallError::Connect)?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *guard = Some(stream.clone());
        self.running.store(true, Ordering::Relaxed);

        let reader = self.clone();
        let reader_stream = stream.clone();
        tokio::spawn(async move { reader.reader_loop(reader_stream, generation).await });

        if let Some(interval) = self.config.ping_interval {
            let pinger = self.clone();
            tokio::spawn(async move { pinger.ping_loop(generation, interval).await });
        }

        Ok((stream, generation))
    }

    /// The one task that reads from the transport, demultiplexing by
    /// stream id. Exits on EOF, read error, or protocol violation, then
    /// fans teardown out to every waiter of its generation.
    async fn reader_loop(self: Arc<Self>, stream: Arc<RpcStream>, generation: u64) {
        debug!(generation, "reader loop started");
        loop {
            let (hdr, body) = match stream.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("connection closed by peer");
                    break;
                }
                Err(err) => {
                    warn!(%err, "reader failed");
                    break;
                }
            };

            match hdr.frame_type() {
                Some(FrameType::Response) => {
                    let Some(call) = self.pending.lock().remove(&hdr.stream_id) else {
                        warn!(
                            stream_id = hdr.stream_id,
                            "response for unknown stream id, tearing down"
                        );
                        break;
                    };
                    let _ = call.tx.send(decode_response(&stream, &hdr, body));
                }
                Some(FrameType::Ping) => {
                    let pong =
                        FrameHeader::pong(hdr.stream_id, hdr.method_id).with(stream.wire_flags());
                    if let Err(err) = stream.send_frame(&pong, &[]).await {
                        warn!(%err, "failed to answer ping");
                        break;
                    }
                }
                Some(FrameType::Pong) => {
                    if let Some(waiter) = self.pings.lock().remove(&hdr.stream_id) {
                        let _ = waiter.tx.send(());
                    } else {
                        debug!(stream_id = hdr.stream_id, "pong with no waiter");
                    }
                }
                _ => {
                    debug!(frame_type = hdr.frame_type, "unexpected frame, ignoring");
                }
            }
        }

        self.teardown(&stream, generation).await;
    }

    /// Complete every waiter belonging to `generation`, then release the
    /// stream handle under the connect lock so the next call dials fresh.
    async fn teardown(&self, stream: &Arc<RpcStream>, generation: u64) {
        let mut guard = self.stream.lock().await;
        // Only the newest connection's reader may clear shared state; a
        // reconnect may already have replaced the handle.
        if self.generation.load(Ordering::Relaxed) == generation {
            self.running.store(false, Ordering::Relaxed);
            *guard = None;
        }

        let dead: Vec<ReplyTx> = {
            let mut map = self.pending.lock();
            let ids: Vec<u32> = map
                .iter()
                .filter(|(_, call)| call.generation == generation)
                .map(|(sid, _)| *sid)
                .collect();
            ids.iter()
                .filter_map(|sid| map.remove(sid))
                .map(|call| call.tx)
                .collect()
        };
        if !dead.is_empty() {
            warn!(calls = dead.len(), "failing pending calls on teardown");
        }
        for tx in dead {
            let _ = tx.send(Err(CallError::Closed {
                message: CLOSED_MESSAGE.into(),
            }));
        }

        // Dropping the senders completes every ping waiter with `false`.
        self.pings
            .lock()
            .retain(|_, waiter| waiter.generation != generation);

        drop(guard);
        stream.shutdown().await;
        debug!(generation, "reader loop exited");
    }

    /// Keepalive. Exits when the client closes or a newer connection
    /// supersedes this one's; a failed ping closes the client.
    fn ping_loop(
        self: Arc<Self>,
        generation: u64,
        interval: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // completes immediately
            loop {
                timer.tick().await;
                if !self.running.load(Ordering::Relaxed)
                    || self.generation.load(Ordering::Relaxed) != generation
                {
                    break;
                }
                if !self.ping().await {
                    warn!("keepalive ping failed, closing client");
                    self.close().await;
                    break;
                }
            }
        })
    }
}

/// Turn a Response frame into the caller-visible result: decrypt first,
/// then interpret the `ERROR` flag.
fn decode_response(
    stream: &RpcStream,
    hdr: &FrameHeader,
    mut body: Vec<u8>,
) -> Result<Vec<u8>, CallError> {
    if hdr.is_encrypted() {
        let Some(cipher) = stream.app_cipher() else {
            warn!(
                stream_id = hdr.stream_id,
                "encrypted response but no app key"
            );
            return Err(CallError::Crypto(CryptoError::Open));
        };
        body = cipher.open(&body).map_err(CallError::Crypto)?;
    }

    if hdr.is_error() {
        return Err(match decode_error_body(&body) {
            Some(err) => CallError::Remote {
                code: err.code,
                message: err.message,
            },
            None => CallError::Remote {
                code: 0,
                message: "Malformed error payload".into(),
            },
        });
    }

    Ok(body)
}
