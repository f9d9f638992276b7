//! Per-connection engine.
//!
//! One `RpcConnection` runs per accepted transport. The loop reads frames
//! and routes them: requests are dispatched on spawned tasks, pings are
//! answered inline, cancels fire the matching cancellation source.
//! Framing violations (bad magic/version, short reads, oversized length)
//! terminate the connection; per-request failures never do.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weft_frame::{
    encode_error_body, FrameFlags, FrameHeader, FrameType, CODE_BAD_PAYLOAD, CODE_UNKNOWN_METHOD,
};
use weft_transport::RpcStream;

use crate::context::RpcContext;
use crate::registry::MethodRegistry;

pub struct RpcConnection {
    stream: Arc<RpcStream>,
    registry: Arc<MethodRegistry>,
    /// Cancellation sources for in-flight requests, keyed by stream id.
    cancels: Mutex<HashMap<u32, CancellationToken>>,
    encrypt_responses: bool,
}

impl RpcConnection {
    pub fn new(
        stream: Arc<RpcStream>,
        registry: Arc<MethodRegistry>,
        encrypt_responses: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            stream,
            registry,
            cancels: Mutex::new(HashMap::new()),
            encrypt_responses,
        })
    }

    /// Frame loop. Runs until the peer closes, a read fails, or a framing
    /// violation occurs; the transport is shut down on the way out.
    pub async fn run(self: Arc<Self>) {
        loop {
            let (hdr, body) = match self.stream.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("peer closed connection");
                    break;
                }
                Err(err) => {
                    warn!(%err, "connection read failed");
                    break;
                }
            };

            match hdr.frame_type() {
                Some(FrameType::Request) => {
                    let conn = self.clone();
                    tokio::spawn(async move { conn.dispatch(hdr, body).await });
                }
                Some(FrameType::Cancel) => self.handle_cancel(&hdr),
                Some(FrameType::Ping) => self.handle_ping(&hdr).await,
                other => {
                    debug!(frame_type = hdr.frame_type, ?other, "ignoring frame");
                }
            }
        }

        // Unblock any handler still waiting on its token.
        for (_, token) in self.cancels.lock().drain() {
            token.cancel();
        }
        self.stream.shutdown().await;
    }

    async fn dispatch(self: Arc<Self>, hdr: FrameHeader, mut body: Vec<u8>) {
        if hdr.is_encrypted() {
            let opened = self
                .stream
                .app_cipher()
                .ok_or(())
                .and_then(|cipher| cipher.open(&body).map_err(drop));
            match opened {
                Ok(plain) => body = plain,
                Err(()) => {
                    warn!(stream_id = hdr.stream_id, "request body failed to decrypt");
                    self.send_error(&hdr, CODE_BAD_PAYLOAD, "Bad payload").await;
                    return;
                }
            }
        }

        let Some(handler) = self.registry.find(hdr.method_id) else {
            debug!(method_id = hdr.method_id, "unknown method");
            self.send_error(&hdr, CODE_UNKNOWN_METHOD, "Unknown method")
                .await;
            return;
        };

        let token = CancellationToken::new();
        self.cancels.lock().insert(hdr.stream_id, token.clone());

        let ctx = RpcContext {
            stream: self.stream.clone(),
            stream_id: hdr.stream_id,
            method_id: hdr.method_id,
            flags: hdr.flags,
            cancel: token.clone(),
            peer: self.stream.peer_identity().cloned(),
        };

        // A handler that finishes first gets its response delivered even
        // if a cancel lands later; once cancellation wins, the handler is
        // dropped and no response goes out.
        tokio::select! {
            biased;
            response = handler(ctx, body) => {
                self.cancels.lock().remove(&hdr.stream_id);
                self.send_response(&hdr, response).await;
            }
            _ = token.cancelled() => {
                self.cancels.lock().remove(&hdr.stream_id);
                debug!(stream_id = hdr.stream_id, "request cancelled before completion");
            }
        }
    }

    fn handle_cancel(&self, hdr: &FrameHeader) {
        let source = self.cancels.lock().remove(&hdr.stream_id);
        match source {
            Some(token) => {
                debug!(stream_id = hdr.stream_id, "cancelling in-flight request");
                token.cancel();
            }
            None => {
                debug!(stream_id = hdr.stream_id, "cancel for unknown stream id");
            }
        }
    }

    async fn handle_ping(&self, hdr: &FrameHeader) {
        let pong = FrameHeader::pong(hdr.stream_id, hdr.method_id).with(self.stream.wire_flags());
        if let Err(err) = self.stream.send_frame(&pong, &[]).await {
            warn!(%err, "failed to send pong");
            self.stream.shutdown().await;
        }
    }

    async fn send_response(&self, req: &FrameHeader, mut body: Vec<u8>) {
        let mut flags = self.stream.wire_flags();
        if self.encrypt_responses && !body.is_empty() {
            if let Some(cipher) = self.stream.app_cipher() {
                match cipher.seal(&body) {
                    Ok(sealed) => {
                        body = sealed;
                        flags |= FrameFlags::ENCRYPTED;
                    }
                    Err(err) => {
                        warn!(%err, stream_id = req.stream_id, "response encryption failed");
                        self.send_error(req, CODE_BAD_PAYLOAD, "Bad payload").await;
                        return;
                    }
                }
            }
        }

        let hdr =
            FrameHeader::response(req.stream_id, req.method_id, body.len() as u32).with(flags);
        if let Err(err) = self.stream.send_frame(&hdr, &body).await {
            warn!(%err, stream_id = req.stream_id, "failed to send response");
            self.stream.shutdown().await;
        }
    }

    async fn send_error(&self, req: &FrameHeader, code: u32, message: &str) {
        let body = encode_error_body(code, message, &[]);
        let hdr = FrameHeader::error_response(req.stream_id, req.method_id, body.len() as u32)
            .with(self.stream.wire_flags());
        if let Err(err) = self.stream.send_frame(&hdr, &body).await {
            warn!(%err, stream_id = req.stream_id, "failed to send error response");
            self.stream.shutdown().await;
        }
    }
}
