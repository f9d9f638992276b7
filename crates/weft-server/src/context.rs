//! Per-request handler context.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use weft_frame::FrameFlags;
use weft_transport::{PeerIdentity, RpcStream};

/// Everything a handler gets to know about the request it is serving.
#[derive(Debug, Clone)]
pub struct RpcContext {
    /// The transport the request arrived on.
    pub stream: Arc<RpcStream>,
    /// Stream id of the request; the response mirrors it.
    pub stream_id: u32,
    /// Method id of the request.
    pub method_id: u64,
    /// Flags as received on the wire.
    pub flags: FrameFlags,
    /// Fires when the client sends a `Cancel` frame for this stream id.
    pub cancel: CancellationToken,
    /// TLS peer identity, when the transport authenticated one.
    pub peer: Option<Arc<PeerIdentity>>,
}

impl RpcContext {
    /// True once a `Cancel` frame for this request has been processed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
