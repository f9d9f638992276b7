//! Error response bodies.
//!
//! A Response frame with the `ERROR` flag carries:
//! big-endian `u32 code`, big-endian `u32 msg_len`, `msg_len` bytes of
//! UTF-8 message, then optional detail bytes to the end of the body.

/// Decoded error payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    pub code: u32,
    pub message: String,
    /// Trailing detail bytes, if any.
    pub detail: Vec<u8>,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for WireError {}

/// Encode an error body.
pub fn encode_error_body(code: u32, message: &str, detail: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + message.len() + detail.len());
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&(message.len() as u32).to_be_bytes());
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(detail);
    buf
}

/// Decode an error body. `None` if the body is too short or the declared
/// message length overruns it; the message is read lossily.
pub fn decode_error_body(body: &[u8]) -> Option<WireError> {
    if body.len() < 8 {
        return None;
    }
    let code = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let msg_len = u32::from_be_bytes([body[4], body[5], body[6], body[7]]) as usize;
    let rest = &body[8..];
    if rest.len() < msg_len {
        return None;
    }
    Some(WireError {
        code,
        message: String::from_utf8_lossy(&rest[..msg_len]).into_owned(),
        detail: rest[msg_len..].to_vec(),
    })
}
