//! Frame header layout and codec.
//!
//! Every frame starts with a fixed 28-byte header, all numeric fields
//! big-endian:
//!
//! ```text
//! offset  size  field
//!      0     4  magic      (0x55525043)
//!      4     1  version    (1)
//!      5     1  type
//!      6     2  flags
//!      8     4  reserved   (zero on send, ignored on receive)
//!     12     4  stream_id
//!     16     8  method_id
//!     24     4  length     (body bytes following the header)
//! ```

use bitflags::bitflags;

/// Frame magic, `b"URPC"` as a big-endian u32.
pub const MAGIC: u32 = 0x5552_5043;

/// Protocol version.
pub const VERSION: u8 = 1;

/// Serialized header size in bytes.
pub const HEADER_LEN: usize = 28;

/// Frame type tags.
///
/// `Stream` is reserved in the tag space but carries no semantics yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Request = 0,
    Response = 1,
    Stream = 2,
    Cancel = 3,
    Ping = 4,
    Pong = 5,
}

impl FrameType {
    /// Decode a wire tag. Unknown tags return `None`; receivers ignore
    /// such frames rather than rejecting the connection.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => FrameType::Request,
            1 => FrameType::Response,
            2 => FrameType::Stream,
            3 => FrameType::Cancel,
            4 => FrameType::Ping,
            5 => FrameType::Pong,
            _ => return None,
        })
    }
}

bitflags! {
    /// Flag bits carried in each header.
    ///
    /// Unknown bits are preserved on parse and re-serialize; receivers
    /// must not reject frames for carrying them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u16 {
        /// Final frame of the logical stream.
        const END_STREAM = 0x01;
        /// Response body carries an error payload.
        const ERROR      = 0x02;
        /// Reserved: body compression.
        const COMPRESSED = 0x04;
        /// Body has been through the application AEAD layer.
        const ENCRYPTED  = 0x08;
        /// Informational: the frame traveled over TLS.
        const TLS        = 0x10;
        /// Informational: the TLS peer presented a verified certificate.
        const MTLS       = 0x20;
    }
}

/// Error from parsing a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Magic did not match.
    BadMagic(u32),
    /// Version did not match.
    BadVersion(u8),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::BadMagic(m) => write!(f, "bad frame magic {m:#010x}"),
            HeaderError::BadVersion(v) => write!(f, "unsupported frame version {v}"),
        }
    }
}

impl std::error::Error for HeaderError {}

/// Parsed frame header.
///
/// `magic`, `version`, and `reserved` are not stored: the first two are
/// constants validated on parse, and `reserved` is written as zero and
/// ignored on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw frame type tag. Use [`FrameHeader::frame_type`] for the known set.
    pub frame_type: u8,
    pub flags: FrameFlags,
    /// Per-connection stream identifier. 0 is reserved and never assigned.
    pub stream_id: u32,
    /// FNV-1a of the method name, or 0 for non-method frames.
    pub method_id: u64,
    /// Body length in bytes.
    pub length: u32,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, stream_id: u32, method_id: u64, length: u32) -> Self {
        Self {
            frame_type: frame_type as u8,
            flags: FrameFlags::empty(),
            stream_id,
            method_id,
            length,
        }
    }

    /// Request header with `END_STREAM` set.
    pub fn request(stream_id: u32, method_id: u64, length: u32) -> Self {
        Self::new(FrameType::Request, stream_id, method_id, length).with(FrameFlags::END_STREAM)
    }

    /// Response header with `END_STREAM` set.
    pub fn response(stream_id: u32, method_id: u64, length: u32) -> Self {
        Self::new(FrameType::Response, stream_id, method_id, length).with(FrameFlags::END_STREAM)
    }

    /// Error response header with `END_STREAM | ERROR` set.
    pub fn error_response(stream_id: u32, method_id: u64, length: u32) -> Self {
        Self::new(FrameType::Response, stream_id, method_id, length)
            .with(FrameFlags::END_STREAM | FrameFlags::ERROR)
    }

    /// Ping header; zero method id and length.
    pub fn ping(stream_id: u32) -> Self {
        Self::new(FrameType::Ping, stream_id, 0, 0).with(FrameFlags::END_STREAM)
    }

    /// Pong header mirroring the ping's stream and method ids; zero length.
    pub fn pong(stream_id: u32, method_id: u64) -> Self {
        Self::new(FrameType::Pong, stream_id, method_id, 0).with(FrameFlags::END_STREAM)
    }

    /// Cancel header for an in-flight request.
    pub fn cancel(stream_id: u32, method_id: u64) -> Self {
        Self::new(FrameType::Cancel, stream_id, method_id, 0).with(FrameFlags::END_STREAM)
    }

    pub fn with(mut self, flags: FrameFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// The frame type, if the tag is in the known set.
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.frame_type)
    }

    pub fn is_error(&self) -> bool {
        self.flags.contains(FrameFlags::ERROR)
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(FrameFlags::ENCRYPTED)
    }

    /// Serialize into a 28-byte buffer.
    pub fn encode(&self, out: &mut [u8; HEADER_LEN]) {
        out[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        out[4] = VERSION;
        out[5] = self.frame_type;
        out[6..8].copy_from_slice(&self.flags.bits().to_be_bytes());
        out[8..12].copy_from_slice(&0u32.to_be_bytes());
        out[12..16].copy_from_slice(&self.stream_id.to_be_bytes());
        out[16..24].copy_from_slice(&self.method_id.to_be_bytes());
        out[24..28].copy_from_slice(&self.length.to_be_bytes());
    }

    /// Serialize into a fresh 28-byte array.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        self.encode(&mut buf);
        buf
    }

    /// Parse a 28-byte header.
    ///
    /// Fails only on magic/version mismatch, which the caller must treat
    /// as terminal for the connection. The reserved word is ignored and
    /// unknown flag bits are kept as-is.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, HeaderError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(HeaderError::BadMagic(magic));
        }
        if buf[4] != VERSION {
            return Err(HeaderError::BadVersion(buf[4]));
        }
        Ok(Self {
            frame_type: buf[5],
            flags: FrameFlags::from_bits_retain(u16::from_be_bytes([buf[6], buf[7]])),
            stream_id: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            method_id: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
            length: u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }
}
