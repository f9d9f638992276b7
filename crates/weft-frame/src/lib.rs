#![deny(unsafe_code)]

//! Wire format for weft.
//!
//! Everything in this crate is pure: header serialization and parsing,
//! method-name hashing, and the error-body layout. No I/O happens here;
//! `weft-transport` moves the bytes.

mod error_body;
mod hash;
mod header;

pub use error_body::{decode_error_body, encode_error_body, WireError};
pub use hash::{fnv1a64, method_id, FNV_OFFSET, FNV_PRIME};
pub use header::{FrameFlags, FrameHeader, FrameType, HeaderError, HEADER_LEN, MAGIC, VERSION};

/// Well-known error code: no handler registered for the method id.
pub const CODE_UNKNOWN_METHOD: u32 = 404;
/// Well-known error code: request body failed to decrypt or parse.
pub const CODE_BAD_PAYLOAD: u32 = 400;
