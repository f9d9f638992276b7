//! Method identity.
//!
//! Method names hash to 64-bit identifiers with FNV-1a. The hash is part
//! of the wire contract: two endpoints agreeing on a name agree on the id.

/// FNV-1a 64-bit offset basis. The empty name hashes to this value.
pub const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime.
pub const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over raw bytes.
pub const fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        h ^= bytes[i] as u64;
        h = h.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    h
}

/// Method identifier for a name.
///
/// `const fn`, so ids can be baked in at compile time:
///
/// ```
/// const ECHO: u64 = weft_frame::method_id("Example.Echo");
/// assert_eq!(ECHO, weft_frame::method_id("Example.Echo"));
/// ```
pub const fn method_id(name: &str) -> u64 {
    fnv1a64(name.as_bytes())
}
