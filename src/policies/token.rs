//! Sticky token decoding
//!
//! Tokens are read as little-endian base-64 numbers over a fixed alphabet so
//! that the same token always lands on the same worker index.

/// Symbol table; a symbol's weight is its position here
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+_/";

/// Positional base
const BASE: u64 = 64;

/// Session token extracted from a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StickyToken {
    /// Already numeric, used as-is
    Index(u64),
    /// Decoded with [`decode_token`]
    Text(String),
}

impl StickyToken {
    /// Integer key used for modulo selection
    pub fn value(&self) -> u64 {
        match self {
            StickyToken::Index(index) => *index,
            StickyToken::Text(text) => decode_token(text),
        }
    }
}

impl From<u64> for StickyToken {
    fn from(index: u64) -> Self {
        StickyToken::Index(index)
    }
}

impl From<&str> for StickyToken {
    fn from(text: &str) -> Self {
        StickyToken::Text(text.to_string())
    }
}

impl From<String> for StickyToken {
    fn from(text: String) -> Self {
        StickyToken::Text(text)
    }
}

/// Decode a token, least significant character first
///
/// Characters outside the alphabet weigh 0. Long tokens wrap around `u64`.
pub fn decode_token(token: &str) -> u64 {
    token
        .bytes()
        .rev()
        .fold(0u64, |acc, byte| {
            acc.wrapping_mul(BASE).wrapping_add(symbol_weight(byte))
        })
}

fn symbol_weight(byte: u8) -> u64 {
    ALPHABET
        .iter()
        .position(|&symbol| symbol == byte)
        .map_or(0, |position| position as u64)
}
