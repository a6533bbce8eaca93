/// Base58 codec for addresses
pub mod base58;

/// SHA-256 / RIPEMD-160 helpers
pub mod hash;

/// Merkle tree over transaction payloads
pub mod merkle;
