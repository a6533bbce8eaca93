//! A minimal UTXO blockchain node.
//!
//! Wallets hold ECDSA P-256 key pairs and spend outputs served by the
//! chainstate index; a miner assembles pending transactions into a block,
//! seals it with proof-of-work and appends it to the sled-backed chain.
//! Peers converge on the longest chain over a small TCP protocol.

/// Blocks, transactions, proof of work, chain storage and the UTXO index
pub mod core;

/// Base58, hashing and the Merkle tree
pub mod crypto;

/// The TCP sync protocol and its server
pub mod node;

/// Key pairs, addresses and the wallet file
pub mod wallet;
