use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::block::Block;

/// Fixed network difficulty: a sealed hash must be below `1 << (256 - 24)`.
pub const TARGET_BITS: u32 = 24;

const HASH_BITS: u32 = 256;

#[derive(Error, Debug)]
pub enum PowError {
    #[error("nonce space exhausted without finding a valid hash")]
    MiningExhausted,

    #[error("block encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}

/// Nonce search over a block's header fields
pub struct ProofOfWork<'a> {
    block: &'a Block,
    merkle_root: Vec<u8>,
    target: BigUint,
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block) -> Result<ProofOfWork<'a>, PowError> {
        let target = BigUint::from(1u32) << (HASH_BITS - TARGET_BITS);
        let merkle_root = block.hash_transactions()?;
        Ok(ProofOfWork {
            block,
            merkle_root,
            target,
        })
    }

    /// The per-attempt digest input: prev_hash, merkle root, then the
    /// timestamp, target bits and nonce as big-endian 8-byte integers.
    fn prepare_data(&self, nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            self.block.prev_hash.len() + self.merkle_root.len() + 3 * 8,
        );
        data.extend_from_slice(&self.block.prev_hash);
        data.extend_from_slice(&self.merkle_root);
        data.extend_from_slice(&self.block.timestamp.to_be_bytes());
        data.extend_from_slice(&u64::from(TARGET_BITS).to_be_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        data
    }

    /// Search nonces from zero until the digest drops below the target.
    pub fn run(&self) -> Result<(u64, Vec<u8>), PowError> {
        let mut nonce: u64 = 0;
        loop {
            let digest = Sha256::digest(self.prepare_data(nonce));
            if BigUint::from_bytes_be(&digest) < self.target {
                return Ok((nonce, digest.to_vec()));
            }
            nonce = nonce.checked_add(1).ok_or(PowError::MiningExhausted)?;
        }
    }

    /// Recompute the digest with the block's recorded nonce and re-check the
    /// target inequality.
    pub fn validate(&self) -> bool {
        let digest = Sha256::digest(self.prepare_data(self.block.nonce));
        BigUint::from_bytes_be(&digest) < self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::Transaction;

    #[test]
    fn test_sealed_block_satisfies_target() {
        let coinbase = Transaction::new_coinbase(
            "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
            "pow test",
        )
        .unwrap();
        let block = Block::new(vec![coinbase], vec![], 0).unwrap();

        let pow = ProofOfWork::new(&block).unwrap();
        assert!(pow.validate());

        let digest = Sha256::digest(pow.prepare_data(block.nonce));
        let target = BigUint::from(1u32) << (HASH_BITS - TARGET_BITS);
        assert!(BigUint::from_bytes_be(&digest) < target);
        assert_eq!(block.hash, digest.to_vec());

        // A neighboring nonce must not (except with ~2^-24 probability)
        // satisfy the same target.
        let neighbor = Sha256::digest(pow.prepare_data(block.nonce.wrapping_add(1)));
        assert!(BigUint::from_bytes_be(&neighbor) >= target);
    }
}
