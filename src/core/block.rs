use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::pow::{PowError, ProofOfWork};
use crate::core::transaction::Transaction;
use crate::crypto::merkle::MerkleTree;

#[derive(Error, Debug)]
pub enum BlockError {
    #[error(transparent)]
    Pow(#[from] PowError),

    #[error("block encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("block decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// A proof-of-work-sealed batch of transactions linked to its predecessor
/// by hash. The genesis block has an empty `prev_hash` and height zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Block {
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    pub prev_hash: Vec<u8>,
    pub hash: Vec<u8>,
    pub nonce: u64,
    pub height: u64,
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

impl Block {
    /// Assemble and seal a new block via proof-of-work.
    pub fn new(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        height: u64,
    ) -> Result<Block, BlockError> {
        let mut block = Block {
            timestamp: now_seconds(),
            transactions,
            prev_hash,
            hash: vec![],
            nonce: 0,
            height,
        };

        let (nonce, hash) = ProofOfWork::new(&block)?.run()?;
        block.nonce = nonce;
        block.hash = hash;
        Ok(block)
    }

    /// Seal the genesis block carrying a single coinbase transaction.
    pub fn genesis(coinbase: Transaction) -> Result<Block, BlockError> {
        Block::new(vec![coinbase], vec![], 0)
    }

    /// Merkle root over the serialized transactions
    pub fn hash_transactions(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        debug_assert!(
            !self.transactions.is_empty(),
            "a block always carries a coinbase"
        );
        let mut payloads = Vec::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            payloads.push(tx.serialize()?);
        }
        Ok(MerkleTree::build(&payloads).root_hash().to_vec())
    }

    pub fn serialize(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    pub fn deserialize(raw: &[u8]) -> Result<Block, bincode::error::DecodeError> {
        let (block, _) = bincode::decode_from_slice(raw, bincode::config::standard())?;
        Ok(block)
    }
}
