use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use log::info;
use p256::ecdsa::SigningKey;
use sled::transaction::ConflictableTransactionError;
use thiserror::Error;

use crate::core::block::{Block, BlockError};
use crate::core::transaction::{Transaction, TransactionError, TxOutput, TxOutputs};

/// Name of the tree holding `block hash -> serialized block`, plus the tip
/// pointer under [`TIP_KEY`].
const BLOCKS_TREE: &str = "blocks";

/// Key of the current tip hash inside the blocks tree.
const TIP_KEY: &[u8] = b"l";

fn db_file(node_id: &str) -> String {
    format!("blockchain_{node_id}.db")
}

#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("blockchain already exists at {0}")]
    AlreadyExists(String),

    #[error("no blockchain found at {0}, create one first")]
    NoChain(String),

    #[error("block {0} is not in the store")]
    BlockNotFound(String),

    #[error("transaction {0} is not found")]
    TransactionNotFound(String),

    #[error("the tip pointer is missing from the store")]
    MissingTip,

    #[error("invalid transaction {0} in block candidate")]
    InvalidTransaction(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error("malformed chainstate key: {0}")]
    MalformedKey(#[from] hex::FromHexError),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decoding error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl From<sled::transaction::TransactionError<BlockchainError>> for BlockchainError {
    fn from(err: sled::transaction::TransactionError<BlockchainError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => BlockchainError::Storage(e),
        }
    }
}

/// The durable chain: a sled database with a `blocks` tree and a tip
/// pointer. All mutations serialize through sled write transactions.
pub struct Blockchain {
    db: sled::Db,
    blocks: sled::Tree,
    tip: RwLock<Vec<u8>>,
}

impl Blockchain {
    /// Create the per-node database, mint the genesis coinbase to `address`
    /// and commit the sealed genesis block together with the tip pointer.
    pub fn create(address: &str, node_id: &str) -> Result<Blockchain, BlockchainError> {
        Self::create_at(&db_file(node_id), address)
    }

    /// Open the per-node database and load the tip pointer.
    pub fn open(node_id: &str) -> Result<Blockchain, BlockchainError> {
        Self::open_at(&db_file(node_id))
    }

    pub fn create_at(path: &str, address: &str) -> Result<Blockchain, BlockchainError> {
        if Path::new(path).exists() {
            return Err(BlockchainError::AlreadyExists(path.to_string()));
        }

        let coinbase = Transaction::new_coinbase(
            address,
            crate::core::transaction::GENESIS_COINBASE_DATA,
        )?;
        // Sealing happens before the database is touched
        let genesis = Block::genesis(coinbase)?;
        let raw = genesis.serialize()?;

        let db = sled::open(path)?;
        let blocks = db.open_tree(BLOCKS_TREE)?;
        blocks
            .transaction(|btx| {
                btx.insert(genesis.hash.as_slice(), raw.as_slice())?;
                btx.insert(TIP_KEY, genesis.hash.as_slice())?;
                Ok::<(), ConflictableTransactionError<BlockchainError>>(())
            })
            .map_err(BlockchainError::from)?;
        blocks.flush()?;

        info!("created blockchain at {path}, genesis {}", hex::encode(&genesis.hash));
        Ok(Blockchain {
            db,
            blocks,
            tip: RwLock::new(genesis.hash),
        })
    }

    pub fn open_at(path: &str) -> Result<Blockchain, BlockchainError> {
        if !Path::new(path).exists() {
            return Err(BlockchainError::NoChain(path.to_string()));
        }

        let db = sled::open(path)?;
        let blocks = db.open_tree(BLOCKS_TREE)?;
        let tip = blocks
            .get(TIP_KEY)?
            .ok_or(BlockchainError::MissingTip)?
            .to_vec();

        Ok(Blockchain {
            db,
            blocks,
            tip: RwLock::new(tip),
        })
    }

    pub(crate) fn db(&self) -> &sled::Db {
        &self.db
    }

    pub fn tip_hash(&self) -> Vec<u8> {
        self.tip.read().expect("tip lock poisoned").clone()
    }

    /// Store an externally produced block. Idempotent: a block whose hash is
    /// already present is left untouched. The tip advances only when the new
    /// block is higher than the current tip block.
    pub fn add_block(&self, block: &Block) -> Result<(), BlockchainError> {
        let raw = block.serialize()?;

        let new_tip = self
            .blocks
            .transaction(|btx| {
                if btx.get(block.hash.as_slice())?.is_some() {
                    return Ok(None);
                }
                btx.insert(block.hash.as_slice(), raw.as_slice())?;

                let tip_hash = btx
                    .get(TIP_KEY)?
                    .ok_or(ConflictableTransactionError::Abort(
                        BlockchainError::MissingTip,
                    ))?;
                let tip_raw = btx.get(&tip_hash)?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(BlockchainError::BlockNotFound(
                        hex::encode(&tip_hash),
                    ))
                })?;
                let tip_block = Block::deserialize(&tip_raw).map_err(|e| {
                    ConflictableTransactionError::Abort(BlockchainError::Decode(e))
                })?;

                if block.height > tip_block.height {
                    btx.insert(TIP_KEY, block.hash.as_slice())?;
                    Ok(Some(block.hash.clone()))
                } else {
                    Ok(None)
                }
            })
            .map_err(BlockchainError::from)?;
        self.blocks.flush()?;

        if let Some(tip) = new_tip {
            *self.tip.write().expect("tip lock poisoned") = tip;
            info!(
                "block {} accepted as new tip at height {}",
                hex::encode(&block.hash),
                block.height
            );
        }
        Ok(())
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Block, BlockchainError> {
        let raw = self
            .blocks
            .get(hash)?
            .ok_or_else(|| BlockchainError::BlockNotFound(hex::encode(hash)))?;
        Ok(Block::deserialize(&raw)?)
    }

    /// All block hashes, tip first, walking back to the genesis.
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>, BlockchainError> {
        let mut hashes = vec![];
        for block in self.iterator() {
            hashes.push(block?.hash);
        }
        Ok(hashes)
    }

    pub fn get_best_height(&self) -> Result<u64, BlockchainError> {
        Ok(self.get_block(&self.tip_hash())?.height)
    }

    /// Verify every transaction, seal a block on top of the current tip and
    /// commit it as the new tip. Proof-of-work runs outside any write
    /// transaction.
    pub fn mine_block(
        &self,
        transactions: Vec<Transaction>,
    ) -> Result<Block, BlockchainError> {
        for tx in &transactions {
            let valid = match self.verify_transaction(tx) {
                Ok(valid) => valid,
                Err(BlockchainError::TransactionNotFound(_)) => false,
                Err(e) => return Err(e),
            };
            if !valid {
                return Err(BlockchainError::InvalidTransaction(hex::encode(&tx.id)));
            }
        }

        let tip_hash = self.tip_hash();
        let height = self.get_block(&tip_hash)?.height + 1;
        let block = Block::new(transactions, tip_hash, height)?;
        let raw = block.serialize()?;

        self.blocks
            .transaction(|btx| {
                btx.insert(block.hash.as_slice(), raw.as_slice())?;
                btx.insert(TIP_KEY, block.hash.as_slice())?;
                Ok::<(), ConflictableTransactionError<BlockchainError>>(())
            })
            .map_err(BlockchainError::from)?;
        self.blocks.flush()?;

        *self.tip.write().expect("tip lock poisoned") = block.hash.clone();
        info!(
            "mined block {} at height {}",
            hex::encode(&block.hash),
            block.height
        );
        Ok(block)
    }

    /// Walk back from the tip until a transaction with `id` is found.
    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction, BlockchainError> {
        for block in self.iterator() {
            for tx in block?.transactions {
                if tx.id == id {
                    return Ok(tx);
                }
            }
        }
        Err(BlockchainError::TransactionNotFound(hex::encode(id)))
    }

    /// Scan the full chain and collect, per transaction, the outputs not
    /// referenced by any later input.
    pub fn find_utxo(&self) -> Result<HashMap<String, TxOutputs>, BlockchainError> {
        let mut utxo: HashMap<String, TxOutputs> = HashMap::new();
        let mut spent: HashMap<String, Vec<i64>> = HashMap::new();

        for block in self.iterator() {
            for tx in &block?.transactions {
                let tx_id = hex::encode(&tx.id);

                let mut outputs: Vec<Option<TxOutput>> = vec![None; tx.outputs.len()];
                let mut any_unspent = false;
                for (index, output) in tx.outputs.iter().enumerate() {
                    let is_spent = spent
                        .get(&tx_id)
                        .is_some_and(|s| s.contains(&(index as i64)));
                    if !is_spent {
                        outputs[index] = Some(output.clone());
                        any_unspent = true;
                    }
                }
                if any_unspent {
                    utxo.insert(tx_id, TxOutputs { outputs });
                }

                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        spent
                            .entry(hex::encode(&input.tx_id))
                            .or_default()
                            .push(input.out_index);
                    }
                }
            }
        }
        Ok(utxo)
    }

    /// Resolve each input's previous transaction and sign.
    pub fn sign_transaction(
        &self,
        tx: &mut Transaction,
        signing_key: &SigningKey,
    ) -> Result<(), BlockchainError> {
        let prev_txs = self.previous_transactions(tx)?;
        tx.sign(signing_key, &prev_txs)?;
        Ok(())
    }

    /// Resolve each input's previous transaction and verify.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, BlockchainError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.previous_transactions(tx)?;
        Ok(tx.verify(&prev_txs)?)
    }

    fn previous_transactions(
        &self,
        tx: &Transaction,
    ) -> Result<HashMap<String, Transaction>, BlockchainError> {
        let mut prev_txs = HashMap::new();
        for input in &tx.inputs {
            let prev = self.find_transaction(&input.tx_id)?;
            prev_txs.insert(hex::encode(&prev.id), prev);
        }
        Ok(prev_txs)
    }

    /// Cursor over the chain from the tip backwards.
    pub fn iterator(&self) -> ChainIterator<'_> {
        ChainIterator {
            current_hash: self.tip_hash(),
            blocks: &self.blocks,
        }
    }
}

/// Walks the chain backwards via `prev_hash`, ending after the genesis
/// block (whose `prev_hash` is empty).
pub struct ChainIterator<'a> {
    current_hash: Vec<u8>,
    blocks: &'a sled::Tree,
}

impl Iterator for ChainIterator<'_> {
    type Item = Result<Block, BlockchainError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_empty() {
            return None;
        }

        let raw = match self.blocks.get(&self.current_hash) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                let missing = hex::encode(&self.current_hash);
                self.current_hash.clear();
                return Some(Err(BlockchainError::BlockNotFound(missing)));
            }
            Err(e) => {
                self.current_hash.clear();
                return Some(Err(e.into()));
            }
        };

        match Block::deserialize(&raw) {
            Ok(block) => {
                self.current_hash = block.prev_hash.clone();
                Some(Ok(block))
            }
            Err(e) => {
                self.current_hash.clear();
                Some(Err(e.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    const ADDRESS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";

    fn chain_in(dir: &TempDir) -> Blockchain {
        let path = dir.path().join("chain.db");
        Blockchain::create_at(path.to_str().unwrap(), ADDRESS).unwrap()
    }

    fn unmined_block(prev_hash: Vec<u8>, height: u64, tag: u8) -> Block {
        Block {
            timestamp: 1,
            transactions: vec![],
            prev_hash,
            hash: vec![tag; 32],
            nonce: 0,
            height,
        }
    }

    #[test]
    fn test_create_commits_genesis_as_tip() {
        let dir = TempDir::new("chain").unwrap();
        let chain = chain_in(&dir);

        assert_eq!(chain.get_best_height().unwrap(), 0);
        let genesis = chain.get_block(&chain.tip_hash()).unwrap();
        assert!(genesis.prev_hash.is_empty());
        assert!(genesis.transactions[0].is_coinbase());
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new("chain").unwrap();
        let path = dir.path().join("chain.db");
        let path = path.to_str().unwrap();

        let _chain = Blockchain::create_at(path, ADDRESS).unwrap();
        assert!(matches!(
            Blockchain::create_at(path, ADDRESS),
            Err(BlockchainError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_open_missing_chain_fails() {
        assert!(matches!(
            Blockchain::open_at("/nonexistent/chain.db"),
            Err(BlockchainError::NoChain(_))
        ));
    }

    #[test]
    fn test_add_block_advances_tip_only_upward() {
        let dir = TempDir::new("chain").unwrap();
        let chain = chain_in(&dir);
        let genesis_hash = chain.tip_hash();

        let higher = unmined_block(genesis_hash.clone(), 1, 0xaa);
        chain.add_block(&higher).unwrap();
        assert_eq!(chain.tip_hash(), higher.hash);

        // A sibling at the same height does not move the tip
        let sibling = unmined_block(genesis_hash, 1, 0xbb);
        chain.add_block(&sibling).unwrap();
        assert_eq!(chain.tip_hash(), higher.hash);
        assert!(chain.get_block(&sibling.hash).is_ok());
    }

    #[test]
    fn test_add_block_is_idempotent() {
        let dir = TempDir::new("chain").unwrap();
        let chain = chain_in(&dir);

        let block = unmined_block(chain.tip_hash(), 1, 0xcc);
        chain.add_block(&block).unwrap();
        let tip_after_first = chain.tip_hash();
        let hashes_after_first = chain.get_block_hashes().unwrap();

        chain.add_block(&block).unwrap();
        assert_eq!(chain.tip_hash(), tip_after_first);
        assert_eq!(chain.get_block_hashes().unwrap(), hashes_after_first);
    }

    #[test]
    fn test_find_transaction_and_utxo_on_genesis() {
        let dir = TempDir::new("chain").unwrap();
        let chain = chain_in(&dir);

        let genesis = chain.get_block(&chain.tip_hash()).unwrap();
        let coinbase = &genesis.transactions[0];

        let found = chain.find_transaction(&coinbase.id).unwrap();
        assert_eq!(&found, coinbase);
        assert!(matches!(
            chain.find_transaction(&[0u8; 32]),
            Err(BlockchainError::TransactionNotFound(_))
        ));

        let utxo = chain.find_utxo().unwrap();
        assert_eq!(utxo.len(), 1);
        let outputs = &utxo[&hex::encode(&coinbase.id)];
        assert_eq!(outputs.outputs.len(), 1);
        assert_eq!(outputs.outputs[0].as_ref().unwrap().value, 10);
    }

    #[test]
    fn test_iterator_walks_tip_to_genesis() {
        let dir = TempDir::new("chain").unwrap();
        let chain = chain_in(&dir);
        let genesis_hash = chain.tip_hash();

        let b1 = unmined_block(genesis_hash.clone(), 1, 0x01);
        let b2 = unmined_block(b1.hash.clone(), 2, 0x02);
        chain.add_block(&b1).unwrap();
        chain.add_block(&b2).unwrap();

        let heights: Vec<u64> = chain
            .iterator()
            .map(|b| b.unwrap().height)
            .collect();
        assert_eq!(heights, vec![2, 1, 0]);
        assert_eq!(
            chain.get_block_hashes().unwrap(),
            vec![b2.hash, b1.hash, genesis_hash]
        );
    }
}
