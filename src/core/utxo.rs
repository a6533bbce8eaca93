use std::collections::HashMap;

use log::info;

use crate::core::block::Block;
use crate::core::blockchain::{Blockchain, BlockchainError};
use crate::core::transaction::{TxOutput, TxOutputs};

/// Name of the tree mapping `tx id -> serialized unspent outputs`.
const UTXO_TREE: &str = "chainstate";

/// The chainstate index: for every transaction with unspent outputs, the
/// outputs still spendable, keyed by raw transaction id. Derived state,
/// rebuildable from the chain at any time.
pub struct UtxoSet<'a> {
    chain: &'a Blockchain,
    tree: sled::Tree,
}

impl<'a> UtxoSet<'a> {
    pub fn new(chain: &'a Blockchain) -> Result<UtxoSet<'a>, BlockchainError> {
        let tree = chain.db().open_tree(UTXO_TREE)?;
        Ok(UtxoSet { chain, tree })
    }

    pub fn chain(&self) -> &Blockchain {
        self.chain
    }

    /// Drop and rebuild the index from a full chain scan. Idempotent.
    pub fn reindex(&mut self) -> Result<(), BlockchainError> {
        // drop_tree tolerates an absent tree
        self.chain.db().drop_tree(UTXO_TREE)?;
        self.tree = self.chain.db().open_tree(UTXO_TREE)?;

        let utxo = self.chain.find_utxo()?;
        let mut batch = sled::Batch::default();
        for (tx_id_hex, outputs) in &utxo {
            batch.insert(hex::decode(tx_id_hex)?, outputs.serialize()?);
        }
        self.tree.apply_batch(batch)?;
        self.tree.flush()?;

        info!("chainstate reindexed, {} transactions", utxo.len());
        Ok(())
    }

    /// Collect outputs locked to `pub_key_hash` until `amount` is covered.
    /// Returns the accumulated value and the selected output indices per
    /// transaction; callers detect insufficient funds by comparing the
    /// accumulated value against `amount`.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<String, Vec<i64>>), BlockchainError> {
        let mut unspent: HashMap<String, Vec<i64>> = HashMap::new();
        let mut accumulated = 0u64;

        for item in self.tree.iter() {
            let (key, value) = item?;
            let outputs = TxOutputs::deserialize(&value)?;

            for (index, output) in outputs.outputs.iter().enumerate() {
                let Some(output) = output else { continue };
                if output.is_locked_with_key(pub_key_hash) && accumulated < amount {
                    accumulated += output.value;
                    unspent
                        .entry(hex::encode(&key))
                        .or_default()
                        .push(index as i64);
                }
            }
        }

        Ok((accumulated, unspent))
    }

    /// All unspent outputs locked to `pub_key_hash` (balance queries).
    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>, BlockchainError> {
        let mut found = vec![];
        for item in self.tree.iter() {
            let (_, value) = item?;
            let outputs = TxOutputs::deserialize(&value)?;
            for output in outputs.outputs.into_iter().flatten() {
                if output.is_locked_with_key(pub_key_hash) {
                    found.push(output);
                }
            }
        }
        Ok(found)
    }

    /// Number of transactions with at least one unspent output.
    pub fn count_transactions(&self) -> usize {
        self.tree.len()
    }

    /// Fold an accepted block into the index: spent outputs slot to `None`
    /// (entries fully spent are removed) and the block's new outputs are
    /// inserted, all in one atomic batch.
    pub fn update(&self, block: &Block) -> Result<(), BlockchainError> {
        let mut touched: HashMap<Vec<u8>, TxOutputs> = HashMap::new();
        let mut batch = sled::Batch::default();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let entry = match touched.entry(input.tx_id.clone()) {
                        std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                        std::collections::hash_map::Entry::Vacant(v) => {
                            let Some(raw) = self.tree.get(&input.tx_id)? else {
                                continue;
                            };
                            v.insert(TxOutputs::deserialize(&raw)?)
                        }
                    };
                    if let Ok(index) = usize::try_from(input.out_index) {
                        if let Some(slot) = entry.outputs.get_mut(index) {
                            *slot = None;
                        }
                    }
                }
            }

            let fresh = TxOutputs {
                outputs: tx.outputs.iter().cloned().map(Some).collect(),
            };
            batch.insert(tx.id.as_slice(), fresh.serialize()?);
        }

        for (tx_id, outputs) in touched {
            if outputs.outputs.iter().all(Option::is_none) {
                batch.remove(tx_id);
            } else {
                batch.insert(tx_id, outputs.serialize()?);
            }
        }

        self.tree.apply_batch(batch)?;
        self.tree.flush()?;
        Ok(())
    }
}
