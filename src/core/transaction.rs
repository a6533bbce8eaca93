use std::collections::HashMap;
use std::fmt;

use bincode::{Decode, Encode};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::wallet::{Wallet, WalletError};

/// Value minted by every coinbase transaction.
pub const SUBSIDY: u64 = 10;

/// Output index carried by the synthetic coinbase input.
pub const COINBASE_OUT_INDEX: i64 = -1;

/// Input data of the very first coinbase transaction.
pub const GENESIS_COINBASE_DATA: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// SEC1 tag for an uncompressed curve point, prepended when rebuilding a
/// verifying key from the raw X||Y bytes.
const SEC1_UNCOMPRESSED_TAG: u8 = 0x04;

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("previous transaction {0} is not known")]
    MissingPrevTx(String),

    #[error("input {input} references output {out_index} which does not exist")]
    MissingPrevOutput { input: usize, out_index: i64 },

    #[error("not enough funds: have {available}, need {required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error(transparent)]
    Address(#[from] WalletError),

    #[error("transaction encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("transaction decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// A reference to a previous output, plus the material proving the spender
/// may consume it. Until signing, `pub_key` holds the spender's raw public
/// key; afterwards `signature` holds the 64-byte `r||s` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct TxInput {
    pub tx_id: Vec<u8>,
    pub out_index: i64,
    pub signature: Vec<u8>,
    pub pub_key: Vec<u8>,
}

/// A value locked to the hash of a recipient's public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct TxOutput {
    pub value: u64,
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, address: &str) -> Result<TxOutput, WalletError> {
        let mut output = TxOutput {
            value,
            pub_key_hash: vec![],
        };
        output.lock(address)?;
        Ok(output)
    }

    /// Lock the output to `address` by extracting its public key hash
    pub fn lock(&mut self, address: &str) -> Result<(), WalletError> {
        self.pub_key_hash = crate::wallet::address_to_pub_key_hash(address)?;
        Ok(())
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

/// The chainstate record for one transaction: its outputs by original index,
/// `None` where the output has been spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct TxOutputs {
    pub outputs: Vec<Option<TxOutput>>,
}

impl TxOutputs {
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    pub fn deserialize(raw: &[u8]) -> Result<TxOutputs, bincode::error::DecodeError> {
        let (outputs, _) = bincode::decode_from_slice(raw, bincode::config::standard())?;
        Ok(outputs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Transaction {
    pub id: Vec<u8>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Mint `SUBSIDY` to `to`. Empty `data` draws 20 random bytes for the
    /// input payload, hex-formatted.
    pub fn new_coinbase(to: &str, data: &str) -> Result<Transaction, TransactionError> {
        let data = if data.is_empty() {
            let mut random = [0u8; 20];
            rand::thread_rng().fill_bytes(&mut random);
            hex::encode(random)
        } else {
            data.to_string()
        };

        let input = TxInput {
            tx_id: vec![],
            out_index: COINBASE_OUT_INDEX,
            signature: vec![],
            pub_key: data.into_bytes(),
        };
        let output = TxOutput::new(SUBSIDY, to)?;

        let mut tx = Transaction {
            id: vec![],
            inputs: vec![input],
            outputs: vec![output],
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// A transaction is coinbase iff it has exactly one input with an empty
    /// `tx_id` and the sentinel output index.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].tx_id.is_empty()
            && self.inputs[0].out_index == COINBASE_OUT_INDEX
    }

    pub fn serialize(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    pub fn deserialize(raw: &[u8]) -> Result<Transaction, bincode::error::DecodeError> {
        let (tx, _) = bincode::decode_from_slice(raw, bincode::config::standard())?;
        Ok(tx)
    }

    /// SHA-256 of the serialization with the id field cleared
    pub fn hash(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        let mut copy = self.clone();
        copy.id = vec![];
        Ok(Sha256::digest(copy.serialize()?).to_vec())
    }

    /// Clone with every input's signature and public key cleared, the
    /// canonical pre-image for signing and verification
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                tx_id: input.tx_id.clone(),
                out_index: input.out_index,
                signature: vec![],
                pub_key: vec![],
            })
            .collect();
        let outputs = self.outputs.clone();

        Transaction {
            id: self.id.clone(),
            inputs,
            outputs,
        }
    }

    /// The signed message: hex of the serialized trimmed copy plus a
    /// trailing newline. Both are consensus bytes.
    fn signing_message(&self) -> Result<String, bincode::error::EncodeError> {
        Ok(format!("{}\n", hex::encode(self.serialize()?)))
    }

    fn check_prev_txs(
        &self,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<(), TransactionError> {
        for input in &self.inputs {
            let key = hex::encode(&input.tx_id);
            match prev_txs.get(&key) {
                Some(prev) if !prev.id.is_empty() => {}
                _ => return Err(TransactionError::MissingPrevTx(key)),
            }
        }
        Ok(())
    }

    fn referenced_output<'a>(
        prev_txs: &'a HashMap<String, Transaction>,
        index: usize,
        input: &TxInput,
    ) -> Result<&'a TxOutput, TransactionError> {
        let prev = prev_txs
            .get(&hex::encode(&input.tx_id))
            .ok_or_else(|| TransactionError::MissingPrevTx(hex::encode(&input.tx_id)))?;
        usize::try_from(input.out_index)
            .ok()
            .and_then(|i| prev.outputs.get(i))
            .ok_or(TransactionError::MissingPrevOutput {
                input: index,
                out_index: input.out_index,
            })
    }

    /// Sign every input against the outputs it references. `prev_txs` must
    /// contain the previous transaction of each input.
    pub fn sign(
        &mut self,
        signing_key: &SigningKey,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }
        self.check_prev_txs(prev_txs)?;

        let mut trimmed = self.trimmed_copy();
        for i in 0..self.inputs.len() {
            let referenced = Self::referenced_output(prev_txs, i, &self.inputs[i])?;
            trimmed.inputs[i].signature = vec![];
            trimmed.inputs[i].pub_key = referenced.pub_key_hash.clone();

            let message = trimmed.signing_message()?;
            let signature: Signature = signing_key.sign(message.as_bytes());
            self.inputs[i].signature = signature.to_bytes().to_vec();

            trimmed.inputs[i].pub_key = vec![];
        }
        Ok(())
    }

    /// Check every input's signature against the outputs it references.
    /// Coinbase transactions verify trivially; a single bad input fails the
    /// whole transaction.
    pub fn verify(
        &self,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<bool, TransactionError> {
        if self.is_coinbase() {
            return Ok(true);
        }
        self.check_prev_txs(prev_txs)?;

        let mut trimmed = self.trimmed_copy();
        for (i, input) in self.inputs.iter().enumerate() {
            let referenced = Self::referenced_output(prev_txs, i, input)?;
            trimmed.inputs[i].signature = vec![];
            trimmed.inputs[i].pub_key = referenced.pub_key_hash.clone();

            let message = trimmed.signing_message()?;

            let Ok(signature) = Signature::from_slice(&input.signature) else {
                return Ok(false);
            };
            let mut sec1 = Vec::with_capacity(1 + input.pub_key.len());
            sec1.push(SEC1_UNCOMPRESSED_TAG);
            sec1.extend_from_slice(&input.pub_key);
            let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(&sec1) else {
                return Ok(false);
            };
            if verifying_key
                .verify(message.as_bytes(), &signature)
                .is_err()
            {
                return Ok(false);
            }

            trimmed.inputs[i].pub_key = vec![];
        }
        Ok(true)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", hex::encode(&self.id))?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {i}:")?;
            writeln!(f, "       TXID:      {}", hex::encode(&input.tx_id))?;
            writeln!(f, "       Out:       {}", input.out_index)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.pub_key))?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {i}:")?;
            writeln!(f, "       Value:  {}", output.value)?;
            writeln!(f, "       Script: {}", hex::encode(&output.pub_key_hash))?;
        }
        Ok(())
    }
}

/// Build a transfer of `amount` from `wallet` to the `to` address, spending
/// outputs served by the UTXO index and returning change to the sender.
pub fn new_utxo_transaction(
    wallet: &Wallet,
    to: &str,
    amount: u64,
    utxo_set: &crate::core::utxo::UtxoSet<'_>,
) -> Result<Transaction, crate::core::blockchain::BlockchainError> {
    let pub_key_hash = crate::crypto::hash::hash_pub_key(&wallet.public_key);
    let (accumulated, spendable) = utxo_set.find_spendable_outputs(&pub_key_hash, amount)?;

    if accumulated < amount {
        return Err(TransactionError::InsufficientFunds {
            available: accumulated,
            required: amount,
        }
        .into());
    }

    let mut inputs = vec![];
    for (tx_id_hex, out_indices) in &spendable {
        let tx_id = hex::decode(tx_id_hex)
            .map_err(crate::core::blockchain::BlockchainError::MalformedKey)?;
        for &out_index in out_indices {
            inputs.push(TxInput {
                tx_id: tx_id.clone(),
                out_index,
                signature: vec![],
                pub_key: wallet.public_key.clone(),
            });
        }
    }

    let mut outputs = vec![TxOutput::new(amount, to).map_err(TransactionError::Address)?];
    if accumulated > amount {
        let change = TxOutput::new(accumulated - amount, &wallet.address())
            .map_err(TransactionError::Address)?;
        outputs.push(change);
    }

    let mut tx = Transaction {
        id: vec![],
        inputs,
        outputs,
    };
    tx.id = tx.hash().map_err(TransactionError::Encode)?;

    let signing_key = wallet
        .signing_key()
        .map_err(TransactionError::Address)?;
    utxo_set.chain().sign_transaction(&mut tx, &signing_key)?;

    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase_to_hash(pub_key_hash: Vec<u8>) -> Transaction {
        let mut tx = Transaction {
            id: vec![],
            inputs: vec![TxInput {
                tx_id: vec![],
                out_index: COINBASE_OUT_INDEX,
                signature: vec![],
                pub_key: b"test data".to_vec(),
            }],
            outputs: vec![TxOutput {
                value: SUBSIDY,
                pub_key_hash,
            }],
        };
        tx.id = tx.hash().unwrap();
        tx
    }

    fn spend(wallet: &Wallet, prev: &Transaction, to_hash: Vec<u8>) -> Transaction {
        let mut tx = Transaction {
            id: vec![],
            inputs: vec![TxInput {
                tx_id: prev.id.clone(),
                out_index: 0,
                signature: vec![],
                pub_key: wallet.public_key.clone(),
            }],
            outputs: vec![TxOutput {
                value: SUBSIDY,
                pub_key_hash: to_hash,
            }],
        };
        tx.id = tx.hash().unwrap();
        tx
    }

    fn prev_map(prev: &Transaction) -> HashMap<String, Transaction> {
        let mut map = HashMap::new();
        map.insert(hex::encode(&prev.id), prev.clone());
        map
    }

    #[test]
    fn test_coinbase_detection() {
        let hash = vec![1u8; 20];
        let tx = coinbase_to_hash(hash.clone());
        assert!(tx.is_coinbase());

        let mut two_inputs = tx.clone();
        two_inputs.inputs.push(two_inputs.inputs[0].clone());
        assert!(!two_inputs.is_coinbase());

        let mut non_empty_id = tx.clone();
        non_empty_id.inputs[0].tx_id = vec![9];
        assert!(!non_empty_id.is_coinbase());

        let mut wrong_index = tx;
        wrong_index.inputs[0].out_index = 0;
        assert!(!wrong_index.is_coinbase());
    }

    #[test]
    fn test_serialization_round_trip() {
        let tx = coinbase_to_hash(vec![7u8; 20]);
        let raw = tx.serialize().unwrap();
        assert_eq!(Transaction::deserialize(&raw).unwrap(), tx);
    }

    #[test]
    fn test_outputs_record_round_trip() {
        let record = TxOutputs {
            outputs: vec![
                None,
                Some(TxOutput {
                    value: 6,
                    pub_key_hash: vec![4u8; 20],
                }),
            ],
        };
        let raw = record.serialize().unwrap();
        assert_eq!(TxOutputs::deserialize(&raw).unwrap(), record);
    }

    #[test]
    fn test_hash_ignores_id_field() {
        let tx = coinbase_to_hash(vec![3u8; 20]);
        let mut mutated = tx.clone();
        mutated.id = vec![0xde, 0xad];
        assert_eq!(tx.hash().unwrap(), mutated.hash().unwrap());
    }

    #[test]
    fn test_trimmed_copy_clears_input_material() {
        let wallet = Wallet::new();
        let prev = coinbase_to_hash(crate::crypto::hash::hash_pub_key(&wallet.public_key));
        let mut tx = spend(&wallet, &prev, vec![2u8; 20]);
        tx.sign(&wallet.signing_key().unwrap(), &prev_map(&prev))
            .unwrap();

        let trimmed = tx.trimmed_copy();
        assert!(trimmed.inputs[0].signature.is_empty());
        assert!(trimmed.inputs[0].pub_key.is_empty());
        assert_eq!(trimmed.id, tx.id);
    }

    #[test]
    fn test_sign_then_verify() {
        let wallet = Wallet::new();
        let prev = coinbase_to_hash(crate::crypto::hash::hash_pub_key(&wallet.public_key));
        let prev_txs = prev_map(&prev);

        let mut tx = spend(&wallet, &prev, vec![2u8; 20]);
        tx.sign(&wallet.signing_key().unwrap(), &prev_txs).unwrap();

        assert_eq!(tx.inputs[0].signature.len(), 64);
        assert!(tx.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_tampered_signature_fails_verification() {
        let wallet = Wallet::new();
        let prev = coinbase_to_hash(crate::crypto::hash::hash_pub_key(&wallet.public_key));
        let prev_txs = prev_map(&prev);

        let mut tx = spend(&wallet, &prev, vec![2u8; 20]);
        tx.sign(&wallet.signing_key().unwrap(), &prev_txs).unwrap();

        for i in 0..tx.inputs[0].signature.len() {
            let mut tampered = tx.clone();
            tampered.inputs[0].signature[i] ^= 0x01;
            assert!(!tampered.verify(&prev_txs).unwrap(), "byte {i}");
        }
    }

    #[test]
    fn test_swapped_referenced_output_fails_verification() {
        let wallet = Wallet::new();
        let my_hash = crate::crypto::hash::hash_pub_key(&wallet.public_key);

        let mut prev = coinbase_to_hash(my_hash.clone());
        prev.outputs.push(TxOutput {
            value: 5,
            pub_key_hash: vec![9u8; 20],
        });
        prev.id = prev.hash().unwrap();
        let prev_txs = prev_map(&prev);

        let mut tx = spend(&wallet, &prev, vec![2u8; 20]);
        tx.sign(&wallet.signing_key().unwrap(), &prev_txs).unwrap();
        assert!(tx.verify(&prev_txs).unwrap());

        let mut swapped = tx.clone();
        swapped.inputs[0].out_index = 1;
        assert!(!swapped.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_verify_with_missing_prev_tx_is_an_error() {
        let wallet = Wallet::new();
        let prev = coinbase_to_hash(crate::crypto::hash::hash_pub_key(&wallet.public_key));
        let tx = spend(&wallet, &prev, vec![2u8; 20]);

        let err = tx.verify(&HashMap::new()).unwrap_err();
        assert!(matches!(err, TransactionError::MissingPrevTx(_)));
    }

    #[test]
    fn test_coinbase_verifies_without_prev_txs() {
        let tx = coinbase_to_hash(vec![1u8; 20]);
        assert!(tx.verify(&HashMap::new()).unwrap());
    }
}
