use bincode::{Decode, Encode};
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::base58::{self, Base58Error};
use crate::crypto::hash::{checksum, hash_pub_key, CHECKSUM_LEN};

pub mod wallets;

pub use wallets::Wallets;

/// Version prefix byte of mainnet addresses.
pub const ADDRESS_VERSION: u8 = 0x00;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error(transparent)]
    Base58(#[from] Base58Error),

    #[error("address checksum mismatch")]
    BadChecksum,

    #[error("address payload is too short")]
    MalformedAddress,

    #[error("corrupt key material: {0}")]
    Key(String),

    #[error("wallet file IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wallet file encoding error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("wallet file decoding error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// An ECDSA P-256 key pair. The public key is the raw X||Y concatenation of
/// the curve point coordinates, 32 bytes each.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct Wallet {
    private_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl Wallet {
    /// Draw a fresh random key pair
    pub fn new() -> Wallet {
        let signing_key = SigningKey::random(&mut OsRng);
        let point = signing_key.verifying_key().to_encoded_point(false);
        Wallet {
            private_key: signing_key.to_bytes().to_vec(),
            // Strip the SEC1 uncompressed-point tag, keeping raw X||Y
            public_key: point.as_bytes()[1..].to_vec(),
        }
    }

    pub fn signing_key(&self) -> Result<SigningKey, WalletError> {
        SigningKey::from_slice(&self.private_key).map_err(|e| WalletError::Key(e.to_string()))
    }

    /// Derive the base58 address:
    /// `Base58(version || RIPEMD160(SHA256(pub_key)) || checksum)`
    pub fn address(&self) -> String {
        let mut payload = vec![ADDRESS_VERSION];
        payload.extend(hash_pub_key(&self.public_key));
        let check = checksum(&payload);
        payload.extend(check);
        base58::encode(&payload)
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that an address decodes and its checksum matches the re-derived one.
pub fn validate_address(address: &str) -> Result<bool, Base58Error> {
    let payload = base58::decode(address)?;
    if payload.len() <= CHECKSUM_LEN + 1 {
        return Ok(false);
    }
    let (versioned, actual) = payload.split_at(payload.len() - CHECKSUM_LEN);
    Ok(checksum(versioned) == actual)
}

/// Extract the 20-byte public key hash from an address by stripping the
/// version prefix and checksum suffix.
pub fn address_to_pub_key_hash(address: &str) -> Result<Vec<u8>, WalletError> {
    let payload = base58::decode(address)?;
    if payload.len() <= CHECKSUM_LEN + 1 {
        return Err(WalletError::MalformedAddress);
    }
    Ok(payload[1..payload.len() - CHECKSUM_LEN].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_is_raw_point() {
        let wallet = Wallet::new();
        assert_eq!(wallet.public_key.len(), 64);
    }

    #[test]
    fn test_address_round_trip() {
        let wallet = Wallet::new();
        let address = wallet.address();
        assert!(validate_address(&address).unwrap());

        let hash = address_to_pub_key_hash(&address).unwrap();
        assert_eq!(hash, hash_pub_key(&wallet.public_key));
        assert_eq!(hash.len(), 20);
    }

    #[test]
    fn test_corrupted_address_fails_validation() {
        let wallet = Wallet::new();
        let address = wallet.address();

        for i in 0..address.len() {
            let mut bytes = address.clone().into_bytes();
            bytes[i] = if bytes[i] == b'2' { b'3' } else { b'2' };
            let corrupted = String::from_utf8(bytes).unwrap();
            if corrupted == address {
                continue;
            }
            assert!(!validate_address(&corrupted).unwrap_or(false), "byte {i}");
        }
    }

    #[test]
    fn test_signing_key_round_trip() {
        let wallet = Wallet::new();
        let restored = wallet.signing_key().unwrap();
        let point = restored.verifying_key().to_encoded_point(false);
        assert_eq!(point.as_bytes()[1..].to_vec(), wallet.public_key);
    }
}
