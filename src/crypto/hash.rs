use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Length of the address checksum suffix.
pub const CHECKSUM_LEN: usize = 4;

pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// RIPEMD-160 of SHA-256, the 20-byte key hash outputs are locked to.
pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    Ripemd160::digest(Sha256::digest(pub_key)).to_vec()
}

/// First four bytes of a double SHA-256, appended to versioned payloads
/// before base58 encoding.
pub fn checksum(payload: &[u8]) -> Vec<u8> {
    sha256(&sha256(payload))[..CHECKSUM_LEN].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_pub_key_is_twenty_bytes() {
        assert_eq!(hash_pub_key(b"some public key").len(), 20);
    }

    #[test]
    fn test_checksum_is_prefix_of_double_sha() {
        let payload = b"versioned payload";
        let full = sha256(&sha256(payload));
        assert_eq!(checksum(payload), full[..CHECKSUM_LEN].to_vec());
    }
}
