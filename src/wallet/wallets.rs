use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::debug;

use crate::wallet::{Wallet, WalletError};

/// A collection of wallets persisted per node id.
#[derive(Debug, Default)]
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
}

fn wallet_file(node_id: &str) -> String {
    format!("wallet_{node_id}.dat")
}

impl Wallets {
    /// Load the wallet file for `node_id`, or start empty when none exists.
    pub fn load(node_id: &str) -> Result<Wallets, WalletError> {
        let path = wallet_file(node_id);
        if !Path::new(&path).exists() {
            debug!("no wallet file at {path}, starting empty");
            return Ok(Wallets::default());
        }

        let raw = fs::read(&path)?;
        let (wallets, _) = bincode::decode_from_slice(&raw, bincode::config::standard())?;
        Ok(Wallets { wallets })
    }

    pub fn save(&self, node_id: &str) -> Result<(), WalletError> {
        let raw = bincode::encode_to_vec(&self.wallets, bincode::config::standard())?;
        fs::write(wallet_file(node_id), raw)?;
        Ok(())
    }

    /// Add a freshly drawn wallet and return its address.
    pub fn create_wallet(&mut self) -> String {
        let wallet = Wallet::new();
        let address = wallet.address();
        self.wallets.insert(address.clone(), wallet);
        address
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.wallets.keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_round_trip() {
        let node_id = format!("wallets-test-{}", std::process::id());

        let mut wallets = Wallets::default();
        let a = wallets.create_wallet();
        let b = wallets.create_wallet();
        wallets.save(&node_id).unwrap();

        let reloaded = Wallets::load(&node_id).unwrap();
        fs::remove_file(wallet_file(&node_id)).unwrap();

        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(reloaded.addresses(), expected);
        assert_eq!(
            reloaded.get_wallet(&a).unwrap().public_key,
            wallets.get_wallet(&a).unwrap().public_key
        );
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let loaded = Wallets::load("no-such-node").unwrap();
        assert!(loaded.addresses().is_empty());
    }
}
