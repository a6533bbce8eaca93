use sha2::{Digest, Sha256};

/// A node in the Merkle tree of transaction payloads
#[derive(Debug, Clone)]
pub struct MerkleNode {
    pub hash: [u8; 32],
    pub left: Option<Box<MerkleNode>>,
    pub right: Option<Box<MerkleNode>>,
}

/// A Merkle tree summarizing a sequence of byte strings into one root
#[derive(Debug, Clone)]
pub struct MerkleTree {
    pub root: MerkleNode,
}

impl MerkleTree {
    /// Build a Merkle tree. Leaves are SHA-256 of each item; a level with an
    /// odd node count duplicates its last node before pairing.
    pub fn build(items: &[Vec<u8>]) -> MerkleTree {
        let mut nodes: Vec<MerkleNode> = items
            .iter()
            .map(|item| MerkleNode {
                hash: Sha256::digest(item).into(),
                left: None,
                right: None,
            })
            .collect();

        if nodes.is_empty() {
            return MerkleTree {
                root: MerkleNode {
                    hash: [0u8; 32],
                    left: None,
                    right: None,
                },
            };
        }

        // Always at least one reduction: a lone leaf is an odd-count level
        // and pairs with its own duplicate.
        loop {
            let mut next_level = vec![];
            for i in (0..nodes.len()).step_by(2) {
                let left = nodes[i].clone();
                let right = if i + 1 < nodes.len() {
                    nodes[i + 1].clone()
                } else {
                    left.clone()
                };

                let mut hasher = Sha256::new();
                hasher.update(left.hash);
                hasher.update(right.hash);
                let parent_hash: [u8; 32] = hasher.finalize().into();

                next_level.push(MerkleNode {
                    hash: parent_hash,
                    left: Some(Box::new(left)),
                    right: Some(Box::new(right)),
                });
            }
            nodes = next_level;
            if nodes.len() == 1 {
                break;
            }
        }

        Self {
            root: nodes[0].clone(),
        }
    }

    /// Get the Merkle root hash
    pub fn root_hash(&self) -> [u8; 32] {
        self.root.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().map(|&b| vec![b; 8]).collect()
    }

    #[test]
    fn test_single_item_is_combined_with_its_duplicate() {
        let tree = MerkleTree::build(&items(&[7]));

        let leaf: [u8; 32] = Sha256::digest(vec![7u8; 8]).into();
        let mut hasher = Sha256::new();
        hasher.update(leaf);
        hasher.update(leaf);
        let expected: [u8; 32] = hasher.finalize().into();

        assert_eq!(tree.root_hash(), expected);
        assert_ne!(tree.root_hash(), leaf);
    }

    #[test]
    fn test_deterministic_and_order_sensitive() {
        let a = MerkleTree::build(&items(&[1, 2, 3, 4]));
        let b = MerkleTree::build(&items(&[1, 2, 3, 4]));
        let c = MerkleTree::build(&items(&[2, 1, 3, 4]));

        assert_eq!(a.root_hash(), b.root_hash());
        assert_ne!(a.root_hash(), c.root_hash());
    }

    #[test]
    fn test_odd_level_duplicates_last_node() {
        // Three leaves: the second pair must be (leaf3, leaf3).
        let data = items(&[1, 2, 3]);
        let tree = MerkleTree::build(&data);

        let leaf = |i: usize| -> [u8; 32] { Sha256::digest(&data[i]).into() };
        let combine = |l: [u8; 32], r: [u8; 32]| -> [u8; 32] {
            let mut hasher = Sha256::new();
            hasher.update(l);
            hasher.update(r);
            hasher.finalize().into()
        };

        let expected = combine(
            combine(leaf(0), leaf(1)),
            combine(leaf(2), leaf(2)),
        );
        assert_eq!(tree.root_hash(), expected);
    }

    #[test]
    fn test_empty_input_yields_zero_root() {
        assert_eq!(MerkleTree::build(&[]).root_hash(), [0u8; 32]);
    }
}
