/// Core blockchain storage, contains the durable chain, tip tracking and iteration
pub mod blockchain;

/// Core transaction struct, defines a transaction, its inputs and outputs, and the signing pipeline
pub mod transaction;

/// Unspent transaction outputs, the derived chainstate index with rebuild and query logic
pub mod utxo;

/// Core block struct, defines a block and all of its parameters
pub mod block;

/// Fixed-difficulty proof of work, nonce search and validation
pub mod pow;
