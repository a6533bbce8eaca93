use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::core::blockchain::{Blockchain, BlockchainError};
use crate::core::transaction::Transaction;
use crate::core::utxo::UtxoSet;
use crate::node::message::{
    decode_payload, frame, AddrPayload, BlockPayload, Command, GetBlocksPayload, GetDataPayload,
    InvKind, InvPayload, TxPayload, VersionPayload, WireError, NODE_VERSION,
};

/// The bootstrap seed every node knows at startup.
pub const CENTRAL_NODE: &str = "localhost:3000";

/// A mining node seals a block once this many transactions are pending.
const MIN_TXS_TO_MINE: usize = 2;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Blockchain(#[from] BlockchainError),
}

/// Per-process server context. Peer bookkeeping lives behind mutexes; the
/// mining address is fixed at startup.
pub struct Node {
    address: String,
    mining_address: String,
    chain: Blockchain,
    known_nodes: Mutex<Vec<String>>,
    blocks_in_transit: Mutex<Vec<Vec<u8>>>,
    mempool: Mutex<HashMap<String, Transaction>>,
}

/// Open the node's chain and serve the wire protocol until the process ends.
pub async fn start_server(node_id: &str, mining_address: &str) -> Result<(), ServerError> {
    let address = format!("localhost:{node_id}");
    let chain = Blockchain::open(node_id)?;

    let node = Arc::new(Node {
        address: address.clone(),
        mining_address: mining_address.to_string(),
        chain,
        known_nodes: Mutex::new(vec![CENTRAL_NODE.to_string()]),
        blocks_in_transit: Mutex::new(vec![]),
        mempool: Mutex::new(HashMap::new()),
    });

    let listener = TcpListener::bind(&address).await?;
    info!("node listening on {address}");

    if node.address != CENTRAL_NODE {
        node.send_version(CENTRAL_NODE).await;
    }

    loop {
        let (stream, peer) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = node.handle_connection(stream).await {
                error!("connection from {peer} failed: {e}");
            }
        });
    }
}

/// One-shot send used by the CLI to submit a transaction to a running node.
pub async fn send_transaction_to(
    addr: &str,
    addr_from: &str,
    tx: &Transaction,
) -> Result<(), ServerError> {
    let payload = TxPayload {
        addr_from: addr_from.to_string(),
        transaction: tx.serialize().map_err(BlockchainError::Encode)?,
    };
    let message = frame(Command::Tx, &payload)?;
    send_raw(addr, &message).await?;
    Ok(())
}

async fn send_raw(addr: &str, message: &[u8]) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(message).await?;
    stream.shutdown().await?;
    Ok(())
}

impl Node {
    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), ServerError> {
        let mut request = Vec::new();
        stream.read_to_end(&mut request).await?;
        drop(stream);

        let command = Command::from_bytes(&request)?;
        debug!("received {} command", command.as_str());

        match command {
            Command::Version => self.handle_version(&request).await,
            Command::Addr => self.handle_addr(&request).await,
            Command::Inv => self.handle_inv(&request).await,
            Command::GetBlocks => self.handle_get_blocks(&request).await,
            Command::GetData => self.handle_get_data(&request).await,
            Command::Block => self.handle_block(&request).await,
            Command::Tx => self.handle_tx(&request).await,
        }
    }

    /// Compare chain heights: the shorter side asks for blocks, the longer
    /// side re-announces its version. The sender always becomes a known peer.
    async fn handle_version(&self, request: &[u8]) -> Result<(), ServerError> {
        let payload: VersionPayload = decode_payload(request)?;
        let my_height = self.chain.get_best_height()?;

        if my_height < payload.best_height {
            self.send_get_blocks(&payload.addr_from).await;
        } else if my_height > payload.best_height {
            self.send_version(&payload.addr_from).await;
        }

        self.add_known_node(&payload.addr_from).await;
        Ok(())
    }

    async fn handle_addr(&self, request: &[u8]) -> Result<(), ServerError> {
        let payload: AddrPayload = decode_payload(request)?;
        for addr in &payload.addr_list {
            self.add_known_node(addr).await;
        }
        info!("known peers: {}", self.known_nodes.lock().await.len());
        self.request_blocks().await;
        Ok(())
    }

    async fn handle_get_blocks(&self, request: &[u8]) -> Result<(), ServerError> {
        let payload: GetBlocksPayload = decode_payload(request)?;
        let hashes = self.chain.get_block_hashes()?;
        self.send_inv(&payload.addr_from, InvKind::Block, hashes)
            .await;
        Ok(())
    }

    async fn handle_inv(&self, request: &[u8]) -> Result<(), ServerError> {
        let payload: InvPayload = decode_payload(request)?;
        debug!(
            "inventory of {} {:?} items from {}",
            payload.items.len(),
            payload.kind,
            payload.addr_from
        );

        match payload.kind {
            InvKind::Block => {
                let Some((first, rest)) = payload.items.split_first() else {
                    return Ok(());
                };
                *self.blocks_in_transit.lock().await = rest.to_vec();
                self.send_get_data(&payload.addr_from, InvKind::Block, first.clone())
                    .await;
            }
            InvKind::Tx => {
                let Some(tx_id) = payload.items.first() else {
                    return Ok(());
                };
                if !self.mempool.lock().await.contains_key(&hex::encode(tx_id)) {
                    self.send_get_data(&payload.addr_from, InvKind::Tx, tx_id.clone())
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn handle_get_data(&self, request: &[u8]) -> Result<(), ServerError> {
        let payload: GetDataPayload = decode_payload(request)?;
        match payload.kind {
            InvKind::Block => {
                let block = self.chain.get_block(&payload.id)?;
                let reply = BlockPayload {
                    addr_from: self.address.clone(),
                    block: block.serialize().map_err(BlockchainError::Encode)?,
                };
                self.send(&payload.addr_from, frame(Command::Block, &reply)?)
                    .await;
            }
            InvKind::Tx => {
                let tx = self
                    .mempool
                    .lock()
                    .await
                    .get(&hex::encode(&payload.id))
                    .cloned();
                let Some(tx) = tx else {
                    warn!(
                        "transaction {} is not in the mempool",
                        hex::encode(&payload.id)
                    );
                    return Ok(());
                };
                let reply = TxPayload {
                    addr_from: self.address.clone(),
                    transaction: tx.serialize().map_err(BlockchainError::Encode)?,
                };
                self.send(&payload.addr_from, frame(Command::Tx, &reply)?)
                    .await;
            }
        }
        Ok(())
    }

    /// Accept an inbound block, then either continue draining the transit
    /// queue or rebuild the UTXO index now that the batch is complete.
    async fn handle_block(&self, request: &[u8]) -> Result<(), ServerError> {
        let payload: BlockPayload = decode_payload(request)?;
        let block = crate::core::block::Block::deserialize(&payload.block)
            .map_err(BlockchainError::Decode)?;

        self.chain.add_block(&block)?;
        info!("received block {}", hex::encode(&block.hash));

        let next = {
            let mut transit = self.blocks_in_transit.lock().await;
            if transit.is_empty() {
                None
            } else {
                Some(transit.remove(0))
            }
        };

        match next {
            Some(hash) => {
                self.send_get_data(&payload.addr_from, InvKind::Block, hash)
                    .await;
            }
            None => {
                tokio::task::block_in_place(|| UtxoSet::new(&self.chain)?.reindex())?;
            }
        }
        Ok(())
    }

    /// Queue the transaction. The seed relays the announcement; a mining
    /// node seals a block once enough transactions are pending.
    async fn handle_tx(&self, request: &[u8]) -> Result<(), ServerError> {
        let payload: TxPayload = decode_payload(request)?;
        let tx =
            Transaction::deserialize(&payload.transaction).map_err(BlockchainError::Decode)?;
        let tx_id = tx.id.clone();

        self.mempool
            .lock()
            .await
            .insert(hex::encode(&tx_id), tx);
        info!("transaction {} queued", hex::encode(&tx_id));

        if self.address == CENTRAL_NODE {
            let peers = self.known_nodes.lock().await.clone();
            for peer in peers {
                if peer != self.address && peer != payload.addr_from {
                    self.send_inv(&peer, InvKind::Tx, vec![tx_id.clone()]).await;
                }
            }
        } else if !self.mining_address.is_empty()
            && self.mempool.lock().await.len() >= MIN_TXS_TO_MINE
        {
            self.mine_pending_transactions().await?;
        }
        Ok(())
    }

    async fn mine_pending_transactions(&self) -> Result<(), ServerError> {
        loop {
            let pending: Vec<Transaction> =
                self.mempool.lock().await.values().cloned().collect();

            let mut verified = vec![];
            for tx in pending {
                match tokio::task::block_in_place(|| self.chain.verify_transaction(&tx)) {
                    Ok(true) => verified.push(tx),
                    Ok(false) => {
                        warn!("transaction {} failed verification", hex::encode(&tx.id))
                    }
                    Err(BlockchainError::TransactionNotFound(id)) => {
                        warn!("transaction references unknown previous transaction {id}")
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if verified.is_empty() {
                info!("all pending transactions are invalid, waiting for new ones");
                return Ok(());
            }

            let coinbase = Transaction::new_coinbase(&self.mining_address, "")
                .map_err(BlockchainError::Transaction)?;
            verified.push(coinbase);

            let block = tokio::task::block_in_place(|| {
                let block = self.chain.mine_block(verified)?;
                UtxoSet::new(&self.chain)?.reindex()?;
                Ok::<_, BlockchainError>(block)
            })?;

            {
                let mut mempool = self.mempool.lock().await;
                for tx in &block.transactions {
                    mempool.remove(&hex::encode(&tx.id));
                }
            }

            let peers = self.known_nodes.lock().await.clone();
            for peer in peers {
                if peer != self.address {
                    self.send_inv(&peer, InvKind::Block, vec![block.hash.clone()])
                        .await;
                }
            }

            if self.mempool.lock().await.is_empty() {
                return Ok(());
            }
        }
    }

    async fn request_blocks(&self) {
        let peers = self.known_nodes.lock().await.clone();
        for peer in peers {
            self.send_get_blocks(&peer).await;
        }
    }

    async fn add_known_node(&self, addr: &str) {
        if addr.is_empty() || addr == self.address {
            return;
        }
        let mut nodes = self.known_nodes.lock().await;
        if !nodes.iter().any(|n| n == addr) {
            nodes.push(addr.to_string());
        }
    }

    async fn send_version(&self, addr: &str) {
        let best_height = match self.chain.get_best_height() {
            Ok(height) => height,
            Err(e) => {
                error!("failed to read best height: {e}");
                return;
            }
        };
        let payload = VersionPayload {
            version: NODE_VERSION,
            best_height,
            addr_from: self.address.clone(),
        };
        match frame(Command::Version, &payload) {
            Ok(message) => self.send(addr, message).await,
            Err(e) => error!("failed to frame version message: {e}"),
        }
    }

    async fn send_get_blocks(&self, addr: &str) {
        let payload = GetBlocksPayload {
            addr_from: self.address.clone(),
        };
        match frame(Command::GetBlocks, &payload) {
            Ok(message) => self.send(addr, message).await,
            Err(e) => error!("failed to frame getblocks message: {e}"),
        }
    }

    async fn send_inv(&self, addr: &str, kind: InvKind, items: Vec<Vec<u8>>) {
        let payload = InvPayload {
            addr_from: self.address.clone(),
            kind,
            items,
        };
        match frame(Command::Inv, &payload) {
            Ok(message) => self.send(addr, message).await,
            Err(e) => error!("failed to frame inv message: {e}"),
        }
    }

    async fn send_get_data(&self, addr: &str, kind: InvKind, id: Vec<u8>) {
        let payload = GetDataPayload {
            addr_from: self.address.clone(),
            kind,
            id,
        };
        match frame(Command::GetData, &payload) {
            Ok(message) => self.send(addr, message).await,
            Err(e) => error!("failed to frame getdata message: {e}"),
        }
    }

    /// Fire-and-forget delivery. An unreachable peer is dropped from the
    /// known-nodes list.
    async fn send(&self, addr: &str, message: Vec<u8>) {
        if let Err(e) = send_raw(addr, &message).await {
            warn!("{addr} is not available: {e}");
            self.known_nodes.lock().await.retain(|n| n != addr);
        }
    }
}
