use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use flexi_logger::{Duplicate, FileSpec, Logger};
use log::info;

use ember_coin::core::blockchain::Blockchain;
use ember_coin::core::pow::ProofOfWork;
use ember_coin::core::transaction::{new_utxo_transaction, Transaction};
use ember_coin::core::utxo::UtxoSet;
use ember_coin::crypto::hash::hash_pub_key;
use ember_coin::node::server::{send_transaction_to, start_server, CENTRAL_NODE};
use ember_coin::wallet::{validate_address, Wallets};

#[derive(Parser)]
#[command(name = "ember-coin", version, about = "A minimal UTXO blockchain node")]
struct Cli {
    /// Node identifier; selects the per-node database and wallet files
    #[arg(long, env = "NODE_ID")]
    node_id: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a blockchain and send the genesis subsidy to ADDRESS
    Createblockchain {
        #[arg(long)]
        address: String,
    },
    /// Generate a new key pair and save it into the wallet file
    Createwallet,
    /// List all addresses from the wallet file
    Listaddresses,
    /// Get the balance of ADDRESS
    Getbalance {
        #[arg(long)]
        address: String,
    },
    /// Send AMOUNT of coins from FROM to TO
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        /// Mine the block locally instead of submitting to the seed node
        #[arg(long)]
        mine: bool,
    },
    /// Print all the blocks of the blockchain
    Printchain,
    /// Rebuild the UTXO index from the chain
    Reindexutxo,
    /// Start a node; optionally mine to MINER
    Startnode {
        #[arg(long)]
        miner: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // The handle keeps the logger alive for the rest of the process
    let _logger = init_logger(&cli.command)?;

    match cli.command {
        Command::Createblockchain { address } => create_blockchain(&cli.node_id, &address),
        Command::Createwallet => create_wallet(&cli.node_id),
        Command::Listaddresses => list_addresses(&cli.node_id),
        Command::Getbalance { address } => get_balance(&cli.node_id, &address),
        Command::Send {
            from,
            to,
            amount,
            mine,
        } => send(&cli.node_id, &from, &to, amount, mine),
        Command::Printchain => print_chain(&cli.node_id),
        Command::Reindexutxo => reindex_utxo(&cli.node_id),
        Command::Startnode { miner } => start_node(&cli.node_id, miner.as_deref()),
    }
}

fn init_logger(command: &Command) -> anyhow::Result<flexi_logger::LoggerHandle> {
    let handle = if matches!(command, Command::Startnode { .. }) {
        std::fs::create_dir_all("logs").context("failed to create log directory")?;
        Logger::try_with_env_or_str("info")?
            .log_to_file(FileSpec::default().directory("logs"))
            .duplicate_to_stderr(Duplicate::Info)
            .start()?
    } else {
        Logger::try_with_env_or_str("warn")?.start()?
    };
    Ok(handle)
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn create_blockchain(node_id: &str, address: &str) -> anyhow::Result<()> {
    ensure_valid_address(address)?;

    let chain = Blockchain::create(address, node_id)?;
    UtxoSet::new(&chain)?.reindex()?;

    println!("Done!");
    Ok(())
}

fn create_wallet(node_id: &str) -> anyhow::Result<()> {
    let mut wallets = Wallets::load(node_id)?;
    let address = wallets.create_wallet();
    wallets.save(node_id)?;

    println!("Your new address: {address}");
    Ok(())
}

fn list_addresses(node_id: &str) -> anyhow::Result<()> {
    let wallets = Wallets::load(node_id)?;
    for address in wallets.addresses() {
        println!("{address}");
    }
    Ok(())
}

fn get_balance(node_id: &str, address: &str) -> anyhow::Result<()> {
    ensure_valid_address(address)?;

    let chain = Blockchain::open(node_id)?;
    let utxo_set = UtxoSet::new(&chain)?;
    let pub_key_hash = ember_coin::wallet::address_to_pub_key_hash(address)?;
    let balance: u64 = utxo_set
        .find_utxo(&pub_key_hash)?
        .iter()
        .map(|output| output.value)
        .sum();

    println!("Balance of '{address}': {balance}");
    Ok(())
}

fn send(node_id: &str, from: &str, to: &str, amount: u64, mine: bool) -> anyhow::Result<()> {
    ensure_valid_address(from)?;
    ensure_valid_address(to)?;

    let wallets = Wallets::load(node_id)?;
    let wallet = wallets
        .get_wallet(from)
        .ok_or_else(|| anyhow!("no wallet for address {from} in the wallet file"))?;

    let chain = Blockchain::open(node_id)?;
    let utxo_set = UtxoSet::new(&chain)?;
    let tx = new_utxo_transaction(wallet, to, amount, &utxo_set)?;

    if mine {
        let coinbase = Transaction::new_coinbase(from, "")?;
        let block = chain.mine_block(vec![coinbase, tx])?;
        utxo_set.update(&block)?;
        info!("mined block {} locally", hex::encode(&block.hash));
    } else {
        runtime()?.block_on(send_transaction_to(
            CENTRAL_NODE,
            &format!("localhost:{node_id}"),
            &tx,
        ))?;
    }

    println!("Success!");
    Ok(())
}

fn print_chain(node_id: &str) -> anyhow::Result<()> {
    let chain = Blockchain::open(node_id)?;

    for block in chain.iterator() {
        let block = block?;
        println!("============ Block {} ============", hex::encode(&block.hash));
        println!("Height: {}", block.height);
        println!("Prev. block: {}", hex::encode(&block.prev_hash));
        let pow_valid = ProofOfWork::new(&block)?.validate();
        println!("PoW: {pow_valid}");
        for tx in &block.transactions {
            println!("{tx}");
        }
        println!();
    }
    Ok(())
}

fn reindex_utxo(node_id: &str) -> anyhow::Result<()> {
    let chain = Blockchain::open(node_id)?;
    let mut utxo_set = UtxoSet::new(&chain)?;
    utxo_set.reindex()?;

    println!(
        "Done! There are {} transactions in the UTXO set.",
        utxo_set.count_transactions()
    );
    Ok(())
}

fn start_node(node_id: &str, miner: Option<&str>) -> anyhow::Result<()> {
    let mining_address = match miner {
        Some(address) => {
            ensure_valid_address(address)?;
            info!("mining is on, rewards go to {address}");
            address.to_string()
        }
        None => String::new(),
    };

    info!("starting node {node_id}");
    runtime()?.block_on(start_server(node_id, &mining_address))?;
    Ok(())
}

fn ensure_valid_address(address: &str) -> anyhow::Result<()> {
    if !validate_address(address)? {
        bail!("address {address} is not valid");
    }
    Ok(())
}
