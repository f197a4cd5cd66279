//! CLI configuration for the standalone indexer.

use clap::Parser;
use hasira::IndexerConfig;
use std::path::PathBuf;

/// Standalone single-contract event indexer.
///
/// Follows one (contract, event) pair, stores matching events under ordering
/// indexes, and serves them over a local HTTP API.
#[derive(Parser, Debug)]
#[command(name = "hasira-indexer")]
#[command(about = "Index one contract's events on a Starknet-style chain", long_about = None)]
pub struct Cli {
    /// Contract address to index events from
    #[arg(long)]
    pub contract: String,

    /// Event name (e.g. Transfer) or raw 0x-selector to index
    #[arg(long)]
    pub event: String,

    /// Index into keys[1..] ++ data used to order events
    #[arg(long, default_value_t = 0)]
    pub order_by: i64,

    /// Index into keys[1..] ++ data used as the unique key (-1 to disable)
    #[arg(long, default_value_t = -1)]
    pub unique: i64,

    /// Starting block number
    #[arg(long, default_value_t = 0)]
    pub start_block: u64,

    /// RPC endpoint URL
    #[arg(long)]
    pub rpc: String,

    /// Network to connect to (devnet, sepolia, mainnet)
    #[arg(long, default_value = "sepolia")]
    pub network: String,

    /// Directory for the embedded event store
    #[arg(long, default_value = "./indexer_db")]
    pub data_dir: PathBuf,

    /// Port for the HTTP query API
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
}

impl Cli {
    pub fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig {
            contract: self.contract.clone(),
            event: self.event.clone(),
            order_by: self.order_by,
            unique: self.unique,
            start_block: self.start_block,
            rpc_url: self.rpc.clone(),
            network: self.network.clone(),
            data_dir: self.data_dir.clone(),
        }
    }
}
