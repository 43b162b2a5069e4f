// CLI commands

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::NodeConfig;
use crate::error::{ConfigError, Result, StorageError};
use crate::ledger::Ledger;
use crate::network::Node;
use crate::storage::Storage;
use crate::wallet::Keystore;

#[derive(Parser, Debug)]
#[command(name = "yggdrasil-node")]
#[command(about = "Peer-to-peer blockchain node", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node and serve peers
    Run {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Mine a block from the mempool every N seconds
        #[arg(long)]
        mine_interval: Option<u64>,
    },

    /// Show the stored chain and known peers
    Info {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Data directory, overriding the configuration
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Create a key pair and print its address
    Keygen {
        /// Keystore file, created if missing
        #[arg(short, long, default_value = "keystore.json")]
        keystore: PathBuf,
    },
}

/// CLI handler
#[derive(Debug, Default)]
pub struct CliHandler;

impl CliHandler {
    pub fn new() -> Self {
        Self
    }

    /// Handle CLI command
    pub async fn handle(&self, cli: Cli) -> Result<()> {
        match cli.command {
            Commands::Run { config, mine_interval } => self.run(config.as_deref(), mine_interval).await,
            Commands::Info { config, data_dir } => self.info(config.as_deref(), data_dir),
            Commands::Keygen { keystore } => self.keygen(&keystore),
        }
    }

    fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
        Ok(match path {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        })
    }

    async fn run(&self, config: Option<&Path>, mine_interval: Option<u64>) -> Result<()> {
        let node = Node::new(Self::load_config(config)?)?;

        if let Some(secs) = mine_interval {
            let miner = node.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Err(e) = miner.mine_block().await {
                        log::error!("Mining failed: {}", e);
                    }
                }
            });
        }

        node.run().await
    }

    fn info(&self, config: Option<&Path>, data_dir: Option<PathBuf>) -> Result<()> {
        let config = Self::load_config(config)?;
        let Some(data_dir) = data_dir.or(config.data_dir) else {
            return Err(ConfigError::Invalid("no data_dir configured".to_string()).into());
        };

        let storage = Storage::open(&data_dir)?;
        let blocks = storage.blocks.load_chain()?;
        let stored = blocks.len();

        let mut ledger = Ledger::default();
        ledger.add_blocks(blocks).map_err(StorageError::InvalidChain)?;
        let chain = ledger.blockchain();

        println!("Chain info ({}):", data_dir.display());
        println!("  Blocks: {}", stored);
        if let Some(tip) = chain.tip() {
            println!("  Height: {}", tip.index());
            println!("  Tip: {}", tip.hash());
            println!("  Tip time: {}", tip.timestamp());
        }

        let peers = storage.peers.load(config.peer_record_limit)?;
        println!("Known peers ({}):", peers.len());
        for peer in peers {
            println!("  {} {} (seen {})", peer.node_identifier, peer.endpoint(), peer.time_stamp);
        }
        Ok(())
    }

    fn keygen(&self, path: &Path) -> Result<()> {
        let mut keystore = Keystore::open(path)?;
        let address = keystore.new_address();
        keystore.save(path)?;

        println!("New address: {}", address);
        if keystore.default_address() == Some(&address) {
            println!("  (default)");
        }
        println!("Keystore: {} ({} keys)", path.display(), keystore.count());
        Ok(())
    }
}
