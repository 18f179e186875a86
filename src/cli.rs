//! Command line interface.

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(
    name = "ferrox",
    about = "Custodial exchange backend: chain synchronizers, treasury and matching engine"
)]
pub struct Cli {
    /// Path to the JSON configuration document. Defaults to
    /// `$HOME/.ferrox/config.json`; a missing file is bootstrapped with a
    /// template to edit.
    #[structopt(long, global = true)]
    pub config: Option<PathBuf>,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(StructOpt)]
pub enum Command {
    /// Run the node: per-coin chain synchronizer and treasury workers
    /// plus the order processor.
    Node {
        /// Storage directory (only meaningful with the rocksdb backend).
        #[structopt(long)]
        data_dir: Option<PathBuf>,
    },
    /// Consolidate hot-wallet UTXOs under another master key. Dry-runs by
    /// default; pass --broadcast to actually move funds.
    Sweep {
        #[structopt(long)]
        coin: String,
        /// Destination master public key (hex).
        #[structopt(long)]
        out_pub_key: String,
        /// Destination master chain code (hex).
        #[structopt(long)]
        out_chain: String,
        #[structopt(long)]
        min_input: u64,
        #[structopt(long)]
        max_input: u64,
        #[structopt(long)]
        max_total: u64,
        #[structopt(long, default_value = "20")]
        max_inputs: usize,
        #[structopt(long)]
        min_output: u64,
        #[structopt(long)]
        max_output: u64,
        #[structopt(long, default_value = "20")]
        max_outputs: usize,
        #[structopt(long)]
        broadcast: bool,
        #[structopt(long)]
        data_dir: Option<PathBuf>,
    },
    /// Derive hot master key material from an operator seed phrase.
    MasterKey {
        #[structopt(long)]
        seed: String,
        /// Also print the master secret (keep it off shared terminals).
        #[structopt(long)]
        show_secret: bool,
    },
}
