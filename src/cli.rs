use clap::{Parser, Subcommand};

/// statechain - Idempotent, content-addressed execution cache
///
/// Inspects the caches written by pipelines built on the statechain library:
/// fingerprints, hash chain steps, and stored cache entries.
#[derive(Parser, Debug)]
#[command(name = "statechain")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Idempotent, content-addressed execution cache", long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short = 'c', long, global = true, env = "STATECHAIN_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the content fingerprint of a file or directory
    Fingerprint(FingerprintArgs),

    /// Hash chain utilities
    Chain(ChainArgs),

    /// Inspect a cache store
    Cache(CacheArgs),

    /// Configuration management utilities
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct FingerprintArgs {
    /// File or directory to fingerprint
    pub path: String,

    /// Hash the full content instead of sampling
    #[arg(long)]
    pub exact: bool,
}

#[derive(Parser, Debug)]
pub struct ChainArgs {
    #[command(subcommand)]
    pub command: ChainCommands,
}

#[derive(Subcommand, Debug)]
pub enum ChainCommands {
    /// Compute the hash an operation moves an environment to
    Advance {
        /// Current chain hash
        #[arg(long)]
        prev: String,

        /// Operation name
        #[arg(long)]
        op: String,

        /// Normalized arguments as a JSON array
        #[arg(long, default_value = "[]")]
        args: String,
    },
}

#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// List entries in a store
    List {
        /// Store path (a JSON document, or a RocksDB cache directory)
        store: String,

        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print one entry
    Show {
        /// Store path (a JSON document, or a RocksDB cache directory)
        store: String,

        /// Entry key
        key: String,
    },

    /// Show store statistics
    Stats {
        /// Store path (a JSON document, or a RocksDB cache directory)
        store: String,
    },
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,

    /// Generate example config file
    Example,

    /// Validate configuration file
    Validate {
        /// Path to config file
        path: String,
    },
}
