mod cli;
mod cli_utils;
mod commands;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};
use statechain::config::load_config_with_discovery;
use statechain::logging::{self, LogFormat};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match load_config_with_discovery(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            logging::init();
            return Err(e);
        }
    };

    logging::init_with(
        Some(&config.observability.log_level),
        LogFormat::parse(&config.observability.log_format),
    );

    match cli.command {
        Commands::Fingerprint(args) => commands::fingerprint::run(&args, &config),
        Commands::Chain(args) => commands::chain::run(args.command),
        Commands::Cache(args) => commands::cache::run(args.command),
        Commands::Config(args) => commands::config::run(args.command, &config),
    }
}
