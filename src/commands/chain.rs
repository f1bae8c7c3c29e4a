use anyhow::{Context, Result};
use serde_json::Value;

use crate::cli::ChainCommands;
use statechain::chain;

pub fn run(command: ChainCommands) -> Result<()> {
    match command {
        ChainCommands::Advance { prev, op, args } => advance(&prev, &op, &args),
    }
}

fn advance(prev: &str, op: &str, args: &str) -> Result<()> {
    let args: Value = serde_json::from_str(args).context("--args must be valid JSON")?;
    if !args.is_array() {
        anyhow::bail!("--args must be a JSON array");
    }

    println!("{}", chain::advance(prev, op, &args)?);
    Ok(())
}
