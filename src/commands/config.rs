use anyhow::Result;
use tracing::info;

use crate::cli::ConfigCommands;
use statechain::config::StatechainConfig;

pub fn run(command: ConfigCommands, config: &StatechainConfig) -> Result<()> {
    match command {
        ConfigCommands::Show => show(config),
        ConfigCommands::Example => example(),
        ConfigCommands::Validate { path } => validate(&path),
    }
}

fn validate(path: &str) -> Result<()> {
    info!("Validating config file: {}", path);

    let config = StatechainConfig::from_file(path)?;
    config.validate()?;

    println!("✓ Configuration file is valid: {}", path);
    println!("\nSummary:");
    println!("  - Cache directory: {}", config.cache.resolved_dir().display());
    println!("  - Backend: {}", config.cache.backend);
    println!(
        "  - Operations cached in environment: {}",
        config.cache.operations_in_environment
    );
    println!(
        "  - Fingerprint sampling: {} bytes above {} bytes",
        config.fingerprint.sample_size, config.fingerprint.sample_threshold
    );

    Ok(())
}

fn example() -> Result<()> {
    println!("{}", StatechainConfig::example()?);
    Ok(())
}

fn show(config: &StatechainConfig) -> Result<()> {
    info!("Showing effective configuration");

    println!("Effective Configuration:\n");
    println!("{}", toml::to_string_pretty(config)?);

    Ok(())
}
