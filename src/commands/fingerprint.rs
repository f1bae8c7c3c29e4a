use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

use crate::cli::FingerprintArgs;
use statechain::config::StatechainConfig;
use statechain::fingerprint::{FingerprintMode, Fingerprinter};

pub fn run(args: &FingerprintArgs, config: &StatechainConfig) -> Result<()> {
    let path = Path::new(&args.path);
    if !path.exists() {
        anyhow::bail!("Path not found: {}", args.path);
    }

    let mode = if args.exact {
        FingerprintMode::Exact
    } else {
        FingerprintMode::Sampled
    };
    debug!(path = %path.display(), mode = %mode, "fingerprinting");

    let fingerprinter = Fingerprinter::new(config.fingerprint.sample_config());
    let digest = fingerprinter
        .fingerprint(path, mode)
        .with_context(|| format!("Failed to fingerprint {}", args.path))?;

    println!("{}", digest);
    Ok(())
}
