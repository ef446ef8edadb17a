use crate::cli::CliContext;
use crate::constants;
use crate::core::codec::MasterKey;
use crate::core::config;
use crate::util::fs as vault_fs;
use anyhow::{Context, Result};
use clap::Args;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Create a random master key if none exists
    #[arg(long)]
    pub generate_key: bool,
}

pub fn run(ctx: &CliContext, args: InitArgs) -> Result<()> {
    let paths = &ctx.paths;
    vault_fs::ensure_dir(&paths.root, constants::VAULT_DIR_MODE)?;
    vault_fs::ensure_dir(&paths.vault, constants::VAULT_DIR_MODE)?;
    vault_fs::ensure_dir(&paths.locks, constants::LOCKS_DIR_MODE)?;

    let vault = config::load(&paths.config)?;
    if !paths.config.exists() {
        config::save(&paths.config, &vault)?;
        println!("wrote default config {}", paths.config.display());
    }

    let key_path = config::master_key_path(paths, &vault);
    if key_path.exists() {
        MasterKey::load(&key_path).context("existing master key is unusable")?;
        println!("master key: {}", key_path.display());
    } else if args.generate_key {
        MasterKey::generate(&key_path)?;
        println!("generated master key {}", key_path.display());
        println!("Back it up now: without it no secret can be decrypted.");
    } else {
        println!(
            "master key missing: {} (rerun with --generate-key)",
            key_path.display()
        );
    }

    println!("vault initialized at {}", paths.root.display());
    Ok(())
}
