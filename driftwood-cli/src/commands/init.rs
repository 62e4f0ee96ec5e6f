//! `driftwood init`: create `~/.driftwood/` and a default config.

use anyhow::{Context, Result};
use clap::Args;

use driftwood_core::{config, registry};

#[derive(Args, Debug)]
pub struct InitArgs {}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let existed = config::config_path_at(&home).exists();
        let config = config::init_at(&home).context("failed to initialize ~/.driftwood")?;

        if existed {
            println!("✓ Already initialized");
        } else {
            println!("✓ Initialized driftwood");
        }
        println!("  Config: {}", config::config_path_at(&home).display());
        println!("  Units:  {}", registry::units_root(&home).display());
        if let Some(root) = config.directory_target_root(&home) {
            println!("  Target: {}", root.display());
        }
        Ok(())
    }
}
