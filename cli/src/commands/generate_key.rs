use super::Outcome;
use anyhow::{Context, Result};
use cipherset_core::operations;
use clap::Args;
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct GenerateKeyCommand {
    #[arg(help = "Key file to write, or '-' for stdout")]
    output: PathBuf,

    #[arg(long, help = "Overwrite an existing key file")]
    force: bool,
}

impl GenerateKeyCommand {
    pub fn run(&self) -> Result<Outcome> {
        operations::generate_key(&self.output, self.force)
            .with_context(|| format!("Failed to generate key {}", self.output.display()))?;
        if self.output != Path::new("-") {
            println!("Generated new key in {}", self.output.display());
            println!("Keep a copy somewhere safe: without it the archive cannot be restored.");
        }
        Ok(Outcome::Clean)
    }
}
