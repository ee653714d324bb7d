use super::Outcome;
use crate::config::Settings;
use anyhow::{Context, Result};
use cipherset_core::{BackupSetConfig, DEFAULT_EXTENSION, operations};
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct CreateSetCommand {
    #[arg(long, help = "Backup set name")]
    name: String,

    #[arg(long, help = "Folder the archive and index are written to")]
    destination: PathBuf,

    #[arg(long, help = "Key file used to encrypt the set (plain copies without one)")]
    key_file: Option<PathBuf>,

    #[arg(long, help = "Where to write the set file")]
    set_file: PathBuf,

    #[arg(long, help = "Archive file extension")]
    extension: Option<String>,

    #[arg(long, help = "Overwrite an existing set file")]
    force: bool,

    #[arg(required = true, help = "Source folders to back up")]
    sources: Vec<PathBuf>,
}

impl CreateSetCommand {
    pub fn run(&self, settings: &Settings) -> Result<Outcome> {
        let extension = self
            .extension
            .clone()
            .or_else(|| settings.extension.clone())
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());

        let mut config = BackupSetConfig::new(&self.name, &self.destination, &self.set_file)
            .with_extension(extension);
        if let Some(key_file) = self.key_file.as_ref().or(settings.key_file.as_ref()) {
            config = config.with_key_file(key_file);
        }
        for source in &self.sources {
            config = config.with_source(source);
        }

        let set = operations::create_backup_set(config, self.force)
            .with_context(|| format!("Failed to create set file {}", self.set_file.display()))?;

        println!("Created backup set '{}' in {}", set.name(), set.set_file().display());
        println!("  Destination: {}", set.destination().display());
        println!("  Index file:  {}", set.index_file().display());
        match set.key_file() {
            Some(key_file) => println!("  Key file:    {}", key_file.display()),
            None => println!("  Key file:    none (files are copied unencrypted)"),
        }
        for folder in set.source_folders() {
            println!("  Source:      {}", folder.display());
        }
        Ok(Outcome::Clean)
    }
}
