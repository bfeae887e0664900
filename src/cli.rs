use clap::Parser;
use std::path::PathBuf;

/// Vault Migrations - versioned, repeatable Vault configuration changes
#[derive(Parser, Debug)]
#[command(name = "vault-migrations")]
#[command(about = "Apply versioned configuration migrations to HashiCorp Vault")]
#[command(version)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Path to the desired-state schema file (used with --generate)
    #[arg(long, default_value = "schema.yaml")]
    pub schema: PathBuf,

    /// Dry-run mode: log what would be executed without touching Vault.
    ///
    /// The version cursor is left unchanged.
    #[arg(long)]
    pub dry_run: bool,

    /// Log level; overrides the configuration file
    #[arg(long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    pub log_level: Option<String>,

    /// Generate a new migration from the schema instead of applying migrations
    #[arg(long)]
    pub generate: bool,

    /// With --generate: diff against live Vault state instead of the last known state
    #[arg(long, requires = "generate")]
    pub live: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
