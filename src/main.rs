//! Vault Migrations - Main entry point
//!
//! Applies pending migrations, or with `--generate` writes the next
//! migration from a desired-state schema.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

use vault_migrations::cli::Cli;
use vault_migrations::config::Config;
use vault_migrations::engine::{GenerateOutcome, MigrationEngine, StateDiffGenerator};
use vault_migrations::store::{Store, VaultStore};
use vault_migrations::{logging, schema, shutdown};

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load_from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if cli.dry_run {
        config.dry_run = true;
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    logging::init(&config.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "Vault Migrations starting up");

    let cancel = CancellationToken::new();
    if let Err(e) = shutdown::cancel_on_signals(cancel.clone()) {
        // Without the listener a signal still terminates the process, just not gracefully
        warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    if cli.generate {
        runtime.block_on(generate(&config, &cli, &cancel))
    } else {
        runtime.block_on(apply(&config, &cancel))
    }
}

/// Apply every pending migration
async fn apply(config: &Config, cancel: &CancellationToken) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    let store: Arc<dyn Store> =
        Arc::new(VaultStore::from_config(&config.vault).context("Failed to create Vault client")?);
    let engine = MigrationEngine::from_config(config, store, info_span!("migrate"));

    let report = engine.run(cancel).await.context("Migration run failed")?;

    if report.is_up_to_date() {
        println!("No pending migrations (current version {}).", report.final_version);
    } else if report.dry_run {
        println!(
            "Dry run: would apply {} migration(s): {:?}",
            report.applied.len(),
            report.applied
        );
    } else {
        println!(
            "Applied {} migration(s); now at version {} ({:.2?}).",
            report.applied.len(),
            report.final_version,
            report.elapsed
        );
    }
    Ok(())
}

/// Write the next migration from the schema
async fn generate(config: &Config, cli: &Cli, cancel: &CancellationToken) -> Result<()> {
    config.validate_for_generate().context("Invalid configuration")?;

    let desired = schema::load_desired_state(&cli.schema)
        .with_context(|| format!("Failed to load schema from {}", cli.schema.display()))?;
    let directory = &config.migrations.directory;
    let generator = StateDiffGenerator::new(directory, info_span!("generate"));

    let current = if cli.live {
        config.validate_connection().context("Invalid configuration")?;
        let store = VaultStore::from_config(&config.vault).context("Failed to create Vault client")?;

        // Paths that were managed before must be observed too, or their removal goes unnoticed
        let mut paths: BTreeSet<String> = desired.keys().cloned().collect();
        if let Some(snapshot) = schema::load_snapshot(directory)? {
            paths.extend(snapshot.into_keys());
        }
        let live = generator
            .observe(&store, &paths, cancel)
            .await
            .context("Failed to read live Vault state")?;
        Some(live)
    } else {
        None
    };

    match generator.generate(current, &desired).context("Failed to generate migration")? {
        GenerateOutcome::NoOp => {
            println!("No migrations required - configurations are identical");
        }
        GenerateOutcome::Generated {
            version,
            file,
            change_set,
        } => {
            println!(
                "Generated migration version {} with {} tasks: {}",
                version,
                change_set.tasks.len(),
                file.display()
            );
        }
    }
    Ok(())
}
