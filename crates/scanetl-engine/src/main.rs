//! scanetl - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use scanetl_common::logging::{init_logging, LogConfig};
use scanetl_engine::config::{EngineSettings, Params, PipelineDocument};
use scanetl_engine::orchestrator::{
    MemoryRunStore, Orchestrator, PgRunStore, RunOutcome, RunStore,
};
use scanetl_engine::transforms::default_registry;
use scanetl_engine::{Cli, Commands};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Environment variables take precedence over the flag
    let log_config = LogConfig::cli(cli.verbose);
    let log_config = match log_config.clone().merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: ignoring SCANETL_LOG_* settings: {}", e);
            log_config
        },
    };
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    match execute(&cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            process::exit(1);
        },
    }
}

async fn execute(cli: &Cli) -> Result<i32> {
    let settings = EngineSettings::from_env().context("Invalid engine settings")?;

    match &cli.command {
        Commands::Check { files, params } => {
            let overrides = Params::from_overrides(params.as_slice())?;
            let orchestrator = Orchestrator::new(
                default_registry(),
                Arc::new(MemoryRunStore::new()),
                settings,
            );
            for (path, doc) in load_all(files)? {
                orchestrator
                    .validate(&doc, &overrides)
                    .with_context(|| format!("{} is invalid", path.display()))?;
                println!("✓ {} ({} stage(s))", path.display(), doc.stages.len());
            }
            Ok(0)
        },

        Commands::Run { files, params } => {
            let overrides = Params::from_overrides(params.as_slice())?;
            let documents = load_all(files)?;
            let store = open_store(&settings).await?;
            let orchestrator = Orchestrator::new(default_registry(), store, settings);

            // Reject every document before running any of them
            for (path, doc) in &documents {
                orchestrator
                    .validate(doc, &overrides)
                    .with_context(|| format!("{} is invalid", path.display()))?;
            }

            let mut exit_code = 0;
            for (path, doc) in &documents {
                info!(file = %path.display(), pipeline = %doc.name, "Running pipeline");
                let outcome = orchestrator
                    .run(doc, &overrides)
                    .await
                    .with_context(|| format!("Failed to run {}", path.display()))?;
                print_outcome(&outcome);
                exit_code = exit_code.max(outcome.exit_code());
            }
            Ok(exit_code)
        },
    }
}

fn load_all(files: &[PathBuf]) -> Result<Vec<(PathBuf, PipelineDocument)>> {
    files
        .iter()
        .map(|path| {
            PipelineDocument::load(path)
                .map(|doc| (path.clone(), doc))
                .with_context(|| format!("Failed to load {}", path.display()))
        })
        .collect()
}

async fn open_store(settings: &EngineSettings) -> Result<Arc<dyn RunStore>> {
    match &settings.run_store_url {
        Some(url) => {
            let store = PgRunStore::connect(url)
                .await
                .context("Failed to connect to run store")?;
            Ok(Arc::new(store))
        },
        None => Ok(Arc::new(MemoryRunStore::new())),
    }
}

fn print_outcome(outcome: &RunOutcome) {
    println!(
        "run {} `{}`: {}",
        outcome.run_id,
        outcome.pipeline,
        outcome.status.as_str()
    );
    for stage in &outcome.stages {
        let marker = if stage.succeeded() {
            "✓"
        } else if stage.failed() {
            "✗"
        } else {
            "-"
        };
        println!(
            "  {} {} [{}] {}",
            marker,
            stage.name,
            stage.transform,
            stage.status.as_str()
        );
        if let Some(error) = &stage.error {
            println!("      error: {}", error);
        }
        for sink_error in &stage.sink_errors {
            println!("      sink: {}", sink_error);
        }
        for provider_error in &stage.provider_errors {
            println!("      provider: {}", provider_error);
        }
    }
    for artifact in &outcome.artifacts {
        println!("  artifact: {}", artifact.display());
    }
}
