//! scanetl Engine Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Streaming ETL for scan and report data: pull entries from remote carriers,
//! turn them into typed records, commit the records in batches.
//!
//! # Overview
//!
//! - **Providers** ([`provider`]): FTP/local trees, HTTP listings, remote
//!   scripts, tar archives and PostgreSQL queries, all behind one lazy
//!   [`provider::EntryProvider`] sequence
//! - **Sinks** ([`sink`]): batched fan-out persistence to PostgreSQL or CSV
//!   files, one lane per output identifier
//! - **Orchestrator** ([`orchestrator`]): validates a pipeline document and
//!   runs its stages, isolating failures per stage
//! - **Transforms** ([`transforms`]): built-in routines (`jsonl_import`,
//!   `csv_import`, `copy`)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use scanetl_engine::config::{EngineSettings, Params, PipelineDocument};
//! use scanetl_engine::orchestrator::{MemoryRunStore, Orchestrator};
//! use scanetl_engine::transforms::default_registry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let doc = PipelineDocument::load("pipeline.toml")?;
//!     let orchestrator = Orchestrator::new(
//!         default_registry(),
//!         Arc::new(MemoryRunStore::new()),
//!         EngineSettings::from_env()?,
//!     );
//!     let outcome = orchestrator.run(&doc, &Params::new()).await?;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

pub mod config;
pub mod db;
pub mod orchestrator;
pub mod provider;
pub mod sink;
pub mod transforms;

pub use config::{ConfigError, PipelineDocument};
pub use orchestrator::{Orchestrator, RunOutcome};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// scanetl - streaming ETL for scan and report data
#[derive(Parser, Debug)]
#[command(name = "scanetl")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one or more pipeline documents
    Run {
        /// Pipeline documents (.toml, .yaml, .yml, .json)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Parameter override, `key:value`; wins over document params
        #[arg(short = 'p', long = "param", value_name = "KEY:VALUE")]
        params: Vec<String>,
    },

    /// Validate pipeline documents without running them
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short = 'p', long = "param", value_name = "KEY:VALUE")]
        params: Vec<String>,
    },
}

/// Make a name usable as a single path component
pub(crate) fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ' ' | ':' => '_',
            c => c,
        })
        .collect()
}
