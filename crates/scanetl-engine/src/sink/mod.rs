//! Record sinks
//!
//! A sink commits typed records to one destination in batches. Records are
//! routed by output identifier into lanes; each lane is a bounded queue with
//! its own drain task, so a slow or failing output never blocks another.
//!
//! ```text
//! save(records) ──> lane map ──┬─> lane "port_scan"  ──> drain ──> BatchWriter
//!                              ├─> lane "dns_record" ──> drain ──┘
//!                              └─> ...
//! ```
//!
//! Lifecycle: `start → save* → finish`. `finish` drains every lane before it
//! returns; a finished sink rejects further records.

pub mod batched;
pub mod database;
pub mod lane;
pub mod record;
pub mod remote_file;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::{ConfigError, EndpointRegistry, EngineSettings, SinkConfig};
use crate::provider::ProviderError;

pub use batched::{BatchOptions, BatchWriter, BatchedSink};
pub use lane::LaneStats;
pub use record::{Persistable, Record};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink `{0}` has not been started")]
    NotStarted(String),

    #[error("sink `{0}` was already started")]
    AlreadyStarted(String),

    #[error("sink `{0}` is finished")]
    Finished(String),

    #[error("lane `{0}` was closed and cannot be reopened")]
    LaneRetired(String),

    #[error("lane `{0}` stopped unexpectedly")]
    LaneGone(String),

    #[error("flush of {records} record(s) to `{output_id}` failed: {message}")]
    Flush {
        output_id: String,
        records: usize,
        message: String,
    },

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transfer failed: {0}")]
    Transfer(#[from] ProviderError),

    #[error(transparent)]
    Common(#[from] scanetl_common::EtlError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SinkError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        SinkError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Out-of-band control messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    /// Flush and retire one lane now. The id cannot be reused afterwards.
    CloseLane(String),
}

/// Batched, fan-out record persistence to one destination
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Instance name used in logs
    fn name(&self) -> &str;

    /// Acquire the destination connection
    async fn start(&self) -> Result<(), SinkError>;

    /// Route records into their lanes. Waits only while a lane queue is full.
    async fn save(&self, records: Vec<Record>) -> Result<(), SinkError>;

    async fn send_message(&self, message: SinkMessage) -> Result<(), SinkError>;

    /// Drain every lane and release the destination. Idempotent.
    async fn finish(&self) -> Result<(), SinkError>;

    /// Errors accumulated by all lanes
    fn errors(&self) -> Vec<String>;

    /// Files worth attaching to a run report
    fn output_paths(&self) -> Vec<PathBuf>;
}

/// Everything a sink needs besides its own config
#[derive(Debug, Clone)]
pub struct SinkContext {
    pub endpoints: EndpointRegistry,
    pub settings: EngineSettings,
    /// Directory for staged files and error logs
    pub artifact_dir: PathBuf,
    /// Instance name, e.g. `masscan/0-database`
    pub instance_name: String,
}

/// Validate a sink config without connecting to anything
pub fn validate(config: &SinkConfig, endpoints: &EndpointRegistry) -> Result<(), ConfigError> {
    match config {
        SinkConfig::Database(c) => c.validate(endpoints),
        SinkConfig::RemoteFile(c) => c.validate(endpoints),
    }
}

/// Resolve a sink config into a ready-to-start sink
pub fn build(config: &SinkConfig, ctx: &SinkContext) -> Result<Box<dyn RecordSink>, ConfigError> {
    let sink: Box<dyn RecordSink> = match config {
        SinkConfig::Database(c) => {
            let (writer, options) = database::PgBatchWriter::from_config(c, ctx)?;
            Box::new(BatchedSink::new(ctx, writer, options))
        },
        SinkConfig::RemoteFile(c) => {
            let (writer, options) = remote_file::FileBatchWriter::from_config(c, ctx)?;
            Box::new(BatchedSink::new(ctx, writer, options))
        },
    };
    Ok(sink)
}
