//! Transformation routines and their registry
//!
//! A stage names its routine by string. The registry resolves that name and
//! the routine declares how many providers and sinks it works with, so a
//! mis-wired stage is rejected before anything connects.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{ConfigError, Params};
use crate::provider::{EntryProvider, ProviderError};
use crate::sink::{Record, RecordSink, SinkError, SinkMessage};

/// Errors a transformation routine can end a stage with
#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Params(#[from] ConfigError),

    #[error("cannot parse `{entry}`: {message}")]
    Parse { entry: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Required number of providers or sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Exactly(usize),
    AtLeast(usize),
}

impl Count {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Count::Exactly(expected) => n == expected,
            Count::AtLeast(min) => n >= min,
        }
    }
}

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Count::Exactly(n) => write!(f, "exactly {}", n),
            Count::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub providers: Count,
    pub sinks: Count,
}

impl Arity {
    pub fn new(providers: Count, sinks: Count) -> Self {
        Self { providers, sinks }
    }

    pub fn check(
        &self,
        stage: &str,
        transform: &str,
        providers: usize,
        sinks: usize,
    ) -> Result<(), ConfigError> {
        if self.providers.accepts(providers) && self.sinks.accepts(sinks) {
            return Ok(());
        }
        Err(ConfigError::Arity {
            stage: stage.to_string(),
            transform: transform.to_string(),
            expected_providers: self.providers.to_string(),
            expected_sinks: self.sinks.to_string(),
            providers,
            sinks,
        })
    }
}

/// What a routine gets to work with while its stage executes
pub struct StageContext<'a> {
    pub run_id: i64,
    pub stage: &'a str,
    /// Initialized providers, in configuration order
    pub providers: &'a mut [Box<dyn EntryProvider>],
    /// Started sinks, in configuration order
    pub sinks: &'a [Box<dyn RecordSink>],
    /// Global < stage < command-line parameters
    pub params: &'a Params,
    pub artifact_dir: &'a Path,
}

/// Save the same records to every sink, in sink order
///
/// Takes the sink slice rather than the whole [`StageContext`] so a routine
/// can keep a provider borrowed while it saves.
pub async fn save_all(
    sinks: &[Box<dyn RecordSink>],
    records: Vec<Record>,
) -> Result<(), SinkError> {
    if let Some((last, rest)) = sinks.split_last() {
        for sink in rest {
            sink.save(records.clone()).await?;
        }
        last.save(records).await?;
    }
    Ok(())
}

pub async fn message_all(
    sinks: &[Box<dyn RecordSink>],
    message: SinkMessage,
) -> Result<(), SinkError> {
    for sink in sinks {
        sink.send_message(message.clone()).await?;
    }
    Ok(())
}

/// One transformation routine
#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    fn arity(&self) -> Arity;

    /// Reject unusable parameters before the stage connects to anything
    fn validate_params(&self, _params: &Params) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn run(&self, ctx: StageContext<'_>) -> Result<(), TransformError>;
}

/// Name → routine lookup
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: BTreeMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, transform: impl Transform + 'static) {
        self.transforms
            .insert(transform.name().to_string(), Arc::new(transform));
    }

    pub fn with(mut self, transform: impl Transform + 'static) -> Self {
        self.register(transform);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Transform>, ConfigError> {
        self.transforms
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownTransform(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.transforms.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("transforms", &self.names())
            .finish()
    }
}
