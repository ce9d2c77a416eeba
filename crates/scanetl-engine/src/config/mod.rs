//! Pipeline and engine configuration
//!
//! - **pipeline**: the pipeline document (stages, provider/sink configs)
//! - **endpoint**: named connection targets referenced by provider/sink configs
//! - **params**: layered parameter maps (global < stage < command line)
//! - **settings**: process-level engine settings from `SCANETL_*` env vars

pub mod endpoint;
pub mod params;
pub mod pipeline;
pub mod settings;

pub use endpoint::{Endpoint, EndpointRegistry};
pub use params::Params;
pub use pipeline::{PipelineDocument, ProviderConfig, SinkConfig, StageConfig};
pub use settings::EngineSettings;

use thiserror::Error;

/// Configuration errors. Always fatal and always raised before any stage
/// touches an external system.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("unsupported pipeline document extension: {0}")]
    UnsupportedFormat(String),

    #[error("missing mandatory field `{field}` in {context}")]
    MissingField { context: String, field: &'static str },

    #[error("unknown endpoint `{0}`")]
    UnknownEndpoint(String),

    #[error("endpoint `{endpoint}` is a {actual} endpoint, {expected} required")]
    EndpointKind {
        endpoint: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("environment variable `{0}` is not set")]
    MissingEnv(String),

    #[error("invalid pattern `{pattern}`: {message}")]
    Pattern { pattern: String, message: String },

    #[error("unknown transformation routine `{0}`")]
    UnknownTransform(String),

    #[error(
        "stage `{stage}`: `{transform}` requires {expected_providers} provider(s) and \
         {expected_sinks} sink(s), got {providers} and {sinks}"
    )]
    Arity {
        stage: String,
        transform: String,
        expected_providers: String,
        expected_sinks: String,
        providers: usize,
        sinks: usize,
    },

    #[error("invalid parameter override `{0}`, expected key:value")]
    Override(String),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error(transparent)]
    Common(#[from] scanetl_common::EtlError),
}
