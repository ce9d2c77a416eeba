//! scanetl Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error and logging plumbing used by every scanetl workspace member.
//!
//! - **Error Handling**: [`EtlError`] and the [`Result`] alias
//! - **Logging**: subscriber setup driven by [`logging::LogConfig`]
//!
//! # Example
//!
//! ```no_run
//! use scanetl_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("engine ready");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{EtlError, Result};
