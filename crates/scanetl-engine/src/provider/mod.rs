//! Entry providers
//!
//! A provider turns one external data carrier (FTP tree, HTTP listing, remote
//! script, archive, database query) into a lazy, single-pass sequence of
//! [`Entry`] handles. Every variant shares the same lifecycle:
//!
//! ```text
//! init() ──> next()* ──> None (exhausted, forever) ──> close()
//! ```
//!
//! `init` connects and spawns one producer task that fills a bounded queue;
//! `next` is the only place a stage waits on discovery.
//!
//! # Variants
//!
//! - **remote_fs**: depth-first walk of an FTP or local directory tree
//! - **http**: single resource or recursive crawl of HTML listings
//! - **remote_command**: script executed over ssh (or locally), stdout captured
//! - **archive**: members of a tar / tar.gz file
//! - **query_export**: PostgreSQL queries exported as JSON lines

pub mod archive;
pub mod command;
pub mod filter;
pub mod ftp;
pub mod http;
pub mod query;
pub mod remote_fs;
pub mod streaming;

use async_trait::async_trait;
use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{ConfigError, EndpointRegistry, EngineSettings, ProviderConfig};

pub use filter::{EntryFilter, NamePattern};
pub use streaming::{Discover, EntrySender, StreamingProvider};

/// Errors raised by providers and entries
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider `{0}` was already initialized")]
    AlreadyInitialized(String),

    #[error("entry `{0}` is closed")]
    EntryClosed(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("FTP error: {0}")]
    Ftp(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProviderError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ProviderError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Byte stream returned by [`Entry::open`]
pub type EntryReader = Pin<Box<dyn AsyncRead + Send>>;

/// Knows how to (re)open the bytes behind one entry
#[async_trait]
pub trait EntryOpener: Send + Sync {
    async fn open(&self) -> Result<EntryReader, ProviderError>;
}

/// Entry content already held in memory
pub struct BytesOpener(Arc<Vec<u8>>);

impl BytesOpener {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(bytes))
    }
}

#[async_trait]
impl EntryOpener for BytesOpener {
    async fn open(&self) -> Result<EntryReader, ProviderError> {
        Ok(Box::pin(Cursor::new(self.0.as_ref().clone())))
    }
}

/// Entry content in a local file
pub struct FileOpener(PathBuf);

impl FileOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }
}

#[async_trait]
impl EntryOpener for FileOpener {
    async fn open(&self) -> Result<EntryReader, ProviderError> {
        let file = tokio::fs::File::open(&self.0)
            .await
            .map_err(|e| ProviderError::io(self.0.display().to_string(), e))?;
        Ok(Box::pin(file))
    }
}

/// Handle to one retrievable unit
///
/// `name` and `path` stay readable after [`Entry::close`] so the entry can
/// still be identified in logs.
pub struct Entry {
    name: String,
    path: String,
    size: Option<u64>,
    opener: Option<Box<dyn EntryOpener>>,
}

impl Entry {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        opener: impl EntryOpener + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size: None,
            opener: Some(Box::new(opener)),
        }
    }

    /// In-memory entry, mostly for command output and tests
    pub fn from_bytes(name: impl Into<String>, path: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self::new(name, path, BytesOpener::new(bytes)).with_size(size)
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hierarchical location hint (remote path, URL, archive member path)
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.opener.is_none()
    }

    pub async fn open(&self) -> Result<EntryReader, ProviderError> {
        match &self.opener {
            Some(opener) => opener.open().await,
            None => Err(ProviderError::EntryClosed(self.path.clone())),
        }
    }

    /// Open the entry and read it to the end
    pub async fn read_all(&self) -> Result<Vec<u8>, ProviderError> {
        let mut reader = self.open().await?;
        let mut buf = Vec::with_capacity(self.size.unwrap_or(0).min(64 * 1024 * 1024) as usize);
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| ProviderError::io(self.path.clone(), e))?;
        Ok(buf)
    }

    /// Release whatever session the opener holds
    pub fn close(&mut self) {
        self.opener = None;
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("size", &self.size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Provider lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    NotStarted,
    Streaming,
    Exhausted,
    Closed,
}

/// Uniform lazy sequence over one external data carrier
#[async_trait]
pub trait EntryProvider: Send {
    /// Stable across runs for the same physical endpoint
    fn id(&self) -> &str;

    /// Instance name used in logs; distinguishes runs and stages
    fn name(&self) -> &str;

    fn state(&self) -> ProviderState;

    /// Connect and start discovery. Call exactly once.
    async fn init(&mut self) -> Result<(), ProviderError>;

    /// Next entry, or `None` once discovery is exhausted
    async fn next(&mut self) -> Option<Entry>;

    /// Release the session. Idempotent, bounded in time.
    async fn close(&mut self);

    /// Per-entry and discovery failures recorded while streaming
    fn errors(&self) -> Vec<String>;

    /// Files worth attaching to a run report
    fn output_paths(&self) -> Vec<PathBuf>;
}

/// Everything a provider needs besides its own config
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub endpoints: EndpointRegistry,
    pub settings: EngineSettings,
    /// Directory for this provider's artifacts
    pub artifact_dir: PathBuf,
    /// Instance name, e.g. `masscan/0-remote_fs`
    pub instance_name: String,
}

/// Validate a provider config without connecting to anything
pub fn validate(config: &ProviderConfig, endpoints: &EndpointRegistry) -> Result<(), ConfigError> {
    match config {
        ProviderConfig::RemoteFs(c) => c.validate(endpoints),
        ProviderConfig::Http(c) => c.validate(),
        ProviderConfig::RemoteCommand(c) => c.validate(endpoints),
        ProviderConfig::Archive(c) => c.validate(),
        ProviderConfig::QueryExport(c) => c.validate(endpoints),
    }
}

/// Resolve a provider config into a ready-to-init provider
pub fn build(
    config: &ProviderConfig,
    ctx: &ProviderContext,
) -> Result<Box<dyn EntryProvider>, ConfigError> {
    let provider: Box<dyn EntryProvider> = match config {
        ProviderConfig::RemoteFs(c) => {
            let (discoverer, filter) = remote_fs::RemoteFsWalker::from_config(c, &ctx.endpoints)?;
            Box::new(StreamingProvider::new(discoverer, filter, ctx))
        },
        ProviderConfig::Http(c) => {
            let (discoverer, filter) = http::HttpCrawler::from_config(c)?;
            Box::new(StreamingProvider::new(discoverer, filter, ctx))
        },
        ProviderConfig::RemoteCommand(c) => {
            let discoverer = command::RemoteCommand::from_config(c, ctx)?;
            Box::new(StreamingProvider::new(discoverer, EntryFilter::all(), ctx))
        },
        ProviderConfig::Archive(c) => {
            let (discoverer, filter) = archive::ArchiveReader::from_config(c)?;
            Box::new(StreamingProvider::new(discoverer, filter, ctx))
        },
        ProviderConfig::QueryExport(c) => {
            let discoverer = query::QueryExporter::from_config(c, &ctx.endpoints)?;
            Box::new(StreamingProvider::new(discoverer, EntryFilter::all(), ctx))
        },
    };
    Ok(provider)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entry_read_and_close() {
        let mut entry = Entry::from_bytes("a.txt", "/data/a.txt", b"hello".to_vec());
        assert_eq!(entry.size(), Some(5));
        assert_eq!(entry.read_all().await.unwrap(), b"hello");
        // entries can be reopened until closed
        assert_eq!(entry.read_all().await.unwrap(), b"hello");

        entry.close();
        assert!(entry.is_closed());
        assert_eq!(entry.name(), "a.txt");
        assert!(matches!(
            entry.open().await,
            Err(ProviderError::EntryClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_file_opener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let entry = Entry::new("f.bin", path.display().to_string(), FileOpener::new(&path));
        assert_eq!(entry.read_all().await.unwrap(), vec![1, 2, 3]);
    }
}
