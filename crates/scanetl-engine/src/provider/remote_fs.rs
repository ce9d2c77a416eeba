//! Remote filesystem walker
//!
//! Depth-first walk of a directory tree on an FTP server or a local endpoint.
//! Names are sorted within each directory, so the walk order is stable for a
//! given tree. FTP entries open a fresh download session each time they are
//! read; the walk itself never holds file contents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::ftp::FtpClient;
use super::streaming::{Discover, EntrySender};
use super::{Entry, EntryFilter, EntryOpener, EntryReader, FileOpener, ProviderError};
use crate::config::{ConfigError, Endpoint, EndpointRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFsConfig {
    pub endpoint: String,
    pub root: String,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
}

fn default_recursive() -> bool {
    true
}

impl RemoteFsConfig {
    pub fn validate(&self, endpoints: &EndpointRegistry) -> Result<(), ConfigError> {
        if self.root.trim().is_empty() {
            return Err(ConfigError::MissingField {
                context: format!("remote_fs provider on `{}`", self.endpoint),
                field: "root",
            });
        }
        EntryFilter::new(self.pattern.as_deref(), self.recursive)?;
        match endpoints.get(&self.endpoint)? {
            Endpoint::Local { .. } => Ok(()),
            Endpoint::Ftp { .. } => endpoints.ftp_config(&self.endpoint).map(|_| ()),
            other => Err(ConfigError::EndpointKind {
                endpoint: self.endpoint.clone(),
                expected: "ftp or local",
                actual: other.kind_name(),
            }),
        }
    }
}

enum Backend {
    Local(PathBuf),
    Ftp(FtpClient),
}

/// One node of the pending walk
struct Pending {
    path: String,
    is_dir: bool,
    size: Option<u64>,
}

/// [`Discover`] implementation for `remote_fs`
pub struct RemoteFsWalker {
    endpoint: String,
    root: String,
    backend: Backend,
}

impl RemoteFsWalker {
    pub fn from_config(
        config: &RemoteFsConfig,
        endpoints: &EndpointRegistry,
    ) -> Result<(Self, EntryFilter), ConfigError> {
        config.validate(endpoints)?;
        let filter = EntryFilter::new(config.pattern.as_deref(), config.recursive)?;

        let backend = match endpoints.get(&config.endpoint)? {
            Endpoint::Local { root } => Backend::Local(root.clone()),
            _ => Backend::Ftp(FtpClient::new(endpoints.ftp_config(&config.endpoint)?)),
        };

        Ok((
            Self {
                endpoint: config.endpoint.clone(),
                root: config.root.clone(),
                backend,
            },
            filter,
        ))
    }

    /// Absolute local path of a walk path under a local endpoint
    fn local_path(base: &Path, path: &str) -> PathBuf {
        base.join(path.trim_start_matches('/'))
    }

    async fn children(&self, dir: &str) -> Result<Vec<Pending>, ProviderError> {
        let mut children = match &self.backend {
            Backend::Local(base) => {
                let local = Self::local_path(base, dir);
                let mut read_dir = tokio::fs::read_dir(&local)
                    .await
                    .map_err(|e| ProviderError::io(local.display().to_string(), e))?;
                let mut children = Vec::new();
                while let Some(child) = read_dir
                    .next_entry()
                    .await
                    .map_err(|e| ProviderError::io(local.display().to_string(), e))?
                {
                    let name = child.file_name().to_string_lossy().into_owned();
                    // follows symlinks
                    let metadata = match tokio::fs::metadata(child.path()).await {
                        Ok(metadata) => metadata,
                        Err(e) => {
                            warn!(
                                path = %child.path().display(),
                                error = %e,
                                "Skipping unreadable entry"
                            );
                            continue;
                        },
                    };
                    children.push(Pending {
                        path: join(dir, &name),
                        is_dir: metadata.is_dir(),
                        size: Some(metadata.len()),
                    });
                }
                children
            },
            Backend::Ftp(client) => client
                .list(dir)
                .await?
                .into_iter()
                .map(|listing| Pending {
                    path: join(dir, &listing.name),
                    is_dir: listing.is_directory,
                    size: listing.size,
                })
                .collect(),
        };

        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }

    fn entry(&self, node: &Pending) -> Entry {
        let name = file_name(&node.path);
        let entry = match &self.backend {
            Backend::Local(base) => {
                let local = Self::local_path(base, &node.path);
                Entry::new(name, node.path.clone(), FileOpener::new(local))
            },
            Backend::Ftp(client) => Entry::new(
                name,
                node.path.clone(),
                FtpOpener {
                    client: client.clone(),
                    path: node.path.clone(),
                },
            ),
        };
        match node.size {
            Some(size) => entry.with_size(size),
            None => entry,
        }
    }
}

#[async_trait]
impl Discover for RemoteFsWalker {
    fn kind(&self) -> &'static str {
        "remote_fs"
    }

    fn endpoint_id(&self) -> String {
        format!("{}:{}", self.endpoint, self.root)
    }

    async fn connect(&mut self) -> Result<(), ProviderError> {
        match &self.backend {
            Backend::Local(base) => {
                let root = Self::local_path(base, &self.root);
                tokio::fs::metadata(&root)
                    .await
                    .map_err(|e| ProviderError::io(root.display().to_string(), e))?;
                Ok(())
            },
            Backend::Ftp(client) => {
                info!(
                    host = %client.config().host,
                    port = client.config().port,
                    "Connecting to FTP endpoint"
                );
                client.check().await
            },
        }
    }

    async fn discover(&mut self, out: &EntrySender) -> Result<(), ProviderError> {
        let root_is_dir = match &self.backend {
            Backend::Local(base) => Self::local_path(base, &self.root).is_dir(),
            Backend::Ftp(_) => true,
        };

        if !root_is_dir {
            let node = Pending {
                path: self.root.clone(),
                is_dir: false,
                size: None,
            };
            out.offer(self.entry(&node)).await;
            return Ok(());
        }

        // Explicit stack instead of recursion; children are pushed in reverse
        // so they pop in sorted order.
        let mut stack = vec![Pending {
            path: self.root.clone(),
            is_dir: true,
            size: None,
        }];
        let mut depth_root = true;

        while let Some(node) = stack.pop() {
            if !node.is_dir {
                if !out.offer(self.entry(&node)).await {
                    debug!("Consumer closed, stopping walk");
                    return Ok(());
                }
                continue;
            }

            if !depth_root && !out.recursive() {
                continue;
            }
            depth_root = false;

            match self.children(&node.path).await {
                Ok(children) => {
                    debug!(dir = %node.path, count = children.len(), "Listed directory");
                    stack.extend(children.into_iter().rev());
                },
                Err(e) => out.skip(&node.path, e),
            }

            if out.is_closed() {
                return Ok(());
            }
        }

        Ok(())
    }
}

/// Downloads an FTP file on every open
struct FtpOpener {
    client: FtpClient,
    path: String,
}

#[async_trait]
impl EntryOpener for FtpOpener {
    async fn open(&self) -> Result<EntryReader, ProviderError> {
        let data = self.client.download(&self.path).await?;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn file_name(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}
