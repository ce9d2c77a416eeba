//! Archive provider
//!
//! Streams the members of a local `.tar`, `.tar.gz` or `.tgz` file in archive
//! order. The archive is read sequentially in a blocking task; each accepted
//! member is buffered and handed over before the next one is read, so queue
//! backpressure reaches the reader.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::streaming::{Discover, EntrySender};
use super::{Entry, EntryFilter, ProviderError};
use crate::config::ConfigError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
}

fn default_recursive() -> bool {
    true
}

impl ArchiveConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField {
                context: "archive provider".to_string(),
                field: "path",
            });
        }
        EntryFilter::new(self.pattern.as_deref(), self.recursive)?;
        Ok(())
    }
}

/// [`Discover`] implementation for `archive`
pub struct ArchiveReader {
    path: PathBuf,
    gzip: bool,
}

impl ArchiveReader {
    pub fn from_config(config: &ArchiveConfig) -> Result<(Self, EntryFilter), ConfigError> {
        config.validate()?;
        let filter = EntryFilter::new(config.pattern.as_deref(), config.recursive)?;
        Ok((
            Self {
                path: config.path.clone(),
                gzip: false,
            },
            filter,
        ))
    }
}

fn is_gzip(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(read == 2 && magic == GZIP_MAGIC)
}

/// Read every member and offer the accepted ones in order
fn stream_members(
    path: &Path,
    gzip: bool,
    out: &EntrySender,
    runtime: &tokio::runtime::Handle,
) -> Result<(), ProviderError> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|e| ProviderError::io(display.clone(), e))?;
    let reader: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut archive = tar::Archive::new(reader);
    let members = archive
        .entries()
        .map_err(|e| ProviderError::Archive(format!("{}: {}", display, e)))?;

    for member in members {
        let mut member =
            member.map_err(|e| ProviderError::Archive(format!("{}: {}", display, e)))?;

        if member.header().entry_type().is_dir() {
            continue;
        }

        let member_path = match member.path() {
            Ok(p) => p.to_string_lossy().trim_start_matches("./").to_string(),
            Err(e) => {
                out.skip(&display, ProviderError::Archive(e.to_string()));
                continue;
            },
        };
        if !out.recursive() && member_path.contains('/') {
            continue;
        }

        let name = member_path
            .rsplit('/')
            .next()
            .unwrap_or(&member_path)
            .to_string();
        if !out.accepts(&name) {
            continue;
        }

        let mut contents = Vec::with_capacity(member.size() as usize);
        if let Err(e) = member.read_to_end(&mut contents) {
            out.skip(&member_path, ProviderError::io(member_path.clone(), e));
            continue;
        }
        debug!(member = %member_path, bytes = contents.len(), "Read archive member");

        let entry = Entry::from_bytes(name, format!("{}!{}", display, member_path), contents);
        if !runtime.block_on(out.offer(entry)) {
            break;
        }
    }
    Ok(())
}

#[async_trait]
impl Discover for ArchiveReader {
    fn kind(&self) -> &'static str {
        "archive"
    }

    fn endpoint_id(&self) -> String {
        self.path.display().to_string()
    }

    async fn connect(&mut self) -> Result<(), ProviderError> {
        let path = self.path.clone();
        self.gzip = tokio::task::spawn_blocking(move || is_gzip(&path))
            .await
            .map_err(|e| ProviderError::Task(e.to_string()))?
            .map_err(|e| ProviderError::io(self.path.display().to_string(), e))?;
        Ok(())
    }

    async fn discover(&mut self, out: &EntrySender) -> Result<(), ProviderError> {
        let path = self.path.clone();
        let gzip = self.gzip;
        let out = out.clone();
        let runtime = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || stream_members(&path, gzip, &out, &runtime))
            .await
            .map_err(|e| ProviderError::Task(e.to_string()))?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{EndpointRegistry, EngineSettings, ProviderConfig};
    use crate::provider::{build, EntryProvider, ProviderContext};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_archive(path: &Path, gzip: bool, members: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let writer: Box<dyn std::io::Write> = if gzip {
            Box::new(GzEncoder::new(file, Compression::default()))
        } else {
            Box::new(file)
        };
        let mut builder = tar::Builder::new(writer);
        for (name, content) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().flush().unwrap();
    }

    fn ctx() -> ProviderContext {
        ProviderContext {
            endpoints: EndpointRegistry::new(),
            settings: EngineSettings::default(),
            artifact_dir: std::env::temp_dir(),
            instance_name: "dns/0-archive".to_string(),
        }
    }

    async fn names(config: ArchiveConfig) -> Vec<String> {
        let mut provider = build(&ProviderConfig::Archive(config), &ctx()).unwrap();
        provider.init().await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = provider.next().await {
            names.push(entry.path().rsplit('!').next().unwrap().to_string());
        }
        provider.close().await;
        names
    }

    #[tokio::test]
    async fn test_members_in_archive_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns.tar.gz");
        write_archive(
            &path,
            true,
            &[("b.csv", "1"), ("a.csv", "2"), ("nested/c.csv", "3"), ("notes.txt", "x")],
        );

        let all = names(ArchiveConfig {
            path: path.clone(),
            pattern: Some("*.csv".to_string()),
            recursive: true,
        })
        .await;
        assert_eq!(all, vec!["b.csv", "a.csv", "nested/c.csv"]);

        let top = names(ArchiveConfig {
            path,
            pattern: None,
            recursive: false,
        })
        .await;
        assert_eq!(top, vec!["b.csv", "a.csv", "notes.txt"]);
    }

    #[tokio::test]
    async fn test_plain_tar_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certs.tar");
        write_archive(&path, false, &[("fp.json", "{\"sha1\":\"ab\"}")]);

        let mut provider = build(
            &ProviderConfig::Archive(ArchiveConfig {
                path,
                pattern: None,
                recursive: true,
            }),
            &ctx(),
        )
        .unwrap();
        provider.init().await.unwrap();
        let entry = provider.next().await.unwrap();
        assert_eq!(entry.name(), "fp.json");
        assert_eq!(entry.read_all().await.unwrap(), b"{\"sha1\":\"ab\"}");
        provider.close().await;
    }

    #[tokio::test]
    async fn test_missing_archive_fails_init() {
        let mut provider = build(
            &ProviderConfig::Archive(ArchiveConfig {
                path: PathBuf::from("/nonexistent/scanetl/archive.tar"),
                pattern: None,
                recursive: true,
            }),
            &ctx(),
        )
        .unwrap();
        assert!(provider.init().await.is_err());
        provider.close().await;
    }
}
