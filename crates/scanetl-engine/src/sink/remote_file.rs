//! CSV file destination
//!
//! Each output identifier gets its own CSV file staged under the artifact
//! directory. When the sink finishes, staged files are copied to a local
//! endpoint or uploaded to an FTP endpoint under the configured path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BatchOptions, BatchWriter, Record, SinkContext, SinkError};
use crate::config::{ConfigError, Endpoint, EndpointRegistry};
use crate::provider::ftp::FtpClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileSinkConfig {
    pub endpoint: String,
    /// Destination directory on the endpoint
    pub path: String,
    /// `output id or type name -> [[field, column header], ...]`
    #[serde(default)]
    pub columns: BTreeMap<String, Vec<(String, String)>>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub flush_interval_secs: Option<u64>,
    /// Write and fsync every record as it arrives
    #[serde(default)]
    pub force_flush: bool,
}

impl RemoteFileSinkConfig {
    pub fn validate(&self, endpoints: &EndpointRegistry) -> Result<(), ConfigError> {
        if self.path.trim().is_empty() {
            return Err(ConfigError::MissingField {
                context: format!("remote_file sink on `{}`", self.endpoint),
                field: "path",
            });
        }
        if self.batch_size == Some(0) {
            return Err(ConfigError::Invalid {
                key: "batch_size".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
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

    pub fn options(&self, ctx: &SinkContext) -> BatchOptions {
        let mut options = BatchOptions::from_settings(&ctx.settings);
        if let Some(batch_size) = self.batch_size {
            options = options.with_batch_size(batch_size);
        }
        if let Some(secs) = self.flush_interval_secs {
            options = options.with_flush_interval(Duration::from_secs(secs));
        }
        if self.force_flush {
            options = options.with_batch_size(1);
        }
        options
    }
}

enum Destination {
    Local(PathBuf),
    Ftp(FtpClient),
}

/// Open CSV file of one lane plus the fields in column order
struct OpenCsv {
    writer: csv::Writer<File>,
    fields: Vec<String>,
    /// Header came from the data, not a column map
    inferred: bool,
    warned_unlisted: bool,
}

pub struct CsvLane {
    path: PathBuf,
    columns: Option<Vec<(String, String)>>,
    file: Mutex<Option<OpenCsv>>,
}

pub struct FileBatchWriter {
    endpoint: String,
    destination: Destination,
    remote_dir: String,
    staging_dir: PathBuf,
    columns: BTreeMap<String, Vec<(String, String)>>,
    force_flush: bool,
    staged: Mutex<Vec<PathBuf>>,
}

impl FileBatchWriter {
    pub fn from_config(
        config: &RemoteFileSinkConfig,
        ctx: &SinkContext,
    ) -> Result<(Self, BatchOptions), ConfigError> {
        config.validate(&ctx.endpoints)?;
        let destination = match ctx.endpoints.get(&config.endpoint)? {
            Endpoint::Local { root } => Destination::Local(root.clone()),
            _ => Destination::Ftp(FtpClient::new(ctx.endpoints.ftp_config(&config.endpoint)?)),
        };

        let writer = Self {
            endpoint: config.endpoint.clone(),
            destination,
            remote_dir: config.path.clone(),
            staging_dir: ctx.artifact_dir.join(crate::file_safe(&ctx.instance_name)),
            columns: config.columns.clone(),
            force_flush: config.force_flush,
            staged: Mutex::new(Vec::new()),
        };
        Ok((writer, config.options(ctx)))
    }

    /// Reserve the staged file of a new lane. Ids that sanitize to the same
    /// name get a numeric suffix so no lane truncates another's file.
    fn claim_staged_path(&self, output_id: &str) -> Result<PathBuf, SinkError> {
        let mut staged = self
            .staged
            .lock()
            .map_err(|_| SinkError::Internal("staged file list poisoned".to_string()))?;

        let base = crate::file_safe(output_id);
        let mut path = self.staging_dir.join(format!("{}.csv", base));
        let mut suffix = 1;
        while staged.contains(&path) {
            suffix += 1;
            path = self.staging_dir.join(format!("{}-{}.csv", base, suffix));
        }
        if suffix > 1 {
            warn!(
                output_id,
                file = %path.display(),
                "Staged file name already taken, using a suffix"
            );
        }
        staged.push(path.clone());
        Ok(path)
    }

    fn staged_files(&self) -> Vec<PathBuf> {
        self.staged
            .lock()
            .map(|staged| staged.iter().filter(|p| p.exists()).cloned().collect())
            .unwrap_or_default()
    }

    async fn deliver(&self, staged: &Path) -> Result<(), SinkError> {
        let file_name = staged
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match &self.destination {
            Destination::Local(root) => {
                let dir = root.join(self.remote_dir.trim_start_matches('/'));
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| SinkError::io(dir.display().to_string(), e))?;
                let target = dir.join(&file_name);
                tokio::fs::copy(staged, &target)
                    .await
                    .map_err(|e| SinkError::io(target.display().to_string(), e))?;
                debug!(target = %target.display(), "Copied staged file");
            },
            Destination::Ftp(client) => {
                let data = tokio::fs::read(staged)
                    .await
                    .map_err(|e| SinkError::io(staged.display().to_string(), e))?;
                let remote = format!("{}/{}", self.remote_dir.trim_end_matches('/'), file_name);
                let bytes = client.upload(&remote, data).await?;
                debug!(remote = %remote, bytes, "Uploaded staged file");
            },
        }
        Ok(())
    }
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn write_rows(lane: &CsvLane, batch: &[Record], sync: bool) -> Result<u64, SinkError> {
    let mut file = lane
        .file
        .lock()
        .map_err(|_| SinkError::Internal(format!("{} writer poisoned", lane.path.display())))?;

    if file.is_none() {
        let (fields, header): (Vec<String>, Vec<String>) = match &lane.columns {
            Some(columns) => columns.iter().cloned().unzip(),
            None => {
                let fields: Vec<String> = batch
                    .iter()
                    .flat_map(|r| r.fields().keys().cloned())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                (fields.clone(), fields)
            },
        };
        let handle = File::create(&lane.path)
            .map_err(|e| SinkError::io(lane.path.display().to_string(), e))?;
        let mut writer = csv::Writer::from_writer(handle);
        writer.write_record(&header)?;
        *file = Some(OpenCsv {
            writer,
            fields,
            inferred: lane.columns.is_none(),
            warned_unlisted: false,
        });
    }

    let Some(open) = file.as_mut() else {
        return Ok(0);
    };
    for record in batch {
        if open.inferred && !open.warned_unlisted {
            if let Some(field) = record.fields().keys().find(|k| !open.fields.contains(*k)) {
                warn!(
                    file = %lane.path.display(),
                    field = %field,
                    "Field missing from the CSV header is not written"
                );
                open.warned_unlisted = true;
            }
        }
        let row: Vec<String> = open.fields.iter().map(|f| cell(record.get(f))).collect();
        open.writer.write_record(&row)?;
    }
    open.writer
        .flush()
        .map_err(|e| SinkError::io(lane.path.display().to_string(), e))?;
    if sync {
        open.writer
            .get_ref()
            .sync_all()
            .map_err(|e| SinkError::io(lane.path.display().to_string(), e))?;
    }
    Ok(batch.len() as u64)
}

#[async_trait]
impl BatchWriter for FileBatchWriter {
    type Lane = CsvLane;

    fn kind(&self) -> &'static str {
        "remote_file"
    }

    async fn open(&self) -> Result<(), SinkError> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| SinkError::io(self.staging_dir.display().to_string(), e))?;
        if let Destination::Ftp(client) = &self.destination {
            client.check().await?;
        }
        info!(
            endpoint = %self.endpoint,
            staging = %self.staging_dir.display(),
            "File sink ready"
        );
        Ok(())
    }

    fn lane(&self, output_id: &str, type_name: &str) -> Result<CsvLane, SinkError> {
        let path = self.claim_staged_path(output_id)?;
        Ok(CsvLane {
            path,
            columns: self
                .columns
                .get(output_id)
                .or_else(|| self.columns.get(type_name))
                .cloned(),
            file: Mutex::new(None),
        })
    }

    async fn write_batch(&self, lane: &CsvLane, batch: &[Record]) -> Result<u64, SinkError> {
        write_rows(lane, batch, self.force_flush)
    }

    async fn close(&self) -> Result<(), SinkError> {
        let mut first_error = None;
        for staged in self.staged_files() {
            if let Err(e) = self.deliver(&staged).await {
                warn!(file = %staged.display(), error = %e, "Failed to deliver staged file");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn output_paths(&self) -> Vec<PathBuf> {
        self.staged_files()
    }
}
