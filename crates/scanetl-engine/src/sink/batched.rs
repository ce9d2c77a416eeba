//! Batched fan-out sink
//!
//! [`BatchedSink`] implements [`RecordSink`] on top of any [`BatchWriter`].
//! The lane map sits behind one short-lived guard used only to look up,
//! create and remove lanes; records travel through the lanes' bounded queues
//! without holding it.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::lane::{Lane, LaneStats};
use super::{Record, RecordSink, SinkContext, SinkError, SinkMessage};
use crate::config::settings::{DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL_SECS};
use crate::config::EngineSettings;

/// Destination half of a batched sink
#[async_trait]
pub trait BatchWriter: Send + Sync + 'static {
    /// Per-lane target resolved once, when the lane is created
    type Lane: Send + Sync + 'static;

    fn kind(&self) -> &'static str;

    /// Acquire the destination connection
    async fn open(&self) -> Result<(), SinkError>;

    /// Resolve where records of `output_id` go
    fn lane(&self, output_id: &str, type_name: &str) -> Result<Self::Lane, SinkError>;

    /// Write one batch; returns the number of rows the destination accepted
    async fn write_batch(&self, lane: &Self::Lane, batch: &[Record]) -> Result<u64, SinkError>;

    /// Release the destination connection once every lane has drained
    async fn close(&self) -> Result<(), SinkError>;

    fn output_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Flush policy shared by all lanes of one sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Hold a sink-wide lock around every flush
    pub serialize_writes: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            serialize_writes: false,
        }
    }
}

impl BatchOptions {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            flush_interval: settings.flush_interval(),
            serialize_writes: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_serialized_writes(mut self, serialize: bool) -> Self {
        self.serialize_writes = serialize;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Idle,
    Running,
    Finishing,
    Finished,
}

struct LaneHandle {
    tx: mpsc::Sender<Record>,
    task: JoinHandle<LaneStats>,
}

struct Inner {
    state: SinkState,
    active: HashMap<String, LaneHandle>,
    retired: HashSet<String>,
}

pub struct BatchedSink<W: BatchWriter> {
    name: String,
    writer: Arc<W>,
    options: BatchOptions,
    inner: Mutex<Inner>,
    write_lock: Option<Arc<tokio::sync::Mutex<()>>>,
    errors: Arc<Mutex<Vec<SinkError>>>,
    error_log: PathBuf,
    error_log_written: Mutex<bool>,
}

impl<W: BatchWriter> BatchedSink<W> {
    pub fn new(ctx: &SinkContext, writer: W, options: BatchOptions) -> Self {
        let options = BatchOptions {
            batch_size: options.batch_size.max(1),
            ..options
        };
        Self {
            name: ctx.instance_name.clone(),
            writer: Arc::new(writer),
            write_lock: options
                .serialize_writes
                .then(|| Arc::new(tokio::sync::Mutex::new(()))),
            options,
            inner: Mutex::new(Inner {
                state: SinkState::Idle,
                active: HashMap::new(),
                retired: HashSet::new(),
            }),
            errors: Arc::new(Mutex::new(Vec::new())),
            error_log: ctx
                .artifact_dir
                .join(format!("{}-errors.log", crate::file_safe(&ctx.instance_name))),
            error_log_written: Mutex::new(false),
        }
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, Inner>, SinkError> {
        self.inner
            .lock()
            .map_err(|_| SinkError::Internal(format!("lane map of `{}` is poisoned", self.name)))
    }

    fn push_error(&self, err: SinkError) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(err);
        }
    }

    /// Sender of the record's lane, creating the lane on first use
    fn lane_sender(&self, record: &Record) -> Result<mpsc::Sender<Record>, SinkError> {
        let mut inner = self.lock_inner()?;
        match inner.state {
            SinkState::Running => {},
            SinkState::Idle => return Err(SinkError::NotStarted(self.name.clone())),
            SinkState::Finishing | SinkState::Finished => {
                return Err(SinkError::Finished(self.name.clone()))
            },
        }

        let output_id = record.output_id();
        if let Some(handle) = inner.active.get(output_id) {
            return Ok(handle.tx.clone());
        }
        if inner.retired.contains(output_id) {
            return Err(SinkError::LaneRetired(output_id.to_string()));
        }

        let target = self.writer.lane(output_id, record.type_name())?;
        let handle = self.spawn_lane(output_id.to_string(), target);
        let tx = handle.tx.clone();
        inner.active.insert(output_id.to_string(), handle);
        Ok(tx)
    }

    fn spawn_lane(&self, output_id: String, target: W::Lane) -> LaneHandle {
        debug!(sink = %self.name, output_id = %output_id, "Opening lane");
        let (tx, rx) = mpsc::channel(self.options.batch_size);
        let span = info_span!("lane", sink = %self.name, output_id = %output_id);
        let lane = Lane {
            output_id,
            target,
            writer: self.writer.clone(),
            batch_size: self.options.batch_size,
            flush_interval: self.options.flush_interval,
            write_lock: self.write_lock.clone(),
            errors: self.errors.clone(),
        };
        let task = tokio::spawn(lane.drain(rx).instrument(span));
        LaneHandle { tx, task }
    }

    async fn join_lane(&self, output_id: &str, task: JoinHandle<LaneStats>) -> Option<LaneStats> {
        match task.await {
            Ok(stats) => Some(stats),
            Err(e) => {
                error!(sink = %self.name, output_id = %output_id, error = %e, "Lane task failed");
                self.push_error(SinkError::LaneGone(output_id.to_string()));
                None
            },
        }
    }

    async fn write_error_log(&self) {
        let lines: Vec<String> = self.errors();
        if lines.is_empty() {
            return;
        }
        if let Some(parent) = self.error_log.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %parent.display(), error = %e, "Cannot create artifact directory");
                return;
            }
        }
        let mut content = lines.join("\n");
        content.push('\n');
        match tokio::fs::write(&self.error_log, content).await {
            Ok(()) => {
                if let Ok(mut written) = self.error_log_written.lock() {
                    *written = true;
                }
            },
            Err(e) => warn!(path = %self.error_log.display(), error = %e, "Cannot write error log"),
        }
    }
}

#[async_trait]
impl<W: BatchWriter> RecordSink for BatchedSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), SinkError> {
        if self.lock_inner()?.state != SinkState::Idle {
            return Err(SinkError::AlreadyStarted(self.name.clone()));
        }

        info!(
            sink = %self.name,
            kind = self.writer.kind(),
            batch_size = self.options.batch_size,
            serialize_writes = self.options.serialize_writes,
            "Starting sink"
        );
        self.writer.open().await?;
        self.lock_inner()?.state = SinkState::Running;
        Ok(())
    }

    async fn save(&self, records: Vec<Record>) -> Result<(), SinkError> {
        for record in records {
            let tx = self.lane_sender(&record)?;
            tx.send(record)
                .await
                .map_err(|e| SinkError::LaneGone(e.0.output_id().to_string()))?;
        }
        Ok(())
    }

    async fn send_message(&self, message: SinkMessage) -> Result<(), SinkError> {
        match message {
            SinkMessage::CloseLane(output_id) => {
                let handle = {
                    let mut inner = self.lock_inner()?;
                    match inner.active.remove(&output_id) {
                        Some(handle) => {
                            inner.retired.insert(output_id.clone());
                            handle
                        },
                        None => {
                            debug!(sink = %self.name, output_id = %output_id, "No open lane to close");
                            return Ok(());
                        },
                    }
                };

                drop(handle.tx);
                if let Some(stats) = self.join_lane(&output_id, handle.task).await {
                    debug!(
                        sink = %self.name,
                        output_id = %output_id,
                        records = stats.records,
                        "Lane closed"
                    );
                }
                Ok(())
            },
        }
    }

    async fn finish(&self) -> Result<(), SinkError> {
        let lanes = {
            let mut inner = self.lock_inner()?;
            match inner.state {
                SinkState::Running => {},
                SinkState::Idle => {
                    inner.state = SinkState::Finished;
                    return Ok(());
                },
                SinkState::Finishing | SinkState::Finished => return Ok(()),
            }
            inner.state = SinkState::Finishing;
            std::mem::take(&mut inner.active)
        };

        info!(sink = %self.name, lanes = lanes.len(), "Finishing sink");

        // Drop every sender first so all lanes drain concurrently
        let pending: Vec<(String, JoinHandle<LaneStats>)> = lanes
            .into_iter()
            .map(|(output_id, LaneHandle { tx, task })| {
                drop(tx);
                (output_id, task)
            })
            .collect();

        let mut records = 0;
        let mut failed_batches = 0;
        for (output_id, task) in pending {
            if let Some(stats) = self.join_lane(&output_id, task).await {
                records += stats.records;
                failed_batches += stats.failed_batches;
            }
        }

        let result = self.writer.close().await;
        if let Err(e) = &result {
            error!(sink = %self.name, error = %e, "Failed to close destination");
        }

        self.write_error_log().await;
        self.lock_inner()?.state = SinkState::Finished;
        info!(sink = %self.name, records, failed_batches, "Sink finished");
        result
    }

    fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .map(|errors| errors.iter().map(|e| e.to_string()).collect())
            .unwrap_or_default()
    }

    fn output_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.writer.output_paths();
        if self.error_log_written.lock().map(|w| *w).unwrap_or(false) {
            paths.push(self.error_log.clone());
        }
        paths
    }
}
