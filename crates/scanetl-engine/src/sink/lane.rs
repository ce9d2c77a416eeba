//! Batching lane drain loop
//!
//! One task per output identifier. It owns the lane's accumulator and is the
//! only code that calls the writer for that lane, so records of one id are
//! written in enqueue order. Flush triggers:
//! - the accumulator reaches the batch size
//! - the idle ticker finds records older than the flush interval
//! - the queue closes (close-lane message or sink finish)

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, trace};

use super::{BatchWriter, Record, SinkError};

/// Per-lane counters, reported when the lane ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaneStats {
    pub output_id: String,
    pub records: u64,
    pub batches: u64,
    pub failed_batches: u64,
    /// Rows the destination reported as written
    pub rows_written: u64,
}

pub(crate) struct Lane<W: BatchWriter> {
    pub output_id: String,
    pub target: W::Lane,
    pub writer: Arc<W>,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Sink-wide lock, present only when writes are serialized
    pub write_lock: Option<Arc<tokio::sync::Mutex<()>>>,
    pub errors: Arc<Mutex<Vec<SinkError>>>,
}

impl<W: BatchWriter> Lane<W> {
    pub(crate) async fn drain(self, mut rx: mpsc::Receiver<Record>) -> LaneStats {
        let mut stats = LaneStats {
            output_id: self.output_id.clone(),
            ..Default::default()
        };
        let mut buffer: Vec<Record> = Vec::with_capacity(self.batch_size);
        let mut oldest: Option<Instant> = None;

        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(record) => {
                        if buffer.is_empty() {
                            oldest = Some(Instant::now());
                        }
                        buffer.push(record);
                        stats.records += 1;
                        if buffer.len() >= self.batch_size {
                            self.flush(&mut buffer, &mut stats).await;
                            oldest = None;
                        }
                    },
                    None => {
                        self.flush(&mut buffer, &mut stats).await;
                        break;
                    },
                },
                _ = ticker.tick() => {
                    let idle = oldest.is_some_and(|t| t.elapsed() >= self.flush_interval);
                    if idle && !buffer.is_empty() {
                        trace!(records = buffer.len(), "Idle flush");
                        self.flush(&mut buffer, &mut stats).await;
                        oldest = None;
                    }
                },
            }
        }

        debug!(
            records = stats.records,
            batches = stats.batches,
            failed = stats.failed_batches,
            "Lane drained"
        );
        stats
    }

    async fn flush(&self, buffer: &mut Vec<Record>, stats: &mut LaneStats) {
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(buffer, Vec::with_capacity(self.batch_size));

        let _guard = match &self.write_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        match self.writer.write_batch(&self.target, &batch).await {
            Ok(rows) => {
                stats.batches += 1;
                stats.rows_written += rows;
                trace!(records = batch.len(), rows, "Batch written");
            },
            Err(e) => {
                stats.failed_batches += 1;
                error!(records = batch.len(), error = %e, "Batch write failed, dropping batch");
                if let Ok(mut errors) = self.errors.lock() {
                    errors.push(SinkError::Flush {
                        output_id: self.output_id.clone(),
                        records: batch.len(),
                        message: e.to_string(),
                    });
                }
            },
        }
    }
}
