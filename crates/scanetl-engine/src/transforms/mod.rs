//! Built-in transformation routines
//!
//! | name           | providers | sinks | records                               |
//! |----------------|-----------|-------|---------------------------------------|
//! | `jsonl_import` | ≥ 1       | ≥ 1   | one per JSON line, `record_type` param |
//! | `csv_import`   | ≥ 1       | ≥ 1   | one per CSV row, `record_type` param   |
//! | `copy`         | ≥ 1       | ≥ 1   | one `raw_entry` per entry              |

pub mod copy;
pub mod csv_import;
pub mod jsonl;

pub use copy::CopyEntries;
pub use csv_import::CsvImport;
pub use jsonl::JsonlImport;

use crate::orchestrator::{save_all, TransformError, TransformRegistry};
use crate::sink::{Record, RecordSink};

/// Records handed to the sinks per `save` call
pub(crate) const SAVE_CHUNK: usize = 512;

/// Registry holding every built-in routine
pub fn default_registry() -> TransformRegistry {
    TransformRegistry::new()
        .with(JsonlImport)
        .with(CsvImport)
        .with(CopyEntries)
}

/// Accumulates records and saves them to every sink in chunks
pub(crate) struct Chunked {
    records: Vec<Record>,
    saved: u64,
}

impl Chunked {
    pub(crate) fn new() -> Self {
        Self {
            records: Vec::with_capacity(SAVE_CHUNK),
            saved: 0,
        }
    }

    pub(crate) async fn push(
        &mut self,
        sinks: &[Box<dyn RecordSink>],
        record: Record,
    ) -> Result<(), TransformError> {
        self.records.push(record);
        if self.records.len() >= SAVE_CHUNK {
            self.flush(sinks).await?;
        }
        Ok(())
    }

    pub(crate) async fn flush(
        &mut self,
        sinks: &[Box<dyn RecordSink>],
    ) -> Result<(), TransformError> {
        if self.records.is_empty() {
            return Ok(());
        }
        let records = std::mem::replace(&mut self.records, Vec::with_capacity(SAVE_CHUNK));
        self.saved += records.len() as u64;
        save_all(sinks, records).await?;
        Ok(())
    }

    pub(crate) fn saved(&self) -> u64 {
        self.saved
    }
}
