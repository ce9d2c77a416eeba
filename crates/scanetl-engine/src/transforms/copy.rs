//! `copy`: every entry's bytes as one record
//!
//! Records carry `name`, `path`, `size` and `content`. Content is UTF-8 text
//! when it decodes, otherwise hex. `record_type` defaults to `raw_entry`.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::Chunked;
use crate::orchestrator::{Arity, Count, StageContext, Transform, TransformError};
use crate::sink::{Persistable, Record};

pub const DEFAULT_RECORD_TYPE: &str = "raw_entry";

pub struct CopyEntries;

#[derive(Debug, Serialize)]
pub struct RawEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub content: String,
}

impl Persistable for RawEntry {
    const TYPE_NAME: &'static str = DEFAULT_RECORD_TYPE;
}

fn encode_content(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => e
            .into_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect(),
    }
}

#[async_trait]
impl Transform for CopyEntries {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn arity(&self) -> Arity {
        Arity::new(Count::AtLeast(1), Count::AtLeast(1))
    }

    async fn run(&self, ctx: StageContext<'_>) -> Result<(), TransformError> {
        let StageContext {
            providers,
            sinks,
            params,
            ..
        } = ctx;
        let record_type = params.get_str("record_type");

        let mut chunk = Chunked::new();
        for provider in providers.iter_mut() {
            while let Some(mut entry) = provider.next().await {
                let bytes = match entry.read_all().await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(entry = %entry.path(), error = %e, "Skipping unreadable entry");
                        entry.close();
                        continue;
                    },
                };

                let raw = RawEntry {
                    name: entry.name().to_string(),
                    path: entry.path().to_string(),
                    size: bytes.len() as u64,
                    content: encode_content(bytes),
                };
                entry.close();

                let mut record = Record::from_persistable(&raw)?;
                if let Some(record_type) = record_type {
                    record = Record::new(record_type, record.fields().clone());
                }
                chunk.push(sinks, record).await?;
            }
        }

        chunk.flush(sinks).await?;
        info!(entries = chunk.saved(), "Entries copied");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Params;
    use crate::transforms::testing::{run, CollectSink, VecProvider};
    use serde_json::json;

    #[tokio::test]
    async fn test_entries_fan_out_to_every_sink() {
        let providers = vec![
            VecProvider::new(vec![("a.txt", "alpha")]),
            VecProvider::new(vec![("b.txt", "beta")]),
        ];
        let first = CollectSink::new();
        let second = CollectSink::new();

        run(
            &CopyEntries,
            providers,
            vec![first.clone(), second.clone()],
            &Params::new(),
        )
        .await
        .unwrap();

        for sink in [&first, &second] {
            let records = sink.records();
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].type_name(), "raw_entry");
            assert_eq!(records[0].get("name"), Some(&json!("a.txt")));
            assert_eq!(records[0].get("path"), Some(&json!("/a.txt")));
            assert_eq!(records[1].get("content"), Some(&json!("beta")));
            assert_eq!(records[1].get("size"), Some(&json!(4)));
        }
    }

    #[tokio::test]
    async fn test_record_type_override() {
        let sink = CollectSink::new();
        run(
            &CopyEntries,
            vec![VecProvider::new(vec![("a.txt", "x")])],
            vec![sink.clone()],
            &Params::new().with("record_type", "blob"),
        )
        .await
        .unwrap();
        assert_eq!(sink.records()[0].output_id(), "blob");
    }

    #[test]
    fn test_binary_content_is_hex() {
        assert_eq!(encode_content(vec![0xff, 0x00, 0x10]), "ff0010");
        assert_eq!(encode_content(b"ok".to_vec()), "ok");
    }
}
