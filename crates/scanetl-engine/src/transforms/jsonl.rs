//! `jsonl_import`: one record per JSON line
//!
//! Parameters:
//! - `record_type` (required): type name of every record
//! - `per_source` (default false): route each entry to its own output id
//!   `<record_type>:<provider index>:<entry path>` and close that lane once
//!   the entry is read
//! - `strict` (default false): fail the stage on the first bad line or
//!   unreadable entry instead of logging and skipping it

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::Chunked;
use crate::config::{ConfigError, Params};
use crate::orchestrator::{message_all, Arity, Count, StageContext, Transform, TransformError};
use crate::provider::{Entry, EntryProvider, ProviderError};
use crate::sink::{Record, RecordSink, SinkMessage};

pub struct JsonlImport;

#[derive(Debug, Default)]
struct EntryStats {
    records: u64,
    skipped_lines: u64,
}

struct Options<'a> {
    record_type: &'a str,
    output_id: Option<String>,
    strict: bool,
}

async fn import_entry(
    entry: &Entry,
    options: &Options<'_>,
    sinks: &[Box<dyn RecordSink>],
    chunk: &mut Chunked,
) -> Result<EntryStats, TransformError> {
    let mut stats = EntryStats::default();
    let mut lines = BufReader::new(entry.open().await?).lines();
    let mut line_no = 0u64;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ProviderError::io(entry.path(), e))?
    {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str::<Value>(line)
            .map_err(|e| e.to_string())
            .and_then(|value| {
                Record::from_value(options.record_type, value).map_err(|e| e.to_string())
            });

        match parsed {
            Ok(record) => {
                let record = match &options.output_id {
                    Some(id) => record.with_output_id(id.clone()),
                    None => record,
                };
                chunk.push(sinks, record).await?;
                stats.records += 1;
            },
            Err(message) if options.strict => {
                return Err(TransformError::Parse {
                    entry: entry.path().to_string(),
                    message: format!("line {}: {}", line_no, message),
                });
            },
            Err(message) => {
                warn!(entry = %entry.path(), line = line_no, error = %message, "Skipping line");
                stats.skipped_lines += 1;
            },
        }
    }

    Ok(stats)
}

#[async_trait]
impl Transform for JsonlImport {
    fn name(&self) -> &'static str {
        "jsonl_import"
    }

    fn arity(&self) -> Arity {
        Arity::new(Count::AtLeast(1), Count::AtLeast(1))
    }

    fn validate_params(&self, params: &Params) -> Result<(), ConfigError> {
        params.require_str("record_type").map(|_| ())
    }

    async fn run(&self, ctx: StageContext<'_>) -> Result<(), TransformError> {
        let StageContext {
            providers,
            sinks,
            params,
            ..
        } = ctx;
        let options = RunOptions {
            record_type: params.require_str("record_type")?,
            per_source: params.get_bool("per_source").unwrap_or(false),
            strict: params.get_bool("strict").unwrap_or(false),
        };

        // lines parsed before a failure still reach the sinks
        let mut chunk = Chunked::new();
        let imported = import_all(providers, sinks, &mut chunk, &options).await;
        let flushed = chunk.flush(sinks).await;
        let (entries, skipped_lines) = imported?;
        flushed?;

        info!(
            entries,
            records = chunk.saved(),
            skipped_lines,
            "JSON lines import complete"
        );
        Ok(())
    }
}

/// Lane id of one entry; unique per run even when base names repeat
fn source_output_id(record_type: &str, provider: usize, entry: &Entry) -> String {
    format!("{}:{}:{}", record_type, provider, entry.path())
}

struct RunOptions<'a> {
    record_type: &'a str,
    per_source: bool,
    strict: bool,
}

async fn import_all(
    providers: &mut [Box<dyn EntryProvider>],
    sinks: &[Box<dyn RecordSink>],
    chunk: &mut Chunked,
    run: &RunOptions<'_>,
) -> Result<(u64, u64), TransformError> {
    let mut entries = 0u64;
    let mut skipped_lines = 0u64;

    for (index, provider) in providers.iter_mut().enumerate() {
        while let Some(mut entry) = provider.next().await {
            let options = Options {
                record_type: run.record_type,
                output_id: run
                    .per_source
                    .then(|| source_output_id(run.record_type, index, &entry)),
                strict: run.strict,
            };

            match import_entry(&entry, &options, sinks, chunk).await {
                Ok(stats) => {
                    debug!(entry = %entry.path(), records = stats.records, "Entry imported");
                    skipped_lines += stats.skipped_lines;
                },
                Err(e @ TransformError::Sink(_)) => return Err(e),
                Err(e) if !run.strict => {
                    warn!(entry = %entry.path(), error = %e, "Skipping entry");
                },
                Err(e) => return Err(e),
            }
            entry.close();
            entries += 1;

            if let Some(output_id) = options.output_id {
                chunk.flush(sinks).await?;
                message_all(sinks, SinkMessage::CloseLane(output_id)).await?;
            }
        }
    }
    Ok((entries, skipped_lines))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transforms::testing::{run, CollectSink, VecProvider};

    #[tokio::test]
    async fn test_lines_become_records() {
        let provider = VecProvider::new(vec![(
            "scan.json",
            "{\"ip\":\"10.0.0.1\",\"port\":22}\n\n{\"ip\":\"10.0.0.2\",\"port\":443}\n",
        )]);
        let sink = CollectSink::new();
        let params = Params::new().with("record_type", "port_scan");

        run(&JsonlImport, vec![provider], vec![sink.clone()], &params)
            .await
            .unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].type_name(), "port_scan");
        assert_eq!(records[0].output_id(), "port_scan");
        assert_eq!(records[1].get("port"), Some(&serde_json::json!(443)));
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_bad_lines_are_skipped_unless_strict() {
        let body = "{\"a\":1}\nnot json\n[1,2]\n{\"a\":2}\n";
        let params = Params::new().with("record_type", "t");

        let sink = CollectSink::new();
        run(
            &JsonlImport,
            vec![VecProvider::new(vec![("x.jsonl", body)])],
            vec![sink.clone()],
            &params,
        )
        .await
        .unwrap();
        assert_eq!(sink.records().len(), 2);

        let strict = params.clone().with("strict", true);
        let err = run(
            &JsonlImport,
            vec![VecProvider::new(vec![("x.jsonl", body)])],
            vec![CollectSink::new()],
            &strict,
        )
        .await
        .unwrap_err();
        match err {
            TransformError::Parse { entry, message } => {
                assert_eq!(entry, "/x.jsonl");
                assert!(message.starts_with("line 2:"), "{}", message);
            },
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_per_source_lanes_are_closed_after_each_entry() {
        let provider = VecProvider::new(vec![
            ("a.json", "{\"n\":1}\n{\"n\":2}\n"),
            ("b.json", "{\"n\":3}\n"),
        ]);
        let sink = CollectSink::new();
        let params = Params::new()
            .with("record_type", "hit")
            .with("per_source", true);

        run(&JsonlImport, vec![provider], vec![sink.clone()], &params)
            .await
            .unwrap();

        let ids: Vec<String> = sink
            .records()
            .iter()
            .map(|r| r.output_id().to_string())
            .collect();
        assert_eq!(ids, vec!["hit:0:/a.json", "hit:0:/a.json", "hit:0:/b.json"]);
        assert_eq!(
            sink.messages(),
            vec![
                SinkMessage::CloseLane("hit:0:/a.json".to_string()),
                SinkMessage::CloseLane("hit:0:/b.json".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_same_entry_name_from_two_providers_gets_two_lanes() {
        let sink = CollectSink::new();
        let params = Params::new()
            .with("record_type", "hit")
            .with("per_source", true);

        run(
            &JsonlImport,
            vec![
                VecProvider::new(vec![("data.json", "{\"n\":1}\n")]),
                VecProvider::new(vec![("data.json", "{\"n\":2}\n")]),
            ],
            vec![sink.clone()],
            &params,
        )
        .await
        .unwrap();

        assert_eq!(
            sink.messages(),
            vec![
                SinkMessage::CloseLane("hit:0:/data.json".to_string()),
                SinkMessage::CloseLane("hit:1:/data.json".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_strict_failure_keeps_earlier_lines() {
        let params = Params::new()
            .with("record_type", "t")
            .with("strict", true);
        let sink = CollectSink::new();

        let err = run(
            &JsonlImport,
            vec![VecProvider::new(vec![
                ("a.jsonl", "{\"a\":1}\n"),
                ("b.jsonl", "{\"a\":2}\nbroken\n"),
            ])],
            vec![sink.clone()],
            &params,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TransformError::Parse { .. }));
        assert_eq!(sink.records().len(), 2);
    }

    #[test]
    fn test_record_type_is_required() {
        assert!(JsonlImport.validate_params(&Params::new()).is_err());
    }
}
