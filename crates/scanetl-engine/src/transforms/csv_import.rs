//! `csv_import`: one record per CSV row
//!
//! The header row names the fields. Empty cells become nulls. Parameters:
//! `record_type` (required), `delimiter` (single character, default `,`) and
//! `strict` as for `jsonl_import`.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::Chunked;
use crate::config::{ConfigError, Params};
use crate::orchestrator::{Arity, Count, StageContext, Transform, TransformError};
use crate::provider::{Entry, EntryProvider};
use crate::sink::{Record, RecordSink};

pub struct CsvImport;

fn parse_delimiter(params: &Params) -> Result<u8, ConfigError> {
    match params.get_str("delimiter") {
        None => Ok(b','),
        Some(raw) if raw.len() == 1 => Ok(raw.as_bytes()[0]),
        Some("\\t") => Ok(b'\t'),
        Some(raw) => Err(ConfigError::Invalid {
            key: "delimiter".to_string(),
            message: format!("expected a single ASCII character, got `{}`", raw),
        }),
    }
}

fn cell(raw: &str) -> Value {
    if raw.is_empty() {
        Value::Null
    } else {
        Value::String(raw.to_string())
    }
}

/// Rows of one entry. In strict mode parsing stops at the first bad row;
/// the rows before it are kept alongside the error.
struct ParsedRows {
    records: Vec<Record>,
    bad_rows: u64,
    error: Option<TransformError>,
}

fn parse_rows(
    data: &[u8],
    record_type: &str,
    delimiter: u8,
    strict: bool,
    entry: &str,
) -> ParsedRows {
    let parse_error = |message: String| TransformError::Parse {
        entry: entry.to_string(),
        message,
    };
    let mut parsed = ParsedRows {
        records: Vec::new(),
        bad_rows: 0,
        error: None,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(data);
    let headers = match reader.headers() {
        Ok(headers) => headers.clone(),
        Err(e) => {
            parsed.error = Some(parse_error(e.to_string()));
            return parsed;
        },
    };

    for (row, result) in reader.records().enumerate() {
        let message = match result {
            Ok(row_data) if row_data.len() == headers.len() => {
                let fields: Map<String, Value> = headers
                    .iter()
                    .zip(row_data.iter())
                    .map(|(name, raw)| (name.to_string(), cell(raw)))
                    .collect();
                parsed.records.push(Record::new(record_type, fields));
                continue;
            },
            Ok(row_data) => format!(
                "row {}: expected {} fields, got {}",
                row + 1,
                headers.len(),
                row_data.len()
            ),
            Err(e) => e.to_string(),
        };

        if strict {
            parsed.error = Some(parse_error(message));
            break;
        }
        warn!(entry, error = %message, "Skipping row");
        parsed.bad_rows += 1;
    }

    parsed
}

async fn import_entry(
    entry: &Entry,
    record_type: &str,
    delimiter: u8,
    strict: bool,
    sinks: &[Box<dyn RecordSink>],
    chunk: &mut Chunked,
) -> Result<u64, TransformError> {
    let data = entry.read_all().await?;
    let parsed = parse_rows(&data, record_type, delimiter, strict, entry.path());
    for record in parsed.records {
        chunk.push(sinks, record).await?;
    }
    match parsed.error {
        Some(e) => Err(e),
        None => Ok(parsed.bad_rows),
    }
}

async fn import_all(
    providers: &mut [Box<dyn EntryProvider>],
    sinks: &[Box<dyn RecordSink>],
    chunk: &mut Chunked,
    record_type: &str,
    delimiter: u8,
    strict: bool,
) -> Result<(u64, u64), TransformError> {
    let mut entries = 0u64;
    let mut bad_rows = 0u64;

    for provider in providers.iter_mut() {
        while let Some(mut entry) = provider.next().await {
            match import_entry(&entry, record_type, delimiter, strict, sinks, chunk).await {
                Ok(bad) => bad_rows += bad,
                Err(e @ TransformError::Sink(_)) => return Err(e),
                Err(e) if !strict => {
                    warn!(entry = %entry.path(), error = %e, "Skipping entry");
                },
                Err(e) => return Err(e),
            }
            entry.close();
            entries += 1;
        }
    }
    Ok((entries, bad_rows))
}

#[async_trait]
impl Transform for CsvImport {
    fn name(&self) -> &'static str {
        "csv_import"
    }

    fn arity(&self) -> Arity {
        Arity::new(Count::AtLeast(1), Count::AtLeast(1))
    }

    fn validate_params(&self, params: &Params) -> Result<(), ConfigError> {
        params.require_str("record_type")?;
        parse_delimiter(params).map(|_| ())
    }

    async fn run(&self, ctx: StageContext<'_>) -> Result<(), TransformError> {
        let StageContext {
            providers,
            sinks,
            params,
            ..
        } = ctx;
        let record_type = params.require_str("record_type")?;
        let delimiter = parse_delimiter(params)?;
        let strict = params.get_bool("strict").unwrap_or(false);

        // rows parsed before a failure still reach the sinks
        let mut chunk = Chunked::new();
        let imported =
            import_all(providers, sinks, &mut chunk, record_type, delimiter, strict).await;
        let flushed = chunk.flush(sinks).await;
        let (entries, bad_rows) = imported?;
        flushed?;

        info!(entries, records = chunk.saved(), bad_rows, "CSV import complete");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transforms::testing::{run, CollectSink, VecProvider};
    use serde_json::json;

    #[tokio::test]
    async fn test_rows_become_records() {
        let provider = VecProvider::new(vec![(
            "dns.csv",
            "name,answer,ttl\na.test,10.0.0.1,300\nb.test,,60\n",
        )]);
        let sink = CollectSink::new();
        let params = Params::new().with("record_type", "dns_record");

        run(&CsvImport, vec![provider], vec![sink.clone()], &params)
            .await
            .unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].type_name(), "dns_record");
        assert_eq!(records[0].get("answer"), Some(&json!("10.0.0.1")));
        assert_eq!(records[1].get("answer"), Some(&Value::Null));
        assert_eq!(records[1].get("ttl"), Some(&json!("60")));
    }

    #[test]
    fn test_short_rows_skipped_or_rejected() {
        let data = b"a,b\n1,2\n3\n4,5\n";
        let lenient = parse_rows(data, "t", b',', false, "x.csv");
        assert_eq!(lenient.records.len(), 2);
        assert_eq!(lenient.bad_rows, 1);
        assert!(lenient.error.is_none());

        let strict = parse_rows(data, "t", b',', true, "x.csv");
        assert_eq!(strict.records.len(), 1);
        let err = strict.error.unwrap();
        assert!(err.to_string().contains("row 2"), "{}", err);
    }

    #[test]
    fn test_delimiter_param() {
        assert_eq!(parse_delimiter(&Params::new()).unwrap(), b',');
        assert_eq!(parse_delimiter(&Params::new().with("delimiter", ";")).unwrap(), b';');
        assert_eq!(parse_delimiter(&Params::new().with("delimiter", "\\t")).unwrap(), b'\t');
        assert!(parse_delimiter(&Params::new().with("delimiter", "||")).is_err());
    }

    #[tokio::test]
    async fn test_tab_separated() {
        let provider = VecProvider::new(vec![("x.tsv", "ip\tport\n10.0.0.1\t22\n")]);
        let sink = CollectSink::new();
        let params = Params::new()
            .with("record_type", "port")
            .with("delimiter", "\\t");

        run(&CsvImport, vec![provider], vec![sink.clone()], &params)
            .await
            .unwrap();
        assert_eq!(sink.records()[0].get("port"), Some(&json!("22")));
    }

    #[tokio::test]
    async fn test_strict_failure_keeps_rows_already_read() {
        let provider = VecProvider::new(vec![
            ("first.csv", "ip,port\n10.0.0.1,22\n"),
            ("second.csv", "ip,port\n10.0.0.2,80\n10.0.0.3\n10.0.0.4,443\n"),
        ]);
        let sink = CollectSink::new();
        let params = Params::new()
            .with("record_type", "port")
            .with("strict", true);

        let err = run(&CsvImport, vec![provider], vec![sink.clone()], &params)
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::Parse { .. }));

        let ips: Vec<Value> = sink
            .records()
            .iter()
            .map(|r| r.get("ip").cloned().unwrap())
            .collect();
        assert_eq!(ips, vec![json!("10.0.0.1"), json!("10.0.0.2")]);
    }
}
