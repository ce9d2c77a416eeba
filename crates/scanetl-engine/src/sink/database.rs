//! PostgreSQL destination
//!
//! Each batch becomes multi-row `INSERT ... VALUES` statements executed in one
//! transaction. The target table and conflict policy are resolved when a lane
//! is created: first by output identifier, then by record type name; the
//! table defaults to the type name and the policy to `ignore`.
//!
//! Columns are the union of the batch's field names in first-seen order;
//! records missing a column insert `NULL`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{BatchOptions, BatchWriter, Record, SinkContext, SinkError};
use crate::config::{ConfigError, EndpointRegistry};
use crate::db;
use scanetl_common::error::validate_identifier;

/// Postgres caps bind parameters per statement at 65535
const MAX_BIND_PARAMS: usize = 65_535;

/// What to do when an inserted row collides with an existing one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// `ON CONFLICT DO NOTHING`
    #[default]
    Ignore,
    /// `ON CONFLICT (keys) DO UPDATE SET field = EXCLUDED.field, ...`
    Update {
        keys: Vec<String>,
        #[serde(default)]
        fields: Vec<String>,
    },
}

impl ConflictPolicy {
    fn validate(&self) -> Result<(), scanetl_common::EtlError> {
        if let ConflictPolicy::Update { keys, fields } = self {
            if keys.is_empty() {
                return Err(scanetl_common::EtlError::config(
                    "update conflict policy needs at least one key column",
                ));
            }
            for column in keys.iter().chain(fields) {
                validate_identifier(column)?;
            }
        }
        Ok(())
    }

    fn clause(&self) -> String {
        match self {
            ConflictPolicy::Ignore => " ON CONFLICT DO NOTHING".to_string(),
            ConflictPolicy::Update { keys, fields } if fields.is_empty() => {
                format!(" ON CONFLICT ({}) DO NOTHING", keys.join(", "))
            },
            ConflictPolicy::Update { keys, fields } => {
                let set = fields
                    .iter()
                    .map(|f| format!("{f} = EXCLUDED.{f}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(" ON CONFLICT ({}) DO UPDATE SET {}", keys.join(", "), set)
            },
        }
    }
}

/// Table and conflict policy for one output identifier or record type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanePolicyConfig {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub policy: ConflictPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSinkConfig {
    pub endpoint: String,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub flush_interval_secs: Option<u64>,
    #[serde(default)]
    pub serialize_writes: bool,
    #[serde(default)]
    pub max_connections: Option<u32>,
    /// Keyed by output identifier or record type name
    #[serde(default)]
    pub lanes: BTreeMap<String, LanePolicyConfig>,
}

impl DatabaseSinkConfig {
    pub fn validate(&self, endpoints: &EndpointRegistry) -> Result<(), ConfigError> {
        endpoints.postgres_url(&self.endpoint)?;
        if self.batch_size == Some(0) {
            return Err(ConfigError::Invalid {
                key: "batch_size".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.flush_interval_secs == Some(0) {
            return Err(ConfigError::Invalid {
                key: "flush_interval_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        for (key, lane) in &self.lanes {
            if let Some(table) = &lane.table {
                validate_identifier(table)?;
            }
            lane.policy.validate().map_err(|e| ConfigError::Invalid {
                key: format!("lanes.{}", key),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn options(&self, ctx: &SinkContext) -> BatchOptions {
        let mut options = BatchOptions::from_settings(&ctx.settings)
            .with_serialized_writes(self.serialize_writes);
        if let Some(batch_size) = self.batch_size {
            options = options.with_batch_size(batch_size);
        }
        if let Some(secs) = self.flush_interval_secs {
            options = options.with_flush_interval(Duration::from_secs(secs));
        }
        options
    }
}

/// Resolved target of one lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub table: String,
    pub policy: ConflictPolicy,
}

pub struct PgBatchWriter {
    endpoint: String,
    url: String,
    max_connections: u32,
    lanes: BTreeMap<String, LanePolicyConfig>,
    pool: OnceCell<PgPool>,
}

impl PgBatchWriter {
    pub fn from_config(
        config: &DatabaseSinkConfig,
        ctx: &SinkContext,
    ) -> Result<(Self, BatchOptions), ConfigError> {
        config.validate(&ctx.endpoints)?;
        let writer = Self {
            endpoint: config.endpoint.clone(),
            url: ctx.endpoints.postgres_url(&config.endpoint)?,
            max_connections: config
                .max_connections
                .unwrap_or(db::DEFAULT_MAX_CONNECTIONS),
            lanes: config.lanes.clone(),
            pool: OnceCell::new(),
        };
        Ok((writer, config.options(ctx)))
    }

    /// Table and policy for a new lane
    pub fn resolve(&self, output_id: &str, type_name: &str) -> Result<TableTarget, SinkError> {
        let configured = self
            .lanes
            .get(output_id)
            .or_else(|| self.lanes.get(type_name))
            .cloned()
            .unwrap_or_default();
        let table = configured.table.unwrap_or_else(|| type_name.to_string());
        validate_identifier(&table)?;
        Ok(TableTarget {
            table,
            policy: configured.policy,
        })
    }

    fn pool(&self) -> Result<&PgPool, SinkError> {
        self.pool
            .get()
            .ok_or_else(|| SinkError::Internal(format!("`{}` pool not opened", self.endpoint)))
    }
}

/// Union of field names in first-seen order
pub fn batch_columns(batch: &[Record]) -> Result<Vec<String>, SinkError> {
    let mut columns: Vec<String> = Vec::new();
    for record in batch {
        for name in record.fields().keys() {
            if !columns.iter().any(|c| c == name) {
                validate_identifier(name)?;
                columns.push(name.clone());
            }
        }
    }
    if columns.is_empty() {
        return Err(SinkError::InvalidRecord(
            "batch has no fields to insert".to_string(),
        ));
    }
    Ok(columns)
}

fn push_value(b: &mut Separated<'_, '_, Postgres, &'static str>, value: Option<&Value>) {
    match value {
        None | Some(Value::Null) => {
            b.push("NULL");
        },
        Some(Value::Bool(v)) => {
            b.push_bind(*v);
        },
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => {
                b.push_bind(i);
            },
            None => {
                b.push_bind(n.as_f64());
            },
        },
        Some(Value::String(s)) => {
            b.push_bind(s.clone());
        },
        Some(other) => {
            b.push_bind(sqlx::types::Json(other.clone()));
        },
    }
}

/// Build the INSERT for one chunk of a batch
pub fn insert_statement<'a>(
    target: &TableTarget,
    columns: &[String],
    chunk: &'a [Record],
) -> QueryBuilder<'a, Postgres> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        target.table,
        columns.join(", ")
    ));
    builder.push_values(chunk, |mut b, record| {
        for column in columns {
            push_value(&mut b, record.get(column));
        }
    });
    builder.push(target.policy.clause());
    builder
}

#[async_trait]
impl BatchWriter for PgBatchWriter {
    type Lane = TableTarget;

    fn kind(&self) -> &'static str {
        "database"
    }

    async fn open(&self) -> Result<(), SinkError> {
        let pool = db::create_pool(&self.url, self.max_connections).await?;
        db::health_check(&pool).await?;
        info!(endpoint = %self.endpoint, "Database sink connected");
        self.pool
            .set(pool)
            .map_err(|_| SinkError::Internal(format!("`{}` pool opened twice", self.endpoint)))
    }

    fn lane(&self, output_id: &str, type_name: &str) -> Result<TableTarget, SinkError> {
        let target = self.resolve(output_id, type_name)?;
        debug!(output_id, table = %target.table, policy = ?target.policy, "Resolved lane target");
        Ok(target)
    }

    async fn write_batch(&self, lane: &TableTarget, batch: &[Record]) -> Result<u64, SinkError> {
        let pool = self.pool()?;
        let columns = batch_columns(batch)?;
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);

        let mut tx = pool.begin().await?;
        let mut affected = 0;
        for chunk in batch.chunks(rows_per_statement) {
            let mut builder = insert_statement(lane, &columns, chunk);
            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn close(&self) -> Result<(), SinkError> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, EngineSettings};
    use serde_json::json;

    fn ctx() -> SinkContext {
        SinkContext {
            endpoints: EndpointRegistry::new().with(
                "warehouse",
                Endpoint::Postgres {
                    url: Some("postgres://localhost/scans".to_string()),
                    url_env: None,
                },
            ),
            settings: EngineSettings::default(),
            artifact_dir: std::env::temp_dir(),
            instance_name: "test/0-database".to_string(),
        }
    }

    fn config() -> DatabaseSinkConfig {
        DatabaseSinkConfig {
            endpoint: "warehouse".to_string(),
            batch_size: Some(2),
            flush_interval_secs: None,
            serialize_writes: false,
            max_connections: None,
            lanes: BTreeMap::from([
                (
                    "port_scan".to_string(),
                    LanePolicyConfig {
                        table: Some("scans.open_ports".to_string()),
                        policy: ConflictPolicy::Update {
                            keys: vec!["ip".to_string(), "port".to_string()],
                            fields: vec!["seen_at".to_string()],
                        },
                    },
                ),
                (
                    "port_scan:archive".to_string(),
                    LanePolicyConfig {
                        table: Some("scans.archived_ports".to_string()),
                        policy: ConflictPolicy::Ignore,
                    },
                ),
            ]),
        }
    }

    #[test]
    fn test_options_fall_back_to_settings() {
        let mut config = config();
        let options = config.options(&ctx());
        assert_eq!(options.batch_size, 2);
        assert_eq!(options.flush_interval, Duration::from_secs(10));

        config.batch_size = None;
        assert_eq!(config.options(&ctx()).batch_size, 1024);
    }

    #[test]
    fn test_policy_lookup_order() {
        let (writer, _) = PgBatchWriter::from_config(&config(), &ctx()).unwrap();

        let by_id = writer.resolve("port_scan:archive", "port_scan").unwrap();
        assert_eq!(by_id.table, "scans.archived_ports");
        assert_eq!(by_id.policy, ConflictPolicy::Ignore);

        let by_type = writer.resolve("port_scan:2024", "port_scan").unwrap();
        assert_eq!(by_type.table, "scans.open_ports");
        assert!(matches!(by_type.policy, ConflictPolicy::Update { .. }));

        let default = writer.resolve("dns_record", "dns_record").unwrap();
        assert_eq!(default.table, "dns_record");
        assert_eq!(default.policy, ConflictPolicy::Ignore);

        assert!(writer.resolve("x", "bad-name; DROP").is_err());
    }

    #[test]
    fn test_conflict_clauses() {
        assert_eq!(ConflictPolicy::Ignore.clause(), " ON CONFLICT DO NOTHING");
        let update = ConflictPolicy::Update {
            keys: vec!["ip".to_string(), "port".to_string()],
            fields: vec!["seen_at".to_string(), "banner".to_string()],
        };
        assert_eq!(
            update.clause(),
            " ON CONFLICT (ip, port) DO UPDATE SET seen_at = EXCLUDED.seen_at, banner = EXCLUDED.banner"
        );
    }

    #[test]
    fn test_insert_statement_sql() {
        let batch = vec![
            Record::from_value("port_scan", json!({"ip": "10.0.0.1", "port": 22})).unwrap(),
            Record::from_value("port_scan", json!({"ip": "10.0.0.2", "banner": null})).unwrap(),
        ];
        let columns = batch_columns(&batch).unwrap();
        assert_eq!(columns, vec!["ip", "port", "banner"]);

        let target = TableTarget {
            table: "open_ports".to_string(),
            policy: ConflictPolicy::Ignore,
        };
        let builder = insert_statement(&target, &columns, &batch);
        assert_eq!(
            builder.sql(),
            "INSERT INTO open_ports (ip, port, banner) VALUES ($1, $2, NULL), ($3, NULL, NULL) \
             ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn test_invalid_columns_rejected() {
        let batch =
            vec![Record::from_value("x", json!({"ok": 1, "bad column": 2})).unwrap()];
        assert!(batch_columns(&batch).is_err());
        assert!(batch_columns(&[Record::from_value("x", json!({})).unwrap()]).is_err());
    }

    #[test]
    fn test_validation_rejects_keyless_update() {
        let mut config = config();
        config.lanes.insert(
            "dns".to_string(),
            LanePolicyConfig {
                table: None,
                policy: ConflictPolicy::Update {
                    keys: vec![],
                    fields: vec!["x".to_string()],
                },
            },
        );
        assert!(matches!(
            config.validate(&ctx().endpoints),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
