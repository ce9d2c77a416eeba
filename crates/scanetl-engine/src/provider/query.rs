//! Query export provider
//!
//! Runs stored SQL queries against a PostgreSQL endpoint and exposes each
//! result set as one JSON-lines entry (one row object per line). Query files
//! are `*.sql`; a directory in `queries` contributes every `*.sql` file it
//! holds, sorted by name. The query name is the file stem.

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::path::PathBuf;
use tracing::{debug, info};

use super::streaming::{Discover, EntrySender};
use super::{Entry, ProviderError};
use crate::config::{ConfigError, EndpointRegistry};
use crate::db;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryExportConfig {
    pub endpoint: String,
    /// `.sql` files or directories of them
    pub queries: Vec<PathBuf>,
    /// Query names to run; empty runs everything
    #[serde(default)]
    pub whitelist: Vec<String>,
}

impl QueryExportConfig {
    pub fn validate(&self, endpoints: &EndpointRegistry) -> Result<(), ConfigError> {
        if self.queries.is_empty() {
            return Err(ConfigError::MissingField {
                context: format!("query_export provider on `{}`", self.endpoint),
                field: "queries",
            });
        }
        endpoints.postgres_url(&self.endpoint).map(|_| ())
    }
}

/// One stored query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredQuery {
    pub name: String,
    pub path: PathBuf,
    pub sql: String,
}

/// [`Discover`] implementation for `query_export`
pub struct QueryExporter {
    endpoint: String,
    url: String,
    sources: Vec<PathBuf>,
    whitelist: Vec<String>,
    pool: Option<PgPool>,
    queries: Vec<StoredQuery>,
}

impl QueryExporter {
    pub fn from_config(
        config: &QueryExportConfig,
        endpoints: &EndpointRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate(endpoints)?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            url: endpoints.postgres_url(&config.endpoint)?,
            sources: config.queries.clone(),
            whitelist: config.whitelist.clone(),
            pool: None,
            queries: Vec::new(),
        })
    }
}

/// Wrap a query so every row comes back as a single JSON text column
pub fn export_sql(sql: &str) -> String {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    format!("SELECT row_to_json(q)::text FROM ({}) q", trimmed)
}

/// Resolve files and directories into the ordered list of queries to run
pub async fn load_queries(
    sources: &[PathBuf],
    whitelist: &[String],
) -> Result<Vec<StoredQuery>, ProviderError> {
    let mut files = Vec::new();
    for source in sources {
        let metadata = tokio::fs::metadata(source)
            .await
            .map_err(|e| ProviderError::io(source.display().to_string(), e))?;
        if metadata.is_dir() {
            let mut found = Vec::new();
            let mut dir = tokio::fs::read_dir(source)
                .await
                .map_err(|e| ProviderError::io(source.display().to_string(), e))?;
            while let Some(child) = dir
                .next_entry()
                .await
                .map_err(|e| ProviderError::io(source.display().to_string(), e))?
            {
                let path = child.path();
                if path.extension().is_some_and(|ext| ext == "sql") {
                    found.push(path);
                }
            }
            found.sort();
            files.extend(found);
        } else {
            files.push(source.clone());
        }
    }

    let mut queries = Vec::with_capacity(files.len());
    for path in files {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !whitelist.is_empty() && !whitelist.contains(&name) {
            debug!(query = %name, "Query not whitelisted");
            continue;
        }
        let sql = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ProviderError::io(path.display().to_string(), e))?;
        queries.push(StoredQuery { name, path, sql });
    }
    Ok(queries)
}

async fn export(pool: &PgPool, query: &StoredQuery) -> Result<Vec<u8>, ProviderError> {
    let sql = export_sql(&query.sql);
    let mut rows = sqlx::query_scalar::<sqlx::Postgres, String>(&sql).fetch(pool);
    let mut out = Vec::new();
    while let Some(row) = rows.try_next().await? {
        out.extend_from_slice(row.as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}

#[async_trait]
impl Discover for QueryExporter {
    fn kind(&self) -> &'static str {
        "query_export"
    }

    fn endpoint_id(&self) -> String {
        self.endpoint.clone()
    }

    async fn connect(&mut self) -> Result<(), ProviderError> {
        self.queries = load_queries(&self.sources, &self.whitelist).await?;
        let pool = db::create_pool(&self.url, 1).await?;
        info!(
            endpoint = %self.endpoint,
            queries = self.queries.len(),
            "Connected for query export"
        );
        self.pool = Some(pool);
        Ok(())
    }

    async fn discover(&mut self, out: &EntrySender) -> Result<(), ProviderError> {
        let Some(pool) = self.pool.clone() else {
            return Ok(());
        };

        for query in std::mem::take(&mut self.queries) {
            let label = query.path.display().to_string();
            match export(&pool, &query).await {
                Ok(bytes) => {
                    debug!(query = %query.name, bytes = bytes.len(), "Exported query");
                    let entry = Entry::from_bytes(format!("{}.jsonl", query.name), label, bytes);
                    if !out.offer(entry).await {
                        break;
                    }
                },
                Err(e) => out.skip(&label, e),
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Endpoint;

    #[test]
    fn test_export_sql_wraps_and_strips_semicolon() {
        assert_eq!(
            export_sql("SELECT ip, port FROM ports;\n"),
            "SELECT row_to_json(q)::text FROM (SELECT ip, port FROM ports) q"
        );
    }

    #[tokio::test]
    async fn test_load_queries_expands_directories_and_whitelists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_hosts.sql"), "SELECT 2").unwrap();
        std::fs::write(dir.path().join("a_ports.sql"), "SELECT 1").unwrap();
        std::fs::write(dir.path().join("readme.md"), "ignored").unwrap();

        let all = load_queries(&[dir.path().to_path_buf()], &[]).await.unwrap();
        let names: Vec<_> = all.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["a_ports", "b_hosts"]);

        let some = load_queries(&[dir.path().to_path_buf()], &["b_hosts".to_string()])
            .await
            .unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].sql, "SELECT 2");
    }

    #[test]
    fn test_requires_postgres_endpoint() {
        let endpoints = EndpointRegistry::new().with(
            "scratch",
            Endpoint::Local {
                root: PathBuf::from("/tmp"),
            },
        );
        let config = QueryExportConfig {
            endpoint: "scratch".to_string(),
            queries: vec![PathBuf::from("q.sql")],
            whitelist: vec![],
        };
        assert!(matches!(
            config.validate(&endpoints),
            Err(ConfigError::EndpointKind { .. })
        ));
    }
}
