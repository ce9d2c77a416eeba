//! Pipeline documents
//!
//! A pipeline document names an ordered list of stages. Each stage binds one
//! registered transformation routine to a list of provider configs, a list of
//! sink configs and a parameter map. Provider and sink configs are tagged
//! unions keyed by `kind`, so a config always selects exactly one variant.
//!
//! ```toml
//! name = "nightly-portscan"
//! abort_on_error = false
//!
//! [endpoints.mirror]
//! kind = "ftp"
//! host = "ftp.example.org"
//!
//! [endpoints.warehouse]
//! kind = "postgres"
//! url_env = "WAREHOUSE_URL"
//!
//! [[stages]]
//! name = "masscan"
//! transform = "jsonl_import"
//! params = { record_type = "port_scan" }
//!
//! [[stages.providers]]
//! kind = "remote_fs"
//! endpoint = "mirror"
//! root = "/pub/masscan"
//! pattern = "*.json"
//!
//! [[stages.sinks]]
//! kind = "database"
//! endpoint = "warehouse"
//! batch_size = 500
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{ConfigError, EndpointRegistry, Params};
use crate::provider::{
    archive::ArchiveConfig, command::RemoteCommandConfig, http::HttpConfig,
    query::QueryExportConfig, remote_fs::RemoteFsConfig,
};
use crate::sink::{database::DatabaseSinkConfig, remote_file::RemoteFileSinkConfig};

/// One provider declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    RemoteFs(RemoteFsConfig),
    Http(HttpConfig),
    RemoteCommand(RemoteCommandConfig),
    Archive(ArchiveConfig),
    QueryExport(QueryExportConfig),
}

impl ProviderConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ProviderConfig::RemoteFs(_) => "remote_fs",
            ProviderConfig::Http(_) => "http",
            ProviderConfig::RemoteCommand(_) => "remote_command",
            ProviderConfig::Archive(_) => "archive",
            ProviderConfig::QueryExport(_) => "query_export",
        }
    }
}

/// One sink declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Database(DatabaseSinkConfig),
    RemoteFile(RemoteFileSinkConfig),
}

impl SinkConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            SinkConfig::Database(_) => "database",
            SinkConfig::RemoteFile(_) => "remote_file",
        }
    }
}

/// One stage of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub transform: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
    #[serde(default)]
    pub params: Params,
}

impl StageConfig {
    /// Stage name for logs and outcomes; falls back to `<index>-<transform>`
    pub fn label(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", index + 1, self.transform))
    }
}

/// A complete pipeline document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDocument {
    pub name: String,
    #[serde(default)]
    pub abort_on_error: bool,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub endpoints: EndpointRegistry,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl PipelineDocument {
    /// Load a document, choosing the parser from the file extension
    /// (`.toml`, `.yaml`/`.yml`, `.json`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        Self::parse(&text, &extension).map_err(|err| match err {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: display,
                message,
            },
            other => other,
        })
    }

    /// Parse document text in the given format (`toml`, `yaml`, `yml`, `json`)
    pub fn parse(text: &str, format: &str) -> Result<Self, ConfigError> {
        let parse_error = |message: String| ConfigError::Parse {
            path: format!("<{}>", format),
            message,
        };

        let document: PipelineDocument = match format {
            "toml" => toml::from_str(text).map_err(|e| parse_error(e.to_string()))?,
            "yaml" | "yml" => serde_yaml::from_str(text).map_err(|e| parse_error(e.to_string()))?,
            "json" => serde_json::from_str(text).map_err(|e| parse_error(e.to_string()))?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        if document.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                context: "pipeline document".to_string(),
                field: "name",
            });
        }

        Ok(document)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Endpoint;

    const TOML_DOC: &str = r#"
        name = "nightly"
        params = { source = "mirror" }

        [endpoints.mirror]
        kind = "ftp"
        host = "ftp.example.org"

        [endpoints.warehouse]
        kind = "postgres"
        url = "postgres://localhost/scans"

        [[stages]]
        name = "masscan"
        transform = "jsonl_import"
        params = { record_type = "port_scan" }

        [[stages.providers]]
        kind = "remote_fs"
        endpoint = "mirror"
        root = "/pub/masscan"
        pattern = "*.json"

        [[stages.sinks]]
        kind = "database"
        endpoint = "warehouse"
        batch_size = 500
        serialize_writes = true

        [stages.sinks.lanes.port_scan]
        policy = { action = "update", keys = ["ip", "port"], fields = ["seen_at"] }
    "#;

    #[test]
    fn test_parse_toml_document() {
        let doc = PipelineDocument::parse(TOML_DOC, "toml").unwrap();
        assert_eq!(doc.name, "nightly");
        assert!(!doc.abort_on_error);
        assert_eq!(doc.stages.len(), 1);

        let stage = &doc.stages[0];
        assert_eq!(stage.label(0), "masscan");
        assert_eq!(stage.params.get_str("record_type"), Some("port_scan"));

        match &stage.providers[0] {
            ProviderConfig::RemoteFs(fs) => {
                assert_eq!(fs.endpoint, "mirror");
                assert_eq!(fs.pattern.as_deref(), Some("*.json"));
                assert!(fs.recursive);
            },
            other => panic!("unexpected provider {:?}", other),
        }

        match &stage.sinks[0] {
            SinkConfig::Database(db) => {
                assert_eq!(db.batch_size, Some(500));
                assert!(db.serialize_writes);
                assert!(db.lanes.contains_key("port_scan"));
            },
            other => panic!("unexpected sink {:?}", other),
        }

        assert!(matches!(
            doc.endpoints.get("mirror").unwrap(),
            Endpoint::Ftp { port: 21, .. }
        ));
    }

    #[test]
    fn test_parse_yaml_document() {
        let yaml = r#"
name: dns
abort_on_error: true
stages:
  - transform: csv_import
    providers:
      - kind: archive
        path: /data/dns.tar.gz
    sinks:
      - kind: remote_file
        endpoint: out
        path: /exports
"#;
        let doc = PipelineDocument::parse(yaml, "yaml").unwrap();
        assert!(doc.abort_on_error);
        assert_eq!(doc.stages[0].label(0), "1-csv_import");
        assert_eq!(doc.stages[0].providers[0].kind_name(), "archive");
        assert_eq!(doc.stages[0].sinks[0].kind_name(), "remote_file");
    }

    #[test]
    fn test_unknown_variant_is_rejected() {
        let yaml = r#"
name: broken
stages:
  - transform: copy
    providers:
      - kind: carrier_pigeon
"#;
        assert!(matches!(
            PipelineDocument::parse(yaml, "yaml"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_tag_is_rejected() {
        let yaml = r#"
name: broken
stages:
  - transform: copy
    providers:
      - root: /tmp
"#;
        assert!(PipelineDocument::parse(yaml, "yaml").is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(matches!(
            PipelineDocument::parse("", "ini"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
