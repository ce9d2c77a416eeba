//! Named endpoints
//!
//! Provider and sink configs never carry connection details themselves; they
//! name an endpoint declared once in the pipeline document. Secrets may be
//! pulled from the environment (`password_env`, `url_env`) so documents can be
//! committed without credentials.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::ConfigError;
use crate::provider::ftp::FtpConfig;

/// One connection target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    /// Directory on the machine running the engine
    Local { root: PathBuf },

    /// FTP server
    Ftp {
        host: String,
        #[serde(default = "default_ftp_port")]
        port: u16,
        #[serde(default = "default_ftp_user")]
        username: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        password_env: Option<String>,
    },

    /// Host reachable through the system `ssh` client
    Ssh {
        host: String,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        port: Option<u16>,
    },

    /// PostgreSQL database
    Postgres {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        url_env: Option<String>,
    },
}

fn default_ftp_port() -> u16 {
    21
}

fn default_ftp_user() -> String {
    "anonymous".to_string()
}

impl Endpoint {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Endpoint::Local { .. } => "local",
            Endpoint::Ftp { .. } => "ftp",
            Endpoint::Ssh { .. } => "ssh",
            Endpoint::Postgres { .. } => "postgres",
        }
    }

    /// Human-readable address used in stable provider ids
    pub fn address(&self) -> String {
        match self {
            Endpoint::Local { root } => root.display().to_string(),
            Endpoint::Ftp { host, port, .. } => format!("{}:{}", host, port),
            Endpoint::Ssh { host, user, .. } => match user {
                Some(user) => format!("{}@{}", user, host),
                None => host.clone(),
            },
            Endpoint::Postgres { url, url_env } => url_env
                .clone()
                .or_else(|| url.as_deref().map(redact_url))
                .unwrap_or_default(),
        }
    }
}

/// Strip the userinfo part of a connection URL
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}{}", &url[..scheme_end + 3], &url[at + 1..])
        },
        _ => url.to_string(),
    }
}

fn read_env(var: &str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingEnv(var.to_string()))
}

/// Endpoint lookup table built from the pipeline document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointRegistry {
    endpoints: BTreeMap<String, Endpoint>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, endpoint: Endpoint) {
        self.endpoints.insert(id.into(), endpoint);
    }

    pub fn with(mut self, id: impl Into<String>, endpoint: Endpoint) -> Self {
        self.insert(id, endpoint);
        self
    }

    pub fn get(&self, id: &str) -> Result<&Endpoint, ConfigError> {
        self.endpoints
            .get(id)
            .ok_or_else(|| ConfigError::UnknownEndpoint(id.to_string()))
    }

    /// Merge `other` into `self`; entries in `self` win
    pub fn merge_missing(&mut self, other: &EndpointRegistry) {
        for (id, endpoint) in &other.endpoints {
            self.endpoints
                .entry(id.clone())
                .or_insert_with(|| endpoint.clone());
        }
    }

    /// Resolve a postgres endpoint to its connection URL
    pub fn postgres_url(&self, id: &str) -> Result<String, ConfigError> {
        match self.get(id)? {
            Endpoint::Postgres { url: Some(url), .. } => Ok(url.clone()),
            Endpoint::Postgres {
                url: None,
                url_env: Some(var),
            } => read_env(var),
            Endpoint::Postgres { .. } => Err(ConfigError::MissingField {
                context: format!("endpoint `{}`", id),
                field: "url",
            }),
            other => Err(ConfigError::EndpointKind {
                endpoint: id.to_string(),
                expected: "postgres",
                actual: other.kind_name(),
            }),
        }
    }

    /// Resolve an FTP endpoint into a client configuration
    pub fn ftp_config(&self, id: &str) -> Result<FtpConfig, ConfigError> {
        match self.get(id)? {
            Endpoint::Ftp {
                host,
                port,
                username,
                password,
                password_env,
            } => {
                let password = match (password, password_env) {
                    (Some(password), _) => password.clone(),
                    (None, Some(var)) => read_env(var)?,
                    (None, None) => FtpConfig::default().password,
                };
                Ok(FtpConfig {
                    host: host.clone(),
                    port: *port,
                    username: username.clone(),
                    password,
                    ..FtpConfig::default()
                })
            },
            other => Err(ConfigError::EndpointKind {
                endpoint: id.to_string(),
                expected: "ftp",
                actual: other.kind_name(),
            }),
        }
    }
}
