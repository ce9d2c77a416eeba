//! Error types shared across scanetl crates

use thiserror::Error;

/// Result type alias for low-level scanetl operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Low-level error shared by the engine and its binaries.
///
/// Component-specific errors (providers, sinks, the orchestrator) wrap this
/// one when the failure comes from plain I/O or (de)serialization.
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl EtlError {
    pub fn config(msg: impl Into<String>) -> Self {
        EtlError::Config(msg.into())
    }
}

/// Check that `name` is safe to splice into SQL as a bare identifier.
///
/// Table and column names come from configuration and record field names,
/// so they cannot be bound as parameters.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_head = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');

    if valid_head && valid_tail && name.len() <= 63 && !name.ends_with('.') {
        Ok(())
    } else {
        Err(EtlError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("port_scan").is_ok());
        assert!(validate_identifier("_tmp1").is_ok());
        assert!(validate_identifier("scans.port_scan").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("drop table;").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("scans.").is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = EtlError::config("missing root");
        assert_eq!(err.to_string(), "Configuration error: missing root");
    }
}
