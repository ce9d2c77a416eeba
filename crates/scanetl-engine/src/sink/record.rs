//! Record envelope
//!
//! Sinks accept heterogeneous values. Each one is flattened to a JSON object
//! and tagged with its declared type name; the output identifier (which lane
//! the record lands in) defaults to that type name.

use serde::Serialize;
use serde_json::{Map, Value};

use super::SinkError;

/// A value that can be stored by a sink
///
/// ```rust,ignore
/// #[derive(Serialize)]
/// struct PortScan { ip: String, port: u16 }
///
/// impl Persistable for PortScan {
///     const TYPE_NAME: &'static str = "port_scan";
/// }
/// ```
pub trait Persistable: Serialize {
    const TYPE_NAME: &'static str;

    /// Output identifier override, e.g. to split one type across lanes
    fn output_id(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    type_name: String,
    output_id: Option<String>,
    fields: Map<String, Value>,
}

impl Record {
    pub fn new(type_name: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            type_name: type_name.into(),
            output_id: None,
            fields,
        }
    }

    /// Build a record from any JSON value; non-objects are rejected
    pub fn from_value(type_name: impl Into<String>, value: Value) -> Result<Self, SinkError> {
        let type_name = type_name.into();
        match value {
            Value::Object(fields) => Ok(Self::new(type_name, fields)),
            other => Err(SinkError::InvalidRecord(format!(
                "`{}` record must serialize to an object, got {}",
                type_name,
                json_kind(&other)
            ))),
        }
    }

    pub fn from_persistable<T: Persistable>(value: &T) -> Result<Self, SinkError> {
        let mut record = Self::from_value(T::TYPE_NAME, serde_json::to_value(value)?)?;
        record.output_id = value.output_id();
        Ok(record)
    }

    pub fn with_output_id(mut self, output_id: impl Into<String>) -> Self {
        self.output_id = Some(output_id.into());
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Lane key: explicit override, else the type name
    pub fn output_id(&self) -> &str {
        self.output_id.as_deref().unwrap_or(&self.type_name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
