use crate::errors::{EngineError, EngineResult};
use crate::models::Row;
use jsonschema::JSONSchema;
use serde_json::Value;
use std::fmt;

/// Rows accepted from one fetch plus a warning per skipped row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    pub rows: Vec<Row>,
    pub skipped: Vec<String>,
}

/// Shape check applied at the row boundary. Every row must be an object; with a
/// schema it must also validate against it. Rejected rows never fail the fetch.
pub struct RowValidator {
    schema: Option<JSONSchema>,
}

impl fmt::Debug for RowValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowValidator")
            .field("has_schema", &self.schema.is_some())
            .finish()
    }
}

impl RowValidator {
    pub fn new(schema: Option<&Value>) -> EngineResult<Self> {
        let schema = match schema {
            Some(schema) => Some(JSONSchema::compile(schema).map_err(|error| {
                EngineError::Query(format!("invalid row schema: {}", error))
            })?),
            None => None,
        };
        Ok(Self { schema })
    }

    pub fn permissive() -> Self {
        Self { schema: None }
    }

    pub fn validate_batch(&self, raw: Vec<Value>) -> RowBatch {
        let mut batch = RowBatch::default();
        for (index, value) in raw.into_iter().enumerate() {
            match self.validate_row(value) {
                Ok(row) => batch.rows.push(row),
                Err(error) => {
                    let warning = EngineError::MalformedRow(format!("row {}: {}", index, error)).to_string();
                    tracing::warn!(row = index, error = %error, "skipping malformed row");
                    batch.skipped.push(warning);
                }
            }
        }
        batch
    }

    fn validate_row(&self, value: Value) -> Result<Row, String> {
        if let Some(schema) = &self.schema {
            if let Err(errors) = schema.validate(&value) {
                let messages = errors
                    .map(|error| {
                        let path = error.instance_path.to_string();
                        if path.is_empty() {
                            error.to_string()
                        } else {
                            format!("{}: {}", path, error)
                        }
                    })
                    .collect::<Vec<_>>();
                return Err(messages.join("; "));
            }
        }

        match value {
            Value::Object(row) => Ok(row),
            other => Err(format!("expected an object, found {}", value_kind(&other))),
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
