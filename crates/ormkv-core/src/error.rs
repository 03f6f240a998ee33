//! Core error types.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Field-level validation failures keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    /// Error messages per field, in field-name order.
    pub fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    /// Create an empty error set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record errors for a field.
    pub fn extend(&mut self, field: impl Into<String>, errors: impl IntoIterator<Item = String>) {
        let entry = self.fields.entry(field.into()).or_default();
        entry.extend(errors);
        if entry.is_empty() {
            self.fields.retain(|_, v| !v.is_empty());
        }
    }

    /// Whether there are no errors.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Errors for one field.
    pub fn for_field(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, errors) in &self.fields {
            for error in errors {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "{field}: {error}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Core errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Query or value error from the proto layer.
    #[error("protocol error: {0}")]
    Proto(#[from] ormkv_proto::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// One or more field values failed validation.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    /// The backend is not connected.
    #[error("backend '{0}' is not connected")]
    NotConnected(String),

    /// A unique column already holds an equivalent value.
    #[error("unique constraint violated on {table}.{column}: {value}")]
    UniquenessViolation {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// Offending value, as written.
        value: String,
    },

    /// Record or model not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A single-object lookup matched more than one row.
    #[error("{model}: expected one object, found {count}")]
    MultipleObjectsReturned {
        /// Model name.
        model: String,
        /// Number of matches.
        count: usize,
    },

    /// A relation was read before it was loaded.
    #[error("relation {model}.{field} is not loaded")]
    RelationNotLoaded {
        /// Model name.
        model: String,
        /// Relation field name.
        field: String,
    },

    /// A delete was refused because protected rows still reference the target.
    #[error("cannot delete {model}: {count} protected reference(s) from {source_model}")]
    Protected {
        /// Model being deleted.
        model: String,
        /// Model holding the references.
        source_model: String,
        /// Number of referencing rows.
        count: usize,
    },

    /// Model definition or registry error.
    #[error("registry error: {0}")]
    Registry(String),

    /// A filter path or lookup could not be resolved.
    #[error("invalid lookup: {0}")]
    InvalidLookup(String),

    /// The backend does not support the operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Transaction error.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Settings could not be loaded or are inconsistent.
    #[error("settings error: {0}")]
    Settings(String),
}

impl Error {
    /// Build a validation error for a single field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = ValidationErrors::new();
        errors.extend(field, [message.into()]);
        Error::Validation(errors)
    }
}

impl From<ValidationErrors> for Error {
    fn from(errors: ValidationErrors) -> Self {
        Error::Validation(errors)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
