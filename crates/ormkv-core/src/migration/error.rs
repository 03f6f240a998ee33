//! Migration-specific error types.

use thiserror::Error;

/// Migration errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The dependency graph contains a cycle.
    #[error("circular dependency: {}", path.join(" -> "))]
    CircularDependency {
        /// Qualified migration names along the cycle; the first name is
        /// repeated at the end.
        path: Vec<String>,
    },

    /// A migration depends on one that is not registered.
    #[error("migration {migration} depends on unknown migration {dependency}")]
    MissingDependency {
        /// Qualified name of the dependant.
        migration: String,
        /// Qualified name of the missing dependency.
        dependency: String,
    },

    /// Two migrations share a qualified name.
    #[error("migration {0} is already registered")]
    DuplicateMigration(String),

    /// A migration has no backward operations.
    #[error("migration {0} is irreversible")]
    Irreversible(String),

    /// An operation names a model the project state does not contain.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// An operation names a field the model does not contain.
    #[error("unknown field {model}.{field}")]
    UnknownField {
        /// Qualified model name.
        model: String,
        /// Field name.
        field: String,
    },

    /// Backend error while applying or recording a migration.
    #[error("backend error: {0}")]
    Backend(#[from] crate::error::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MigrationError {
    fn from(e: serde_json::Error) -> Self {
        MigrationError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::CircularDependency {
            path: vec!["app.0001".into(), "app.0002".into(), "app.0001".into()],
        };
        assert_eq!(
            err.to_string(),
            "circular dependency: app.0001 -> app.0002 -> app.0001"
        );

        let err = MigrationError::UnknownField {
            model: "blog.Post".into(),
            field: "slug".into(),
        };
        assert!(err.to_string().contains("blog.Post.slug"));
    }
}
