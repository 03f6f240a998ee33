//! Schema editor interface.

use async_trait::async_trait;

use super::state::{FieldState, IndexState, ModelState};
use crate::error::Error;

/// Applies schema operations to a backend.
///
/// Removals never destroy data: models and fields are deprecated instead,
/// which keeps them readable while hiding them from normal query results.
#[async_trait]
pub trait SchemaEditor: Send + Sync {
    /// Create storage for a model, including link tables of its
    /// many-to-many fields.
    async fn create_model(&self, model: &ModelState) -> Result<(), Error>;

    /// Hide a model's table from normal queries.
    async fn deprecate_model(&self, model: &ModelState) -> Result<(), Error>;

    /// Add a column, backfilling existing rows when the field has a default.
    async fn add_field(&self, model: &ModelState, field: &FieldState) -> Result<(), Error>;

    /// Hide a column from normal queries.
    async fn deprecate_field(&self, model: &ModelState, field: &FieldState) -> Result<(), Error>;

    /// Change a column's definition.
    async fn alter_field(
        &self,
        model: &ModelState,
        from: &FieldState,
        to: &FieldState,
    ) -> Result<(), Error>;

    /// Rename a column, rewriting stored rows.
    async fn rename_field(
        &self,
        model: &ModelState,
        from: &FieldState,
        to: &FieldState,
    ) -> Result<(), Error>;

    /// Create a secondary index.
    async fn add_index(&self, model: &ModelState, index: &IndexState) -> Result<(), Error>;

    /// Remove a secondary index.
    async fn remove_index(&self, model: &ModelState, index: &IndexState) -> Result<(), Error>;

    /// Change unique-together groups. Backends without composite
    /// constraints may only record them.
    async fn alter_unique_together(
        &self,
        model: &ModelState,
        groups: &[Vec<String>],
    ) -> Result<(), Error> {
        let _ = (model, groups);
        Ok(())
    }
}
