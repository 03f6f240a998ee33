//! Lazy, immutable query builder.
//!
//! A [`QuerySet`] records filter clauses, ordering and slicing against one
//! model. Nothing touches a backend until [`QuerySet::fetch`] runs. A fetched
//! set keeps its instances; refining it with local clauses, ordering or
//! slicing evaluates in memory through the same [`FilterEvaluator`] the
//! key-value backend uses, so both paths select the same rows.
//!
//! Composition never fails. Unknown fields and malformed paths surface as
//! [`Error::InvalidLookup`] from the next operation that talks to a backend.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ormkv_proto::{AggregateResult, Aggregation, Filter, OrderSpec, Query, Row, Value};
use tracing::{debug, instrument, warn};

use super::aggregate;
use super::executor;
use super::filter::FilterEvaluator;
use super::lookup::{self, LookupValue};
use crate::backend::StorageBackend;
use crate::database::Database;
use crate::error::Error;
use crate::field::FieldValue;
use crate::model::{apply_on_delete, Instance, ModelDef, SaveOutcome};

#[derive(Debug, Clone)]
struct Clause {
    path: String,
    value: LookupValue,
    negated: bool,
}

/// Result of [`QuerySet::save`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveSummary {
    /// Instances written as new rows.
    pub inserted: usize,
    /// Instances written over existing rows.
    pub updated: usize,
    /// Instances that failed to save.
    pub failed: usize,
    /// Instances attempted.
    pub total: usize,
    /// One message per failure, prefixed with the instance's position.
    pub errors: Vec<String>,
}

/// A lazily evaluated query over one model.
#[derive(Clone)]
pub struct QuerySet {
    db: Database,
    model: Arc<ModelDef>,
    clauses: Vec<Clause>,
    order: Option<Vec<String>>,
    offset: usize,
    limit: Option<usize>,
    backend: Option<String>,
    cache: Option<Vec<Instance>>,
}

impl QuerySet {
    /// A query returning every row of `model`.
    pub fn new(db: Database, model: Arc<ModelDef>) -> Self {
        Self {
            db,
            model,
            clauses: Vec::new(),
            order: None,
            offset: 0,
            limit: None,
            backend: None,
            cache: None,
        }
    }

    /// The queried model.
    pub fn model(&self) -> &Arc<ModelDef> {
        &self.model
    }

    /// Keep rows matching `path` (`field`, `field__lookup`, `fk__field__lookup`).
    pub fn filter(self, path: &str, value: impl Into<LookupValue>) -> Self {
        self.push_clause(path, value.into(), false)
    }

    /// Drop rows matching `path`.
    pub fn exclude(self, path: &str, value: impl Into<LookupValue>) -> Self {
        self.push_clause(path, value.into(), true)
    }

    fn push_clause(mut self, path: &str, value: LookupValue, negated: bool) -> Self {
        let clause = Clause {
            path: path.to_string(),
            value,
            negated,
        };
        if self.is_sliced() {
            if self.cache.take().is_some() {
                debug!(model = %self.model.name, "sliced set refetches after a filter");
            }
        } else if let Some(cached) = self.cache.take() {
            match self.refine_cached(cached, &clause) {
                Ok(kept) => self.cache = Some(kept),
                Err(e) => debug!(model = %self.model.name, error = %e, "clause needs a refetch"),
            }
        }
        self.clauses.push(clause);
        self
    }

    /// Filters and ordering apply before the slice, so a sliced cache cannot
    /// be refined in place.
    fn is_sliced(&self) -> bool {
        self.limit.is_some() || self.offset > 0
    }

    fn refine_cached(&self, cached: Vec<Instance>, clause: &Clause) -> Result<Vec<Instance>, Error> {
        let filter = lookup::compile(
            self.db.registry(),
            &self.model,
            &clause.path,
            &clause.value,
            clause.negated,
        )?;
        if !filter.is_local() {
            return Err(Error::InvalidLookup(format!(
                "'{}' crosses a relation",
                clause.path
            )));
        }
        let mut kept = Vec::with_capacity(cached.len());
        for instance in cached {
            if FilterEvaluator::evaluate(&filter, &instance.to_storage_record()?)? {
                kept.push(instance);
            }
        }
        Ok(kept)
    }

    /// Replace the ordering. `-name` sorts descending.
    pub fn order_by(mut self, fields: &[&str]) -> Self {
        self.order = Some(fields.iter().map(|f| f.to_string()).collect());
        if self.is_sliced() {
            if self.cache.take().is_some() {
                debug!(model = %self.model.name, "sliced set refetches after reordering");
            }
        } else if let Some(cached) = self.cache.take() {
            match self.order_specs().and_then(|order| sort_instances(cached, &order)) {
                Ok(sorted) => self.cache = Some(sorted),
                Err(e) => debug!(model = %self.model.name, error = %e, "ordering needs a refetch"),
            }
        }
        self
    }

    /// Return at most `n` rows.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(self.limit.map_or(n, |current| current.min(n)));
        if let Some(cached) = self.cache.take() {
            self.cache = Some(executor::paginate(cached, 0, Some(n)));
        }
        self
    }

    /// Skip the first `n` rows.
    pub fn offset(mut self, n: usize) -> Self {
        self.offset += n;
        self.limit = self.limit.map(|current| current.saturating_sub(n));
        if let Some(cached) = self.cache.take() {
            self.cache = Some(executor::paginate(cached, n, None));
        }
        self
    }

    /// Route the query, and [`QuerySet::save`], to a named backend.
    pub fn using(mut self, backend: &str) -> Self {
        self.backend = Some(backend.to_string());
        self
    }

    pub(crate) fn using_opt(mut self, backend: Option<String>) -> Self {
        self.backend = backend;
        self
    }

    /// Name of the selected backend, if overridden.
    pub fn backend_name(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    fn order_specs(&self) -> Result<Vec<OrderSpec>, Error> {
        let fields = self.order.as_ref().unwrap_or(&self.model.ordering);
        fields
            .iter()
            .map(|raw| -> Result<OrderSpec, Error> {
                let spec = OrderSpec::parse(raw);
                let field = self
                    .model
                    .field(&spec.column)
                    .or_else(|| self.model.field_by_column(&spec.column))
                    .filter(|f| f.has_column())
                    .ok_or_else(|| {
                        Error::InvalidLookup(format!(
                            "cannot order {} by '{}'",
                            self.model.name, spec.column
                        ))
                    })?;
                Ok(OrderSpec {
                    column: field.column(),
                    direction: spec.direction,
                })
            })
            .collect()
    }

    /// Compile into a backend query.
    pub fn query(&self) -> Result<Query, Error> {
        self.model.ensure_concrete()?;
        let mut query = Query::new(self.model.table_ref());
        for clause in &self.clauses {
            query = query.with_filter(lookup::compile(
                self.db.registry(),
                &self.model,
                &clause.path,
                &clause.value,
                clause.negated,
            )?);
        }
        for spec in self.order_specs()? {
            query = query.with_order(spec);
        }
        query = query.with_offset(self.offset);
        if let Some(limit) = self.limit {
            query = query.with_limit(limit);
        }
        Ok(query)
    }

    fn backend(&self) -> Result<Arc<dyn StorageBackend>, Error> {
        self.db.backend(self.backend.as_deref())
    }

    /// Run the query and return a fetched copy. Already fetched sets are
    /// returned as they are.
    #[instrument(skip(self), fields(model = %self.model.name))]
    pub async fn fetch(&self) -> Result<QuerySet, Error> {
        if self.cache.is_some() {
            return Ok(self.clone());
        }
        let query = self.query()?;
        let backend = self.backend()?;
        let rows = backend.execute(&query).await?;
        let instances = rows
            .iter()
            .map(|row| Instance::from_record(self.model.clone(), row, Some(backend.name())))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(rows = instances.len(), backend = backend.name(), "fetched");
        let mut fetched = self.clone();
        fetched.cache = Some(instances);
        Ok(fetched)
    }

    /// Fetched instances; empty until [`QuerySet::fetch`] has run.
    pub fn array(&self) -> &[Instance] {
        self.cache.as_deref().unwrap_or(&[])
    }

    /// Mutable access to fetched instances, for editing before [`QuerySet::save`].
    pub fn array_mut(&mut self) -> &mut [Instance] {
        self.cache.as_deref_mut().unwrap_or(&mut [])
    }

    /// Take the fetched instances.
    pub fn into_vec(self) -> Vec<Instance> {
        self.cache.unwrap_or_default()
    }

    /// Whether the set holds fetched results, even if there are none.
    pub fn is_fetched(&self) -> bool {
        self.cache.is_some()
    }

    /// Drop fetched results, keeping the query.
    pub fn clear_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    /// Number of matching rows.
    pub async fn count(&self) -> Result<usize, Error> {
        if let Some(cached) = &self.cache {
            return Ok(cached.len());
        }
        self.backend()?.count(&self.query()?).await
    }

    /// Whether any row matches.
    pub async fn exists(&self) -> Result<bool, Error> {
        if let Some(cached) = &self.cache {
            return Ok(!cached.is_empty());
        }
        Ok(!self.clone().limit(1).fetch().await?.array().is_empty())
    }

    /// First matching instance.
    pub async fn first(&self) -> Result<Option<Instance>, Error> {
        if let Some(cached) = &self.cache {
            return Ok(cached.first().cloned());
        }
        Ok(self.clone().limit(1).fetch().await?.into_vec().into_iter().next())
    }

    /// The single matching instance.
    pub async fn get(&self) -> Result<Instance, Error> {
        let mut found = self.fetch().await?.into_vec();
        match found.len() {
            0 => Err(Error::NotFound(format!(
                "{} matching query does not exist",
                self.model.name
            ))),
            1 => Ok(found.remove(0)),
            count => Err(Error::MultipleObjectsReturned {
                model: self.model.name.clone(),
                count,
            }),
        }
    }

    fn columns_of(&self, fields: &[&str]) -> Result<Vec<(String, String)>, Error> {
        fields
            .iter()
            .map(|name| {
                self.model
                    .field(name)
                    .filter(|f| f.has_column())
                    .map(|f| (name.to_string(), f.column()))
                    .ok_or_else(|| {
                        Error::InvalidLookup(format!("{} has no column field '{}'", self.model.name, name))
                    })
            })
            .collect()
    }

    /// Selected fields of every matching row, keyed by field name.
    pub async fn values(&self, fields: &[&str]) -> Result<Vec<BTreeMap<String, FieldValue>>, Error> {
        let columns = self.columns_of(fields)?;
        if let Some(cached) = &self.cache {
            return cached
                .iter()
                .map(|instance| {
                    columns
                        .iter()
                        .map(|(name, _)| -> Result<(String, FieldValue), Error> {
                            Ok((name.clone(), instance.get(name)?.clone()))
                        })
                        .collect()
                })
                .collect();
        }

        let query = self
            .query()?
            .with_projection(columns.iter().map(|(_, c)| c.clone()).collect());
        let rows = self.backend()?.execute(&query).await?;
        rows.iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|(name, column)| -> Result<(String, FieldValue), Error> {
                        let field = self.model.field(name).ok_or_else(|| {
                            Error::InvalidLookup(format!("{} has no field '{}'", self.model.name, name))
                        })?;
                        let raw = row.get(column).cloned().unwrap_or(Value::Null);
                        Ok((name.clone(), field.from_storage(&raw)?))
                    })
                    .collect()
            })
            .collect()
    }

    /// Aggregate over matching rows. Aggregations name fields; results keep
    /// the aliases given.
    pub async fn aggregate(&self, aggregations: &[Aggregation]) -> Result<Vec<AggregateResult>, Error> {
        let mapped = aggregations
            .iter()
            .map(|agg| -> Result<Aggregation, Error> {
                let mut agg = agg.clone();
                if let Some(name) = &agg.column {
                    let column = self.columns_of(&[name.as_str()])?.remove(0).1;
                    agg.column = Some(column);
                }
                Ok(agg)
            })
            .collect::<Result<Vec<_>, Error>>()?;

        if let Some(cached) = &self.cache {
            let rows = cached
                .iter()
                .map(Instance::to_storage_record)
                .collect::<Result<Vec<Row>, _>>()?;
            return aggregate::compute(&rows, &mapped);
        }
        self.backend()?.aggregate(&self.query()?, &mapped).await
    }

    /// Set fields on every matching row. Returns the number of rows changed.
    /// Fetched instances are not refreshed.
    pub async fn update(&self, changes: &[(&str, FieldValue)]) -> Result<usize, Error> {
        let mut row = Row::new();
        for (name, value) in changes {
            let field = self.model.field(name).filter(|f| f.has_column()).ok_or_else(|| {
                Error::InvalidLookup(format!("{} has no column field '{}'", self.model.name, name))
            })?;
            if field.is_primary_key() {
                return Err(Error::InvalidData(format!(
                    "cannot bulk-update primary key of {}",
                    self.model.name
                )));
            }
            row.insert(field.column(), field.to_storage(&field.clean(value)?)?);
        }
        if row.is_empty() {
            return Ok(0);
        }
        self.backend()?.update_many(&self.query()?, row).await
    }

    /// Delete every matching row, applying `on_delete` rules of relations
    /// pointing at the model. Returns the number of rows removed.
    #[instrument(skip(self), fields(model = %self.model.name))]
    pub async fn delete(&self) -> Result<usize, Error> {
        let query = self.query()?;
        let backend = self.backend()?;
        let pk_column = self.model.pk_column();
        let query = query.with_projection(vec![pk_column.clone()]);
        let ids: Vec<_> = backend
            .execute(&query)
            .await?
            .into_iter()
            .filter_map(|mut row| row.remove(&pk_column))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        apply_on_delete(&self.db, backend.as_ref(), &self.model, ids.clone()).await?;
        let removed = backend
            .delete_many(
                &Query::new(self.model.table_ref())
                    .with_filter(Filter::is_in(pk_column, ids)),
            )
            .await?;
        debug!(removed, "deleted");
        Ok(removed)
    }

    /// Insert or update every fetched instance against the selected backend.
    ///
    /// Failures are counted and reported per instance; the remaining
    /// instances are still saved. A set that was never fetched saves nothing.
    pub async fn save(&mut self) -> Result<SaveSummary, Error> {
        let backend = self.backend()?;
        let mut summary = SaveSummary::default();
        let Some(cached) = self.cache.as_mut() else {
            return Ok(summary);
        };
        for (index, instance) in cached.iter_mut().enumerate() {
            summary.total += 1;
            match instance.save_to(backend.as_ref()).await {
                Ok(SaveOutcome::Inserted) => summary.inserted += 1,
                Ok(SaveOutcome::Updated) => summary.updated += 1,
                Err(e) => {
                    warn!(model = %self.model.name, index, error = %e, "save failed");
                    summary.failed += 1;
                    summary.errors.push(format!("{index}: {e}"));
                }
            }
        }
        Ok(summary)
    }
}

fn sort_instances(instances: Vec<Instance>, order: &[OrderSpec]) -> Result<Vec<Instance>, Error> {
    let mut keyed = instances
        .into_iter()
        .map(|instance| Ok((instance.to_storage_record()?, instance)))
        .collect::<Result<Vec<(Row, Instance)>, Error>>()?;
    keyed.sort_by(|(a, _), (b, _)| executor::compare_rows(a, b, order));
    Ok(keyed.into_iter().map(|(_, instance)| instance).collect())
}

impl fmt::Debug for QuerySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &self.model.qualified_name())
            .field("clauses", &self.clauses)
            .field("order", &self.order)
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("backend", &self.backend)
            .field("fetched", &self.cache.as_ref().map(Vec::len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Connections, StorageBackend};
    use crate::field::FieldDef;
    use crate::storage::{KvBackend, KvConfig};

    async fn setup() -> (Database, Arc<ModelDef>) {
        let backend = KvBackend::new("default", KvConfig::temporary());
        backend.connect().await.unwrap();
        let connections = Connections::new("default").with_backend(Arc::new(backend));
        let db = Database::new(Default::default(), Arc::new(connections));
        let people = db
            .register(
                ModelDef::builder("app", "Person")
                    .field("name", FieldDef::char(50))
                    .field("age", FieldDef::integer())
                    .ordering(&["name"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        for (name, age) in [("Carol", 41), ("Alice", 30), ("Bob", 25)] {
            let mut person = people.new_instance();
            person.set("name", name).unwrap();
            person.set("age", age).unwrap();
            person.save(&db).await.unwrap();
        }
        let model = people.model().clone();
        (db, model)
    }

    fn names(qs: &QuerySet) -> Vec<String> {
        qs.array()
            .iter()
            .map(|p| p.get("name").unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_default_ordering_and_fetch() {
        let (db, model) = setup().await;
        let qs = QuerySet::new(db, model);
        assert!(!qs.is_fetched());
        assert!(qs.array().is_empty());

        let fetched = qs.fetch().await.unwrap();
        assert!(fetched.is_fetched());
        assert_eq!(names(&fetched), vec!["Alice", "Bob", "Carol"]);
    }

    #[tokio::test]
    async fn test_in_memory_refinement_matches_backend() {
        let (db, model) = setup().await;
        let fetched = QuerySet::new(db.clone(), model.clone()).fetch().await.unwrap();

        let local = fetched.clone().filter("age__gte", 30).order_by(&["-age"]);
        assert!(local.is_fetched());
        let remote = QuerySet::new(db, model)
            .filter("age__gte", 30)
            .order_by(&["-age"])
            .fetch()
            .await
            .unwrap();
        assert_eq!(names(&local), names(&remote));
        assert_eq!(names(&local), vec!["Carol", "Alice"]);
    }

    #[tokio::test]
    async fn test_slicing_composes() {
        let (db, model) = setup().await;
        let qs = QuerySet::new(db, model).limit(2).offset(1);
        let fetched = qs.fetch().await.unwrap();
        assert_eq!(names(&fetched), vec!["Bob"]);

        let again = fetched.clone().clear_cache().fetch().await.unwrap();
        assert_eq!(names(&again), vec!["Bob"]);
    }

    #[tokio::test]
    async fn test_refining_sliced_set_refetches() {
        let (db, model) = setup().await;
        let sliced = QuerySet::new(db.clone(), model.clone())
            .limit(2)
            .fetch()
            .await
            .unwrap();
        assert_eq!(names(&sliced), vec!["Alice", "Bob"]);

        let refined = sliced.clone().filter("age__gte", 40);
        assert!(!refined.is_fetched());
        let refined = refined.fetch().await.unwrap();
        assert_eq!(names(&refined), vec!["Carol"]);

        let reordered = sliced.order_by(&["-age"]);
        assert!(!reordered.is_fetched());
        let reordered = reordered.fetch().await.unwrap();
        assert_eq!(names(&reordered), vec!["Carol", "Alice"]);

        let skipped = QuerySet::new(db, model).offset(1).fetch().await.unwrap();
        let refined = skipped.filter("age__lt", 35).fetch().await.unwrap();
        assert_eq!(names(&refined), vec!["Bob"]);
    }

    #[tokio::test]
    async fn test_abstract_model_is_rejected() {
        let (db, _) = setup().await;
        let base = ModelDef::builder("app", "Stamped")
            .field("created", FieldDef::integer())
            .abstract_model()
            .build()
            .unwrap();
        assert!(matches!(db.register(base), Err(Error::Registry(_))));

        let base = db.registry().require("app.Stamped").unwrap();
        let qs = QuerySet::new(db.clone(), base);
        assert!(matches!(qs.query(), Err(Error::Registry(_))));
        assert!(matches!(qs.count().await, Err(Error::Registry(_))));
        assert!(matches!(qs.delete().await, Err(Error::Registry(_))));
        assert!(matches!(db.manager("app.Stamped"), Err(Error::Registry(_))));
    }

    #[tokio::test]
    async fn test_bad_path_is_deferred() {
        let (db, model) = setup().await;
        let fetched = QuerySet::new(db, model).fetch().await.unwrap();
        let refined = fetched.filter("nickname", "x");
        assert!(!refined.is_fetched());
        assert!(matches!(refined.fetch().await, Err(Error::InvalidLookup(_))));
    }

    #[tokio::test]
    async fn test_get_and_aggregate() {
        let (db, model) = setup().await;
        let qs = QuerySet::new(db, model);
        let bob = qs.clone().filter("name__iexact", "bob").get().await.unwrap();
        assert_eq!(bob.get("age").unwrap(), &FieldValue::Int(25));

        assert!(matches!(
            qs.clone().filter("age__gt", 100).get().await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            qs.clone().get().await,
            Err(Error::MultipleObjectsReturned { count: 3, .. })
        ));

        let totals = qs.aggregate(&[Aggregation::sum("age"), Aggregation::count()]).await.unwrap();
        assert_eq!(totals[0].alias, "age__sum");
        assert_eq!(totals[0].value, Value::Int(96));
        assert_eq!(totals[1].value, Value::Int(3));
    }

    #[tokio::test]
    async fn test_update_delete_and_save() {
        let (db, model) = setup().await;
        let qs = QuerySet::new(db.clone(), model.clone());
        assert_eq!(qs.clone().filter("age__lt", 35).update(&[("age", FieldValue::Int(50))]).await.unwrap(), 2);
        assert_eq!(qs.clone().filter("age", 50).count().await.unwrap(), 2);

        let mut fetched = qs.clone().filter("name", "Carol").fetch().await.unwrap();
        fetched.array_mut()[0].set("age", 42).unwrap();
        let summary = fetched.save().await.unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.failed, 0);

        assert_eq!(qs.clone().exclude("name", "Carol").delete().await.unwrap(), 2);
        let rest = qs.values(&["name", "age"]).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0]["age"], FieldValue::Int(42));
    }
}
