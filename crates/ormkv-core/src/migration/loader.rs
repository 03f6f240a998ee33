//! Migration dependency graph.
//!
//! [`MigrationLoader::ordered_migrations`] validates the whole graph before
//! returning anything: every dependency must be registered and the graph must
//! be acyclic. The order itself is a topological sort with ties broken by
//! qualified name, so it does not depend on registration order.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::error::MigrationError;
use super::operation::Migration;
use super::state::ProjectState;

/// Registered migrations keyed by qualified name.
#[derive(Debug, Clone, Default)]
pub struct MigrationLoader {
    migrations: BTreeMap<String, Migration>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl MigrationLoader {
    /// An empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration.
    pub fn register(&mut self, migration: Migration) -> Result<(), MigrationError> {
        let name = migration.qualified_name();
        if self.migrations.contains_key(&name) {
            return Err(MigrationError::DuplicateMigration(name));
        }
        self.migrations.insert(name, migration);
        Ok(())
    }

    /// Builder form of [`MigrationLoader::register`].
    pub fn with(mut self, migration: Migration) -> Result<Self, MigrationError> {
        self.register(migration)?;
        Ok(self)
    }

    /// A migration by qualified name.
    pub fn get(&self, name: &str) -> Option<&Migration> {
        self.migrations.get(name)
    }

    /// Number of registered migrations.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Qualified dependency names of a migration, sorted.
    fn dependencies_of(&self, name: &str) -> BTreeSet<String> {
        self.migrations
            .get(name)
            .map(|m| m.resolved_dependencies().into_iter().collect())
            .unwrap_or_default()
    }

    fn check_dependencies(&self) -> Result<(), MigrationError> {
        for (name, migration) in &self.migrations {
            for dependency in migration.resolved_dependencies() {
                if !self.migrations.contains_key(&dependency) {
                    return Err(MigrationError::MissingDependency {
                        migration: name.clone(),
                        dependency,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_cycles(&self) -> Result<(), MigrationError> {
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        for name in self.migrations.keys() {
            let mut path = Vec::new();
            self.visit(name, &mut marks, &mut path)?;
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<(), MigrationError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(name.to_string());
                return Err(MigrationError::CircularDependency { path: cycle });
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        path.push(name);
        if let Some(migration) = self.migrations.get(name) {
            let mut dependencies = migration.resolved_dependencies();
            dependencies.sort();
            for dependency in dependencies {
                if let Some((key, _)) = self.migrations.get_key_value(&dependency) {
                    self.visit(key, marks, path)?;
                }
            }
        }
        path.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    /// Every migration, dependencies first.
    ///
    /// Fails with [`MigrationError::MissingDependency`] or
    /// [`MigrationError::CircularDependency`] before any order is produced.
    pub fn ordered_migrations(&self) -> Result<Vec<&Migration>, MigrationError> {
        self.check_dependencies()?;
        self.check_cycles()?;

        let mut remaining: BTreeMap<&str, BTreeSet<String>> = self
            .migrations
            .keys()
            .map(|name| (name.as_str(), self.dependencies_of(name)))
            .collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();
        for name in &ready {
            remaining.remove(name);
        }

        let mut ordered = Vec::with_capacity(self.migrations.len());
        while let Some(name) = ready.pop_first() {
            if let Some(migration) = self.migrations.get(name) {
                ordered.push(migration);
            }
            let unblocked: Vec<&str> = remaining
                .iter_mut()
                .filter_map(|(candidate, deps)| {
                    deps.remove(name);
                    deps.is_empty().then_some(*candidate)
                })
                .collect();
            for candidate in unblocked {
                remaining.remove(candidate);
                ready.insert(candidate);
            }
        }
        debug!(count = ordered.len(), "ordered migrations");
        Ok(ordered)
    }

    /// Migrations no other migration depends on, optionally within one app.
    pub fn leaf_nodes(&self, app_label: Option<&str>) -> Vec<String> {
        let depended: BTreeSet<String> = self
            .migrations
            .values()
            .flat_map(Migration::resolved_dependencies)
            .collect();
        self.migrations
            .values()
            .filter(|m| app_label.map_or(true, |app| m.app_label == app))
            .map(Migration::qualified_name)
            .filter(|name| !depended.contains(name))
            .collect()
    }

    /// Project state after replaying every migration in order.
    pub fn project_state(&self) -> Result<ProjectState, MigrationError> {
        self.ordered_migrations()?
            .into_iter()
            .try_fold(ProjectState::new(), |state, migration| migration.apply_state(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::operation::Operation;
    use crate::migration::state::ModelState;

    #[test]
    fn test_order_ignores_registration_order() {
        let mut loader = MigrationLoader::new();
        loader
            .register(Migration::new("blog", "0002_posts").depends_on("0001_initial"))
            .unwrap();
        loader.register(Migration::new("blog", "0001_initial")).unwrap();
        let names: Vec<String> = loader
            .ordered_migrations()
            .unwrap()
            .iter()
            .map(|m| m.name.clone())
            .collect();
        assert_eq!(names, vec!["0001_initial", "0002_posts"]);
    }

    #[test]
    fn test_ties_break_by_name() {
        let loader = MigrationLoader::new()
            .with(Migration::new("shop", "0001_initial"))
            .unwrap()
            .with(Migration::new("auth", "0001_initial"))
            .unwrap()
            .with(Migration::new("blog", "0001_initial").depends_on("shop.0001_initial"))
            .unwrap();
        let names: Vec<String> = loader
            .ordered_migrations()
            .unwrap()
            .iter()
            .map(|m| m.qualified_name())
            .collect();
        assert_eq!(
            names,
            vec!["auth.0001_initial", "shop.0001_initial", "blog.0001_initial"]
        );
        assert_eq!(
            loader.leaf_nodes(None),
            vec!["auth.0001_initial", "blog.0001_initial"]
        );
        assert_eq!(loader.leaf_nodes(Some("shop")), Vec::<String>::new());
    }

    #[test]
    fn test_missing_dependency() {
        let loader = MigrationLoader::new()
            .with(Migration::new("blog", "0002_posts").depends_on("0001_initial"))
            .unwrap();
        match loader.ordered_migrations() {
            Err(MigrationError::MissingDependency {
                migration,
                dependency,
            }) => {
                assert_eq!(migration, "blog.0002_posts");
                assert_eq!(dependency, "blog.0001_initial");
            }
            other => panic!("expected missing dependency, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_reports_path() {
        let loader = MigrationLoader::new()
            .with(Migration::new("app", "a").depends_on("c"))
            .unwrap()
            .with(Migration::new("app", "b").depends_on("a"))
            .unwrap()
            .with(Migration::new("app", "c").depends_on("b"))
            .unwrap();
        match loader.ordered_migrations() {
            Err(MigrationError::CircularDependency { path }) => {
                assert_eq!(path, vec!["app.a", "app.c", "app.b", "app.a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicates_and_project_state() {
        let mut loader = MigrationLoader::new();
        let initial = Migration::new("blog", "0001_initial").with_operation(Operation::CreateModel {
            model: ModelState::new("blog", "Author"),
        });
        loader.register(initial.clone()).unwrap();
        assert!(matches!(
            loader.register(initial),
            Err(MigrationError::DuplicateMigration(_))
        ));
        let state = loader.project_state().unwrap();
        assert!(state.contains("blog.Author"));
    }
}
