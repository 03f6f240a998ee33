//! Migration name suggestions.
//!
//! The namer is advisory. It classifies a change list by the kind of work it
//! does and derives a short slug from the models and fields involved.

use std::collections::BTreeSet;
use std::fmt;

use super::diff::Change;

const MAX_SLUG_LEN: usize = 40;

/// Broad category of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MigrationKind {
    /// First migration of an app.
    Init,
    /// Removes models, fields or indexes.
    Remove,
    /// Adds models or fields.
    Feat,
    /// Adjusts existing field definitions.
    Fix,
    /// Renames and index or constraint reshuffles.
    Refactor,
}

impl MigrationKind {
    /// Lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationKind::Init => "init",
            MigrationKind::Remove => "remove",
            MigrationKind::Feat => "feat",
            MigrationKind::Fix => "fix",
            MigrationKind::Refactor => "refactor",
        }
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A suggested migration name.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationName {
    /// Category.
    pub kind: MigrationKind,
    /// Lowercase, underscore-separated slug.
    pub slug: String,
    /// How strongly the changes agree on `kind`, in `[0, 1]`.
    pub confidence: f64,
}

impl MigrationName {
    /// File-style name, e.g. `0003_feat_author_bio`.
    pub fn file_name(&self, number: u32) -> String {
        format!("{:04}_{}_{}", number, self.kind, self.slug)
    }
}

/// Suggests names for change lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationNamer {
    first: bool,
}

impl MigrationNamer {
    /// A namer for migrations that follow earlier ones.
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat the change list as an app's first migration.
    pub fn first(mut self, first: bool) -> Self {
        self.first = first;
        self
    }

    fn classify(&self, change: &Change) -> MigrationKind {
        match change {
            Change::CreateModel { .. } if self.first => MigrationKind::Init,
            Change::CreateModel { .. } | Change::AddField { .. } => MigrationKind::Feat,
            Change::DeleteModel { .. } | Change::RemoveField { .. } => MigrationKind::Remove,
            Change::AlterField { .. } => MigrationKind::Fix,
            Change::RenameField { .. }
            | Change::AddIndex { .. }
            | Change::RemoveIndex { .. }
            | Change::AlterUniqueTogether { .. } => MigrationKind::Refactor,
        }
    }

    /// Suggest a name for a change list.
    pub fn suggest(&self, changes: &[Change]) -> MigrationName {
        if changes.is_empty() {
            return MigrationName {
                kind: MigrationKind::Refactor,
                slug: "empty".to_string(),
                confidence: 0.0,
            };
        }

        let mut counts = [0usize; 5];
        for change in changes {
            counts[self.classify(change) as usize] += 1;
        }
        // Ties go to the earlier variant.
        let (winner, votes) = [
            MigrationKind::Init,
            MigrationKind::Remove,
            MigrationKind::Feat,
            MigrationKind::Fix,
            MigrationKind::Refactor,
        ]
        .into_iter()
        .map(|kind| (kind, counts[kind as usize]))
        .fold((MigrationKind::Refactor, 0), |best, candidate| {
            if candidate.1 > best.1 {
                candidate
            } else {
                best
            }
        });

        let share = votes as f64 / changes.len() as f64;
        let confidence = if votes == changes.len() {
            match winner {
                MigrationKind::Init => 0.95,
                MigrationKind::Fix => 0.7,
                _ => 0.9,
            }
        } else {
            (share * 0.8 * 100.0).round() / 100.0
        };

        let slug = if winner == MigrationKind::Init {
            "initial".to_string()
        } else if let [only] = changes {
            single_slug(only)
        } else {
            models_slug(changes)
        };

        MigrationName {
            kind: winner,
            slug: truncate(slug),
            confidence,
        }
    }
}

fn short(model: &str) -> String {
    model.rsplit('.').next().unwrap_or(model).to_lowercase()
}

fn single_slug(change: &Change) -> String {
    let model = short(&change.model_name());
    match change {
        Change::CreateModel { .. } => model,
        Change::DeleteModel { .. } => format!("delete_{model}"),
        Change::AddField { field, .. } => format!("{model}_{}", field.name),
        Change::RemoveField { field, .. } => format!("{model}_{}", field.name),
        Change::AlterField { to, .. } => format!("{model}_{}", to.name),
        Change::RenameField { from, to, .. } => format!("{model}_{}_to_{}", from.name, to.name),
        Change::AddIndex { index, .. } | Change::RemoveIndex { index, .. } => {
            format!("{model}_{}", index.name)
        }
        Change::AlterUniqueTogether { .. } => format!("{model}_unique_together"),
    }
}

fn models_slug(changes: &[Change]) -> String {
    let models: BTreeSet<String> = changes.iter().map(|c| short(&c.model_name())).collect();
    let mut parts: Vec<String> = models.iter().take(3).cloned().collect();
    if models.len() > 3 {
        parts.push("and_more".to_string());
    }
    parts.join("_")
}

fn truncate(slug: String) -> String {
    let cleaned: String = slug
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let mut cut: String = cleaned.chars().take(MAX_SLUG_LEN).collect();
    while cut.ends_with('_') {
        cut.pop();
    }
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::state::{FieldState, ModelState};

    fn add(model: &str, field: &str) -> Change {
        Change::AddField {
            model: model.to_string(),
            field: FieldState::new(field, "TextField", Some(field.to_string())),
        }
    }

    fn remove(model: &str, field: &str) -> Change {
        Change::RemoveField {
            model: model.to_string(),
            field: FieldState::new(field, "TextField", Some(field.to_string())),
        }
    }

    #[test]
    fn test_initial_migration() {
        let changes = vec![
            Change::CreateModel {
                model: ModelState::new("blog", "Author"),
            },
            Change::CreateModel {
                model: ModelState::new("blog", "Post"),
            },
        ];
        let name = MigrationNamer::new().first(true).suggest(&changes);
        assert_eq!(name.kind, MigrationKind::Init);
        assert_eq!(name.file_name(1), "0001_init_initial");
        assert!(name.confidence > 0.9);

        let later = MigrationNamer::new().suggest(&changes);
        assert_eq!(later.kind, MigrationKind::Feat);
        assert_eq!(later.slug, "author_post");
    }

    #[test]
    fn test_single_change_slug() {
        let name = MigrationNamer::new().suggest(&[add("blog.Author", "bio")]);
        assert_eq!(name.kind, MigrationKind::Feat);
        assert_eq!(name.file_name(3), "0003_feat_author_bio");
    }

    #[test]
    fn test_mixed_changes_lower_confidence() {
        let changes = vec![
            remove("blog.Author", "age"),
            remove("blog.Post", "draft"),
            add("blog.Post", "status"),
        ];
        let name = MigrationNamer::new().suggest(&changes);
        assert_eq!(name.kind, MigrationKind::Remove);
        assert!((name.confidence - 0.53).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&name.confidence));
    }

    #[test]
    fn test_empty_and_long_slugs() {
        assert_eq!(MigrationNamer::new().suggest(&[]).confidence, 0.0);
        let long = add("blog.Author", "a_really_quite_extraordinarily_long_field_name");
        let name = MigrationNamer::new().suggest(&[long]);
        assert!(name.slug.len() <= MAX_SLUG_LEN);
        assert!(!name.slug.ends_with('_'));
    }
}
