//! End-to-end migration tests: detect changes from registered models, name
//! and order migrations, apply them to the key-value backend.

use std::sync::Arc;

use ormkv_core::migration::{
    Change, KvRecorder, MigrationKind, MigrationNamer, Operation, Recorder,
};
use ormkv_core::{
    Connections, Database, FieldDef, FieldValue, KvBackend, KvConfig, Migration,
    MigrationError, MigrationExecutor, MigrationLoader, ModelDef, ModelRegistry, ProjectState,
    StateComparator, StorageBackend,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn author(name_length: usize, with_bio: bool) -> ModelDef {
    let mut builder = ModelDef::builder("blog", "Author").field("name", FieldDef::char(name_length));
    if with_bio {
        builder = builder.field("bio", FieldDef::text().default("n/a"));
    }
    builder.build().unwrap()
}

fn database(backend: &Arc<KvBackend>, models: Vec<ModelDef>) -> Database {
    let connections = Connections::new("default").with_backend(backend.clone());
    let db = Database::new(Arc::new(ModelRegistry::new()), Arc::new(connections));
    for model in models {
        db.register(model).unwrap();
    }
    db
}

#[test]
fn test_max_length_change_is_one_alter_field() {
    let before = ProjectState::from_models([ormkv_core::ModelState::from_def(&author(100, false))]);
    let after = ProjectState::from_models([ormkv_core::ModelState::from_def(&author(200, false))]);

    let changes = StateComparator::new().compare(&before, &after);
    assert_eq!(changes.len(), 1);
    match &changes[0] {
        Change::AlterField { model, changes, .. } => {
            assert_eq!(model, "blog.Author");
            assert_eq!(changes, &vec!["max_length".to_string()]);
        }
        other => panic!("expected AlterField, got {other:?}"),
    }

    let name = MigrationNamer::new().suggest(&changes);
    assert_eq!(name.kind, MigrationKind::Fix);
    assert_eq!(name.file_name(2), "0002_fix_author_name");
}

#[test]
fn test_dependency_registered_later_still_runs_first() {
    let mut loader = MigrationLoader::new();
    loader
        .register(Migration::new("blog", "0002_posts").depends_on("0001_initial"))
        .unwrap();
    loader.register(Migration::new("blog", "0001_initial")).unwrap();

    let order: Vec<String> = loader
        .ordered_migrations()
        .unwrap()
        .into_iter()
        .map(Migration::qualified_name)
        .collect();
    assert_eq!(order, vec!["blog.0001_initial", "blog.0002_posts"]);
    assert_eq!(loader.leaf_nodes(Some("blog")), vec!["blog.0002_posts"]);
}

#[test]
fn test_missing_and_circular_dependencies() {
    let loader = MigrationLoader::new()
        .with(Migration::new("shop", "0002_items").depends_on("0001_initial"))
        .unwrap();
    assert!(matches!(
        loader.ordered_migrations(),
        Err(MigrationError::MissingDependency { .. })
    ));

    let loader = MigrationLoader::new()
        .with(Migration::new("shop", "0001_a").depends_on("0002_b"))
        .unwrap()
        .with(Migration::new("shop", "0002_b").depends_on("0001_a"))
        .unwrap();
    match loader.ordered_migrations() {
        Err(MigrationError::CircularDependency { path }) => {
            assert_eq!(path.first(), path.last());
            assert!(path.len() >= 3);
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_detect_apply_and_evolve_schema() {
    init_tracing();
    let backend = Arc::new(KvBackend::new("default", KvConfig::temporary()));
    backend.connect().await.unwrap();
    let recorder = Arc::new(KvRecorder::new(backend.clone()));
    let executor = MigrationExecutor::new(backend.clone(), recorder.clone());

    // First release: the initial migration comes straight from the models.
    let v1 = database(&backend, vec![author(100, false)]);
    let initial_changes = StateComparator::new().compare(&ProjectState::new(), &v1.project_state());
    let initial_name = MigrationNamer::new().first(true).suggest(&initial_changes);
    assert_eq!(initial_name.kind, MigrationKind::Init);
    let mut loader = MigrationLoader::new();
    loader
        .register(Migration::from_changes(
            "blog",
            initial_name.file_name(1),
            &initial_changes,
        ))
        .unwrap();

    let applied = executor.migrate(&loader).await.unwrap();
    assert_eq!(applied, vec!["blog.0001_init_initial"]);
    assert!(backend.table_exists("blog_author").await.unwrap());

    let authors = v1.manager("blog.Author").unwrap();
    authors.create(&[("name", "Alice".into())]).await.unwrap();
    authors.create(&[("name", "Bob".into())]).await.unwrap();

    // Second release adds a field with a default; stored rows are backfilled.
    let v2 = database(&backend, vec![author(100, true)]);
    let changes = StateComparator::new().compare(&loader.project_state().unwrap(), &v2.project_state());
    assert!(matches!(changes.as_slice(), [Change::AddField { .. }]));
    let name = MigrationNamer::new().suggest(&changes);
    loader
        .register(
            Migration::from_changes("blog", name.file_name(2), &changes)
                .depends_on(initial_name.file_name(1)),
        )
        .unwrap();

    assert_eq!(executor.plan(&loader).await.unwrap().len(), 1);
    let applied = executor.migrate(&loader).await.unwrap();
    assert_eq!(applied, vec!["blog.0002_feat_author_bio"]);
    assert_eq!(
        recorder.applied().await.unwrap(),
        vec!["blog.0001_init_initial", "blog.0002_feat_author_bio"]
    );

    let alice = v2.manager("blog.Author").unwrap().get("name", "Alice").await.unwrap();
    assert_eq!(alice.get("bio").unwrap(), &FieldValue::from("n/a"));

    // Generated migrations carry backward operations; unapplying hides the column.
    let undone = executor.unapply(&loader, 1).await.unwrap();
    assert_eq!(undone, vec!["blog.0002_feat_author_bio"]);
    let meta = backend.table_meta("blog_author").await.unwrap().unwrap();
    assert!(meta.column("bio").is_some_and(|c| c.deprecated));
    assert_eq!(recorder.applied().await.unwrap(), vec!["blog.0001_init_initial"]);
}

#[test]
fn test_migrations_serialise_to_json() {
    let migration = Migration::new("blog", "0003_rename")
        .depends_on("0002_feat_author_bio")
        .with_operation(Operation::RenameField {
            model: "blog.Author".into(),
            from: "bio".into(),
            to: "about".into(),
        });
    let json = serde_json::to_string(&migration).unwrap();
    assert!(json.contains("\"op\":\"rename_field\""));
    let back: Migration = serde_json::from_str(&json).unwrap();
    assert_eq!(back.qualified_name(), "blog.0003_rename");
    assert_eq!(back.operations.len(), 1);
}
