//! Integration tests for managers, querysets and relations.

use ormkv_core::{Database, Error, FieldDef, FieldValue, Manager, ModelDef, OnDelete};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Blog {
    db: Database,
    authors: Manager,
    posts: Manager,
    comments: Manager,
}

async fn blog(post_on_delete: OnDelete) -> Blog {
    init_tracing();
    let db = Database::temporary().await.unwrap();

    // Posts register before their target to exercise deferred relations.
    let posts = db
        .register(
            ModelDef::builder("blog", "Post")
                .field("title", FieldDef::char(200))
                .field("views", FieldDef::integer().default(0))
                .field(
                    "author",
                    FieldDef::foreign_key("Author")
                        .related_name("posts")
                        .on_delete(post_on_delete)
                        .null(),
                )
                .ordering(&["title"])
                .build()
                .unwrap(),
        )
        .unwrap();
    let authors = db
        .register(
            ModelDef::builder("blog", "Author")
                .field("name", FieldDef::char(100))
                .field("email", FieldDef::email().unique().null())
                .build()
                .unwrap(),
        )
        .unwrap();
    let comments = db
        .register(
            ModelDef::builder("blog", "Comment")
                .field("body", FieldDef::text())
                .field(
                    "post",
                    FieldDef::foreign_key("blog.Post").related_name("comments"),
                )
                .build()
                .unwrap(),
        )
        .unwrap();

    Blog {
        db,
        authors,
        posts,
        comments,
    }
}

async fn seed(blog: &Blog) {
    let alice = blog.authors.create(&[("name", "Alice".into())]).await.unwrap();
    let bob = blog.authors.create(&[("name", "Bob".into())]).await.unwrap();
    for (title, views, author) in [
        ("Intro to sled", 120, &alice),
        ("Async traits", 40, &alice),
        ("Borrowing", 75, &bob),
    ] {
        let post = blog
            .posts
            .create(&[
                ("title", title.into()),
                ("views", views.into()),
                ("author", author.pk().clone()),
            ])
            .await
            .unwrap();
        blog.comments
            .create(&[("body", "nice".into()), ("post", post.pk().clone())])
            .await
            .unwrap();
    }
}

fn titles(posts: &[ormkv_core::Instance]) -> Vec<String> {
    posts
        .iter()
        .map(|p| p.get("title").unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_filter_fetches_single_match() {
    let blog = blog(OnDelete::Cascade).await;
    blog.authors.create(&[("name", "Alice".into())]).await.unwrap();
    blog.authors.create(&[("name", "Bob".into())]).await.unwrap();

    let found = blog.authors.filter("name", "Alice").fetch().await.unwrap();
    assert_eq!(found.array().len(), 1);
    assert_eq!(found.array()[0].get("name").unwrap(), &FieldValue::from("Alice"));
}

#[tokio::test]
async fn test_clear_cache_empties_array() {
    let blog = blog(OnDelete::Cascade).await;
    seed(&blog).await;

    let fetched = blog.posts.all().fetch().await.unwrap();
    assert!(fetched.is_fetched());
    assert_eq!(fetched.array().len(), 3);

    let cleared = fetched.clear_cache();
    assert!(!cleared.is_fetched());
    assert!(cleared.array().is_empty());
}

#[tokio::test]
async fn test_lookup_spans_foreign_keys() {
    let blog = blog(OnDelete::Cascade).await;
    seed(&blog).await;

    let by_alice = blog
        .posts
        .filter("author__name", "Alice")
        .fetch()
        .await
        .unwrap();
    assert_eq!(titles(by_alice.array()), vec!["Async traits", "Intro to sled"]);

    let two_hops = blog
        .comments
        .filter("post__author__name__iexact", "bob")
        .count()
        .await
        .unwrap();
    assert_eq!(two_hops, 1);

    let excluded = blog
        .posts
        .exclude("author__name", "Alice")
        .fetch()
        .await
        .unwrap();
    assert_eq!(titles(excluded.array()), vec!["Borrowing"]);

    assert!(matches!(
        blog.posts.filter("author__nickname", "x").fetch().await,
        Err(Error::InvalidLookup(_))
    ));
}

#[tokio::test]
async fn test_related_accessors() {
    let blog = blog(OnDelete::Cascade).await;
    seed(&blog).await;

    let mut post = blog.posts.get("title", "Borrowing").await.unwrap();
    assert!(matches!(
        post.related("author"),
        Err(Error::RelationNotLoaded { .. })
    ));
    let author = post.fetch_related(&blog.db, "author").await.unwrap().unwrap();
    assert_eq!(author.get("name").unwrap().to_string(), "Bob");
    assert_eq!(post.related("author").unwrap().get("name").unwrap().to_string(), "Bob");

    let alice = blog.authors.get("name", "Alice").await.unwrap();
    let written = alice.related_set(&blog.db, "posts").await.unwrap();
    assert_eq!(written.count().await.unwrap(), 2);

    // Re-pointing the key drops the cached relation.
    post.set("author", alice.pk().clone()).unwrap();
    assert!(post.related("author").is_err());
    post.save(&blog.db).await.unwrap();
    assert_eq!(written.count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_many_to_many_links() {
    init_tracing();
    let db = Database::temporary().await.unwrap();
    let tags = db
        .register(
            ModelDef::builder("blog", "Tag")
                .field("label", FieldDef::char(30).unique())
                .build()
                .unwrap(),
        )
        .unwrap();
    let articles = db
        .register(
            ModelDef::builder("blog", "Article")
                .field("title", FieldDef::char(100))
                .field("tags", FieldDef::many_to_many("Tag").related_name("articles"))
                .build()
                .unwrap(),
        )
        .unwrap();

    let rust = tags.create(&[("label", "rust".into())]).await.unwrap();
    let db_tag = tags.create(&[("label", "databases".into())]).await.unwrap();
    let article = articles.create(&[("title", "sled internals".into())]).await.unwrap();

    assert_eq!(article.m2m_add(&db, "tags", &[&rust, &db_tag, &rust]).await.unwrap(), 2);
    assert_eq!(article.m2m_add(&db, "tags", &[&rust]).await.unwrap(), 0);
    assert_eq!(article.m2m_related(&db, "tags").await.unwrap().count().await.unwrap(), 2);

    let tagged = rust.related_set(&db, "articles").await.unwrap().fetch().await.unwrap();
    assert_eq!(tagged.array().len(), 1);

    assert_eq!(article.m2m_remove(&db, "tags", &[&rust]).await.unwrap(), 1);
    assert_eq!(article.m2m_ids(&db, "tags").await.unwrap(), vec![db_tag.pk().clone()]);
}

#[tokio::test]
async fn test_cascade_reaches_grandchildren() {
    let blog = blog(OnDelete::Cascade).await;
    seed(&blog).await;

    let mut alice = blog.authors.get("name", "Alice").await.unwrap();
    assert!(alice.delete(&blog.db).await.unwrap());
    assert!(alice.pk().is_null());
    assert!(!alice.is_persisted());

    assert_eq!(blog.posts.count().await.unwrap(), 1);
    assert_eq!(blog.comments.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_set_null_and_protect() {
    let blog = blog(OnDelete::SetNull).await;
    seed(&blog).await;

    let removed = blog.authors.filter("name", "Bob").delete().await.unwrap();
    assert_eq!(removed, 1);
    let orphan = blog.posts.get("title", "Borrowing").await.unwrap();
    assert!(orphan.fk_id("author").unwrap().is_null());

    let guarded = blog_with_protect().await;
    let owner = guarded.authors.create(&[("name", "Carol".into())]).await.unwrap();
    guarded
        .posts
        .create(&[("title", "Kept".into()), ("author", owner.pk().clone())])
        .await
        .unwrap();
    let mut owner = owner;
    assert!(matches!(
        owner.delete(&guarded.db).await,
        Err(Error::Protected { count: 1, .. })
    ));
    assert_eq!(guarded.authors.count().await.unwrap(), 1);
}

async fn blog_with_protect() -> Blog {
    blog(OnDelete::Protect).await
}

#[tokio::test]
async fn test_values_and_slicing() {
    let blog = blog(OnDelete::Cascade).await;
    seed(&blog).await;

    let rows = blog
        .posts
        .order_by(&["-views"])
        .offset(1)
        .limit(1)
        .values(&["title", "views"])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["title"].to_string(), "Borrowing");
    assert_eq!(rows[0]["views"], FieldValue::Int(75));
}

#[tokio::test]
async fn test_bulk_create_and_save_summary() {
    let blog = blog(OnDelete::Cascade).await;
    let mut batch = Vec::new();
    for name in ["Dana", "Eve"] {
        let mut author = blog.authors.new_instance();
        author.set("name", name).unwrap();
        batch.push(author);
    }
    let created = blog.authors.bulk_create(batch).await.unwrap();
    assert!(created.iter().all(|a| a.is_persisted() && !a.pk().is_null()));

    let mut fetched = blog.authors.all().fetch().await.unwrap();
    for author in fetched.array_mut() {
        author.set("email", format!("{}@example.com", author.get("name").unwrap())).unwrap();
    }
    let summary = fetched.save().await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.updated, 2);
    assert_eq!(summary.failed, 0);

    let mut clash = blog.authors.new_instance();
    clash.set("name", "Mallory").unwrap();
    clash.set("email", "DANA@example.com").unwrap();
    assert!(matches!(
        clash.save(&blog.db).await,
        Err(Error::UniquenessViolation { .. })
    ));
}
