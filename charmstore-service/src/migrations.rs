//! Idempotent database schema migrations.
//!
//! [`migrate`] runs at server start, before any request is served. It
//! consults the singleton migrations document for already-executed names
//! and runs the remaining migrations in declaration order. There is no
//! distributed lock: several replicas may start at once, so every
//! migration must be idempotent and tolerate being partially applied by a
//! peer mid-run. The discipline that makes this work: iterate matching
//! documents with a forward-only filter and apply per-document updates
//! whose post-condition excludes them from that filter.
//!
//! Executed names are recorded with an atomic append-if-absent, which
//! deduplicates concurrent completions. Names are append-only across the
//! lifetime of a deployment: removing or renaming one would make older
//! replicas reject the database as unknown.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use charmstore_types::{field_set, BaseEntity, CharmUrl};
use futures_util::future::BoxFuture;
use futures_util::TryStreamExt;
use serde_json::Value;

use crate::docstore::{doc_id, to_document, Collection, Document, Filter, Mutation};
use crate::store::StoreDatabase;
use crate::{Error, Result};

/// The id of the singleton document recording executed migrations.
const MIGRATIONS_DOC_ID: &str = "migrations";

/// The group everyone belongs to, granted read access by default.
pub const EVERYONE: &str = "everyone";

/// The error type migration functions return.
pub type MigrationError = Box<dyn std::error::Error + Send + Sync>;

type MigrationFn =
    Box<dyn Fn(StoreDatabase) -> BoxFuture<'static, std::result::Result<(), MigrationError>> + Send + Sync>;

/// A named, idempotent transformation of the database.
pub struct Migration {
    name: String,
    run: MigrationFn,
}

impl Migration {
    /// Creates a migration with a stable name and its function.
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(StoreDatabase) -> BoxFuture<'static, std::result::Result<(), MigrationError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    /// The migration's stable name, used to record execution.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// All the migrations executed, in order, when the charm store server is
/// started. To introduce a new migration, append it to this list; never
/// remove or rename an existing one.
pub fn default_migrations() -> Vec<Migration> {
    vec![
        Migration::new("entity ids denormalization", |db| {
            Box::pin(denormalize_entity_ids(db))
        }),
        Migration::new("base entities creation", |db| {
            Box::pin(create_base_entities(db))
        }),
        Migration::new("read acl creation", |db| Box::pin(populate_read_acl(db))),
        Migration::new("write acl creation", |db| Box::pin(populate_write_acl(db))),
        Migration::new("populate promulgated entities", |db| {
            Box::pin(populate_promulgated_entities(db))
        }),
    ]
}

/// Runs all not-yet-executed migrations in declaration order.
///
/// Fails with [`Error::UnknownMigration`] when the database records a name
/// this binary does not know (the replica is older than the database), and
/// with [`Error::MigrationFailed`] when a migration function fails; nothing
/// after a failed migration is run.
pub async fn migrate(db: &StoreDatabase, migrations: &[Migration]) -> Result<()> {
    let executed = executed_migrations(db, migrations).await?;

    for migration in migrations {
        if executed.contains(migration.name()) {
            tracing::debug!(name = migration.name(), "skipping already executed migration");
            continue;
        }
        tracing::info!(name = migration.name(), "starting migration");
        (migration.run)(db.clone())
            .await
            .map_err(|source| Error::MigrationFailed {
                name: migration.name().to_owned(),
                source: Arc::from(source),
            })?;
        set_executed(db, migration.name()).await?;
        tracing::info!(name = migration.name(), "migration completed");
    }
    Ok(())
}

/// Reads the executed-migrations set, verifying every recorded name is
/// known to this binary. An absent document means nothing was executed.
async fn executed_migrations(
    db: &StoreDatabase,
    migrations: &[Migration],
) -> Result<HashSet<String>> {
    let Some(doc) = db
        .migrations()
        .find_one(&Filter::All, &field_set(["executed"]))
        .await?
    else {
        return Ok(HashSet::new());
    };
    let executed: Vec<String> = match doc.get("executed") {
        Some(value) => serde_json::from_value(value.clone())?,
        None => Vec::new(),
    };

    let known: HashSet<&str> = migrations.iter().map(Migration::name).collect();
    for name in &executed {
        if !known.contains(name.as_str()) {
            return Err(Error::UnknownMigration { name: name.clone() });
        }
    }
    Ok(executed.into_iter().collect())
}

/// Records a migration as executed with an atomic append-if-absent.
async fn set_executed(db: &StoreDatabase, name: &str) -> Result<()> {
    db.migrations()
        .upsert_id(
            MIGRATIONS_DOC_ID,
            &[Mutation::AddToSet(
                "executed".into(),
                Value::String(name.to_owned()),
            )],
        )
        .await
}

/// Adds the user, name, revision and series fields to entities where those
/// fields are missing.
async fn denormalize_entity_ids(db: StoreDatabase) -> std::result::Result<(), MigrationError> {
    let entities = db.entities();
    let mut stream = entities
        .find(&Filter::Exists("name".into(), false), &field_set(["_id"]))
        .await?;
    while let Some(doc) = stream.try_next().await? {
        let url: CharmUrl = doc_id(&doc)?.parse()?;
        tracing::info!("updating {url}");
        entities
            .update_id(
                &url.to_string(),
                &[
                    Mutation::Set(
                        "user".into(),
                        Value::String(url.user().unwrap_or_default().to_owned()),
                    ),
                    Mutation::Set("name".into(), Value::String(url.name().to_owned())),
                    Mutation::Set("revision".into(), Value::from(url.revision().unwrap_or(-1))),
                    Mutation::Set(
                        "series".into(),
                        Value::String(url.series().unwrap_or_default().to_owned()),
                    ),
                ],
            )
            .await?;
    }
    Ok(())
}

/// Creates a public base entity for each entity in the database.
async fn create_base_entities(db: StoreDatabase) -> std::result::Result<(), MigrationError> {
    let base_entities = db.base_entities();
    let mut counter = 0;

    let mut stream = db
        .entities()
        .find(&Filter::All, &field_set(["baseurl"]))
        .await?;
    while let Some(doc) = stream.try_next().await? {
        let Some(base_url) = doc.get("baseurl").and_then(Value::as_str) else {
            continue;
        };
        let base: CharmUrl = base_url.parse()?;
        let base_entity = BaseEntity {
            user: Some(base.user().unwrap_or_default().to_owned()),
            name: Some(base.name().to_owned()),
            public: Some(true),
            ..BaseEntity::new(base)
        };
        match base_entities.insert(to_document(&base_entity)?).await {
            Ok(()) => counter += 1,
            // A peer created it first.
            Err(Error::DuplicateKey(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }
    tracing::info!("{counter} base entities created");
    Ok(())
}

/// Adds the read ACL to base entities not having it.
async fn populate_read_acl(db: StoreDatabase) -> std::result::Result<(), MigrationError> {
    let base_entities = db.base_entities();
    let needs_acl = Filter::Or(vec![
        Filter::Exists("acls".into(), false),
        Filter::Eq("acls.read".into(), Value::Array(Vec::new())),
    ]);

    let mut counter = 0;
    let mut stream = base_entities.find(&needs_acl, &field_set(["_id"])).await?;
    while let Some(doc) = stream.try_next().await? {
        let url: CharmUrl = doc_id(&doc)?.parse()?;
        let mut read_perm = vec![Value::String(EVERYONE.to_owned())];
        if let Some(user) = url.user() {
            read_perm.push(Value::String(user.to_owned()));
        }
        base_entities
            .update_id(
                &url.to_string(),
                &[Mutation::Set("acls.read".into(), Value::Array(read_perm))],
            )
            .await?;
        counter += 1;
    }
    tracing::info!("{counter} base entities updated");
    Ok(())
}

/// Adds the write ACL to owned base entities not having the field.
async fn populate_write_acl(db: StoreDatabase) -> std::result::Result<(), MigrationError> {
    let base_entities = db.base_entities();
    let needs_acl = Filter::And(vec![
        Filter::Exists("acls.write".into(), false),
        Filter::Ne("user".into(), Value::String(String::new())),
    ]);

    let mut counter = 0;
    let mut stream = base_entities.find(&needs_acl, &field_set(["_id"])).await?;
    while let Some(doc) = stream.try_next().await? {
        let url: CharmUrl = doc_id(&doc)?.parse()?;
        let Some(user) = url.user() else {
            continue;
        };
        base_entities
            .update_id(
                &url.to_string(),
                &[Mutation::Set(
                    "acls.write".into(),
                    Value::Array(vec![Value::String(user.to_owned())]),
                )],
            )
            .await?;
        counter += 1;
    }
    tracing::info!("{counter} base entities updated");
    Ok(())
}

/// Folds old-style promulgated entities (stored without a user) into their
/// owned counterparts, recording the promulgated alias on the owned entity
/// and removing the old documents.
async fn populate_promulgated_entities(db: StoreDatabase) -> std::result::Result<(), MigrationError> {
    let entities = db.entities();
    let base_entities = db.base_entities();

    let stream = entities
        .find(
            &Filter::Eq("user".into(), Value::String(String::new())),
            &field_set(["_id", "baseurl", "blobhash", "extrainfo"]),
        )
        .await?;
    let mut old: Vec<Document> = stream.try_collect().await?;
    old.sort_by_key(|doc| {
        doc_id(doc)
            .ok()
            .and_then(|id| id.parse::<CharmUrl>().ok())
            .and_then(|url| url.revision())
            .unwrap_or(-1)
    });

    for doc in old {
        let url: CharmUrl = doc_id(&doc)?.parse()?;
        tracing::debug!("promulgated URL: {url}");
        let owner = doc
            .get("extrainfo")
            .and_then(|info| info.get("bzr-owner"))
            .and_then(Value::as_str)
            .ok_or_else(|| format!("cannot get promulgated user for {url}"))?;
        if owner.is_empty() {
            return Err(format!("no user for {url}").into());
        }
        tracing::debug!("user: {owner}");

        let mut owned = vec![
            Filter::Eq("user".into(), Value::String(owner.to_owned())),
            Filter::Eq("name".into(), Value::String(url.name().to_owned())),
            Filter::Eq(
                "series".into(),
                Value::String(url.series().unwrap_or_default().to_owned()),
            ),
        ];
        if let Some(blob_hash) = doc.get("blobhash").and_then(Value::as_str) {
            owned.push(Filter::Eq(
                "blobhash".into(),
                Value::String(blob_hash.to_owned()),
            ));
        }
        let matched = entities
            .update(
                &Filter::And(owned),
                &[
                    Mutation::Set("promulgated-url".into(), Value::String(url.to_string())),
                    Mutation::Set(
                        "promulgated-revision".into(),
                        Value::from(url.revision().unwrap_or(-1)),
                    ),
                ],
            )
            .await?;
        if matched == 0 {
            return Err(format!("cannot update entity for promulgated charm or bundle {url}").into());
        }

        // The owner's base holds the promulgation; any other base with the
        // same name loses it.
        base_entities
            .update(
                &Filter::And(vec![
                    Filter::Eq("name".into(), Value::String(url.name().to_owned())),
                    Filter::Eq("user".into(), Value::String(owner.to_owned())),
                ]),
                &[Mutation::Set("promulgated".into(), Value::Bool(true))],
            )
            .await?;
        base_entities
            .update(
                &Filter::And(vec![
                    Filter::Eq("name".into(), Value::String(url.name().to_owned())),
                    Filter::Ne("user".into(), Value::String(owner.to_owned())),
                    Filter::Eq("promulgated".into(), Value::Bool(true)),
                ]),
                &[Mutation::Set("promulgated".into(), Value::Bool(false))],
            )
            .await?;

        // The old documents are aliases now; drop them.
        entities.remove_id(&url.to_string()).await?;
        if let Some(base_url) = doc.get("baseurl").and_then(Value::as_str) {
            base_entities.remove_id(base_url).await?;
        }
    }

    entities
        .update(
            &Filter::Exists("promulgated-revision".into(), false),
            &[Mutation::Set("promulgated-revision".into(), Value::from(-1))],
        )
        .await?;
    base_entities
        .update(
            &Filter::Exists("promulgated".into(), false),
            &[Mutation::Set("promulgated".into(), Value::Bool(false))],
        )
        .await?;
    Ok(())
}
