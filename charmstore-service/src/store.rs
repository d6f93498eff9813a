//! Typed access to the charm store database.

use std::sync::Arc;

use async_trait::async_trait;
use charmstore_types::{BaseEntity, CharmUrl, Entity, FieldSet};
use futures_util::TryStreamExt;
use serde_json::Value;

use crate::docstore::{from_document, Collection, Database, Document, Filter};
use crate::entitycache::EntityStore;
use crate::{Error, Result};

/// Wraps the document database with typed access to the charm store
/// collections and the entity resolution queries.
#[derive(Debug, Clone)]
pub struct StoreDatabase {
    db: Arc<dyn Database>,
}

impl StoreDatabase {
    /// Creates a wrapper over the given database.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// The collection holding [`Entity`] documents.
    pub fn entities(&self) -> Arc<dyn Collection> {
        self.db.collection("entities")
    }

    /// The collection holding [`BaseEntity`] documents.
    pub fn base_entities(&self) -> Arc<dyn Collection> {
        self.db.collection("base_entities")
    }

    /// The collection holding the singleton migrations document.
    pub fn migrations(&self) -> Arc<dyn Collection> {
        self.db.collection("migrations")
    }

    /// Returns an arbitrary named collection.
    pub fn collection(&self, name: &str) -> Arc<dyn Collection> {
        self.db.collection(name)
    }

    /// Resolves a URL to the best matching entity, with the given fields
    /// populated.
    ///
    /// A URL without a user resolves through promulgated aliases; a URL
    /// without a revision resolves to the highest matching revision.
    pub async fn find_best_entity(&self, url: &CharmUrl, fields: &FieldSet) -> Result<Entity> {
        let entities = self.entities();
        let not_found = || Error::not_found(format!("entity {url:?}"));

        if url.revision().is_some() {
            let filter = if url.user().is_some() {
                Filter::Id(url.to_string())
            } else {
                Filter::Eq("promulgated-url".into(), Value::String(url.to_string()))
            };
            let doc = entities
                .find_one(&filter, fields)
                .await?
                .ok_or_else(not_found)?;
            return from_document(doc);
        }

        // No revision: scan the matching entities for the highest one.
        let mut conditions = vec![Filter::Eq(
            "name".into(),
            Value::String(url.name().to_owned()),
        )];
        if let Some(series) = url.series() {
            conditions.push(Filter::Eq("series".into(), Value::String(series.to_owned())));
        }
        let revision_field = match url.user() {
            Some(user) => {
                conditions.push(Filter::Eq("user".into(), Value::String(user.to_owned())));
                "revision"
            }
            None => {
                conditions.push(Filter::Exists("promulgated-url".into(), true));
                "promulgated-revision"
            }
        };

        let mut query_fields = fields.clone();
        if !query_fields.is_empty() {
            query_fields.insert(revision_field.to_owned());
        }
        let mut stream = entities.find(&Filter::And(conditions), &query_fields).await?;
        let mut best: Option<(i64, Document)> = None;
        while let Some(doc) = stream.try_next().await? {
            let revision = doc.get(revision_field).and_then(Value::as_i64).unwrap_or(-1);
            if best.as_ref().is_none_or(|(r, _)| revision > *r) {
                best = Some((revision, doc));
            }
        }
        let (_, doc) = best.ok_or_else(not_found)?;
        from_document(doc)
    }

    /// Resolves a URL to its owning base entity, with the given fields
    /// populated. A URL without a user resolves to the promulgated base
    /// entity for its name.
    pub async fn find_base_entity(&self, url: &CharmUrl, fields: &FieldSet) -> Result<BaseEntity> {
        let base = url.base();
        let filter = if base.user().is_some() {
            Filter::Id(base.to_string())
        } else {
            Filter::And(vec![
                Filter::Eq("name".into(), Value::String(base.name().to_owned())),
                Filter::Eq("promulgated".into(), Value::Bool(true)),
            ])
        };
        let doc = self
            .base_entities()
            .find_one(&filter, fields)
            .await?
            .ok_or_else(|| Error::not_found(format!("base entity {base:?}")))?;
        from_document(doc)
    }
}

#[async_trait]
impl EntityStore for StoreDatabase {
    async fn find_best_entity(&self, url: &CharmUrl, fields: &FieldSet) -> Result<Entity> {
        StoreDatabase::find_best_entity(self, url, fields).await
    }

    async fn find_base_entity(&self, url: &CharmUrl, fields: &FieldSet) -> Result<BaseEntity> {
        StoreDatabase::find_base_entity(self, url, fields).await
    }
}
