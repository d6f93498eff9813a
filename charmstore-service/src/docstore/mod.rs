//! The document-store contract consumed by the blob store, the migration
//! engine, and the entity queries.
//!
//! The contract is deliberately small: filtered finds with field projection
//! and forward-only iteration, inserts with duplicate-key detection, and
//! conditional updates that report how many documents matched. The matched
//! count is the compare-and-set primitive everything else builds on: an
//! update whose filter pins both the `_id` and the expected prior state
//! either applies atomically or matches nothing.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use charmstore_types::FieldSet;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::{Error, Result};

/// A schemaless document. Every document carries a string `_id` field.
pub type Document = serde_json::Map<String, Value>;

/// Forward-only stream of documents produced by [`Collection::find`].
pub type DocStream = BoxStream<'static, Result<Document>>;

/// A filter over documents, evaluated against dotted field paths.
///
/// A path like `"parts.3.complete"` traverses objects by key and arrays by
/// index. A missing path never satisfies [`Filter::Eq`]; use
/// [`Filter::Exists`] to distinguish absent from null.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Matches every document.
    All,
    /// Matches the document with the given `_id`.
    Id(String),
    /// Matches documents whose value at the path equals the given value.
    Eq(String, Value),
    /// Matches documents whose value at the path is present and differs.
    Ne(String, Value),
    /// Matches documents whose numeric value at the path is strictly less.
    Lt(String, Value),
    /// Matches documents by presence or absence of the path.
    Exists(String, bool),
    /// Matches documents satisfying all inner filters.
    And(Vec<Filter>),
    /// Matches documents satisfying at least one inner filter.
    Or(Vec<Filter>),
}

/// A single update operator applied to every matched document.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Sets the value at the path, creating intermediate objects and
    /// null-padding intermediate arrays as needed.
    Set(String, Value),
    /// Removes the value at the path (array elements become null).
    Unset(String),
    /// Appends the value to the array at the path unless already present.
    AddToSet(String, Value),
    /// Adds the amount to the integer at the path (missing counts as zero).
    Inc(String, i64),
    /// Removes all occurrences of the value from the array at the path.
    Pull(String, Value),
}

/// A named collection of documents.
#[async_trait]
pub trait Collection: fmt::Debug + Send + Sync + 'static {
    /// Inserts a document. The document must carry a string `_id`; a clash
    /// with an existing id fails with [`Error::DuplicateKey`].
    async fn insert(&self, doc: Document) -> Result<()>;

    /// Returns the first document matching the filter, projected to the
    /// given fields (an empty set selects everything).
    async fn find_one(&self, filter: &Filter, fields: &FieldSet) -> Result<Option<Document>>;

    /// Returns a forward-only stream over all matching documents, projected
    /// to the given fields.
    async fn find(&self, filter: &Filter, fields: &FieldSet) -> Result<DocStream>;

    /// Applies the mutations to every matching document, atomically per
    /// document, and returns how many documents matched.
    async fn update(&self, filter: &Filter, mutations: &[Mutation]) -> Result<u64>;

    /// Applies the mutations to the document with the given id, creating it
    /// first if absent. Atomic with respect to other updates of the id.
    async fn upsert_id(&self, id: &str, mutations: &[Mutation]) -> Result<()>;

    /// Removes all matching documents and returns how many were removed.
    async fn remove(&self, filter: &Filter) -> Result<u64>;

    /// Applies the mutations to the document with the given id, returning
    /// whether it existed.
    async fn update_id(&self, id: &str, mutations: &[Mutation]) -> Result<bool> {
        Ok(self.update(&Filter::Id(id.to_owned()), mutations).await? > 0)
    }

    /// Removes the document with the given id, returning whether it existed.
    async fn remove_id(&self, id: &str) -> Result<bool> {
        Ok(self.remove(&Filter::Id(id.to_owned())).await? > 0)
    }
}

/// A database handing out named [`Collection`]s.
pub trait Database: fmt::Debug + Send + Sync + 'static {
    /// Returns the collection with the given name, creating it lazily.
    fn collection(&self, name: &str) -> Arc<dyn Collection>;
}

/// Extracts the `_id` of a document.
pub fn doc_id(doc: &Document) -> Result<&str> {
    doc.get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Database("document has no string _id".into()))
}

/// Deserializes a document into a typed value.
pub fn from_document<T: serde::de::DeserializeOwned>(doc: Document) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

/// Serializes a typed value into a document.
pub fn to_document<T: serde::Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(doc) => Ok(doc),
        _ => Err(Error::Database("value does not serialize to a document".into())),
    }
}
