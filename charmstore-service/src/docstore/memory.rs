//! In-memory document store.
//!
//! This provides a [`Database`] backed by mutex-protected maps. One mutex
//! per collection gives the per-document atomicity the conditional updates
//! in the contract require, which makes it suitable for tests and embedded
//! single-process deployments only; a multi-process deployment needs a
//! store whose conditional updates are atomic across processes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use charmstore_types::FieldSet;
use futures_util::StreamExt;
use serde_json::Value;

use super::{Collection, Database, DocStream, Document, Filter, Mutation};
use crate::{Error, Result};

/// An in-memory [`Database`].
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    collections: Mutex<HashMap<String, Arc<MemoryCollection>>>,
}

impl MemoryDatabase {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for MemoryDatabase {
    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        let mut collections = self.collections.lock().unwrap();
        Arc::clone(
            collections
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(MemoryCollection::default())),
        ) as Arc<dyn Collection>
    }
}

/// A single in-memory collection, keyed by `_id`.
#[derive(Debug, Default)]
pub struct MemoryCollection {
    docs: Mutex<BTreeMap<String, Document>>,
}

#[async_trait::async_trait]
impl Collection for MemoryCollection {
    async fn insert(&self, doc: Document) -> Result<()> {
        let id = super::doc_id(&doc)?.to_owned();
        let mut docs = self.docs.lock().unwrap();
        if docs.contains_key(&id) {
            return Err(Error::DuplicateKey(id));
        }
        docs.insert(id, doc);
        Ok(())
    }

    async fn find_one(&self, filter: &Filter, fields: &FieldSet) -> Result<Option<Document>> {
        let docs = self.docs.lock().unwrap();
        Ok(docs
            .values()
            .find(|doc| matches(doc, filter))
            .map(|doc| project(doc, fields)))
    }

    async fn find(&self, filter: &Filter, fields: &FieldSet) -> Result<DocStream> {
        // Snapshot under the lock; the stream itself is then lock-free,
        // which keeps iteration forward-only and deadlock-free even when
        // the consumer updates the collection mid-iteration.
        let snapshot: Vec<Document> = {
            let docs = self.docs.lock().unwrap();
            docs.values()
                .filter(|doc| matches(doc, filter))
                .map(|doc| project(doc, fields))
                .collect()
        };
        Ok(futures_util::stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn update(&self, filter: &Filter, mutations: &[Mutation]) -> Result<u64> {
        let mut docs = self.docs.lock().unwrap();
        let mut matched = 0;
        for doc in docs.values_mut() {
            if matches(doc, filter) {
                matched += 1;
                for mutation in mutations {
                    apply(doc, mutation);
                }
            }
        }
        Ok(matched)
    }

    async fn upsert_id(&self, id: &str, mutations: &[Mutation]) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs.entry(id.to_owned()).or_insert_with(|| {
            let mut doc = Document::new();
            doc.insert("_id".to_owned(), Value::String(id.to_owned()));
            doc
        });
        for mutation in mutations {
            apply(doc, mutation);
        }
        Ok(())
    }

    async fn remove(&self, filter: &Filter) -> Result<u64> {
        let mut docs = self.docs.lock().unwrap();
        let before = docs.len();
        docs.retain(|_, doc| !matches(doc, filter));
        Ok((before - docs.len()) as u64)
    }
}

/// Resolves a dotted path within a document.
fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Sets the value at a dotted path, creating intermediate objects and
/// null-padding intermediate arrays, matching the sparse-array update
/// semantics the multipart protocol depends on.
fn set_path(doc: &mut Document, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let (first, rest) = segments.split_first().expect("path is never empty");
    if rest.is_empty() {
        doc.insert((*first).to_owned(), value);
        return;
    }
    let slot = doc.entry((*first).to_owned()).or_insert(Value::Null);
    set_value_path(slot, rest, value);
}

fn set_value_path(slot: &mut Value, segments: &[&str], value: Value) {
    let (segment, rest) = segments.split_first().expect("segments are never empty");
    if let Ok(index) = segment.parse::<usize>() {
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        let items = slot.as_array_mut().unwrap();
        while items.len() <= index {
            items.push(Value::Null);
        }
        if rest.is_empty() {
            items[index] = value;
        } else {
            set_value_path(&mut items[index], rest, value);
        }
    } else {
        if !slot.is_object() {
            *slot = Value::Object(Document::new());
        }
        let map = slot.as_object_mut().unwrap();
        if rest.is_empty() {
            map.insert((*segment).to_owned(), value);
        } else {
            let next = map.entry((*segment).to_owned()).or_insert(Value::Null);
            set_value_path(next, rest, value);
        }
    }
}

/// Removes the value at a dotted path. Array elements become null so that
/// sibling indices keep their positions.
fn unset_path(doc: &mut Document, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments.split_last().expect("path is never empty");
    if parents.is_empty() {
        doc.remove(*last);
        return;
    }
    let mut current = match doc.get_mut(parents[0]) {
        Some(value) => value,
        None => return,
    };
    for segment in &parents[1..] {
        current = match current {
            Value::Object(map) => match map.get_mut(*segment) {
                Some(value) => value,
                None => return,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(value) => value,
                None => return,
            },
            _ => return,
        };
    }
    match current {
        Value::Object(map) => {
            map.remove(*last);
        }
        Value::Array(items) => {
            if let Some(item) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *item = Value::Null;
            }
        }
        _ => {}
    }
}

fn apply(doc: &mut Document, mutation: &Mutation) {
    match mutation {
        Mutation::Set(path, value) => set_path(doc, path, value.clone()),
        Mutation::Unset(path) => unset_path(doc, path),
        Mutation::AddToSet(path, value) => {
            let mut items = match get_path(doc, path) {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            if !items.contains(value) {
                items.push(value.clone());
                set_path(doc, path, Value::Array(items));
            }
        }
        Mutation::Inc(path, amount) => {
            let current = get_path(doc, path).and_then(Value::as_i64).unwrap_or(0);
            set_path(doc, path, Value::from(current + amount));
        }
        Mutation::Pull(path, value) => {
            if let Some(Value::Array(items)) = get_path(doc, path) {
                let retained: Vec<Value> =
                    items.iter().filter(|item| *item != value).cloned().collect();
                set_path(doc, path, Value::Array(retained));
            }
        }
    }
}

fn matches(doc: &Document, filter: &Filter) -> bool {
    match filter {
        Filter::All => true,
        Filter::Id(id) => doc.get("_id").and_then(Value::as_str) == Some(id),
        Filter::Eq(path, value) => get_path(doc, path) == Some(value),
        Filter::Ne(path, value) => matches!(get_path(doc, path), Some(found) if found != value),
        Filter::Lt(path, value) => get_path(doc, path).is_some_and(|found| less_than(found, value)),
        Filter::Exists(path, expected) => get_path(doc, path).is_some() == *expected,
        Filter::And(filters) => filters.iter().all(|filter| matches(doc, filter)),
        Filter::Or(filters) => filters.iter().any(|filter| matches(doc, filter)),
    }
}

fn less_than(a: &Value, b: &Value) -> bool {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a < b;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a < b,
        _ => false,
    }
}

/// Projects a document to the requested fields. An empty set selects the
/// whole document; otherwise `_id` and the top-level segment of every
/// requested path are kept.
fn project(doc: &Document, fields: &FieldSet) -> Document {
    if fields.is_empty() {
        return doc.clone();
    }
    let mut out = Document::new();
    if let Some(id) = doc.get("_id") {
        out.insert("_id".to_owned(), id.clone());
    }
    for field in fields {
        let top = field.split('.').next().unwrap();
        if !out.contains_key(top) {
            if let Some(value) = doc.get(top) {
                out.insert(top.to_owned(), value.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use charmstore_types::field_set;
    use futures_util::TryStreamExt;
    use serde_json::json;

    use super::*;

    fn doc(value: serde_json::Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not a document"),
        }
    }

    fn collection() -> MemoryCollection {
        MemoryCollection::default()
    }

    #[tokio::test]
    async fn insert_detects_duplicates() {
        let c = collection();
        c.insert(doc(json!({"_id": "x", "n": 1}))).await.unwrap();
        let err = c.insert(doc(json!({"_id": "x"}))).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(id) if id == "x"));
    }

    #[tokio::test]
    async fn conditional_claim_matches_once() {
        let c = collection();
        c.insert(doc(json!({"_id": "up", "parts": []}))).await.unwrap();

        // The claim condition from the multipart protocol: the slot must be
        // absent or null.
        let unclaimed = Filter::And(vec![
            Filter::Id("up".into()),
            Filter::Or(vec![
                Filter::Exists("parts.2".into(), false),
                Filter::Eq("parts.2".into(), Value::Null),
            ]),
        ]);
        let claim = [Mutation::Set("parts.2".into(), json!({"hash": "h", "size": 3}))];

        assert_eq!(c.update(&unclaimed, &claim).await.unwrap(), 1);
        // A second claim no longer matches.
        assert_eq!(c.update(&unclaimed, &claim).await.unwrap(), 0);

        // The array was null-padded up to the claimed slot.
        let stored = c.find_one(&Filter::Id("up".into()), &FieldSet::new()).await.unwrap().unwrap();
        assert_eq!(stored["parts"], json!([null, null, {"hash": "h", "size": 3}]));
    }

    #[tokio::test]
    async fn nested_set_and_exists() {
        let c = collection();
        c.insert(doc(json!({"_id": "up", "parts": [null, {"hash": "h", "size": 1}]})))
            .await
            .unwrap();
        c.update_id("up", &[Mutation::Set("parts.1.complete".into(), json!(true))])
            .await
            .unwrap();

        let stored = c.find_one(&Filter::Eq("parts.1.complete".into(), json!(true)), &FieldSet::new())
            .await
            .unwrap();
        assert!(stored.is_some());

        // Explicit null is present, a missing index is not.
        let stored = stored.unwrap();
        assert!(get_path(&stored, "parts.0").is_some());
        assert!(get_path(&stored, "parts.5").is_none());
    }

    #[tokio::test]
    async fn add_to_set_deduplicates() {
        let c = collection();
        c.upsert_id("migrations", &[Mutation::AddToSet("executed".into(), json!("migr-1"))])
            .await
            .unwrap();
        c.upsert_id("migrations", &[Mutation::AddToSet("executed".into(), json!("migr-1"))])
            .await
            .unwrap();
        c.upsert_id("migrations", &[Mutation::AddToSet("executed".into(), json!("migr-2"))])
            .await
            .unwrap();

        let stored = c.find_one(&Filter::All, &FieldSet::new()).await.unwrap().unwrap();
        assert_eq!(stored["executed"], json!(["migr-1", "migr-2"]));
    }

    #[tokio::test]
    async fn unset_and_pull() {
        let c = collection();
        c.insert(doc(json!({
            "_id": "b",
            "hash": "h",
            "acls": {"read": ["everyone", "bob"]},
            "parts": [{"hash": "p0"}, {"hash": "p1"}],
        })))
        .await
        .unwrap();

        c.update_id("b", &[Mutation::Unset("hash".into()), Mutation::Unset("parts.0".into())])
            .await
            .unwrap();
        c.update_id("b", &[Mutation::Pull("acls.read".into(), json!("bob"))])
            .await
            .unwrap();

        let stored = c.find_one(&Filter::All, &FieldSet::new()).await.unwrap().unwrap();
        assert!(stored.get("hash").is_none());
        // Unsetting an array element nulls it, keeping sibling positions.
        assert_eq!(stored["parts"], json!([null, {"hash": "p1"}]));
        assert_eq!(stored["acls"]["read"], json!(["everyone"]));
    }

    #[tokio::test]
    async fn inc_and_conditional_remove() {
        let c = collection();
        c.insert(doc(json!({"_id": "h1", "refs": 2}))).await.unwrap();

        c.update_id("h1", &[Mutation::Inc("refs".into(), -1)]).await.unwrap();
        let gone = Filter::And(vec![Filter::Id("h1".into()), Filter::Lt("refs".into(), json!(1))]);
        assert_eq!(c.remove(&gone).await.unwrap(), 0);

        c.update_id("h1", &[Mutation::Inc("refs".into(), -1)]).await.unwrap();
        assert_eq!(c.remove(&gone).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn projection_keeps_id_and_top_level_fields() {
        let c = collection();
        c.insert(doc(json!({"_id": "e", "baseurl": "b", "blobname": "n", "size": 3})))
            .await
            .unwrap();

        let stored = c.find_one(&Filter::All, &field_set(["baseurl", "acls.read"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("_id"), Some(&json!("e")));
        assert_eq!(stored.get("baseurl"), Some(&json!("b")));
        assert!(stored.get("blobname").is_none());
        assert!(stored.get("size").is_none());
    }

    #[tokio::test]
    async fn find_streams_matching_documents() {
        let c = collection();
        for i in 0..3 {
            c.insert(doc(json!({"_id": format!("d{i}"), "expires": i})))
                .await
                .unwrap();
        }

        let stream = c.find(&Filter::Lt("expires".into(), json!(2)), &FieldSet::new())
            .await
            .unwrap();
        let found: Vec<Document> = stream.try_collect().await.unwrap();
        assert_eq!(found.len(), 2);
    }
}
