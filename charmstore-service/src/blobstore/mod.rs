//! Content-addressed, reference-counted blob storage.
//!
//! [`Store`] binds user-visible names to immutable byte sequences addressed
//! by their SHA-384 hash. For any two blobs with the same hash exactly one
//! physical copy exists in the [`backend`](crate::backend); bindings are
//! reference-counted and the physical object is deleted only when the last
//! binding is removed.
//!
//! All cross-process coordination goes through conditional updates on the
//! document store: the store itself keeps no in-memory state beyond its
//! configuration and is safe for unbounded concurrent callers.

mod multipart;

pub use multipart::{Part, PartInfo};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use charmstore_types::{FieldSet, MultipartIndex};
use futures_util::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Digest;

use crate::backend::{Backend, BoxedBackend};
use crate::config::StoreConfig;
use crate::docstore::{from_document, to_document, Collection, Database, Filter, Mutation};
use crate::{Error, PayloadStream, Result};

/// Returns a new hasher producing the digest format used by the store.
pub fn new_hash() -> sha2::Sha384 {
    sha2::Sha384::new()
}

/// Returns the lowercase hex SHA-384 of the given bytes.
pub fn hash_of(data: &[u8]) -> String {
    hex::encode(sha2::Sha384::digest(data))
}

/// Converts a wall-clock time to the epoch-milliseconds representation
/// stored in documents.
pub(crate) fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The name of the chunk blob holding one part of a multipart upload.
pub(crate) fn part_name(upload_id: &str, part: u32) -> String {
    format!("{upload_id}/{part}")
}

/// A content-addressed blob store over a document database and a chunked
/// object backend.
#[derive(Debug, Clone)]
pub struct Store(Arc<StoreInner>);

#[derive(Debug)]
struct StoreInner {
    backend: BoxedBackend,
    refs: Arc<dyn Collection>,
    blobs: Arc<dyn Collection>,
    uploads: Arc<dyn Collection>,
    challenges: Arc<dyn Collection>,
    config: StoreConfig,
}

/// A binding of a user-visible name to stored content.
#[derive(Debug, Serialize, Deserialize)]
struct RefDoc {
    #[serde(rename = "_id")]
    name: String,
    hash: String,
    size: u64,
}

/// The per-content reference count.
#[derive(Debug, Serialize, Deserialize)]
struct BlobDoc {
    #[serde(rename = "_id")]
    hash: String,
    size: u64,
    refs: i64,
}

/// A pending two-phase put.
#[derive(Debug, Serialize, Deserialize)]
struct ChallengeDoc {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    size: u64,
    hash: String,
    expires: i64,
}

/// The challenge returned by [`Store::put_challenged`] when the content is
/// not yet stored. The id is an opaque nonce to be redeemed with
/// [`Store::put_with_challenge`] before it expires.
#[derive(Debug, Clone)]
pub struct PutChallenge {
    /// The opaque challenge nonce.
    pub id: String,
    /// When the challenge stops being redeemable.
    pub expires: SystemTime,
}

impl Store {
    /// Creates a store over the given database and backend. Collections are
    /// named `<prefix>.refs`, `<prefix>.blobs`, `<prefix>.uploads`, and
    /// `<prefix>.challenges`.
    pub fn new(
        db: &dyn Database,
        prefix: &str,
        backend: BoxedBackend,
        config: StoreConfig,
    ) -> Self {
        Self(Arc::new(StoreInner {
            backend,
            refs: db.collection(&format!("{prefix}.refs")),
            blobs: db.collection(&format!("{prefix}.blobs")),
            uploads: db.collection(&format!("{prefix}.uploads")),
            challenges: db.collection(&format!("{prefix}.challenges")),
            config,
        }))
    }

    /// The configuration the store was created with.
    pub fn config(&self) -> &StoreConfig {
        &self.0.config
    }

    /// Starts the background sweeper that deletes expired multipart uploads
    /// and challenges every [`StoreConfig::sweep_interval`].
    pub fn start(&self) {
        let store = self.clone();
        let interval = self.0.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so sweeps run one
            // full interval apart from startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = store.delete_expired_parts().await {
                    tracing::warn!(error = %err, "expired part sweep failed");
                }
            }
        });
    }

    /// Stores the stream's bytes under `name`, verifying them against the
    /// declared size and lowercase hex SHA-384 hash.
    ///
    /// A prior binding of `name` is replaced atomically; content already
    /// stored under the same hash is reused rather than rewritten. Fails
    /// with [`Error::HashMismatch`] when the bytes diverge from the
    /// declaration, in which case no binding is changed.
    pub async fn put_unchallenged(
        &self,
        stream: PayloadStream,
        name: &str,
        size: u64,
        hash: &str,
    ) -> Result<()> {
        let start = Instant::now();

        self.ensure_blob(stream, size, hash).await?;
        match self.bind_name(name, hash, size).await {
            Ok(Some(prev_hash)) => self.release(&prev_hash).await?,
            Ok(None) => {}
            Err(err) => {
                // Undo the reference taken by ensure_blob.
                if let Err(release_err) = self.release(hash).await {
                    tracing::warn!(error = %release_err, "cannot release blob after failed bind");
                }
                return Err(err);
            }
        }

        merni::distribution!("blobstore.put.latency"@s: start.elapsed());
        merni::distribution!("blobstore.put.size"@b: size);
        Ok(())
    }

    /// First phase of a hash-challenged put.
    ///
    /// If content with the given hash is already stored, the name is bound
    /// immediately and no upload is needed (`None`). Otherwise the caller
    /// receives a challenge whose nonce must be redeemed with
    /// [`put_with_challenge`](Self::put_with_challenge) within its expiry.
    pub async fn put_challenged(
        &self,
        name: &str,
        size: u64,
        hash: &str,
    ) -> Result<Option<PutChallenge>> {
        if self.try_reference(hash).await? {
            match self.bind_name(name, hash, size).await {
                Ok(Some(prev_hash)) => self.release(&prev_hash).await?,
                Ok(None) => {}
                Err(err) => {
                    if let Err(release_err) = self.release(hash).await {
                        tracing::warn!(error = %release_err, "cannot release blob after failed bind");
                    }
                    return Err(err);
                }
            }
            merni::counter!("blobstore.put.challenge_skipped": 1);
            return Ok(None);
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let expires = SystemTime::now() + self.0.config.challenge_expiry;
        let doc = to_document(&ChallengeDoc {
            id: id.clone(),
            name: name.to_owned(),
            size,
            hash: hash.to_owned(),
            expires: unix_millis(expires),
        })?;
        self.0.challenges.insert(doc).await?;
        Ok(Some(PutChallenge { id, expires }))
    }

    /// Second phase of a hash-challenged put: uploads the stream declared
    /// by an earlier [`put_challenged`](Self::put_challenged). An unknown
    /// or expired nonce fails with [`Error::NotFound`].
    pub async fn put_with_challenge(&self, challenge_id: &str, stream: PayloadStream) -> Result<()> {
        let not_found = || Error::not_found(format!("challenge {challenge_id:?}"));
        let doc = self
            .0
            .challenges
            .find_one(&Filter::Id(challenge_id.to_owned()), &FieldSet::new())
            .await?
            .ok_or_else(not_found)?;
        let challenge: ChallengeDoc = from_document(doc)?;
        if challenge.expires < unix_millis(SystemTime::now()) {
            self.0.challenges.remove_id(challenge_id).await?;
            return Err(not_found());
        }

        self.put_unchallenged(stream, &challenge.name, challenge.size, &challenge.hash)
            .await?;
        self.0.challenges.remove_id(challenge_id).await?;
        Ok(())
    }

    /// Opens the blob bound to `name` for sequential reading, returning the
    /// stream and its length.
    ///
    /// With a [`MultipartIndex`], `name` is an upload id and the returned
    /// stream concatenates the chunk blobs `<name>/0 .. <name>/n-1` in
    /// order.
    pub async fn open(
        &self,
        name: &str,
        index: Option<&MultipartIndex>,
    ) -> Result<(PayloadStream, u64)> {
        let Some(index) = index else {
            return self.open_blob(name).await;
        };

        let total = index.total_size();
        let parts: Vec<String> = (0..index.sizes.len())
            .map(|part| part_name(name, part as u32))
            .collect();
        let store = self.clone();
        let stream = futures_util::stream::iter(parts)
            .then(move |part| {
                let store = store.clone();
                async move {
                    match store.open_blob(&part).await {
                        Ok((stream, _)) => stream,
                        Err(err) => futures_util::stream::once(async move {
                            Err(std::io::Error::other(err))
                        })
                        .boxed(),
                    }
                }
            })
            .flatten()
            .boxed();
        Ok((stream, total))
    }

    /// Removes the binding of `name`. The backing content is deleted only
    /// when its last binding is removed. Removing an unbound name is not an
    /// error.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let Some(doc) = self
            .0
            .refs
            .find_one(&Filter::Id(name.to_owned()), &FieldSet::new())
            .await?
        else {
            return Ok(());
        };
        let binding: RefDoc = from_document(doc)?;

        // Remove only the binding we resolved, so a concurrent rebind of
        // the same name is not lost.
        let removed = self
            .0
            .refs
            .remove(&Filter::And(vec![
                Filter::Id(name.to_owned()),
                Filter::Eq("hash".into(), Value::String(binding.hash.clone())),
            ]))
            .await?;
        if removed > 0 {
            self.release(&binding.hash).await?;
        }
        Ok(())
    }

    /// Resolves a single (non-composite) blob name.
    async fn open_blob(&self, name: &str) -> Result<(PayloadStream, u64)> {
        let not_found = || Error::not_found(format!("resource at path {name:?}"));
        let doc = self
            .0
            .refs
            .find_one(&Filter::Id(name.to_owned()), &FieldSet::new())
            .await?
            .ok_or_else(not_found)?;
        let binding: RefDoc = from_document(doc)?;
        let (size, stream) = self
            .0
            .backend
            .get_object(&binding.hash)
            .await?
            .ok_or_else(not_found)?;
        Ok((stream, size))
    }

    /// Makes sure content with the given hash is durably stored and takes
    /// one reference to it.
    async fn ensure_blob(&self, stream: PayloadStream, size: u64, hash: &str) -> Result<()> {
        if self.try_reference(hash).await? {
            // Content is already stored. The incoming bytes are verified
            // anyway so a bad uploader cannot alias existing content.
            if let Err(err) = verify_stream(stream, size, hash).await {
                self.release(hash).await?;
                return Err(err);
            }
            merni::counter!("blobstore.put.deduplicated": 1);
            return Ok(());
        }

        let hasher = Arc::new(Mutex::new(new_hash()));
        let written = Arc::new(AtomicU64::new(0));
        let stream = stream
            .inspect({
                let hasher = Arc::clone(&hasher);
                let written = Arc::clone(&written);
                move |res| {
                    if let Ok(chunk) = res {
                        hasher.lock().unwrap().update(chunk);
                        written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    }
                }
            })
            .boxed();

        self.0.backend.put_object(hash, stream).await?;

        let digest = hex::encode(hasher.lock().unwrap().clone().finalize());
        if written.load(Ordering::Acquire) != size || digest != hash {
            self.0.backend.delete_object(hash).await?;
            return Err(Error::HashMismatch(String::new()));
        }

        let doc = to_document(&BlobDoc {
            hash: hash.to_owned(),
            size,
            refs: 1,
        })?;
        loop {
            match self.0.blobs.insert(doc.clone()).await {
                Ok(()) => return Ok(()),
                Err(Error::DuplicateKey(_)) => {
                    // Raced with another uploader of the same content; take
                    // a reference to theirs instead. If the document went
                    // away again in between, retry the insert.
                    if self.try_reference(hash).await? {
                        return Ok(());
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Bumps the refcount iff content with the given hash is stored.
    async fn try_reference(&self, hash: &str) -> Result<bool> {
        let stored = Filter::And(vec![
            Filter::Id(hash.to_owned()),
            Filter::Exists("refs".into(), true),
        ]);
        let matched = self
            .0
            .blobs
            .update(&stored, &[Mutation::Inc("refs".into(), 1)])
            .await?;
        Ok(matched == 1)
    }

    /// Drops one reference; deletes the physical content when the count
    /// reaches zero.
    async fn release(&self, hash: &str) -> Result<()> {
        self.0
            .blobs
            .update_id(hash, &[Mutation::Inc("refs".into(), -1)])
            .await?;
        let dead = Filter::And(vec![
            Filter::Id(hash.to_owned()),
            Filter::Lt("refs".into(), Value::from(1)),
        ]);
        if self.0.blobs.remove(&dead).await? > 0 {
            self.0.backend.delete_object(hash).await?;
        }
        Ok(())
    }

    /// Binds `name` to the given content, replacing a prior binding
    /// atomically. Returns the previously bound hash, whose reference the
    /// caller must release.
    async fn bind_name(&self, name: &str, hash: &str, size: u64) -> Result<Option<String>> {
        loop {
            let prev = self
                .0
                .refs
                .find_one(&Filter::Id(name.to_owned()), &FieldSet::new())
                .await?;
            match prev {
                None => {
                    let doc = to_document(&RefDoc {
                        name: name.to_owned(),
                        hash: hash.to_owned(),
                        size,
                    })?;
                    match self.0.refs.insert(doc).await {
                        Ok(()) => return Ok(None),
                        // A peer bound the name first; re-read and replace.
                        Err(Error::DuplicateKey(_)) => continue,
                        Err(err) => return Err(err),
                    }
                }
                Some(doc) => {
                    let prev: RefDoc = from_document(doc)?;
                    let unchanged = Filter::And(vec![
                        Filter::Id(name.to_owned()),
                        Filter::Eq("hash".into(), Value::String(prev.hash.clone())),
                    ]);
                    let bind = [
                        Mutation::Set("hash".into(), Value::String(hash.to_owned())),
                        Mutation::Set("size".into(), Value::from(size)),
                    ];
                    if self.0.refs.update(&unchanged, &bind).await? == 1 {
                        return Ok(Some(prev.hash));
                    }
                    // The binding changed under us; retry against the new one.
                }
            }
        }
    }
}

/// Drains a stream, verifying its size and hash without storing anything.
async fn verify_stream(mut stream: PayloadStream, size: u64, hash: &str) -> Result<()> {
    let mut hasher = new_hash();
    let mut read = 0u64;
    while let Some(chunk) = stream.try_next().await? {
        hasher.update(&chunk);
        read += chunk.len() as u64;
    }
    if read != size || hex::encode(hasher.finalize()) != hash {
        return Err(Error::HashMismatch(String::new()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::in_memory::InMemoryBackend;
    use crate::docstore::memory::MemoryDatabase;
    use crate::stream::{make_stream, read_to_vec};

    pub(crate) fn make_store() -> (Store, InMemoryBackend, Arc<MemoryDatabase>) {
        let db = Arc::new(MemoryDatabase::new());
        let backend = InMemoryBackend::new();
        let store = Store::new(
            db.as_ref(),
            "blobstore",
            Box::new(backend.clone()),
            StoreConfig::default(),
        );
        (store, backend, db)
    }

    pub(crate) async fn put(store: &Store, name: &str, content: &[u8]) {
        store
            .put_unchallenged(
                make_stream(content),
                name,
                content.len() as u64,
                &hash_of(content),
            )
            .await
            .unwrap();
    }

    pub(crate) async fn open_to_vec(store: &Store, name: &str) -> Result<Vec<u8>> {
        let (stream, _) = store.open(name, None).await?;
        read_to_vec(stream).await
    }

    #[tokio::test]
    async fn put_and_open() {
        let (store, _backend, _db) = make_store();
        put(&store, "x", b"some data").await;

        let (stream, length) = store.open("x", None).await.unwrap();
        assert_eq!(length, 9);
        assert_eq!(read_to_vec(stream).await.unwrap(), b"some data");
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let (store, backend, _db) = make_store();
        put(&store, "x", b"some data").await;
        put(&store, "x", b"some data").await;

        assert_eq!(backend.len(), 1);
        assert_eq!(open_to_vec(&store, "x").await.unwrap(), b"some data");
    }

    #[tokio::test]
    async fn put_twice_overwrites() {
        let (store, backend, _db) = make_store();
        put(&store, "x", b"some data").await;
        put(&store, "x", b"some different data").await;

        assert_eq!(open_to_vec(&store, "x").await.unwrap(), b"some different data");
        // The replaced content lost its last reference.
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn bad_hash_rejected() {
        let (store, backend, _db) = make_store();
        let content = b"some data";
        let err = store
            .put_unchallenged(
                make_stream(content),
                "x",
                content.len() as u64,
                &hash_of(b"wrong"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HashMismatch(_)), "{err}");

        // Nothing was bound and nothing survives in the backend.
        assert!(matches!(store.open("x", None).await, Err(Error::NotFound(_))));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn bad_size_rejected() {
        let (store, _backend, _db) = make_store();
        let content = b"some data";
        let err = store
            .put_unchallenged(make_stream(content), "x", 4, &hash_of(content))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HashMismatch(_)), "{err}");
    }

    #[tokio::test]
    async fn remove_makes_unreadable() {
        let (store, _backend, _db) = make_store();
        put(&store, "x", b"some data").await;
        assert_eq!(open_to_vec(&store, "x").await.unwrap(), b"some data");

        store.remove("x").await.unwrap();

        let err = match store.open("x", None).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.is_not_found(), "{err}");

        // Removing a missing name is not an error.
        store.remove("x").await.unwrap();
    }

    #[tokio::test]
    async fn dedup_across_names() {
        let (store, backend, _db) = make_store();
        put(&store, "a", b"shared content").await;
        put(&store, "b", b"shared content").await;

        // One physical copy serves both names.
        assert_eq!(backend.len(), 1);

        store.remove("a").await.unwrap();
        assert_eq!(open_to_vec(&store, "b").await.unwrap(), b"shared content");

        store.remove("b").await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn mismatched_put_does_not_alias_existing_content() {
        let (store, _backend, _db) = make_store();
        put(&store, "a", b"good content").await;

        // Claim the stored hash while uploading different bytes.
        let err = store
            .put_unchallenged(make_stream(b"evil content"), "b", 12, &hash_of(b"good content"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HashMismatch(_)), "{err}");

        assert!(matches!(store.open("b", None).await, Err(Error::NotFound(_))));
        assert_eq!(open_to_vec(&store, "a").await.unwrap(), b"good content");
    }

    #[tokio::test]
    async fn challenged_put_of_known_content_needs_no_upload() {
        let (store, backend, _db) = make_store();
        put(&store, "x", b"some data").await;

        let challenge = store
            .put_challenged("y", 9, &hash_of(b"some data"))
            .await
            .unwrap();
        assert!(challenge.is_none(), "no upload should be needed");

        assert_eq!(open_to_vec(&store, "y").await.unwrap(), b"some data");
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn challenged_put_of_unknown_content_roundtrips() {
        let (store, _backend, _db) = make_store();
        let content = b"fresh content";
        let hash = hash_of(content);

        let challenge = store
            .put_challenged("x", content.len() as u64, &hash)
            .await
            .unwrap()
            .expect("upload should be required");

        store
            .put_with_challenge(&challenge.id, make_stream(content))
            .await
            .unwrap();
        assert_eq!(open_to_vec(&store, "x").await.unwrap(), content);

        // The nonce is single-use.
        let err = store
            .put_with_challenge(&challenge.id, make_stream(content))
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }
}
