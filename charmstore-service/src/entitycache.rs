//! A per-request cache of entity and base-entity documents.
//!
//! HTTP handlers construct one [`Cache`] per bulk metadata request. Field
//! handlers register the document fields they need up front; the cache then
//! issues every backing-store query with the running union of those fields,
//! so one query serves all handlers.
//!
//! Lookups of the same URL are coalesced: at most one load per `(kind,
//! url)` is in flight, and later callers attach to it and observe the same
//! result. Loading an entity also indexes it under its promulgated alias
//! and prefetches its base entity in the background.
//!
//! Lock discipline: one mutex over both maps, released before any await;
//! per-entry wake-up through a shared [`Notify`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use charmstore_types::{field_set, BaseEntity, CharmUrl, Entity, FieldSet};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{Error, Result};

/// The entity fields every cache query includes, whatever the handlers
/// register: resolving aliases and prefetching base entities needs them.
pub const REQUIRED_ENTITY_FIELDS: &[&str] = &["_id", "baseurl", "promulgated-url"];

/// The base-entity fields every cache query includes.
pub const REQUIRED_BASE_ENTITY_FIELDS: &[&str] = &["_id"];

/// The backing store the cache loads documents from.
#[async_trait]
pub trait EntityStore: fmt::Debug + Send + Sync + 'static {
    /// Resolves a URL (possibly a promulgated alias, possibly without a
    /// revision) to the best matching entity with the given fields
    /// populated.
    async fn find_best_entity(&self, url: &CharmUrl, fields: &FieldSet) -> Result<Entity>;

    /// Resolves a URL to its owning base entity with the given fields
    /// populated.
    async fn find_base_entity(&self, url: &CharmUrl, fields: &FieldSet) -> Result<BaseEntity>;
}

/// A pre-issued stream of entity documents, as produced by a bulk query.
pub type EntityStream = BoxStream<'static, Result<Entity>>;

/// A pre-issued stream of base-entity documents.
pub type BaseEntityStream = BoxStream<'static, Result<BaseEntity>>;

/// A per-request cache over two entity kinds, keyed by URL.
#[derive(Debug, Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn EntityStore>,
    state: Mutex<State>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

#[derive(Debug)]
struct State {
    entity_fields: FieldSet,
    base_fields: FieldSet,
    entities: HashMap<String, Entry<Entity>>,
    base_entities: HashMap<String, Entry<BaseEntity>>,
    iter_error: Option<Error>,
}

/// A cache entry. `Loading` is the coalescing point: every caller of the
/// same URL waits on the shared notify. `Done` is terminal for errors and
/// terminal for successes until a caller needs fields beyond `fields`.
#[derive(Debug)]
enum Entry<T> {
    Loading { notify: Arc<Notify> },
    Done { result: Result<Arc<T>>, fields: FieldSet },
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        match self {
            Entry::Loading { notify } => Entry::Loading {
                notify: Arc::clone(notify),
            },
            Entry::Done { result, fields } => Entry::Done {
                result: result.clone(),
                fields: fields.clone(),
            },
        }
    }
}

impl Cache {
    /// Creates a cache over the given backing store.
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                state: Mutex::new(State {
                    entity_fields: field_set(REQUIRED_ENTITY_FIELDS.iter().copied()),
                    base_fields: field_set(REQUIRED_BASE_ENTITY_FIELDS.iter().copied()),
                    entities: HashMap::new(),
                    base_entities: HashMap::new(),
                    iter_error: None,
                }),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Adds fields to the set included in every entity query.
    pub fn add_entity_fields(&self, fields: &FieldSet) {
        let mut state = self.inner.state.lock().unwrap();
        state.entity_fields.extend(fields.iter().cloned());
    }

    /// Adds fields to the set included in every base-entity query.
    pub fn add_base_entity_fields(&self, fields: &FieldSet) {
        let mut state = self.inner.state.lock().unwrap();
        state.base_fields.extend(fields.iter().cloned());
    }

    /// The current union of registered entity fields. Callers pre-issuing
    /// their own entity queries must select exactly this set.
    pub fn entity_fields(&self) -> FieldSet {
        self.inner.state.lock().unwrap().entity_fields.clone()
    }

    /// The current union of registered base-entity fields.
    pub fn base_entity_fields(&self) -> FieldSet {
        self.inner.state.lock().unwrap().base_fields.clone()
    }

    /// Returns the entity for the given URL with at least the union of
    /// `extra_fields` and the registered fields populated.
    ///
    /// Concurrent lookups of the same URL share one backing-store call. A
    /// previously failed load replays the same error without retrying.
    pub async fn entity(&self, url: &CharmUrl, extra_fields: &FieldSet) -> Result<Arc<Entity>> {
        let key = url.to_string();
        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(Error::Closed);
            }
            let notify = {
                let mut state = self.inner.state.lock().unwrap();
                state.entity_fields.extend(extra_fields.iter().cloned());
                let needed = state.entity_fields.clone();
                match state.entities.get(&key).cloned() {
                    None => {
                        let notify = Arc::new(Notify::new());
                        state.entities.insert(
                            key.clone(),
                            Entry::Loading {
                                notify: Arc::clone(&notify),
                            },
                        );
                        self.spawn_entity_load(url.clone(), key.clone(), needed, Arc::clone(&notify));
                        notify
                    }
                    Some(Entry::Loading { notify }) => notify,
                    Some(Entry::Done { result: Err(err), .. }) => return Err(err),
                    Some(Entry::Done { result: Ok(entity), fields }) => {
                        if needed.is_subset(&fields) {
                            return Ok(entity);
                        }
                        // The entry lacks fields this caller needs; reload
                        // it with the widened union.
                        let widened: FieldSet = needed.union(&fields).cloned().collect();
                        let notify = Arc::new(Notify::new());
                        state.entities.insert(
                            key.clone(),
                            Entry::Loading {
                                notify: Arc::clone(&notify),
                            },
                        );
                        self.spawn_entity_load(url.clone(), key.clone(), widened, Arc::clone(&notify));
                        notify
                    }
                }
            };
            self.wait_entity(&key, notify).await?;
        }
    }

    /// Returns the base entity owning the given URL, analogous to
    /// [`entity`](Self::entity).
    pub async fn base_entity(
        &self,
        url: &CharmUrl,
        extra_fields: &FieldSet,
    ) -> Result<Arc<BaseEntity>> {
        let base_url = url.base();
        let key = base_url.to_string();
        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(Error::Closed);
            }
            let notify = {
                let mut state = self.inner.state.lock().unwrap();
                state.base_fields.extend(extra_fields.iter().cloned());
                let needed = state.base_fields.clone();
                match state.base_entities.get(&key).cloned() {
                    None => {
                        let notify = Arc::new(Notify::new());
                        state.base_entities.insert(
                            key.clone(),
                            Entry::Loading {
                                notify: Arc::clone(&notify),
                            },
                        );
                        self.spawn_base_load(
                            base_url.clone(),
                            vec![key.clone()],
                            needed,
                            Arc::clone(&notify),
                        );
                        notify
                    }
                    Some(Entry::Loading { notify }) => notify,
                    Some(Entry::Done { result: Err(err), .. }) => return Err(err),
                    Some(Entry::Done { result: Ok(base), fields }) => {
                        if needed.is_subset(&fields) {
                            return Ok(base);
                        }
                        let widened: FieldSet = needed.union(&fields).cloned().collect();
                        let notify = Arc::new(Notify::new());
                        state.base_entities.insert(
                            key.clone(),
                            Entry::Loading {
                                notify: Arc::clone(&notify),
                            },
                        );
                        self.spawn_base_load(
                            base_url.clone(),
                            vec![key.clone()],
                            widened,
                            Arc::clone(&notify),
                        );
                        notify
                    }
                }
            };
            self.wait_base(&key, notify).await?;
        }
    }

    /// Consumes a pre-issued entity stream in the background, populating
    /// the cache as results arrive. The stream must have been issued with
    /// the current [`entity_fields`](Self::entity_fields) selection.
    pub fn add_entities(&self, mut stream: EntityStream) {
        let cache = self.clone();
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    _ = inner.cancel.cancelled() => break,
                };
                match item {
                    None => break,
                    Some(Ok(entity)) => {
                        let woken = {
                            let mut state = inner.state.lock().unwrap();
                            let fields = state.entity_fields.clone();
                            cache.insert_entity_locked(&mut state, Arc::new(entity), fields, None)
                        };
                        for notify in woken {
                            notify.notify_waiters();
                        }
                    }
                    Some(Err(err)) => {
                        let mut state = inner.state.lock().unwrap();
                        state.iter_error.get_or_insert(err);
                        break;
                    }
                }
            }
        });
    }

    /// Consumes a pre-issued base-entity stream in the background,
    /// analogous to [`add_entities`](Self::add_entities).
    pub fn add_base_entities(&self, mut stream: BaseEntityStream) {
        let cache = self.clone();
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    _ = inner.cancel.cancelled() => break,
                };
                match item {
                    None => break,
                    Some(Ok(base)) => {
                        let woken = {
                            let mut state = inner.state.lock().unwrap();
                            let fields = state.base_fields.clone();
                            insert_base_locked(&mut state, Arc::new(base), fields, &[])
                        };
                        for notify in woken {
                            notify.notify_waiters();
                        }
                    }
                    Some(Err(err)) => {
                        let mut state = inner.state.lock().unwrap();
                        state.iter_error.get_or_insert(err);
                        break;
                    }
                }
            }
        });
    }

    /// Wraps a pre-issued entity stream so that every yielded entity is
    /// inserted into the cache (with base-entity prefetch) on the way
    /// through.
    pub fn iter(&self, stream: EntityStream) -> CacheIter {
        CacheIter {
            cache: self.clone(),
            stream,
        }
    }

    /// Closes the cache: stops accepting new loads, wakes every waiter
    /// with [`Error::Closed`], drains in-flight background work, and
    /// returns the first error any background stream produced.
    pub async fn close(&self) -> Result<()> {
        self.inner.cancel.cancel();

        let waiters: Vec<Arc<Notify>> = {
            let state = self.inner.state.lock().unwrap();
            let entities = state.entities.values().filter_map(|entry| match entry {
                Entry::Loading { notify } => Some(Arc::clone(notify)),
                Entry::Done { .. } => None,
            });
            let bases = state.base_entities.values().filter_map(|entry| match entry {
                Entry::Loading { notify } => Some(Arc::clone(notify)),
                Entry::Done { .. } => None,
            });
            entities.chain(bases).collect()
        };
        for notify in waiters {
            notify.notify_waiters();
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let err = self.inner.state.lock().unwrap().iter_error.take();
        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Waits for the in-flight entity load behind `notify`. The waiter is
    /// enabled before re-checking the entry, so a wake-up between unlock
    /// and await is never lost.
    async fn wait_entity(&self, key: &str, notify: Arc<Notify>) -> Result<()> {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let still_loading = {
            let state = self.inner.state.lock().unwrap();
            matches!(
                state.entities.get(key),
                Some(Entry::Loading { notify: current }) if Arc::ptr_eq(current, &notify)
            )
        };
        if still_loading {
            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.cancel.cancelled() => return Err(Error::Closed),
            }
        }
        Ok(())
    }

    async fn wait_base(&self, key: &str, notify: Arc<Notify>) -> Result<()> {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let still_loading = {
            let state = self.inner.state.lock().unwrap();
            matches!(
                state.base_entities.get(key),
                Some(Entry::Loading { notify: current }) if Arc::ptr_eq(current, &notify)
            )
        };
        if still_loading {
            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.cancel.cancelled() => return Err(Error::Closed),
            }
        }
        Ok(())
    }

    fn spawn_entity_load(
        &self,
        url: CharmUrl,
        key: String,
        fields: FieldSet,
        notify: Arc<Notify>,
    ) {
        let cache = self.clone();
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            let result = tokio::select! {
                result = inner.store.find_best_entity(&url, &fields) => result,
                _ = inner.cancel.cancelled() => Err(Error::Closed),
            };
            let woken = {
                let mut state = inner.state.lock().unwrap();
                match result {
                    Ok(entity) => cache.insert_entity_locked(
                        &mut state,
                        Arc::new(entity),
                        fields,
                        Some(&key),
                    ),
                    Err(err) => {
                        state.entities.insert(key, Entry::Done { result: Err(err), fields });
                        Vec::new()
                    }
                }
            };
            notify.notify_waiters();
            for other in woken {
                other.notify_waiters();
            }
        });
    }

    fn spawn_base_load(
        &self,
        base_url: CharmUrl,
        keys: Vec<String>,
        fields: FieldSet,
        notify: Arc<Notify>,
    ) {
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            let result = tokio::select! {
                result = inner.store.find_base_entity(&base_url, &fields) => result,
                _ = inner.cancel.cancelled() => Err(Error::Closed),
            };
            let woken = {
                let mut state = inner.state.lock().unwrap();
                match result {
                    Ok(base) => insert_base_locked(&mut state, Arc::new(base), fields, &keys),
                    Err(err) => {
                        let mut woken = Vec::new();
                        for key in keys {
                            let entry = Entry::Done {
                                result: Err(err.clone()),
                                fields: fields.clone(),
                            };
                            if let Some(Entry::Loading { notify }) =
                                state.base_entities.insert(key, entry)
                            {
                                woken.push(notify);
                            }
                        }
                        woken
                    }
                }
            };
            notify.notify_waiters();
            for other in woken {
                other.notify_waiters();
            }
        });
    }

    /// Inserts a loaded entity under its canonical URL, its promulgated
    /// alias, and the key it was requested by, then schedules a
    /// base-entity prefetch if the base is neither cached nor loading.
    /// Returns the notifies of any replaced `Loading` entries; the caller
    /// must wake them after releasing the lock.
    fn insert_entity_locked(
        &self,
        state: &mut State,
        entity: Arc<Entity>,
        fields: FieldSet,
        requested_key: Option<&str>,
    ) -> Vec<Arc<Notify>> {
        let mut woken = Vec::new();
        let done = Entry::Done {
            result: Ok(Arc::clone(&entity)),
            fields,
        };

        let mut keys = vec![entity.url.to_string()];
        if let Some(promulgated) = &entity.promulgated_url {
            keys.push(promulgated.to_string());
        }
        if let Some(requested) = requested_key {
            if !keys.iter().any(|key| key == requested) {
                keys.push(requested.to_owned());
            }
        }
        for key in keys {
            if let Some(Entry::Loading { notify }) = state.entities.insert(key, done.clone()) {
                woken.push(notify);
            }
        }

        // Base-entity prefetch. The promulgated base form is indexed as an
        // alias so lookups by either form hit the same entry.
        if let Some(base_url) = entity.base_url.clone() {
            let canonical = base_url.to_string();
            let mut base_keys = vec![canonical.clone()];
            if let Some(promulgated) = &entity.promulgated_url {
                let alias = promulgated.base().to_string();
                if alias != canonical {
                    base_keys.push(alias);
                }
            }
            match state.base_entities.get(&canonical).cloned() {
                None => {
                    let notify = Arc::new(Notify::new());
                    for key in &base_keys {
                        state.base_entities.insert(
                            key.clone(),
                            Entry::Loading {
                                notify: Arc::clone(&notify),
                            },
                        );
                    }
                    self.spawn_base_load(base_url, base_keys, state.base_fields.clone(), notify);
                }
                Some(entry) => {
                    // Already cached or loading; just fill in missing alias
                    // keys.
                    for key in &base_keys[1..] {
                        state
                            .base_entities
                            .entry(key.clone())
                            .or_insert_with(|| entry.clone());
                    }
                }
            }
        }

        woken
    }
}

/// Inserts a loaded base entity under its canonical URL, its promulgated
/// alias when flagged, and the keys its load was issued under. Returns the
/// notifies of replaced `Loading` entries.
fn insert_base_locked(
    state: &mut State,
    base: Arc<BaseEntity>,
    fields: FieldSet,
    requested_keys: &[String],
) -> Vec<Arc<Notify>> {
    let mut woken = Vec::new();
    let done = Entry::Done {
        result: Ok(Arc::clone(&base)),
        fields,
    };

    let mut keys = vec![base.url.to_string()];
    if base.promulgated == Some(true) {
        let alias = CharmUrl::new(None, None, base.url.name(), None).to_string();
        if !keys.contains(&alias) {
            keys.push(alias);
        }
    }
    for requested in requested_keys {
        if !keys.contains(requested) {
            keys.push(requested.clone());
        }
    }
    for key in keys {
        if let Some(Entry::Loading { notify }) = state.base_entities.insert(key, done.clone()) {
            woken.push(notify);
        }
    }
    woken
}

/// Read-through iterator returned by [`Cache::iter`].
pub struct CacheIter {
    cache: Cache,
    stream: EntityStream,
}

impl fmt::Debug for CacheIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheIter").finish_non_exhaustive()
    }
}

impl CacheIter {
    /// Yields the next entity, inserting it into the cache and scheduling
    /// its base-entity prefetch on the way through.
    pub async fn next(&mut self) -> Option<Result<Arc<Entity>>> {
        if self.cache.inner.cancel.is_cancelled() {
            return Some(Err(Error::Closed));
        }
        match self.stream.next().await? {
            Ok(entity) => {
                let entity = Arc::new(entity);
                let woken = {
                    let mut state = self.cache.inner.state.lock().unwrap();
                    let fields = state.entity_fields.clone();
                    self.cache
                        .insert_entity_locked(&mut state, Arc::clone(&entity), fields, None)
                };
                for notify in woken {
                    notify.notify_waiters();
                }
                Some(Ok(entity))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::{mpsc, oneshot};

    use super::*;

    fn url(s: &str) -> CharmUrl {
        s.parse().unwrap()
    }

    fn entity_fields(extra: &[&str]) -> FieldSet {
        let mut fields = field_set(REQUIRED_ENTITY_FIELDS.iter().copied());
        fields.extend(extra.iter().map(|s| s.to_string()));
        fields
    }

    fn base_entity_fields(extra: &[&str]) -> FieldSet {
        let mut fields = field_set(REQUIRED_BASE_ENTITY_FIELDS.iter().copied());
        fields.extend(extra.iter().map(|s| s.to_string()));
        fields
    }

    fn wordpress_entity() -> Entity {
        let mut entity = Entity::new(url("~bob/wordpress-1"));
        entity.promulgated_url = Some(url("wordpress-5"));
        entity.base_url = Some(url("~bob/wordpress"));
        entity.blob_name = Some("w1".into());
        entity.size = Some(1);
        entity
    }

    fn wordpress_base() -> BaseEntity {
        let mut base = BaseEntity::new(url("~bob/wordpress"));
        base.name = Some("wordpress".into());
        base
    }

    /// A store that answers from fixed document lists and counts calls.
    #[derive(Debug, Default)]
    struct StaticStore {
        entities: Vec<Entity>,
        base_entities: Vec<BaseEntity>,
        entity_calls: AtomicUsize,
        base_calls: AtomicUsize,
    }

    #[async_trait]
    impl EntityStore for StaticStore {
        async fn find_best_entity(&self, url: &CharmUrl, _fields: &FieldSet) -> Result<Entity> {
            self.entity_calls.fetch_add(1, Ordering::SeqCst);
            self.entities
                .iter()
                .find(|entity| {
                    entity.url == *url || entity.promulgated_url.as_ref() == Some(url)
                })
                .cloned()
                .ok_or_else(|| Error::not_found(format!("entity {url:?}")))
        }

        async fn find_base_entity(&self, url: &CharmUrl, _fields: &FieldSet) -> Result<BaseEntity> {
            self.base_calls.fetch_add(1, Ordering::SeqCst);
            let base = url.base();
            self.base_entities
                .iter()
                .find(|candidate| candidate.url == base)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("base entity {base:?}")))
        }
    }

    type EntityReply = oneshot::Sender<Result<Entity>>;
    type BaseReply = oneshot::Sender<Result<BaseEntity>>;

    /// A store that forwards every query to the test over a channel, so
    /// tests control exactly when and how each query is answered.
    #[derive(Debug)]
    struct ChanStore {
        entity_queries: mpsc::UnboundedSender<(CharmUrl, FieldSet, EntityReply)>,
        base_queries: mpsc::UnboundedSender<(CharmUrl, FieldSet, BaseReply)>,
    }

    type EntityQueryRx = mpsc::UnboundedReceiver<(CharmUrl, FieldSet, EntityReply)>;
    type BaseQueryRx = mpsc::UnboundedReceiver<(CharmUrl, FieldSet, BaseReply)>;

    fn chan_store() -> (Arc<ChanStore>, EntityQueryRx, BaseQueryRx) {
        let (entity_tx, entity_rx) = mpsc::unbounded_channel();
        let (base_tx, base_rx) = mpsc::unbounded_channel();
        let store = Arc::new(ChanStore {
            entity_queries: entity_tx,
            base_queries: base_tx,
        });
        (store, entity_rx, base_rx)
    }

    #[async_trait]
    impl EntityStore for ChanStore {
        async fn find_best_entity(&self, url: &CharmUrl, fields: &FieldSet) -> Result<Entity> {
            let (reply, response) = oneshot::channel();
            self.entity_queries
                .send((url.clone(), fields.clone(), reply))
                .map_err(|_| Error::Database("entity query channel closed".into()))?;
            response
                .await
                .map_err(|_| Error::Database("entity reply dropped".into()))?
        }

        async fn find_base_entity(&self, url: &CharmUrl, fields: &FieldSet) -> Result<BaseEntity> {
            let (reply, response) = oneshot::channel();
            self.base_queries
                .send((url.clone(), fields.clone(), reply))
                .map_err(|_| Error::Database("base entity query channel closed".into()))?;
            response
                .await
                .map_err(|_| Error::Database("base entity reply dropped".into()))?
        }
    }

    #[tokio::test]
    async fn base_entity_query_issued_sequentially_for_promulgated_url() {
        let (store, mut entity_rx, mut base_rx) = chan_store();
        let cache = Cache::new(store);
        cache.add_base_entity_fields(&field_set(["name"]));

        // Look up by the promulgated form; the blobname field is requested
        // on top of the required set.
        let lookup = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .entity(&url("wordpress-1"), &field_set(["blobname"]))
                    .await
            })
        };

        let (queried_url, queried_fields, reply) = entity_rx.recv().await.unwrap();
        assert_eq!(queried_url, url("wordpress-1"));
        assert_eq!(queried_fields, entity_fields(&["blobname"]));
        // No base query may be issued before the entity reply: the real
        // base URL cannot be inferred from the promulgated form.
        assert!(base_rx.try_recv().is_err());
        reply.send(Ok(wordpress_entity())).unwrap();

        let entity = lookup.await.unwrap().unwrap();
        assert_eq!(entity.blob_name.as_deref(), Some("w1"));

        // The prefetch uses the base URL from the loaded entity.
        let (queried_url, queried_fields, reply) = base_rx.recv().await.unwrap();
        assert_eq!(queried_url, url("~bob/wordpress"));
        assert_eq!(queried_fields, base_entity_fields(&["name"]));
        reply.send(Ok(wordpress_base())).unwrap();

        // Every further lookup must be served from the cache: drop the
        // query channels so any backing-store call fails loudly.
        drop(entity_rx);
        drop(base_rx);

        let entity = cache
            .entity(&url("wordpress-1"), &field_set(["baseurl", "blobname"]))
            .await
            .unwrap();
        assert_eq!(entity.blob_name.as_deref(), Some("w1"));

        // Canonical and promulgated forms hit the same entries.
        let entity = cache.entity(&url("~bob/wordpress-1"), &FieldSet::new()).await.unwrap();
        assert_eq!(entity.url, url("~bob/wordpress-1"));

        let base = cache
            .base_entity(&url("wordpress"), &field_set(["name"]))
            .await
            .unwrap();
        assert_eq!(base.name.as_deref(), Some("wordpress"));

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_lookups_coalesce_into_one_query() {
        let (store, mut entity_rx, _base_rx) = chan_store();
        let cache = Cache::new(store);

        let mut lookups = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            lookups.push(tokio::spawn(async move {
                cache.entity(&url("~bob/wordpress-1"), &FieldSet::new()).await
            }));
        }

        // Exactly one backing query is issued.
        let (_, _, reply) = entity_rx.recv().await.unwrap();
        reply.send(Ok(wordpress_entity())).unwrap();

        let mut results = Vec::new();
        for lookup in lookups {
            results.push(lookup.await.unwrap().unwrap());
        }
        for window in results.windows(2) {
            assert!(Arc::ptr_eq(&window[0], &window[1]));
        }
        assert!(entity_rx.try_recv().is_err(), "expected a single query");

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn loaded_fields_subsume_later_requests() {
        let store = Arc::new(StaticStore {
            entities: vec![wordpress_entity()],
            base_entities: vec![wordpress_base()],
            ..Default::default()
        });
        let cache = Cache::new(Arc::clone(&store) as Arc<dyn EntityStore>);

        cache
            .entity(&url("~bob/wordpress-1"), &field_set(["blobname"]))
            .await
            .unwrap();
        assert_eq!(store.entity_calls.load(Ordering::SeqCst), 1);

        // A subset of the loaded fields is served from the cache.
        cache.entity(&url("~bob/wordpress-1"), &FieldSet::new()).await.unwrap();
        cache
            .entity(&url("~bob/wordpress-1"), &field_set(["blobname"]))
            .await
            .unwrap();
        assert_eq!(store.entity_calls.load(Ordering::SeqCst), 1);

        // A field outside the loaded set forces a reload with the widened
        // union.
        cache
            .entity(&url("~bob/wordpress-1"), &field_set(["size"]))
            .await
            .unwrap();
        assert_eq!(store.entity_calls.load(Ordering::SeqCst), 2);

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_loads_are_terminal_and_replayed() {
        let store = Arc::new(StaticStore::default());
        let cache = Cache::new(Arc::clone(&store) as Arc<dyn EntityStore>);

        let err = cache
            .entity(&url("~bob/missing-1"), &FieldSet::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{err}");

        // The failure is cached; no retry happens in this cache instance.
        let err = cache
            .entity(&url("~bob/missing-1"), &FieldSet::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{err}");
        assert_eq!(store.entity_calls.load(Ordering::SeqCst), 1);

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn iterator_populates_cache_and_prefetches_bases() {
        let store = Arc::new(StaticStore {
            base_entities: vec![wordpress_base()],
            ..Default::default()
        });
        let cache = Cache::new(Arc::clone(&store) as Arc<dyn EntityStore>);

        let stream: EntityStream =
            futures_util::stream::iter(vec![Ok(wordpress_entity())]).boxed();
        let mut iter = cache.iter(stream);

        let entity = iter.next().await.unwrap().unwrap();
        assert_eq!(entity.url, url("~bob/wordpress-1"));
        assert!(iter.next().await.is_none());

        // The yielded entity was cached; no entity query is ever issued.
        cache.entity(&url("wordpress-5"), &FieldSet::new()).await.unwrap();
        assert_eq!(store.entity_calls.load(Ordering::SeqCst), 0);

        // The base entity was prefetched by the insertion, so this lookup
        // coalesces with it rather than issuing its own query.
        let base = cache.base_entity(&url("~bob/wordpress-1"), &FieldSet::new()).await.unwrap();
        assert_eq!(base.url, url("~bob/wordpress"));
        assert_eq!(store.base_calls.load(Ordering::SeqCst), 1);

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn add_entities_consumes_stream_in_background() {
        let store = Arc::new(StaticStore {
            base_entities: vec![wordpress_base()],
            ..Default::default()
        });
        let cache = Cache::new(Arc::clone(&store) as Arc<dyn EntityStore>);

        let stream: EntityStream =
            futures_util::stream::iter(vec![Ok(wordpress_entity())]).boxed();
        cache.add_entities(stream);

        // Let the background consumer drain the ready stream.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        cache.entity(&url("~bob/wordpress-1"), &FieldSet::new()).await.unwrap();
        assert_eq!(store.entity_calls.load(Ordering::SeqCst), 0);

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn add_entities_error_is_returned_by_close() {
        let store = Arc::new(StaticStore::default());
        let cache = Cache::new(store as Arc<dyn EntityStore>);

        let stream: EntityStream = futures_util::stream::iter(vec![
            Ok(wordpress_entity()),
            Err(Error::Database("iterator broke".into())),
        ])
        .boxed();
        cache.add_entities(stream);

        let err = cache.close().await.unwrap_err();
        assert!(matches!(err, Error::Database(_)), "{err}");
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_closed() {
        let (store, mut entity_rx, _base_rx) = chan_store();
        let cache = Cache::new(store);

        let lookup = {
            let cache = cache.clone();
            tokio::spawn(
                async move { cache.entity(&url("~bob/wordpress-1"), &FieldSet::new()).await },
            )
        };

        // Hold the query unanswered so the waiter is parked, then close.
        let (_url, _fields, _reply) = entity_rx.recv().await.unwrap();
        cache.close().await.unwrap();

        let err = lookup.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Closed), "{err}");

        // Operations after close fail immediately.
        let err = cache
            .entity(&url("~bob/wordpress-1"), &FieldSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed), "{err}");
    }
}
