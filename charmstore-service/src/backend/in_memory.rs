//! In-memory backend for tests.
//!
//! This provides a [`Backend`] backed by a `HashMap`, removing the need for
//! filesystem tempdir management in unit tests. The backend is [`Clone`] so
//! tests can hold a handle for direct inspection while the store owns a
//! boxed copy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt};

use super::Backend;
use crate::{PayloadStream, Result};

type Objects = HashMap<String, Bytes>;

/// A [`Backend`] holding all objects in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    objects: Arc<Mutex<Objects>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the stored bytes, if present.
    pub fn get_stored(&self, name: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    /// Returns `true` if the backend contains an object with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.objects.lock().unwrap().contains_key(name)
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Returns `true` if the backend has no stored objects.
    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn put_object(&self, name: &str, stream: PayloadStream) -> Result<()> {
        let bytes: BytesMut = stream.try_collect().await?;
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_owned(), bytes.freeze());
        Ok(())
    }

    async fn get_object(&self, name: &str) -> Result<Option<(u64, PayloadStream)>> {
        let entry = self.objects.lock().unwrap().get(name).cloned();
        Ok(entry.map(|bytes| {
            let size = bytes.len() as u64;
            let stream = futures_util::stream::once(async move { Ok(bytes) }).boxed();
            (size, stream)
        }))
    }

    async fn delete_object(&self, name: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(name);
        Ok(())
    }
}
