//! The chunked-object store contract consumed by the blob store.
//!
//! Backends store raw byte objects under opaque names and know nothing
//! about hashes, reference counts, or multipart uploads; all of that lives
//! in [`blobstore`](crate::blobstore) above this trait. Names may contain
//! `/` separators, which filesystem-like backends map to directories.

pub mod in_memory;
pub mod local_fs;

use std::fmt;

use crate::{PayloadStream, Result};

/// A type-erased [`Backend`] instance.
pub type BoxedBackend = Box<dyn Backend>;

/// A dumb object store holding raw bytes under opaque names.
#[async_trait::async_trait]
pub trait Backend: fmt::Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Stores an object at the given name, overwriting any previous object.
    async fn put_object(&self, name: &str, stream: PayloadStream) -> Result<()>;

    /// Retrieves the object at the given name, returning its size and a
    /// stream of its bytes, or `None` if no such object exists.
    async fn get_object(&self, name: &str) -> Result<Option<(u64, PayloadStream)>>;

    /// Deletes the object at the given name. Deleting a missing object is
    /// not an error.
    async fn delete_object(&self, name: &str) -> Result<()>;
}
