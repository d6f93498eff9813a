//! Blob-related wire types.

use serde::{Deserialize, Serialize};

/// The index of all the parts of a multipart blob.
///
/// It is produced when a multipart upload is finished and should be stored
/// in an external document along with the blob name, so that the composite
/// blob can be read back part by part.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartIndex {
    /// The size of each part, in part order.
    pub sizes: Vec<u32>,
}

impl MultipartIndex {
    /// The total size of the composite blob.
    pub fn total_size(&self) -> u64 {
        self.sizes.iter().map(|&size| u64::from(size)).sum()
    }
}
