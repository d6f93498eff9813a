//! Multipart upload coordination.
//!
//! An upload is tracked by a document in the `uploads` collection; the blob
//! for part `n` is stored under the chunk name `<uploadId>/<n>`. Concurrent
//! writers coordinate exclusively through conditional updates on that
//! document: a part slot is claimed with a compare-and-set that only
//! matches while the slot is absent or null, and the record's final hash is
//! set with a compare-and-set that only matches while it is unset. A slot,
//! once present, never changes its hash, and `complete` only ever goes from
//! false to true.

use std::time::SystemTime;

use charmstore_types::{FieldSet, MultipartIndex};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Digest;

use super::{new_hash, part_name, unix_millis, Store};
use crate::docstore::{from_document, to_document, Collection, Filter, Mutation};
use crate::{Error, PayloadStream, Result};

/// The record held for a pending multipart upload.
#[derive(Debug, Serialize, Deserialize)]
struct UploadDoc {
    /// The upload id. The blob for each part is named `<id>/<part>`.
    #[serde(rename = "_id")]
    id: String,

    /// The SHA-384 of all parts concatenated in order. Empty until the
    /// upload is finished.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    hash: String,

    /// Expiry time of the upload, in epoch milliseconds.
    expires: i64,

    /// All currently claimed parts, sparsely indexed by part number.
    #[serde(default)]
    parts: Vec<Option<PartDoc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PartDoc {
    hash: String,
    size: u64,
    #[serde(default)]
    complete: bool,
}

/// One part of a multipart blob, as declared by the caller when finishing
/// an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Hex SHA-384 of the part's content.
    pub hash: String,
}

impl Part {
    /// Creates a part declaration with the given hash.
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }
}

/// A completed part, as reported by [`Store::list_parts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    /// The part number.
    pub part: u32,
    /// Hex SHA-384 of the part's content.
    pub hash: String,
    /// The size of the part in bytes.
    pub size: u64,
}

impl Store {
    /// Creates a new record to track a multipart upload, returning the
    /// upload id. No parts are reserved; abandoned parts are garbage
    /// collected after `expiry`.
    pub async fn new_parts(&self, expiry: SystemTime) -> Result<String> {
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let doc = to_document(&UploadDoc {
            id: upload_id.clone(),
            hash: String::new(),
            expires: unix_millis(expiry),
            parts: Vec::new(),
        })?;
        self.0.uploads.insert(doc).await?;
        Ok(upload_id)
    }

    /// Like [`new_parts`](Self::new_parts), with the configured default
    /// upload expiry.
    pub async fn new_parts_default(&self) -> Result<String> {
        self.new_parts(SystemTime::now() + self.0.config.upload_expiry)
            .await
    }

    /// Uploads part `part` of the given upload. The content is read from
    /// the stream and must match the declared size and hash.
    ///
    /// A part may be uploaded more than once as long as every attempt
    /// declares the same hash; re-uploading a completed part is a no-op and
    /// a different hash fails with [`Error::HashMismatch`]. Concurrent
    /// writers of the same part race for the slot through a conditional
    /// claim; offering identical bytes, all of them succeed.
    pub async fn put_part(
        &self,
        upload_id: &str,
        part: u32,
        stream: PayloadStream,
        size: u64,
        hash: &str,
    ) -> Result<()> {
        if part >= self.0.config.max_parts {
            return Err(Error::BadRequest(format!("part number {part} too big")));
        }

        let udoc = self.upload_doc(upload_id).await?;
        if !udoc.hash.is_empty() {
            return Err(Error::InvalidUpload(format!(
                "upload {upload_id:?} is already finished"
            )));
        }

        match udoc.parts.get(part as usize).cloned().flatten() {
            Some(slot) => {
                if slot.hash != hash {
                    return Err(Error::HashMismatch(format!("already uploaded part {part}")));
                }
                if slot.complete {
                    // Already uploaded; use the existing part.
                    return Ok(());
                }
                // A writer claimed the slot but never finished, perhaps
                // because a previous upload failed. Race for the upload.
            }
            None => {
                // Claim the slot before putting the part, so that an
                // interrupted upload is still visible to the expiry sweep.
                if self.claim_part(upload_id, part, hash, size).await? {
                    return Ok(());
                }
            }
        }

        let name = part_name(upload_id, part);
        self.put_unchallenged(stream, &name, size, hash).await?;

        self.0
            .uploads
            .update_id(
                upload_id,
                &[Mutation::Set(
                    format!("parts.{part}.complete"),
                    Value::Bool(true),
                )],
            )
            .await?;
        Ok(())
    }

    /// Claims the slot for a part, returning whether the part has already
    /// been uploaded completely by someone else.
    async fn claim_part(&self, upload_id: &str, part: u32, hash: &str, size: u64) -> Result<bool> {
        let slot_path = format!("parts.{part}");
        let unclaimed = Filter::And(vec![
            Filter::Id(upload_id.to_owned()),
            Filter::Or(vec![
                Filter::Exists(slot_path.clone(), false),
                Filter::Eq(slot_path.clone(), Value::Null),
            ]),
        ]);
        let claim = [Mutation::Set(
            slot_path,
            serde_json::to_value(PartDoc {
                hash: hash.to_owned(),
                size,
                complete: false,
            })?,
        )];
        if self.0.uploads.update(&unclaimed, &claim).await? == 1 {
            return Ok(false);
        }

        // The claim matched nothing: the upload is gone, or a peer claimed
        // the slot first. Re-read the record to find out.
        let udoc = self.upload_doc(upload_id).await?;
        let slot = udoc
            .parts
            .get(part as usize)
            .cloned()
            .flatten()
            .ok_or_else(|| {
                Error::Database(format!(
                    "claim of part {part} matched nothing even though the slot is empty"
                ))
            })?;
        if slot.hash != hash {
            return Err(Error::HashMismatch(format!("already uploaded part {part}")));
        }
        // The hash matches, so another writer got there first. If their
        // upload completed, use it; otherwise race them for it.
        Ok(slot.complete)
    }

    /// Finishes a multipart upload by joining the declared parts into one
    /// composite blob. The resulting blob can be opened by passing the
    /// upload id and the returned index to [`Store::open`].
    ///
    /// The upload record is kept; callers should persist the index and then
    /// call [`Store::delete_parts`]. Finishing is idempotent: repeating the
    /// call with matching parts returns the previously computed index.
    pub async fn finish_parts(
        &self,
        upload_id: &str,
        parts: &[Part],
    ) -> Result<(MultipartIndex, String)> {
        let udoc = self.upload_doc(upload_id).await?;
        let index = verify_parts(&udoc, parts)?;
        if !udoc.hash.is_empty() {
            return Ok((index, udoc.hash));
        }

        // Stream all parts in order through a running hash, so the
        // composite digest is computed over the actual stored bytes.
        let mut hasher = new_hash();
        for part in 0..parts.len() {
            let name = part_name(upload_id, part as u32);
            let (mut stream, _) = self.open_blob(&name).await?;
            while let Some(chunk) = stream.try_next().await? {
                hasher.update(&chunk);
            }
        }
        let digest = hex::encode(hasher.finalize());

        let unfinished = Filter::And(vec![
            Filter::Id(upload_id.to_owned()),
            Filter::Or(vec![
                Filter::Exists("hash".into(), false),
                Filter::Eq("hash".into(), Value::String(String::new())),
            ]),
        ]);
        let set_hash = [Mutation::Set("hash".into(), Value::String(digest.clone()))];
        if self.0.uploads.update(&unfinished, &set_hash).await? == 0 {
            // A peer finished the upload concurrently; only identical
            // outcomes are acceptable.
            let udoc = self.upload_doc(upload_id).await?;
            if udoc.hash != digest {
                return Err(Error::HashMismatch(format!(
                    "concurrently finished upload {upload_id:?}"
                )));
            }
        }

        merni::distribution!("blobstore.multipart.parts": parts.len());
        Ok((index, digest))
    }

    /// Returns the completed parts of the given upload, omitting slots
    /// that are absent or still in progress.
    pub async fn list_parts(&self, upload_id: &str) -> Result<Vec<PartInfo>> {
        let udoc = self.upload_doc(upload_id).await?;
        Ok(udoc
            .parts
            .iter()
            .enumerate()
            .filter_map(|(part, slot)| {
                slot.as_ref().filter(|slot| slot.complete).map(|slot| PartInfo {
                    part: part as u32,
                    hash: slot.hash.clone(),
                    size: slot.size,
                })
            })
            .collect())
    }

    /// Deletes the upload record and, unless the upload was finished, all
    /// its chunk blobs. After a finish the chunks back the composite blob
    /// and stay; only the record is removed. Unknown ids are a no-op.
    pub async fn delete_parts(&self, upload_id: &str) -> Result<()> {
        let Some(doc) = self
            .0
            .uploads
            .find_one(&Filter::Id(upload_id.to_owned()), &FieldSet::new())
            .await?
        else {
            return Ok(());
        };
        let udoc: UploadDoc = from_document(doc)?;
        if udoc.hash.is_empty() {
            self.remove_chunks(&udoc).await?;
        }
        self.0.uploads.remove_id(upload_id).await?;
        Ok(())
    }

    /// Deletes all multipart upload records past their expiry, along with
    /// their chunk blobs, and drops expired put challenges.
    pub async fn delete_expired_parts(&self) -> Result<()> {
        let now = unix_millis(SystemTime::now());
        let expired: Vec<_> = self
            .0
            .uploads
            .find(&Filter::Lt("expires".into(), Value::from(now)), &FieldSet::new())
            .await?
            .try_collect()
            .await?;

        let mut removed = 0i64;
        for doc in expired {
            let udoc: UploadDoc = from_document(doc)?;
            // An abandoned upload loses its chunks whether or not it was
            // finished; callers persisting an index call delete_parts
            // before the expiry.
            self.remove_chunks(&udoc).await?;
            self.0.uploads.remove_id(&udoc.id).await?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, "deleted expired multipart uploads");
        }
        merni::counter!("blobstore.multipart.expired": removed);

        self.0
            .challenges
            .remove(&Filter::Lt("expires".into(), Value::from(now)))
            .await?;
        Ok(())
    }

    async fn remove_chunks(&self, udoc: &UploadDoc) -> Result<()> {
        for (part, slot) in udoc.parts.iter().enumerate() {
            if slot.is_some() {
                self.remove(&part_name(&udoc.id, part as u32)).await?;
            }
        }
        Ok(())
    }

    async fn upload_doc(&self, upload_id: &str) -> Result<UploadDoc> {
        let doc = self
            .0
            .uploads
            .find_one(&Filter::Id(upload_id.to_owned()), &FieldSet::new())
            .await?
            .ok_or_else(|| Error::not_found(format!("upload id {upload_id:?}")))?;
        from_document(doc)
    }
}

/// Checks the declared parts against the stored slots and computes the
/// multipart index.
fn verify_parts(udoc: &UploadDoc, parts: &[Part]) -> Result<MultipartIndex> {
    if udoc.parts.len() != parts.len() {
        return Err(Error::InvalidUpload(format!(
            "upload has {} parts, {} declared",
            udoc.parts.len(),
            parts.len()
        )));
    }
    let mut sizes = Vec::with_capacity(parts.len());
    for (part, declared) in parts.iter().enumerate() {
        let slot = udoc.parts[part]
            .as_ref()
            .ok_or_else(|| Error::InvalidUpload(format!("part {part} not uploaded")))?;
        if slot.hash != declared.hash {
            return Err(Error::InvalidUpload(format!("hash mismatch for part {part}")));
        }
        if !slot.complete {
            return Err(Error::InvalidUpload(format!("part {part} not complete")));
        }
        let size = u32::try_from(slot.size).map_err(|_| Error::PartTooLarge {
            part: part as u32,
            size: slot.size,
        })?;
        sizes.push(size);
    }
    Ok(MultipartIndex { sizes })
}
