//! The entity documents stored in the database.
//!
//! Documents loaded through the entity cache are *partial*: only the fields
//! selected by a query are populated, everything else stays at its default.
//! All optional fields therefore deserialize leniently.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::url::CharmUrl;

/// A single revision of a charm or bundle, addressed by its URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// The exclusive identifier of the entity.
    #[serde(rename = "_id")]
    pub url: CharmUrl,

    /// The URL of the base entity owning all revisions of this name.
    #[serde(rename = "baseurl", default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<CharmUrl>,

    /// The owning user, denormalized from the URL. Empty for entities that
    /// predate denormalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// The name, denormalized from the URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The revision, denormalized from the URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i32>,

    /// The series, denormalized from the URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,

    /// Hex-encoded SHA-384 of the entity's archive blob.
    #[serde(rename = "blobhash", default, skip_serializing_if = "Option::is_none")]
    pub blob_hash: Option<String>,

    /// The name the archive blob is stored under in the blob store.
    #[serde(rename = "blobname", default, skip_serializing_if = "Option::is_none")]
    pub blob_name: Option<String>,

    /// The size of the archive blob in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,

    /// Per-part sizes when the archive was uploaded in multiple parts.
    /// Together with `blob_name` this reconstructs the composite blob.
    #[serde(rename = "blobsizes", default, skip_serializing_if = "Option::is_none")]
    pub blob_sizes: Option<Vec<u32>>,

    /// Uninterpreted key/value annotations attached by clients.
    #[serde(rename = "extrainfo", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_info: BTreeMap<String, Value>,

    /// The promulgated alias of this entity, if it has been promulgated.
    #[serde(
        rename = "promulgated-url",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub promulgated_url: Option<CharmUrl>,

    /// The revision in the promulgated URL, or -1 when not promulgated.
    #[serde(
        rename = "promulgated-revision",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub promulgated_revision: Option<i32>,
}

impl Entity {
    /// Creates an entity document holding only the URL.
    pub fn new(url: CharmUrl) -> Self {
        Self {
            url,
            base_url: None,
            user: None,
            name: None,
            revision: None,
            series: None,
            blob_hash: None,
            blob_name: None,
            size: None,
            blob_sizes: None,
            extra_info: BTreeMap::new(),
            promulgated_url: None,
            promulgated_revision: None,
        }
    }
}

/// The per-name container of cross-revision metadata.
///
/// Exactly one base entity exists per `~user/name` pair; all revisions of
/// that name share it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseEntity {
    /// The base URL owning this document.
    #[serde(rename = "_id")]
    pub url: CharmUrl,

    /// The owning user. Empty for base entities created before ownership
    /// denormalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// The charm or bundle name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Whether the entities under this base are publicly readable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<bool>,

    /// Access control lists for all revisions under this base.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acls: Option<Acls>,

    /// Whether this base holds the promulgated entities for its name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promulgated: Option<bool>,
}

impl BaseEntity {
    /// Creates a base entity document holding only the URL.
    pub fn new(url: CharmUrl) -> Self {
        Self {
            url,
            user: None,
            name: None,
            public: None,
            acls: None,
            promulgated: None,
        }
    }
}

/// Read and write access control lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acls {
    /// Users and groups allowed to read.
    #[serde(default)]
    pub read: Vec<String>,

    /// Users and groups allowed to write.
    #[serde(default)]
    pub write: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_document_field_names() {
        let mut entity = Entity::new("~bob/trusty/wordpress-1".parse().unwrap());
        entity.base_url = Some("~bob/wordpress".parse().unwrap());
        entity.blob_hash = Some("abc".into());
        entity.promulgated_url = Some("wordpress-5".parse().unwrap());

        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["_id"], "~bob/trusty/wordpress-1");
        assert_eq!(value["baseurl"], "~bob/wordpress");
        assert_eq!(value["blobhash"], "abc");
        assert_eq!(value["promulgated-url"], "wordpress-5");
        assert!(value.get("blobname").is_none());
    }

    #[test]
    fn partial_document_deserializes() {
        let entity: Entity = serde_json::from_value(serde_json::json!({
            "_id": "~bob/wordpress-1",
            "blobname": "w1",
        }))
        .unwrap();
        assert_eq!(entity.url.to_string(), "~bob/wordpress-1");
        assert_eq!(entity.blob_name.as_deref(), Some("w1"));
        assert_eq!(entity.base_url, None);
    }

    #[test]
    fn base_entity_acls_roundtrip() {
        let base = BaseEntity {
            acls: Some(Acls {
                read: vec!["everyone".into(), "bob".into()],
                write: vec!["bob".into()],
            }),
            public: Some(true),
            ..BaseEntity::new("~bob/wordpress".parse().unwrap())
        };
        let value = serde_json::to_value(&base).unwrap();
        assert_eq!(value["acls"]["read"][0], "everyone");
        let back: BaseEntity = serde_json::from_value(value).unwrap();
        assert_eq!(back, base);
    }
}
