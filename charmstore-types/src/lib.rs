//! This is a collection of types shared among the charm store crates.
//!
//! It primarily includes the charm URL syntax and the entity documents that
//! the store, the migration engine, and the entity cache all operate on.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod blob;
mod entity;
mod fields;
mod url;

pub use blob::MultipartIndex;
pub use entity::{Acls, BaseEntity, Entity};
pub use fields::{field_set, FieldSet};
pub use url::{CharmUrl, ParseUrlError};
