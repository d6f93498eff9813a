//! Field-selection sets for partial document queries.

use std::collections::BTreeSet;

/// An ordered set of document field names, used to project queries and to
/// record which fields of a cached document are populated.
///
/// An empty set selects the whole document. Names may be dotted paths
/// (`"acls.read"`); a projection always includes `_id`.
pub type FieldSet = BTreeSet<String>;

/// Builds a [`FieldSet`] from string literals.
pub fn field_set<I, S>(names: I) -> FieldSet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}
