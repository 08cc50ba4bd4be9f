//! Projection rules deciding which fields an unpacked measurement carries.
//!
//! A [`BucketSpec`] names the bucket's time field, its optional metadata
//! field, and a set of fields that is either an include list or an exclude
//! list depending on the [`Behavior`]. The metadata field is special-cased:
//! [`resolve_meta_inclusion`] strips it from the field set so that it is
//! never treated as an ordinary measurement field.

use std::collections::BTreeSet;

/// Whether a [`BucketSpec`]'s field set lists fields to keep or to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Behavior {
    /// Only the listed fields appear in output.
    Include,
    /// Every field except the listed ones appears in output.
    Exclude,
}

/// Projection configuration for unpacking buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSpec {
    /// Name of the per-measurement time field.
    pub time_field: String,
    /// Name under which the bucket's `meta` value is materialized.
    pub meta_field: Option<String>,
    /// Fields included or excluded, depending on [`Behavior`].
    pub field_set: BTreeSet<String>,
}

impl BucketSpec {
    /// Creates a spec with the given time field, no metadata field and an
    /// empty field set.
    pub fn new(time_field: impl Into<String>) -> Self {
        Self {
            time_field: time_field.into(),
            meta_field: None,
            field_set: BTreeSet::new(),
        }
    }

    /// Sets the metadata field name.
    pub fn with_meta_field(mut self, meta_field: impl Into<String>) -> Self {
        self.meta_field = Some(meta_field.into());
        self
    }

    /// Replaces the field set.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_set = fields.into_iter().map(Into::into).collect();
        self
    }
}

/// Applies `behavior` to a membership test.
fn apply(behavior: Behavior, listed: bool) -> bool {
    match behavior {
        Behavior::Include => listed,
        Behavior::Exclude => !listed,
    }
}

/// Decides whether the metadata field is materialized and returns a copy of
/// `spec` with the metadata field removed from its field set.
///
/// Without a configured metadata field the answer is always `false`.
pub fn resolve_meta_inclusion(behavior: Behavior, spec: &BucketSpec) -> (bool, BucketSpec) {
    let mut normalized = spec.clone();
    let Some(meta_field) = spec.meta_field.as_deref() else {
        return (false, normalized);
    };

    let listed = normalized.field_set.remove(meta_field);
    (apply(behavior, listed), normalized)
}

/// Returns whether the time field appears in output.
pub fn include_time_field(behavior: Behavior, spec: &BucketSpec) -> bool {
    include_field(&spec.time_field, behavior, spec)
}

/// Returns whether the field called `name` appears in output.
pub fn include_field(name: &str, behavior: Behavior, spec: &BucketSpec) -> bool {
    apply(behavior, spec.field_set.contains(name))
}
