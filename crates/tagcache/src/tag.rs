// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tags provided by queries and matched by invalidations.

use std::{borrow::Cow, collections::BTreeSet, fmt, sync::Arc};

use serde_json::Value;

use crate::Args;

/// A label attached to cached data so related queries can be invalidated together.
///
/// A tag has a type (its `kind`) and an optional id. When used for invalidation, a tag without
/// an id is a wildcard that matches every tag of the same kind; a tag with an id only matches
/// the identical tag.
///
/// # Examples
///
/// ```
/// use tagcache::Tag;
///
/// let every_job = Tag::new("Job");
/// let job_42 = Tag::with_id("Job", "42");
///
/// assert!(every_job.matches(&job_42));
/// assert!(job_42.matches(&job_42));
/// assert!(!job_42.matches(&Tag::with_id("Job", "7")));
/// assert!(!job_42.matches(&every_job));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tag {
    kind: Cow<'static, str>,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    id: Option<String>,
}

impl Tag {
    /// Creates a tag of `kind` without an id.
    #[must_use]
    pub fn new(kind: impl Into<Cow<'static, str>>) -> Self {
        Self { kind: kind.into(), id: None }
    }

    /// Creates a tag of `kind` identifying a single record.
    #[must_use]
    pub fn with_id(kind: impl Into<Cow<'static, str>>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.into()),
        }
    }

    /// The type of the tag, such as `Job`.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The record id, if any.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Returns `true` if this tag, used as an invalidation, applies to the `provided` tag.
    #[must_use]
    pub fn matches(&self, provided: &Self) -> bool {
        self.kind == provided.kind && (self.id.is_none() || self.id == provided.id)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{id}", self.kind),
            None => f.write_str(&self.kind),
        }
    }
}

type TagFn = dyn Fn(&Value, &Args) -> Vec<Tag> + Send + Sync;

/// Describes which tags a query provides once its data is stored.
///
/// Tags are either a fixed list or computed from the stored data and the query arguments, which
/// allows one tag per returned record.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tagcache::{Provides, Tag};
///
/// let provides = Provides::from_fn(|data, _args| {
///     let mut tags = vec![Tag::new("Job")];
///     if let Some(jobs) = data.as_array() {
///         tags.extend(jobs.iter().filter_map(|job| job["id"].as_str()).map(|id| Tag::with_id("Job", id)));
///     }
///     tags
/// });
///
/// let tags = provides.resolve(&json!([{"id": "1"}, {"id": "2"}]), &Default::default());
/// assert_eq!(tags.len(), 3);
/// ```
#[derive(Clone, Default)]
pub enum Provides {
    /// The query provides no tags and is never invalidated.
    #[default]
    Nothing,
    /// A fixed set of tags.
    Tags(Vec<Tag>),
    /// Tags computed from the stored data and the query arguments.
    Computed(Arc<TagFn>),
}

impl Provides {
    /// Creates a fixed tag list.
    #[must_use]
    pub fn tags(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self::Tags(tags.into_iter().collect())
    }

    /// Computes tags from the stored data and the query arguments.
    #[must_use]
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Value, &Args) -> Vec<Tag> + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    /// Resolves the tags for `data` produced by a query called with `args`.
    #[must_use]
    pub fn resolve(&self, data: &Value, args: &Args) -> BTreeSet<Tag> {
        match self {
            Self::Nothing => BTreeSet::new(),
            Self::Tags(tags) => tags.iter().cloned().collect(),
            Self::Computed(f) => f(data, args).into_iter().collect(),
        }
    }
}

impl fmt::Debug for Provides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nothing => f.write_str("Nothing"),
            Self::Tags(tags) => f.debug_tuple("Tags").field(tags).finish(),
            Self::Computed(_) => f.debug_tuple("Computed").finish_non_exhaustive(),
        }
    }
}

impl From<Tag> for Provides {
    fn from(tag: Tag) -> Self {
        Self::Tags(vec![tag])
    }
}

impl From<Vec<Tag>> for Provides {
    fn from(tags: Vec<Tag>) -> Self {
        Self::Tags(tags)
    }
}

impl<const N: usize> From<[Tag; N]> for Provides {
    fn from(tags: [Tag; N]) -> Self {
        Self::Tags(tags.into())
    }
}
