// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The inverted index from tags to cache keys.

use std::collections::{BTreeSet, HashMap};

use crate::{CacheKey, Tag};

/// Inverted index from tags to the cache keys that provide them.
///
/// Exact lookups go through the tag itself; wildcard lookups go through the tag's kind. Each key
/// also remembers its own tags so re-indexing or removing it is proportional to its tag count.
#[derive(Debug, Default)]
pub struct TagIndex {
    by_tag: HashMap<Tag, BTreeSet<CacheKey>>,
    by_kind: HashMap<String, BTreeSet<CacheKey>>,
    by_key: HashMap<CacheKey, BTreeSet<Tag>>,
}

impl TagIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `key` provides `tags`, replacing whatever it provided before.
    pub fn index(&mut self, key: &CacheKey, tags: impl IntoIterator<Item = Tag>) {
        self.remove(key);

        let tags: BTreeSet<Tag> = tags.into_iter().collect();
        if tags.is_empty() {
            return;
        }

        for tag in &tags {
            self.by_kind.entry(tag.kind().to_owned()).or_default().insert(key.clone());
            self.by_tag.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.by_key.insert(key.clone(), tags);
    }

    /// Forgets every tag provided by `key`.
    pub fn remove(&mut self, key: &CacheKey) {
        let Some(tags) = self.by_key.remove(key) else {
            return;
        };

        for tag in tags {
            if let Some(keys) = self.by_kind.get_mut(tag.kind()) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_kind.remove(tag.kind());
                }
            }
            if let Some(keys) = self.by_tag.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(&tag);
                }
            }
        }
    }

    /// Returns the sorted, de-duplicated keys matched by any of `tags`.
    ///
    /// The index itself is not modified; marking entries stale is the caller's concern.
    #[must_use]
    pub fn invalidate(&self, tags: &[Tag]) -> Vec<CacheKey> {
        let mut matched = BTreeSet::new();
        for tag in tags {
            let keys = if tag.id().is_some() {
                self.by_tag.get(tag)
            } else {
                self.by_kind.get(tag.kind())
            };
            matched.extend(keys.into_iter().flatten().cloned());
        }
        matched.into_iter().collect()
    }

    /// Returns the tags currently indexed for `key`.
    #[must_use]
    pub fn tags_of(&self, key: &CacheKey) -> Option<&BTreeSet<Tag>> {
        self.by_key.get(key)
    }

    /// Returns the number of indexed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Returns `true` if no key is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Removes everything.
    pub fn clear(&mut self) {
        self.by_tag.clear();
        self.by_kind.clear();
        self.by_key.clear();
    }
}
