// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache entries and the store holding them.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use serde_json::Value;
use tokio::{sync::watch, time::Instant};

use crate::{CacheKey, Error, Query, Tag};

/// Lifecycle of a cached query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueryStatus {
    /// Known to the cache but never loaded.
    Idle,
    /// A load is in progress; previous data, if any, is still available.
    Loading,
    /// Data is available.
    Success,
    /// The last load failed with a surfaced error.
    Error,
}

/// Where the data of a successful entry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataSource {
    /// The remote fetch collaborator.
    Remote,
    /// The fallback generator registered for the endpoint.
    Fallback,
}

/// A snapshot of a query as observed by a consumer.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct QueryState {
    /// Current lifecycle state.
    pub status: QueryStatus,
    /// The latest data, kept while a refetch is loading.
    pub data: Option<Value>,
    /// The surfaced error of a failed load.
    pub error: Option<Error>,
    /// Set when a tag invalidation hit the entry and no refetch has replaced it yet.
    pub stale: bool,
    /// Provenance of `data`.
    pub source: Option<DataSource>,
}

impl QueryState {
    /// The state of a query that has not been loaded.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            stale: false,
            source: None,
        }
    }

    /// Returns `true` while a load is running.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// Returns `true` if the data was synthesized by a fallback generator.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.source == Some(DataSource::Fallback)
    }
}

/// One cached query.
///
/// Entries are created through [`idle`](Self::idle), [`success`](Self::success) and
/// [`failed`](Self::failed), which keep `status == Success` equivalent to having data and no
/// error.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    query: Query,
    status: QueryStatus,
    data: Option<Value>,
    error: Option<Error>,
    source: Option<DataSource>,
    tags: BTreeSet<Tag>,
    subscriber_count: usize,
    last_accessed_at: Instant,
    stale: bool,
    pending_invalidation: Vec<Tag>,
    generation: u64,
    load: u64,
}

impl CacheEntry {
    /// An entry that exists but has never been loaded.
    #[must_use]
    pub fn idle(query: Query) -> Self {
        Self {
            query,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            source: None,
            tags: BTreeSet::new(),
            subscriber_count: 0,
            last_accessed_at: Instant::now(),
            stale: false,
            pending_invalidation: Vec::new(),
            generation: 0,
            load: 0,
        }
    }

    /// A successfully loaded entry.
    #[must_use]
    pub fn success(query: Query, data: Value, source: DataSource, tags: BTreeSet<Tag>) -> Self {
        Self {
            status: QueryStatus::Success,
            data: Some(data),
            source: Some(source),
            tags,
            ..Self::idle(query)
        }
    }

    /// An entry whose load failed.
    #[must_use]
    pub fn failed(query: Query, error: Error, tags: BTreeSet<Tag>) -> Self {
        Self {
            status: QueryStatus::Error,
            error: Some(error),
            tags,
            ..Self::idle(query)
        }
    }

    /// The cache key.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        self.query.key()
    }

    /// The query that produced the entry.
    #[must_use]
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Lifecycle state.
    #[must_use]
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// The stored data.
    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// The surfaced error.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Provenance of the data.
    #[must_use]
    pub fn source(&self) -> Option<DataSource> {
        self.source
    }

    /// Tags provided when the entry was written.
    #[must_use]
    pub fn tags(&self) -> &BTreeSet<Tag> {
        &self.tags
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    /// When the entry was last read or subscribed to.
    #[must_use]
    pub fn last_accessed_at(&self) -> Instant {
        self.last_accessed_at
    }

    /// Returns `true` if a tag invalidation hit the entry after it was written.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Returns `true` for a successful entry that has not been invalidated.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.status == QueryStatus::Success && !self.stale
    }

    /// The consumer-facing snapshot of the entry.
    #[must_use]
    pub fn state(&self) -> QueryState {
        QueryState {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            stale: self.stale,
            source: self.source,
        }
    }

    /// Marks the entry as loading, keeping the previous data visible. Returns the sequence
    /// number of the new load.
    fn begin_loading(&mut self) -> u64 {
        self.status = QueryStatus::Loading;
        self.error = None;
        self.load += 1;
        self.load
    }

    /// Marks the entry stale. An invalidation that hits a loading entry is remembered so the
    /// write that ends the load can re-check it.
    pub(crate) fn invalidate(&mut self, tags: &[Tag]) {
        self.stale = true;
        self.defer_invalidation(tags);
    }

    /// Remembers `tags` for the write ending the current load, if any, without marking the
    /// entry stale. Used for first loads, which have no indexed tags to match yet.
    pub(crate) fn defer_invalidation(&mut self, tags: &[Tag]) {
        if self.status == QueryStatus::Loading {
            self.pending_invalidation.extend_from_slice(tags);
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Sequence number of the most recently started load.
    pub(crate) fn load_sequence(&self) -> u64 {
        self.load
    }
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    state: watch::Sender<QueryState>,
}

impl Slot {
    fn new(entry: CacheEntry) -> Self {
        let (state, _) = watch::channel(entry.state());
        Self { entry, state }
    }

    fn publish(&self) {
        self.state.send_replace(self.entry.state());
    }
}

/// Holds one entry per cache key.
///
/// The store is a plain data structure; the client guards it and the tag index with a single
/// lock so every operation is atomic with respect to the others.
#[derive(Debug, Default)]
pub struct CacheStore {
    slots: HashMap<CacheKey, Slot>,
}

impl CacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the entry for `key` and records the access.
    pub fn get(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let slot = self.slots.get_mut(key)?;
        slot.entry.last_accessed_at = Instant::now();
        Some(slot.entry.clone())
    }

    /// Returns the entry for `key` without recording an access.
    #[must_use]
    pub fn peek(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.slots.get(key).map(|slot| &slot.entry)
    }

    /// Stores `entry` under `key`, keeping the subscriber count of the entry it replaces.
    pub fn put(&mut self, key: CacheKey, entry: CacheEntry) {
        self.write(key, entry);
    }

    /// Removes the entry for `key`.
    pub fn delete(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.slots.remove(key).map(|slot| slot.entry)
    }

    /// Returns every entry providing a tag matched by `tag`, ordered by key.
    #[must_use]
    pub fn entries_by_tag(&self, tag: &Tag) -> Vec<CacheEntry> {
        let mut entries: Vec<_> = self
            .slots
            .values()
            .filter(|slot| slot.entry.tags.iter().any(|provided| tag.matches(provided)))
            .map(|slot| slot.entry.clone())
            .collect();
        entries.sort_unstable_by(|a, b| a.key().cmp(b.key()));
        entries
    }

    /// Removes every unsubscribed entry not accessed within `retention` and returns their keys.
    pub fn sweep(&mut self, retention: Duration) -> Vec<CacheKey> {
        let now = Instant::now();
        let mut evicted: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.entry.subscriber_count == 0 && now.saturating_duration_since(slot.entry.last_accessed_at) >= retention
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &evicted {
            self.slots.remove(key);
        }
        evicted.sort_unstable();
        evicted
    }

    /// Removes everything.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the stored keys in order.
    #[must_use]
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self.slots.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Writes `entry`, carrying over the subscription bookkeeping and watchers of the entry it
    /// replaces. Returns `true` if an invalidation recorded while the replaced entry was loading
    /// still applies to the tags of the new one; the new entry is then left stale.
    pub(crate) fn write(&mut self, key: CacheKey, mut entry: CacheEntry) -> bool {
        let Some(slot) = self.slots.get_mut(&key) else {
            self.slots.insert(key, Slot::new(entry));
            return false;
        };

        let previous = &mut slot.entry;
        let pending = std::mem::take(&mut previous.pending_invalidation);
        let still_invalid = pending.iter().any(|inv| entry.tags.iter().any(|tag| inv.matches(tag)));

        entry.subscriber_count = previous.subscriber_count;
        entry.generation = previous.generation;
        entry.load = previous.load;
        entry.stale = still_invalid;
        slot.entry = entry;
        slot.publish();
        still_invalid
    }

    /// Writes the result of load number `load`. Returns `None` without touching the entry if a
    /// newer load has started since; otherwise behaves like [`write`](Self::write).
    pub(crate) fn complete_load(&mut self, key: CacheKey, entry: CacheEntry, load: u64) -> Option<bool> {
        if self.slots.get(&key).is_some_and(|slot| slot.entry.load > load) {
            return None;
        }
        Some(self.write(key, entry))
    }

    /// Applies `f` to the entry for `key` and notifies its watchers.
    pub(crate) fn update<R>(&mut self, key: &CacheKey, f: impl FnOnce(&mut CacheEntry) -> R) -> Option<R> {
        let slot = self.slots.get_mut(key)?;
        let result = f(&mut slot.entry);
        slot.publish();
        Some(result)
    }

    fn slot_or_idle(&mut self, query: &Query) -> &mut Slot {
        self.slots
            .entry(query.key().clone())
            .or_insert_with(|| Slot::new(CacheEntry::idle(query.clone())))
    }

    /// Marks the entry for `query` as loading, creating it if absent, and returns the sequence
    /// number its result must be written with.
    pub(crate) fn begin_loading(&mut self, query: &Query) -> u64 {
        let slot = self.slot_or_idle(query);
        let load = slot.entry.begin_loading();
        slot.publish();
        load
    }

    /// Adds a subscriber, creating an idle entry if absent, and starts watching the entry.
    pub(crate) fn subscribe(&mut self, query: &Query) -> (&CacheEntry, watch::Receiver<QueryState>) {
        let slot = self.slot_or_idle(query);
        slot.entry.subscriber_count += 1;
        slot.entry.generation += 1;
        slot.entry.last_accessed_at = Instant::now();
        let state = slot.state.subscribe();
        (&slot.entry, state)
    }

    /// Removes a subscriber. Returns the entry generation when the last subscriber left.
    pub(crate) fn unsubscribe(&mut self, key: &CacheKey) -> Option<u64> {
        let entry = &mut self.slots.get_mut(key)?.entry;
        entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
        entry.last_accessed_at = Instant::now();
        (entry.subscriber_count == 0).then_some(entry.generation)
    }

    /// Keys of entries currently loading.
    pub(crate) fn loading_keys(&self) -> Vec<CacheKey> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.entry.status == QueryStatus::Loading)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Entries with at least one subscriber.
    pub(crate) fn subscribed(&self) -> impl Iterator<Item = &CacheEntry> {
        self.slots.values().map(|slot| &slot.entry).filter(|entry| entry.subscriber_count > 0)
    }

    /// Drops unsubscribed entries and resets subscribed ones to idle, notifying their watchers.
    pub(crate) fn reset(&mut self) {
        self.slots.retain(|_, slot| slot.entry.subscriber_count > 0);
        for slot in self.slots.values_mut() {
            let previous = &slot.entry;
            slot.entry = CacheEntry {
                subscriber_count: previous.subscriber_count,
                generation: previous.generation,
                load: previous.load,
                ..CacheEntry::idle(previous.query.clone())
            };
            slot.publish();
        }
    }
}
