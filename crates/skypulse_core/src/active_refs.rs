/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;

/// Bounded cache of live like/repost references, keyed by `<did>/<rkey>` and
/// valued by the target post id. Overflow evicts the LRU entry silently: the
/// persisted `like:`/`repost:` row stays behind as the durable fallback, so a
/// later delete still resolves through the store.
pub struct ActiveRefs {
    cache: LruCache<String, u64>,
}

impl ActiveRefs {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Promotes the key to most-recently-used.
    pub fn get(&mut self, key: &str) -> Option<u64> {
        self.cache.get(key).copied()
    }

    pub fn insert(&mut self, key: String, post_id: u64) {
        self.cache.put(key, post_id);
    }

    pub fn remove(&mut self, key: &str) -> Option<u64> {
        self.cache.pop(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains(key)
    }

    /// Drops every entry whose target id is in `ids`, returning the removed
    /// keys so the caller can delete the matching store rows.
    pub fn purge_ids(&mut self, ids: &HashSet<u64>) -> Vec<String> {
        let doomed: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, id)| ids.contains(id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.cache.pop(key);
        }
        doomed
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }
}
