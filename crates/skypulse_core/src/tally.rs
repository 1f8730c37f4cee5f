/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-post counters, stored under `post:<uri>` exactly in this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostStats {
    pub likes: u64,
    pub reposts: u64,
    #[serde(rename = "lastUpdated")]
    pub last_updated: i64,
    pub id: u64,
}

impl PostStats {
    pub fn new(id: u64, now: i64) -> Self {
        Self {
            likes: 0,
            reposts: 0,
            last_updated: now,
            id,
        }
    }
}

pub enum AdjustOutcome {
    /// Counters changed; the returned row is the canonical persisted shape.
    Updated(PostStats),
    /// Both counters hit zero; the entry was removed. Carries the freed id.
    Removed(u64),
}

/// In-memory tally of every tracked post.
#[derive(Default)]
pub struct TallyTable {
    posts: HashMap<String, PostStats>,
}

impl TallyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &str) -> Option<&PostStats> {
        self.posts.get(uri)
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.posts.contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PostStats)> {
        self.posts.iter()
    }

    pub fn insert(&mut self, uri: String, stats: PostStats) {
        self.posts.insert(uri, stats);
    }

    pub fn remove(&mut self, uri: &str) -> Option<PostStats> {
        self.posts.remove(uri)
    }

    /// Ensures an entry exists for `uri` before an increment lands.
    pub fn ensure(&mut self, uri: &str, id: u64, now: i64) -> &mut PostStats {
        self.posts
            .entry(uri.to_string())
            .or_insert_with(|| PostStats::new(id, now))
    }

    /// Applies deltas floored at zero and bumps `last_updated`. An entry whose
    /// counters both reach zero dies here, within the same call.
    pub fn adjust(
        &mut self,
        uri: &str,
        like_delta: i64,
        repost_delta: i64,
        now: i64,
    ) -> Option<AdjustOutcome> {
        let stats = self.posts.get_mut(uri)?;
        stats.likes = (stats.likes as i64 + like_delta).max(0) as u64;
        stats.reposts = (stats.reposts as i64 + repost_delta).max(0) as u64;
        stats.last_updated = now;
        if stats.likes == 0 && stats.reposts == 0 {
            let id = stats.id;
            self.posts.remove(uri);
            return Some(AdjustOutcome::Removed(id));
        }
        Some(AdjustOutcome::Updated(self.posts[uri].clone()))
    }
}
