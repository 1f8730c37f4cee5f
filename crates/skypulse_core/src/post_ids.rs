/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::batch::WriteBatcher;
use anyhow::Result;
use std::collections::HashMap;

pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Bidirectional map between post URIs and compact numeric ids. The caches
/// store ids, not URIs, so both sides must stay consistent with the three
/// persisted rows (`postid:`, `posturi:`, `posturl:`) plus `meta:nextPostId`.
pub struct PostIdRegistry {
    by_uri: HashMap<String, u64>,
    by_id: HashMap<u64, String>,
    urls: HashMap<u64, Option<String>>,
    next_id: u64,
}

impl Default for PostIdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PostIdRegistry {
    pub fn new() -> Self {
        Self {
            by_uri: HashMap::new(),
            by_id: HashMap::new(),
            urls: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn id_for(&self, uri: &str) -> Option<u64> {
        self.by_uri.get(uri).copied()
    }

    pub fn uri_for(&self, id: u64) -> Option<&str> {
        self.by_id.get(&id).map(|s| s.as_str())
    }

    /// Display URL for an id, derived once and cached.
    pub fn url_for(&mut self, id: u64) -> Option<String> {
        if let Some(cached) = self.urls.get(&id) {
            return cached.clone();
        }
        let derived = self.by_id.get(&id).and_then(|uri| display_url(uri));
        self.urls.insert(id, derived.clone());
        derived
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn set_next_id(&mut self, next: u64) {
        self.next_id = next.max(1);
    }

    pub fn len(&self) -> usize {
        self.by_uri.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uri.is_empty()
    }

    /// Allocates (or returns) the id for a URI, persisting all three rows and
    /// the allocation cursor.
    pub fn register(&mut self, uri: &str, batcher: &mut WriteBatcher) -> Result<u64> {
        if let Some(id) = self.by_uri.get(uri) {
            return Ok(*id);
        }
        let id = self.next_id;
        self.next_id += 1;
        let url = display_url(uri);
        self.by_uri.insert(uri.to_string(), id);
        self.by_id.insert(id, uri.to_string());
        self.urls.insert(id, url.clone());

        batcher.put_json(&format!("postid:{uri}"), &id)?;
        batcher.put_json(&format!("posturi:{id}"), &uri)?;
        batcher.put_json(&format!("posturl:{id}"), &url)?;
        batcher.put_json("meta:nextPostId", &self.next_id)?;
        Ok(id)
    }

    /// Recovery-time insert of an already-allocated mapping. Does not touch
    /// the store; the caller decides which rows need rewriting.
    pub fn restore(&mut self, uri: String, id: u64, url: Option<Option<String>>) {
        self.by_uri.insert(uri.clone(), id);
        self.by_id.insert(id, uri);
        if let Some(url) = url {
            self.urls.insert(id, url);
        }
    }

    pub fn restore_url(&mut self, id: u64, url: Option<String>) {
        self.urls.insert(id, url);
    }

    pub fn remove(&mut self, id: u64, batcher: &mut WriteBatcher) -> Result<()> {
        if let Some(uri) = self.by_id.remove(&id) {
            self.by_uri.remove(&uri);
            batcher.del(&format!("postid:{uri}"))?;
        }
        self.urls.remove(&id);
        batcher.del(&format!("posturi:{id}"))?;
        batcher.del(&format!("posturl:{id}"))?;
        Ok(())
    }
}

/// `at://<did>/app.bsky.feed.post/<rkey>` -> public profile URL; anything
/// else has no display URL.
pub fn display_url(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("at://")?;
    let mut parts = rest.splitn(3, '/');
    let did = parts.next()?;
    let collection = parts.next()?;
    let rkey = parts.next()?;
    if collection != POST_COLLECTION || did.is_empty() || rkey.is_empty() {
        return None;
    }
    Some(format!("https://bsky.app/profile/{did}/post/{rkey}"))
}
