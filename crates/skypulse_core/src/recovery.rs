/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::aggregator::{Aggregator, RefKind};
use crate::batch::RECOVERY_BATCH_OPS;
use crate::now_ms;
use crate::post_ids::display_url;
use crate::tally::PostStats;
use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const POST_RECOVERY_COMPACTION_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct RecoverySummary {
    pub posts: usize,
    pub stale_removed: usize,
    pub zero_removed: usize,
    pub active_likes: usize,
    pub active_reposts: usize,
    pub repaired_rows: usize,
    pub next_post_id: u64,
}

/// Rebuilds the whole in-memory state from the store before the first frame
/// arrives. Individual bad rows are logged and deleted; recovery itself never
/// aborts. All repairs commit through one recovery-sized batch scope.
pub fn run(agg: &mut Aggregator) -> Result<RecoverySummary> {
    let started = Instant::now();
    info!("recovering state from {}", agg.kv().path().display());

    agg.batcher.begin(RECOVERY_BATCH_OPS);
    let result = recover_inner(agg);
    let end = agg.batcher.end();
    let summary = result?;
    end?;

    info!(
        posts = summary.posts,
        stale_removed = summary.stale_removed,
        zero_removed = summary.zero_removed,
        active_likes = summary.active_likes,
        active_reposts = summary.active_reposts,
        repaired = summary.repaired_rows,
        next_post_id = summary.next_post_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "recovery complete"
    );

    if summary.stale_removed > 0 {
        agg.schedule_compaction(POST_RECOVERY_COMPACTION_DELAY);
    }
    Ok(summary)
}

#[derive(Debug, Deserialize)]
struct RawPostRow {
    #[serde(default)]
    likes: Option<u64>,
    #[serde(default)]
    reposts: Option<u64>,
    #[serde(rename = "lastUpdated", default)]
    last_updated: Option<i64>,
    #[serde(default)]
    id: Option<u64>,
}

fn recover_inner(agg: &mut Aggregator) -> Result<RecoverySummary> {
    let mut summary = RecoverySummary::default();
    let kv = agg.kv().clone();

    // Phase 1: allocation cursor, if one was ever persisted.
    let stored_next = match kv.get_json("meta:nextPostId") {
        Ok(value) => value.and_then(|v| v.as_u64()),
        Err(e) => {
            warn!("recovery: unreadable meta:nextPostId ({e:#}); dropping");
            agg.batcher.del("meta:nextPostId")?;
            None
        }
    };

    // Phase 2: uri -> id.
    let phase = Instant::now();
    let mut by_uri: HashMap<String, u64> = HashMap::new();
    let mut max_id = 0u64;
    let mut scanned = 0usize;
    for (key, value) in kv.scan_prefix("postid:") {
        scanned += 1;
        let uri = &key["postid:".len()..];
        let id = value.ok().and_then(|v| v.as_u64());
        match id {
            Some(id) if !uri.is_empty() => {
                max_id = max_id.max(id);
                by_uri.insert(uri.to_string(), id);
            }
            _ => {
                warn!("recovery: dropping malformed row {key}");
                agg.batcher.del(&key)?;
                summary.repaired_rows += 1;
            }
        }
    }
    info!(
        rows = scanned,
        elapsed_ms = phase.elapsed().as_millis() as u64,
        "recovery: postid scan"
    );

    // Phase 3: id -> uri, accepting the legacy `{uri, url}` object shape.
    let phase = Instant::now();
    let mut by_id: HashMap<u64, String> = HashMap::new();
    let mut urls: HashMap<u64, Option<String>> = HashMap::new();
    let mut scanned = 0usize;
    for (key, value) in kv.scan_prefix("posturi:") {
        scanned += 1;
        let Ok(id) = key["posturi:".len()..].parse::<u64>() else {
            warn!("recovery: dropping malformed row {key}");
            agg.batcher.del(&key)?;
            summary.repaired_rows += 1;
            continue;
        };
        match value {
            Ok(Value::String(uri)) => {
                by_id.insert(id, uri);
            }
            Ok(Value::Object(map)) => match map.get("uri").and_then(|u| u.as_str()) {
                Some(uri) => {
                    by_id.insert(id, uri.to_string());
                    urls.insert(id, map.get("url").and_then(|u| u.as_str()).map(String::from));
                    agg.batcher.put_json(&key, &uri)?;
                    summary.repaired_rows += 1;
                }
                None => {
                    warn!("recovery: dropping malformed row {key}");
                    agg.batcher.del(&key)?;
                    summary.repaired_rows += 1;
                }
            },
            _ => {
                warn!("recovery: dropping malformed row {key}");
                agg.batcher.del(&key)?;
                summary.repaired_rows += 1;
            }
        }
    }
    // Reconcile the two directions, preferring `postid:`, dropping orphans.
    for (uri, id) in &by_uri {
        if by_id.get(id).map(String::as_str) != Some(uri.as_str()) {
            by_id.insert(*id, uri.clone());
            agg.batcher.put_json(&format!("posturi:{id}"), uri)?;
            summary.repaired_rows += 1;
        }
    }
    let orphans: Vec<u64> = by_id
        .iter()
        .filter(|(id, uri)| by_uri.get(*uri).copied() != Some(**id))
        .map(|(id, _)| *id)
        .collect();
    for id in orphans {
        by_id.remove(&id);
        urls.remove(&id);
        agg.batcher.del(&format!("posturi:{id}"))?;
        agg.batcher.del(&format!("posturl:{id}"))?;
        summary.repaired_rows += 1;
    }
    info!(
        rows = scanned,
        elapsed_ms = phase.elapsed().as_millis() as u64,
        "recovery: posturi scan"
    );

    // Phase 4: display URLs.
    let phase = Instant::now();
    let mut scanned = 0usize;
    for (key, value) in kv.scan_prefix("posturl:") {
        scanned += 1;
        let Ok(id) = key["posturl:".len()..].parse::<u64>() else {
            agg.batcher.del(&key)?;
            summary.repaired_rows += 1;
            continue;
        };
        if !by_id.contains_key(&id) {
            agg.batcher.del(&key)?;
            summary.repaired_rows += 1;
            continue;
        }
        match value {
            Ok(Value::String(url)) => {
                urls.insert(id, Some(url));
            }
            Ok(Value::Null) => {
                urls.insert(id, None);
            }
            _ => {
                agg.batcher.del(&key)?;
                summary.repaired_rows += 1;
            }
        }
    }
    info!(
        rows = scanned,
        elapsed_ms = phase.elapsed().as_millis() as u64,
        "recovery: posturl scan"
    );

    for (uri, id) in &by_uri {
        let url = urls.remove(id);
        agg.ids.restore(uri.clone(), *id, url);
    }

    // Phase 5: allocation cursor invariant.
    let next = stored_next.unwrap_or(1).max(max_id + 1).max(1);
    agg.ids.set_next_id(next);
    agg.batcher.put_json("meta:nextPostId", &next)?;

    // Phase 6: tally rows.
    let phase = Instant::now();
    let now = now_ms();
    let retention = agg.config().retention_ms();
    let mut scanned = 0usize;
    for (key, value) in kv.scan_prefix("post:") {
        scanned += 1;
        let uri = key["post:".len()..].to_string();
        let Ok(read_value) = value else {
            warn!("recovery: dropping malformed row {key}");
            agg.batcher.del(&key)?;
            summary.repaired_rows += 1;
            continue;
        };
        let Ok(row) = serde_json::from_value::<RawPostRow>(read_value.clone()) else {
            warn!("recovery: dropping malformed row {key}");
            agg.batcher.del(&key)?;
            summary.repaired_rows += 1;
            continue;
        };
        let likes = row.likes.unwrap_or(0);
        let reposts = row.reposts.unwrap_or(0);
        let last_updated = row.last_updated.unwrap_or(0);

        if likes == 0 && reposts == 0 {
            summary.zero_removed += 1;
            agg.batcher.del(&key)?;
            if let Some(id) = row.id.or_else(|| agg.ids.id_for(&uri)) {
                agg.ids.remove(id, &mut agg.batcher)?;
            }
            continue;
        }
        if now - last_updated > retention {
            summary.stale_removed += 1;
            agg.batcher.del(&key)?;
            if let Some(id) = row.id.or_else(|| agg.ids.id_for(&uri)) {
                agg.ids.remove(id, &mut agg.batcher)?;
            }
            continue;
        }

        let id = match (agg.ids.id_for(&uri), row.id) {
            // The `postid:` direction is authoritative when present.
            (Some(mapped), _) => mapped,
            (None, Some(row_id)) => {
                agg.ids.restore(uri.clone(), row_id, Some(display_url(&uri)));
                agg.batcher.put_json(&format!("postid:{uri}"), &row_id)?;
                agg.batcher.put_json(&format!("posturi:{row_id}"), &uri)?;
                agg.batcher
                    .put_json(&format!("posturl:{row_id}"), &display_url(&uri))?;
                if row_id >= agg.ids.next_id() {
                    agg.ids.set_next_id(row_id + 1);
                }
                summary.repaired_rows += 1;
                row_id
            }
            (None, None) => {
                summary.repaired_rows += 1;
                agg.ids.register(&uri, &mut agg.batcher)?
            }
        };

        let canonical = PostStats {
            likes,
            reposts,
            last_updated,
            id,
        };
        let canonical_value = serde_json::to_value(&canonical)?;
        if canonical_value != read_value {
            agg.batcher.put_json(&key, &canonical)?;
            summary.repaired_rows += 1;
        }
        agg.tally.insert(uri, canonical);
        summary.posts += 1;
    }
    // The cursor may have moved while backfilling; persist the final value.
    let next = agg.ids.next_id();
    agg.batcher.put_json("meta:nextPostId", &next)?;
    summary.next_post_id = next;
    info!(
        rows = scanned,
        elapsed_ms = phase.elapsed().as_millis() as u64,
        "recovery: post scan"
    );

    // Phases 7 and 8: live references back into the bounded caches.
    summary.active_likes = recover_refs(agg, RefKind::Like, &mut summary.repaired_rows)?;
    summary.active_reposts = recover_refs(agg, RefKind::Repost, &mut summary.repaired_rows)?;

    Ok(summary)
}

fn recover_refs(agg: &mut Aggregator, kind: RefKind, repaired: &mut usize) -> Result<usize> {
    let phase = Instant::now();
    let kv = agg.kv().clone();
    let prefix = kind.key_prefix();
    let mut restored = 0usize;
    let mut scanned = 0usize;
    for (key, value) in kv.scan_prefix(prefix) {
        scanned += 1;
        let ref_key = &key[prefix.len()..];
        let (id, legacy) = match value {
            Ok(Value::Number(n)) => (n.as_u64(), false),
            Ok(Value::String(uri)) => (agg.ids.id_for(&uri), true),
            _ => (None, false),
        };
        let Some(id) = id else {
            agg.batcher.del(&key)?;
            *repaired += 1;
            continue;
        };
        let Some(uri) = agg.ids.uri_for(id).map(str::to_string) else {
            agg.batcher.del(&key)?;
            *repaired += 1;
            continue;
        };
        if !agg.tally.contains(&uri) {
            agg.batcher.del(&key)?;
            *repaired += 1;
            continue;
        }
        if legacy {
            agg.batcher.put_json(&key, &id)?;
            *repaired += 1;
        }
        match kind {
            RefKind::Like => agg.active_likes.insert(ref_key.to_string(), id),
            RefKind::Repost => agg.active_reposts.insert(ref_key.to_string(), id),
        }
        restored += 1;
    }
    info!(
        rows = scanned,
        restored,
        elapsed_ms = phase.elapsed().as_millis() as u64,
        "recovery: {} scan",
        kind.label()
    );
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kv::KvStore;
    use std::path::Path;
    use std::sync::Arc;

    const POST: &str = "at://did:plc:p/app.bsky.feed.post/r1";

    fn new_agg(dir: &Path) -> Aggregator {
        let cfg = Config {
            db_path: dir.join("db"),
            snapshot_dir: dir.join("snapshots"),
            ..Config::default()
        };
        let kv = Arc::new(KvStore::open(&cfg.db_path).unwrap());
        Aggregator::new(cfg, kv)
    }

    fn post_row(likes: u64, reposts: u64, last_updated: i64, id: u64) -> serde_json::Value {
        serde_json::json!({
            "likes": likes, "reposts": reposts, "lastUpdated": last_updated, "id": id
        })
    }

    #[tokio::test]
    async fn recovers_state_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());
        let now = now_ms();

        let kv = agg.kv().clone();
        kv.put_json(&format!("post:{POST}"), &post_row(3, 1, now, 7))
            .unwrap();
        kv.put_json(&format!("postid:{POST}"), &7u64).unwrap();
        kv.put_json("posturi:7", &POST).unwrap();
        kv.put_json("like:did:q/k", &7u64).unwrap();
        kv.put_json("meta:nextPostId", &8u64).unwrap();

        let summary = run(&mut agg).unwrap();
        assert_eq!(summary.posts, 1);
        assert_eq!(summary.next_post_id, 8);
        assert_eq!(summary.active_likes, 1);

        let stats = agg.tally.get(POST).unwrap();
        assert_eq!((stats.likes, stats.reposts, stats.id), (3, 1, 7));
        assert_eq!(agg.active_likes.get("did:q/k"), Some(7));
        assert_eq!(agg.ids.next_id(), 8);
    }

    #[tokio::test]
    async fn migrates_legacy_uri_ref_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());
        let now = now_ms();

        let kv = agg.kv().clone();
        kv.put_json(&format!("post:{POST}"), &post_row(1, 0, now, 3))
            .unwrap();
        kv.put_json(&format!("postid:{POST}"), &3u64).unwrap();
        kv.put_json("posturi:3", &POST).unwrap();
        kv.put_json("like:did:z/k", &POST).unwrap();

        run(&mut agg).unwrap();
        assert_eq!(agg.active_likes.get("did:z/k"), Some(3));
        assert_eq!(
            kv.get_json("like:did:z/k").unwrap(),
            Some(serde_json::json!(3))
        );
    }

    #[tokio::test]
    async fn drops_zero_and_stale_rows_with_their_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());
        let now = now_ms();
        let kv = agg.kv().clone();

        let zero = "at://did:plc:p/app.bsky.feed.post/zero";
        let stale = "at://did:plc:p/app.bsky.feed.post/stale";
        kv.put_json(&format!("post:{zero}"), &post_row(0, 0, now, 1))
            .unwrap();
        kv.put_json(&format!("postid:{zero}"), &1u64).unwrap();
        kv.put_json("posturi:1", &zero).unwrap();
        kv.put_json(&format!("post:{stale}"), &post_row(5, 0, now - 25 * 3_600_000, 2))
            .unwrap();
        kv.put_json(&format!("postid:{stale}"), &2u64).unwrap();
        kv.put_json("posturi:2", &stale).unwrap();
        // A ref pointing at the stale post must not survive either.
        kv.put_json("like:did:a/r", &2u64).unwrap();

        let summary = run(&mut agg).unwrap();
        assert_eq!(summary.zero_removed, 1);
        assert_eq!(summary.stale_removed, 1);
        assert!(agg.tally.is_empty());
        assert!(kv.get_raw(&format!("post:{zero}")).unwrap().is_none());
        assert!(kv.get_raw(&format!("postid:{zero}")).unwrap().is_none());
        assert!(kv.get_raw(&format!("post:{stale}")).unwrap().is_none());
        assert!(kv.get_raw("like:did:a/r").unwrap().is_none());
        assert_eq!(summary.next_post_id, 3);
    }

    #[tokio::test]
    async fn backfills_mappings_from_post_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());
        let now = now_ms();
        let kv = agg.kv().clone();

        // Row carries id 9 but neither mapping row exists.
        kv.put_json(&format!("post:{POST}"), &post_row(2, 0, now, 9))
            .unwrap();

        let summary = run(&mut agg).unwrap();
        assert_eq!(agg.ids.id_for(POST), Some(9));
        assert_eq!(
            kv.get_json(&format!("postid:{POST}")).unwrap(),
            Some(serde_json::json!(9))
        );
        assert_eq!(
            kv.get_json("posturi:9").unwrap(),
            Some(serde_json::json!(POST))
        );
        // Cursor stays above every observed id.
        assert!(summary.next_post_id > 9);
    }

    #[tokio::test]
    async fn allocates_fresh_id_when_row_has_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());
        let now = now_ms();
        let kv = agg.kv().clone();

        kv.put_json(
            &format!("post:{POST}"),
            &serde_json::json!({"likes": 1, "reposts": 0, "lastUpdated": now}),
        )
        .unwrap();

        run(&mut agg).unwrap();
        let stats = agg.tally.get(POST).unwrap();
        assert_eq!(stats.id, 1);
        // The row was rewritten into the canonical shape.
        let row = kv.get_json(&format!("post:{POST}")).unwrap().unwrap();
        assert_eq!(row["id"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn accepts_legacy_posturi_object_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());
        let now = now_ms();
        let kv = agg.kv().clone();

        kv.put_json(&format!("post:{POST}"), &post_row(1, 0, now, 4))
            .unwrap();
        kv.put_json(&format!("postid:{POST}"), &4u64).unwrap();
        kv.put_json(
            "posturi:4",
            &serde_json::json!({"uri": POST, "url": "https://bsky.app/profile/did:plc:p/post/r1"}),
        )
        .unwrap();

        run(&mut agg).unwrap();
        assert_eq!(agg.ids.uri_for(4), Some(POST));
        assert_eq!(
            agg.ids.url_for(4).as_deref(),
            Some("https://bsky.app/profile/did:plc:p/post/r1")
        );
        // Normalized to the plain string shape.
        assert_eq!(
            kv.get_json("posturi:4").unwrap(),
            Some(serde_json::json!(POST))
        );
    }

    #[tokio::test]
    async fn deletes_orphaned_reverse_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());
        let kv = agg.kv().clone();

        // posturi:5 exists with no postid: row pointing back.
        kv.put_json("posturi:5", &POST).unwrap();
        kv.put_json("posturl:5", &serde_json::Value::Null).unwrap();

        run(&mut agg).unwrap();
        assert!(kv.get_raw("posturi:5").unwrap().is_none());
        assert!(kv.get_raw("posturl:5").unwrap().is_none());
        assert!(agg.ids.uri_for(5).is_none());
    }

    #[tokio::test]
    async fn deletes_rows_that_fail_to_decode() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());
        let now = now_ms();
        let kv = agg.kv().clone();

        kv.put_json(&format!("post:{POST}"), &post_row(1, 0, now, 2))
            .unwrap();
        kv.put_json(&format!("postid:{POST}"), &2u64).unwrap();
        kv.put_json("posturi:2", &POST).unwrap();
        kv.put_raw("postid:at://broken", b"{not json").unwrap();
        kv.put_raw("like:did:a/bad", b"]]").unwrap();

        let summary = run(&mut agg).unwrap();
        assert_eq!(summary.posts, 1);
        assert!(kv.get_raw("postid:at://broken").unwrap().is_none());
        assert!(kv.get_raw("like:did:a/bad").unwrap().is_none());
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let now = now_ms();
        {
            let mut agg = new_agg(dir.path());
            let kv = agg.kv().clone();
            kv.put_json(&format!("post:{POST}"), &post_row(3, 1, now, 7))
                .unwrap();
            kv.put_json(&format!("postid:{POST}"), &7u64).unwrap();
            kv.put_json("posturi:7", &POST).unwrap();
            kv.put_json("like:did:q/k", &POST).unwrap();
            run(&mut agg).unwrap();
        }
        // Second run over the repaired store finds nothing left to fix.
        let mut agg = new_agg(dir.path());
        let summary = run(&mut agg).unwrap();
        assert_eq!(summary.posts, 1);
        assert_eq!(summary.repaired_rows, 0);
        assert_eq!(summary.active_likes, 1);
        assert_eq!(summary.next_post_id, 8);
        assert_eq!(agg.active_likes.get("did:q/k"), Some(7));
    }
}
