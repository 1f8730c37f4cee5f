/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::active_refs::ActiveRefs;
use crate::batch::WriteBatcher;
use crate::config::Config;
use crate::ingest::{self, Commit, Operation};
use crate::kv::KvStore;
use crate::post_ids::PostIdRegistry;
use crate::snapshot::{self, SnapshotJob, SnapshotQueue, SnapshotReason};
use crate::tally::{AdjustOutcome, TallyTable};
use crate::{now_ms, prune, rank, report};
use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Like,
    Repost,
}

impl RefKind {
    pub fn label(&self) -> &'static str {
        match self {
            RefKind::Like => "like",
            RefKind::Repost => "repost",
        }
    }

    pub fn key_prefix(&self) -> &'static str {
        match self {
            RefKind::Like => "like:",
            RefKind::Repost => "repost:",
        }
    }

    fn deltas(&self, sign: i64) -> (i64, i64) {
        match self {
            RefKind::Like => (sign, 0),
            RefKind::Repost => (0, sign),
        }
    }
}

/// The whole mutable state of the service in one container: tally, id
/// registry, active-reference caches, write batcher and snapshot queue.
/// `main` builds it, recovery fills it, the ingest loop and the timer workers
/// mutate it behind one async mutex, shutdown drops it.
pub struct Aggregator {
    cfg: Config,
    kv: Arc<KvStore>,
    pub batcher: WriteBatcher,
    pub ids: PostIdRegistry,
    pub tally: TallyTable,
    pub active_likes: ActiveRefs,
    pub active_reposts: ActiveRefs,
    snapshots: SnapshotQueue,
    timers_started: bool,
    shutting_down: bool,
    finalized: bool,
    compaction_pending: Arc<AtomicBool>,
}

impl Aggregator {
    pub fn new(cfg: Config, kv: Arc<KvStore>) -> Self {
        let snapshots = SnapshotQueue::start(cfg.snapshot_dir.clone());
        Self {
            batcher: WriteBatcher::new(kv.clone()),
            ids: PostIdRegistry::new(),
            tally: TallyTable::new(),
            active_likes: ActiveRefs::new(cfg.max_active_likes),
            active_reposts: ActiveRefs::new(cfg.max_active_reposts),
            snapshots,
            timers_started: false,
            shutting_down: false,
            finalized: false,
            compaction_pending: Arc::new(AtomicBool::new(false)),
            kv,
            cfg,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub fn set_shutting_down(&mut self) {
        self.shutting_down = true;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn handle_commit(&mut self, kind: RefKind, did: &str, commit: &Commit) -> Result<()> {
        match commit.operation {
            // Likes and reposts are immutable records.
            Operation::Update => Ok(()),
            Operation::Create => self.handle_create(kind, did, commit),
            Operation::Delete => self.handle_delete(kind, did, &commit.rkey),
        }
    }

    fn handle_create(&mut self, kind: RefKind, did: &str, commit: &Commit) -> Result<()> {
        let Some(record) = &commit.record else {
            return Ok(());
        };
        let Some(uri) = ingest::subject_uri(record) else {
            return Ok(());
        };
        let ref_key = format!("{did}/{}", commit.rkey);
        let now = now_ms();

        let id = self.ids.register(&uri, &mut self.batcher)?;
        self.tally.ensure(&uri, id, now);
        let (like_delta, repost_delta) = kind.deltas(1);
        self.apply_adjust(&uri, like_delta, repost_delta, now)?;

        match kind {
            RefKind::Like => self.active_likes.insert(ref_key.clone(), id),
            RefKind::Repost => self.active_reposts.insert(ref_key.clone(), id),
        }
        self.batcher
            .put_json(&format!("{}{ref_key}", kind.key_prefix()), &id)?;
        Ok(())
    }

    fn handle_delete(&mut self, kind: RefKind, did: &str, rkey: &str) -> Result<()> {
        let ref_key = format!("{did}/{rkey}");
        let row_key = format!("{}{ref_key}", kind.key_prefix());

        let cached = match kind {
            RefKind::Like => self.active_likes.remove(&ref_key),
            RefKind::Repost => self.active_reposts.remove(&ref_key),
        };
        let resolved = match cached {
            Some(id) => Some(id),
            None => self.resolve_ref_row(&row_key),
        };
        // Unknown reference: nothing to undo, nothing to write.
        let Some(id) = resolved else {
            return Ok(());
        };

        self.batcher.del(&row_key)?;

        let Some(uri) = self.ids.uri_for(id).map(str::to_string) else {
            // Target already pruned: the ref row is gone, the count stays.
            return Ok(());
        };
        if !self.tally.contains(&uri) {
            return Ok(());
        }
        let (like_delta, repost_delta) = kind.deltas(-1);
        self.apply_adjust(&uri, like_delta, repost_delta, now_ms())
    }

    /// Ref rows hold a numeric post id; legacy rows hold the subject URI as a
    /// plain string and are resolved through the registry.
    fn resolve_ref_row(&self, row_key: &str) -> Option<u64> {
        let value = match self.kv.get_json(row_key) {
            Ok(v) => v,
            Err(e) => {
                warn!("unreadable ref row {row_key}: {e:#}");
                return None;
            }
        };
        match value {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(uri)) => self.ids.id_for(&uri),
            _ => None,
        }
    }

    /// Applies a counter change and keeps the store in step: a surviving
    /// entry gets its `post:` row rewritten, a dying one takes its id
    /// mappings and row with it.
    pub fn apply_adjust(
        &mut self,
        uri: &str,
        like_delta: i64,
        repost_delta: i64,
        now: i64,
    ) -> Result<()> {
        match self.tally.adjust(uri, like_delta, repost_delta, now) {
            Some(AdjustOutcome::Updated(stats)) => {
                self.batcher.put_json(&format!("post:{uri}"), &stats)
            }
            Some(AdjustOutcome::Removed(id)) => {
                self.ids.remove(id, &mut self.batcher)?;
                self.batcher.del(&format!("post:{uri}"))
            }
            None => Ok(()),
        }
    }

    pub fn enqueue_snapshot(&mut self, reason: SnapshotReason) {
        let at = Utc::now();
        let ranked = rank::top_posts(
            &self.tally,
            now_ms(),
            self.cfg.half_life_hours,
            self.cfg.top_count,
        );
        let ids = &mut self.ids;
        let doc = snapshot::build_document(
            at,
            reason,
            self.cfg.window_hours,
            self.cfg.half_life_hours,
            self.cfg.top_count,
            &ranked,
            |id| ids.url_for(id),
        );
        self.snapshots.enqueue(SnapshotJob { at, doc });
    }

    pub async fn drain_snapshots(&mut self) {
        self.snapshots.drain().await;
    }

    /// Deferred, coalesced store compaction. A second request while one is
    /// pending or running is a no-op.
    pub fn schedule_compaction(&self, delay: Duration) {
        if self.compaction_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let kv = self.kv.clone();
        let pending = self.compaction_pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("compacting state store");
            let started = Instant::now();
            let joined = tokio::task::spawn_blocking(move || kv.compact_all()).await;
            if joined.is_err() {
                warn!("compaction task failed");
            }
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "compaction finished"
            );
            pending.store(false, Ordering::SeqCst);
        });
    }
}

/// First successful connect starts the periodic workers; every connect drops
/// a "connected" snapshot marker.
pub async fn on_connected(state: &Arc<Mutex<Aggregator>>, shutdown: watch::Receiver<bool>) {
    let mut agg = state.lock().await;
    if !agg.timers_started {
        agg.timers_started = true;
        report::start_worker(state.clone(), shutdown.clone());
        prune::start_worker(state.clone(), shutdown.clone());
        snapshot::start_worker(state.clone(), shutdown);
    }
    agg.enqueue_snapshot(SnapshotReason::Connected);
}

/// Final report, final prune, final snapshot, store flush. Idempotent; the
/// timer workers must already be stopped.
pub async fn finalize(state: &Arc<Mutex<Aggregator>>) -> Result<()> {
    let mut agg = state.lock().await;
    if agg.finalized {
        return Ok(());
    }
    agg.finalized = true;
    agg.shutting_down = true;

    let mut sys = sysinfo::System::new();
    report::report_once(&mut agg, &mut sys);
    match prune::run_once(&mut agg) {
        Ok(outcome) => {
            if outcome.removed_posts() > 0 {
                info!(removed = outcome.removed_posts(), "final prune");
            }
        }
        Err(e) => warn!("final prune failed: {e:#}"),
    }
    agg.enqueue_snapshot(SnapshotReason::Final);
    agg.drain_snapshots().await;
    agg.kv.flush()?;
    info!("aggregator state flushed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::LIKE_COLLECTION;
    use std::path::Path;

    const POST: &str = "at://did:plc:p/app.bsky.feed.post/r1";

    fn test_config(dir: &Path) -> Config {
        Config {
            db_path: dir.join("db"),
            snapshot_dir: dir.join("snapshots"),
            ..Config::default()
        }
    }

    fn new_agg(dir: &Path) -> Aggregator {
        let cfg = test_config(dir);
        let kv = Arc::new(KvStore::open(&cfg.db_path).unwrap());
        Aggregator::new(cfg, kv)
    }

    fn create_commit(rkey: &str, subject: &str) -> Commit {
        Commit {
            rev: None,
            operation: Operation::Create,
            collection: LIKE_COLLECTION.to_string(),
            rkey: rkey.to_string(),
            record: Some(serde_json::json!({"subject": {"uri": subject}})),
            cid: None,
        }
    }

    fn delete_commit(rkey: &str) -> Commit {
        Commit {
            rev: None,
            operation: Operation::Delete,
            collection: LIKE_COLLECTION.to_string(),
            rkey: rkey.to_string(),
            record: None,
            cid: None,
        }
    }

    #[tokio::test]
    async fn like_unlike_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());

        agg.handle_commit(RefKind::Like, "did:a", &create_commit("x1", POST))
            .unwrap();
        agg.handle_commit(RefKind::Like, "did:b", &create_commit("x2", POST))
            .unwrap();
        agg.handle_commit(RefKind::Like, "did:a", &delete_commit("x1"))
            .unwrap();

        let stats = agg.tally.get(POST).unwrap();
        assert_eq!(stats.likes, 1);
        assert_eq!(stats.reposts, 0);
        assert!(!agg.active_likes.contains("did:a/x1"));
        assert!(agg.active_likes.contains("did:b/x2"));

        let row = agg.kv().get_json(&format!("post:{POST}")).unwrap().unwrap();
        assert_eq!(row["likes"], serde_json::json!(1));
        assert!(agg.kv().get_raw("like:did:a/x1").unwrap().is_none());
        assert!(agg.kv().get_raw("like:did:b/x2").unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_without_create_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());

        agg.handle_commit(RefKind::Like, "did:c", &delete_commit("z"))
            .unwrap();
        assert!(agg.tally.is_empty());
        assert!(agg.kv().get_raw("like:did:c/z").unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_resolves_through_store_after_cache_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());

        agg.handle_commit(RefKind::Like, "did:a", &create_commit("x1", POST))
            .unwrap();
        // Simulate LRU spill: the durable row stays behind.
        assert!(agg.active_likes.remove("did:a/x1").is_some());
        assert!(agg.kv().get_raw("like:did:a/x1").unwrap().is_some());

        agg.handle_commit(RefKind::Like, "did:a", &delete_commit("x1"))
            .unwrap();
        // Sole like removed: the post and its id mappings die with it.
        assert!(agg.tally.is_empty());
        assert!(agg.kv().get_raw("like:did:a/x1").unwrap().is_none());
        assert!(agg.kv().get_raw(&format!("post:{POST}")).unwrap().is_none());
        assert!(agg
            .kv()
            .get_raw(&format!("postid:{POST}"))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn legacy_uri_ref_row_resolves_on_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());

        agg.handle_commit(RefKind::Like, "did:a", &create_commit("x1", POST))
            .unwrap();
        agg.handle_commit(RefKind::Like, "did:z", &create_commit("k", POST))
            .unwrap();
        // Rewrite did:z's row to the legacy string shape and drop it from the
        // cache so the delete has to go through the store.
        agg.kv().put_json("like:did:z/k", &POST).unwrap();
        agg.active_likes.remove("did:z/k");

        agg.handle_commit(RefKind::Like, "did:z", &delete_commit("k"))
            .unwrap();
        assert_eq!(agg.tally.get(POST).unwrap().likes, 1);
        assert!(agg.kv().get_raw("like:did:z/k").unwrap().is_none());
    }

    #[tokio::test]
    async fn update_commits_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());
        let commit = Commit {
            rev: None,
            operation: Operation::Update,
            collection: LIKE_COLLECTION.to_string(),
            rkey: "x1".to_string(),
            record: Some(serde_json::json!({"subject": {"uri": POST}})),
            cid: None,
        };
        agg.handle_commit(RefKind::Like, "did:a", &commit).unwrap();
        assert!(agg.tally.is_empty());
    }

    #[tokio::test]
    async fn create_without_subject_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());
        let commit = Commit {
            rev: None,
            operation: Operation::Create,
            collection: LIKE_COLLECTION.to_string(),
            rkey: "x1".to_string(),
            record: Some(serde_json::json!({"createdAt": "2026-01-01T00:00:00Z"})),
            cid: None,
        };
        agg.handle_commit(RefKind::Like, "did:a", &commit).unwrap();
        assert!(agg.tally.is_empty());
        assert!(agg.ids.is_empty());
    }

    #[tokio::test]
    async fn repost_counts_separately() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_agg(dir.path());
        agg.handle_commit(RefKind::Like, "did:a", &create_commit("x1", POST))
            .unwrap();
        agg.handle_commit(RefKind::Repost, "did:a", &create_commit("y1", POST))
            .unwrap();
        let stats = agg.tally.get(POST).unwrap();
        assert_eq!((stats.likes, stats.reposts), (1, 1));
        assert!(agg.active_reposts.contains("did:a/y1"));
        assert!(agg.kv().get_raw("repost:did:a/y1").unwrap().is_some());
    }
}
