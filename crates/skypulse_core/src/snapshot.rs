/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::aggregator::Aggregator;
use crate::rank::RankedPost;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    Initial,
    Connected,
    Interval,
    Final,
}

impl SnapshotReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotReason::Initial => "initial",
            SnapshotReason::Connected => "connected",
            SnapshotReason::Interval => "interval",
            SnapshotReason::Final => "final",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPost {
    pub rank: usize,
    pub uri: String,
    pub url: Option<String>,
    pub post_id: u64,
    pub likes: u64,
    pub reposts: u64,
    pub score: u64,
    pub hotness: f64,
    pub last_updated: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDoc {
    pub generated_at: String,
    pub reason: String,
    pub window_hours: f64,
    pub half_life_hours: f64,
    pub top_count: usize,
    pub posts: Vec<SnapshotPost>,
}

#[derive(Debug)]
pub struct SnapshotJob {
    pub at: DateTime<Utc>,
    pub doc: SnapshotDoc,
}

pub fn build_document(
    at: DateTime<Utc>,
    reason: SnapshotReason,
    window_hours: f64,
    half_life_hours: f64,
    top_count: usize,
    ranked: &[RankedPost],
    url_for: impl FnMut(u64) -> Option<String>,
) -> SnapshotDoc {
    let mut url_for = url_for;
    let posts = ranked
        .iter()
        .enumerate()
        .map(|(i, p)| SnapshotPost {
            rank: i + 1,
            uri: p.uri.clone(),
            url: url_for(p.stats.id),
            post_id: p.stats.id,
            likes: p.stats.likes,
            reposts: p.stats.reposts,
            score: p.score,
            hotness: round6(p.hotness),
            last_updated: p.stats.last_updated,
        })
        .collect();
    SnapshotDoc {
        generated_at: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        reason: reason.as_str().to_string(),
        window_hours,
        half_life_hours,
        top_count,
        posts,
    }
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

/// `<dir>/<YYYY-MM-DD>/<YYYY-MM-DD>T<HH-MM>Z.json`
pub fn snapshot_path(dir: &Path, at: DateTime<Utc>) -> PathBuf {
    let day = at.format("%Y-%m-%d").to_string();
    let name = format!("{}Z.json", at.format("%Y-%m-%dT%H-%M"));
    dir.join(day).join(name)
}

async fn write_snapshot(dir: &Path, job: &SnapshotJob) -> Result<PathBuf> {
    let path = snapshot_path(dir, job.at);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create snapshot dir: {}", parent.display()))?;
    }
    let body =
        serde_json::to_vec_pretty(&job.doc).context("encode snapshot document")?;
    // Write-then-close; a concurrent reader may observe a partial file.
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("write snapshot: {}", path.display()))?;
    Ok(path)
}

/// Single-lane writer: jobs are written strictly one at a time, in enqueue
/// order. Shutdown drops the sender and awaits the worker, draining whatever
/// is still queued.
pub struct SnapshotQueue {
    tx: Option<mpsc::UnboundedSender<SnapshotJob>>,
    worker: Option<JoinHandle<()>>,
}

impl SnapshotQueue {
    pub fn start(dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SnapshotJob>();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match write_snapshot(&dir, &job).await {
                    Ok(path) => {
                        info!(reason = %job.doc.reason, "snapshot written: {}", path.display())
                    }
                    Err(e) => warn!("snapshot write failed: {e:#}"),
                }
            }
        });
        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    pub fn enqueue(&self, job: SnapshotJob) {
        if let Some(tx) = &self.tx {
            if tx.send(job).is_err() {
                warn!("snapshot queue is closed; dropping snapshot");
            }
        }
    }

    pub async fn drain(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

/// Periodic snapshot trigger. One-shot reasons (initial/connected/final) are
/// enqueued directly by the aggregator.
pub fn start_worker(state: Arc<Mutex<Aggregator>>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let period = {
            let agg = state.lock().await;
            std::time::Duration::from_millis(agg.config().snapshot_interval_ms.max(1_000))
        };
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.reset();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            state.lock().await.enqueue_snapshot(SnapshotReason::Interval);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tally::PostStats;
    use chrono::TimeZone;

    #[test]
    fn path_layout_by_day_and_minute() {
        let at = Utc.with_ymd_and_hms(2026, 8, 2, 7, 5, 33).unwrap();
        let path = snapshot_path(Path::new("/snaps"), at);
        assert_eq!(
            path,
            PathBuf::from("/snaps/2026-08-02/2026-08-02T07-05Z.json")
        );
    }

    #[test]
    fn document_shape_and_rounding() {
        let at = Utc.with_ymd_and_hms(2026, 8, 2, 7, 5, 0).unwrap();
        let ranked = vec![RankedPost {
            uri: "at://did:p/app.bsky.feed.post/r1".to_string(),
            stats: PostStats {
                likes: 3,
                reposts: 1,
                last_updated: 42,
                id: 7,
            },
            score: 5,
            hotness: 4.123_456_789,
        }];
        let doc = build_document(at, SnapshotReason::Connected, 24.0, 3.0, 10, &ranked, |_| {
            Some("https://bsky.app/profile/did:p/post/r1".to_string())
        });
        assert_eq!(doc.reason, "connected");
        assert_eq!(doc.top_count, 10);
        assert_eq!(doc.posts.len(), 1);
        let p = &doc.posts[0];
        assert_eq!(p.rank, 1);
        assert_eq!(p.post_id, 7);
        assert_eq!(p.hotness, 4.123_457);

        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("generatedAt").is_some());
        assert!(json.get("windowHours").is_some());
        assert!(json["posts"][0].get("postId").is_some());
        assert!(json["posts"][0].get("lastUpdated").is_some());
    }

    #[tokio::test]
    async fn queue_drains_in_order_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = SnapshotQueue::start(dir.path().to_path_buf());
        for minute in 0..3u32 {
            let at = Utc.with_ymd_and_hms(2026, 8, 2, 7, minute, 0).unwrap();
            queue.enqueue(SnapshotJob {
                at,
                doc: build_document(at, SnapshotReason::Interval, 24.0, 3.0, 10, &[], |_| None),
            });
        }
        queue.drain().await;
        for minute in 0..3u32 {
            let at = Utc.with_ymd_and_hms(2026, 8, 2, 7, minute, 0).unwrap();
            assert!(snapshot_path(dir.path(), at).exists());
        }
    }
}
