/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::aggregator::Aggregator;
use crate::batch::PRUNE_BATCH_OPS;
use crate::now_ms;
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

const COMPACTION_DELAY: Duration = Duration::from_secs(180);

#[derive(Debug, Default)]
pub struct PruneOutcome {
    pub stale_removed: usize,
    pub overflow_removed: usize,
    pub refs_purged: usize,
}

impl PruneOutcome {
    pub fn removed_posts(&self) -> usize {
        self.stale_removed + self.overflow_removed
    }
}

pub fn start_worker(state: Arc<Mutex<Aggregator>>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let period = {
            let agg = state.lock().await;
            agg.config().prune_interval()
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
            let mut agg = state.lock().await;
            match run_once(&mut agg) {
                Ok(outcome) if outcome.removed_posts() > 0 => {
                    info!(
                        stale = outcome.stale_removed,
                        overflow = outcome.overflow_removed,
                        refs = outcome.refs_purged,
                        "prune removed posts"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("prune error: {e:#}"),
            }
        }
    });
}

/// Retention + capacity sweep, then the cascade that keeps refs honest:
/// every removed post id is scrubbed from both caches and from every
/// `like:`/`repost:` row, so no later delete can decrement a stale counter.
pub fn run_once(agg: &mut Aggregator) -> Result<PruneOutcome> {
    agg.batcher.begin(PRUNE_BATCH_OPS);
    let result = prune_inner(agg);
    let end = agg.batcher.end();
    let outcome = result?;
    end?;

    if outcome.removed_posts() > 0 {
        agg.schedule_compaction(COMPACTION_DELAY);
    }
    Ok(outcome)
}

fn prune_inner(agg: &mut Aggregator) -> Result<PruneOutcome> {
    let now = now_ms();
    let retention = agg.config().retention_ms();
    let max_tracked = agg.config().max_tracked_posts;
    let mut outcome = PruneOutcome::default();

    // Retention pass.
    let mut doomed: Vec<(String, u64)> = agg
        .tally
        .iter()
        .filter(|(_, stats)| now - stats.last_updated > retention)
        .map(|(uri, stats)| (uri.clone(), stats.id))
        .collect();
    outcome.stale_removed = doomed.len();

    // Capacity pass over whatever survives, oldest first.
    let survivors = agg.tally.len() - doomed.len();
    if survivors > max_tracked {
        let doomed_uris: HashSet<&String> = doomed.iter().map(|(uri, _)| uri).collect();
        let mut remaining: Vec<(String, i64, u64)> = agg
            .tally
            .iter()
            .filter(|(uri, _)| !doomed_uris.contains(uri))
            .map(|(uri, stats)| (uri.clone(), stats.last_updated, stats.id))
            .collect();
        remaining.sort_by_key(|(_, last_updated, _)| *last_updated);
        let excess = survivors - max_tracked;
        outcome.overflow_removed = excess;
        doomed.extend(
            remaining
                .into_iter()
                .take(excess)
                .map(|(uri, _, id)| (uri, id)),
        );
    }

    if doomed.is_empty() {
        return Ok(outcome);
    }

    let mut removed_ids: HashSet<u64> = HashSet::with_capacity(doomed.len());
    let mut removed_uris: HashSet<String> = HashSet::with_capacity(doomed.len());
    for (uri, id) in &doomed {
        agg.tally.remove(uri);
        agg.ids.remove(*id, &mut agg.batcher)?;
        agg.batcher.del(&format!("post:{uri}"))?;
        removed_ids.insert(*id);
        removed_uris.insert(uri.clone());
    }

    // Cascade through the in-memory caches.
    let mut purged_rows: HashSet<String> = HashSet::new();
    for key in agg.active_likes.purge_ids(&removed_ids) {
        let row_key = format!("like:{key}");
        agg.batcher.del(&row_key)?;
        purged_rows.insert(row_key);
        outcome.refs_purged += 1;
    }
    for key in agg.active_reposts.purge_ids(&removed_ids) {
        let row_key = format!("repost:{key}");
        agg.batcher.del(&row_key)?;
        purged_rows.insert(row_key);
        outcome.refs_purged += 1;
    }

    // And through the store, catching refs that were evicted from the caches
    // earlier. Legacy rows still hold the subject URI.
    let kv = agg.kv().clone();
    for prefix in ["like:", "repost:"] {
        for (key, value) in kv.scan_prefix(prefix) {
            if purged_rows.contains(&key) {
                continue;
            }
            let dead = match value {
                Ok(serde_json::Value::Number(n)) => {
                    n.as_u64().is_some_and(|id| removed_ids.contains(&id))
                }
                Ok(serde_json::Value::String(uri)) => removed_uris.contains(&uri),
                _ => false,
            };
            if dead {
                agg.batcher.del(&key)?;
                outcome.refs_purged += 1;
            }
        }
    }

    Ok(outcome)
}
