/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::aggregator::Aggregator;
use crate::{now_ms, rank};
use std::sync::Arc;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::{watch, Mutex};
use tracing::info;

pub fn start_worker(state: Arc<Mutex<Aggregator>>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let period = {
            let agg = state.lock().await;
            std::time::Duration::from_millis(agg.config().report_interval_ms.max(1_000))
        };
        let mut sys = System::new();
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
            report_once(&mut agg, &mut sys);
        }
    });
}

/// One resource + leaderboard report. CPU% is the delta since the previous
/// refresh, so the first report after startup reads zero.
pub fn report_once(agg: &mut Aggregator, sys: &mut System) {
    let (rss_bytes, cpu_percent) = process_stats(sys);
    sys.refresh_memory();
    info!(
        rss_mb = rss_bytes / (1024 * 1024),
        cpu_percent = cpu_percent as f64,
        sys_used_mb = sys.used_memory() / (1024 * 1024),
        posts = agg.tally.len(),
        active_likes = agg.active_likes.len(),
        active_likes_cap = agg.active_likes.capacity(),
        active_reposts = agg.active_reposts.len(),
        active_reposts_cap = agg.active_reposts.capacity(),
        "aggregator status"
    );

    let now = now_ms();
    let cfg = agg.config();
    let top = rank::top_posts(&agg.tally, now, cfg.half_life_hours, cfg.top_count);
    if top.is_empty() {
        info!("no data yet");
        return;
    }
    for (i, p) in top.iter().enumerate() {
        let rank = i + 1;
        let url = agg.ids.url_for(p.stats.id).unwrap_or_else(|| "-".to_string());
        let uri = &p.uri;
        let likes = p.stats.likes;
        let reposts = p.stats.reposts;
        let score = p.score;
        let hotness = p.hotness;
        let age_s = (now - p.stats.last_updated).max(0) / 1000;
        info!(
            "#{rank} {url} ({uri}) - {likes} likes, {reposts} reposts, score {score}, hotness {hotness:.3}, updated {age_s}s ago"
        );
    }
}

fn process_stats(sys: &mut System) -> (u64, f32) {
    if let Ok(pid) = sysinfo::get_current_pid() {
        let _ = sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        if let Some(proc) = sys.process(pid) {
            return (proc.memory(), proc.cpu_usage());
        }
    }
    (0, 0.0)
}
