/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::tally::{PostStats, TallyTable};
use std::cmp::Ordering;

pub const REPOST_WEIGHT: u64 = 2;
const MS_PER_HOUR: f64 = 3_600_000.0;

pub fn score(stats: &PostStats) -> u64 {
    stats.likes + REPOST_WEIGHT * stats.reposts
}

/// Exponentially decayed score. Zero-score posts stay at zero; a non-finite
/// decay factor falls back to the raw score.
pub fn hotness(stats: &PostStats, now: i64, half_life_hours: f64) -> f64 {
    let s = score(stats) as f64;
    if s <= 0.0 {
        return 0.0;
    }
    let age_hours = (now - stats.last_updated).max(0) as f64 / MS_PER_HOUR;
    let decay = (-age_hours / half_life_hours).exp();
    if !decay.is_finite() {
        return s;
    }
    s * decay
}

#[derive(Debug, Clone)]
pub struct RankedPost {
    pub uri: String,
    pub stats: PostStats,
    pub score: u64,
    pub hotness: f64,
}

/// Top-N by `(-hotness, -score, -last_updated)`, with URI order as the final
/// deterministic tiebreaker. N is tiny, so a full sort is fine.
pub fn top_posts(tally: &TallyTable, now: i64, half_life_hours: f64, n: usize) -> Vec<RankedPost> {
    let mut ranked: Vec<RankedPost> = tally
        .iter()
        .map(|(uri, stats)| RankedPost {
            uri: uri.clone(),
            stats: stats.clone(),
            score: score(stats),
            hotness: hotness(stats, now, half_life_hours),
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.hotness
            .partial_cmp(&a.hotness)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.score.cmp(&a.score))
            .then_with(|| b.stats.last_updated.cmp(&a.stats.last_updated))
            .then_with(|| a.uri.cmp(&b.uri))
    });
    ranked.truncate(n);
    ranked
}
