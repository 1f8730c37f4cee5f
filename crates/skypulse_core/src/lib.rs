/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod active_refs;
pub mod aggregator;
pub mod batch;
pub mod config;
pub mod ingest;
pub mod kv;
pub mod post_ids;
pub mod prune;
pub mod rank;
pub mod recovery;
pub mod report;
pub mod snapshot;
pub mod tally;

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
