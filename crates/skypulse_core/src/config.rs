/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_JETSTREAM_URL: &str = "wss://jetstream2.us-east.bsky.network/subscribe";

#[derive(Debug, Clone)]
pub struct Config {
    pub jetstream_url: String,
    pub db_path: PathBuf,
    pub snapshot_dir: PathBuf,
    pub report_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    pub top_count: usize,
    pub max_tracked_posts: usize,
    pub window_hours: f64,
    pub half_life_hours: f64,
    /// Direct retention override; wins over `window_hours` when set.
    pub stale_ms: Option<u64>,
    pub max_active_likes: usize,
    pub max_active_reposts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jetstream_url: DEFAULT_JETSTREAM_URL.to_string(),
            db_path: PathBuf::from("./data/aggregator-db"),
            snapshot_dir: PathBuf::from("./data/aggregator-snapshots"),
            report_interval_ms: 30_000,
            snapshot_interval_ms: 600_000,
            top_count: 10,
            max_tracked_posts: 100_000,
            window_hours: 24.0,
            half_life_hours: 3.0,
            stale_ms: None,
            max_active_likes: 200_000,
            max_active_reposts: 120_000,
        }
    }
}

impl Config {
    pub fn retention_ms(&self) -> i64 {
        match self.stale_ms {
            Some(ms) => ms as i64,
            None => (self.window_hours.max(0.0) * 3_600_000.0) as i64,
        }
    }

    /// Prune cadence: 5x the report interval, clamped to [15s, retention].
    pub fn prune_interval(&self) -> Duration {
        let retention = self.retention_ms().max(1) as u64;
        let v = self
            .report_interval_ms
            .saturating_mul(5)
            .max(15_000)
            .min(retention);
        Duration::from_millis(v)
    }
}

pub enum Loaded {
    Run(Config),
    Help,
}

pub fn usage() -> String {
    [
        "skypulse_aggregator - like/repost aggregator for the Bluesky Jetstream firehose",
        "",
        "Usage: skypulse_aggregator [options]",
        "",
        "Options:",
        "  --interval-ms N           report period in ms (default 30000)",
        "  --top N                   leaderboard size (default 10)",
        "  --max-posts N             tally hard cap (default 100000)",
        "  --window-hours H          retention window in hours (default 24)",
        "  --half-life-hours H       hotness decay half-life in hours (default 3)",
        "  --snapshot-interval-ms N  snapshot period in ms (default 600000)",
        "  --snapshot-dir PATH       snapshot directory (env SNAPSHOT_DIR)",
        "  --state PATH              state store location (env STATE_FILE)",
        "  --stale-ms N              retention window override in ms",
        "  --max-active-likes N      active like cache capacity (default 200000)",
        "  --max-active-reposts N    active repost cache capacity (default 120000)",
        "  -h, --help                print this help and exit",
    ]
    .join("\n")
}

/// Environment first, then flags; flags win.
pub fn load() -> Result<Loaded> {
    let mut cfg = Config::default();
    apply_env(&mut cfg);
    let args: Vec<String> = std::env::args().skip(1).collect();
    parse_args(cfg, &args)
}

fn apply_env(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SNAPSHOT_DIR") {
        if !v.trim().is_empty() {
            cfg.snapshot_dir = PathBuf::from(v);
        }
    }
    if let Ok(v) = std::env::var("STATE_FILE") {
        if !v.trim().is_empty() {
            cfg.db_path = PathBuf::from(v);
        }
    }
    if let Ok(v) = std::env::var("JETSTREAM_URL") {
        if !v.trim().is_empty() {
            cfg.jetstream_url = v;
        }
    }
}

pub fn parse_args(mut cfg: Config, args: &[String]) -> Result<Loaded> {
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(Loaded::Help),
            "--interval-ms" => cfg.report_interval_ms = parse_num(&mut it, arg)?,
            "--top" => cfg.top_count = parse_num(&mut it, arg)?,
            "--max-posts" => cfg.max_tracked_posts = parse_num(&mut it, arg)?,
            "--window-hours" => cfg.window_hours = parse_num(&mut it, arg)?,
            "--half-life-hours" => cfg.half_life_hours = parse_num(&mut it, arg)?,
            "--snapshot-interval-ms" => cfg.snapshot_interval_ms = parse_num(&mut it, arg)?,
            "--snapshot-dir" => cfg.snapshot_dir = PathBuf::from(next_value(&mut it, arg)?),
            "--state" => cfg.db_path = PathBuf::from(next_value(&mut it, arg)?),
            "--stale-ms" => cfg.stale_ms = Some(parse_num(&mut it, arg)?),
            "--max-active-likes" => cfg.max_active_likes = parse_num(&mut it, arg)?,
            "--max-active-reposts" => cfg.max_active_reposts = parse_num(&mut it, arg)?,
            other => bail!("unknown option: {other} (see --help)"),
        }
    }
    Ok(Loaded::Run(cfg))
}

fn next_value<'a>(it: &mut std::slice::Iter<'a, String>, flag: &str) -> Result<&'a str> {
    it.next()
        .map(|s| s.as_str())
        .with_context(|| format!("{flag} requires a value"))
}

fn parse_num<T: std::str::FromStr>(it: &mut std::slice::Iter<'_, String>, flag: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = next_value(it, flag)?;
    raw.parse::<T>()
        .with_context(|| format!("{flag}: invalid value {raw:?}"))
}
