/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use skypulse_core::aggregator::{self, Aggregator};
use skypulse_core::config::{self, Loaded};
use skypulse_core::kv::KvStore;
use skypulse_core::snapshot::SnapshotReason;
use skypulse_core::{ingest, recovery};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let cfg = match config::load()? {
        Loaded::Run(cfg) => cfg,
        Loaded::Help => {
            println!("{}", config::usage());
            return Ok(());
        }
    };

    info!("skypulse aggregator starting");
    info!(
        state = %cfg.db_path.display(),
        snapshots = %cfg.snapshot_dir.display(),
        window_hours = cfg.window_hours,
        half_life_hours = cfg.half_life_hours,
        top = cfg.top_count,
        "configuration"
    );

    let kv = Arc::new(KvStore::open(&cfg.db_path).context("open state store")?);
    let mut agg = Aggregator::new(cfg, kv);
    recovery::run(&mut agg).context("state recovery")?;
    agg.enqueue_snapshot(SnapshotReason::Initial);

    let state = Arc::new(Mutex::new(agg));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ingest_task = tokio::spawn(ingest::run(state.clone(), shutdown_rx));

    wait_for_signal().await;
    info!("shutdown requested");

    {
        state.lock().await.set_shutting_down();
    }
    let _ = shutdown_tx.send(true);
    if let Err(e) = ingest_task.await {
        warn!("ingest task ended abnormally: {e}");
    }

    aggregator::finalize(&state).await?;
    info!("clean shutdown");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
