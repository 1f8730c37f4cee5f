/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::aggregator::{self, Aggregator, RefKind};
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

pub const LIKE_COLLECTION: &str = "app.bsky.feed.like";
pub const REPOST_COLLECTION: &str = "app.bsky.feed.repost";

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One Jetstream frame, keyed by `kind`. Frames with an unknown kind fail to
/// decode and are dropped like any other malformed frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JetstreamEvent {
    Commit(CommitEvent),
    Identity(IgnoredEvent),
    Account(IgnoredEvent),
}

#[derive(Debug, Deserialize)]
pub struct CommitEvent {
    pub did: String,
    #[serde(default)]
    pub time_us: Option<u64>,
    #[serde(default)]
    pub commit: Option<Commit>,
}

#[derive(Debug, Deserialize)]
pub struct IgnoredEvent {}

#[derive(Debug, Deserialize)]
pub struct Commit {
    #[serde(default)]
    pub rev: Option<String>,
    pub operation: Operation,
    pub collection: String,
    pub rkey: String,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
    #[serde(default)]
    pub cid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Deserialize)]
struct RefRecord {
    subject: RefSubject,
}

#[derive(Debug, Deserialize)]
struct RefSubject {
    uri: String,
}

/// `record.subject.uri` of a like/repost record, or None for anything that
/// does not have that shape.
pub fn subject_uri(record: &serde_json::Value) -> Option<String> {
    serde_json::from_value::<RefRecord>(record.clone())
        .ok()
        .map(|r| r.subject.uri)
}

/// Consume loop: connect, drain frames in arrival order, reconnect after a
/// fixed delay until the aggregator is shutting down. Never returns an error
/// to the caller; a dead connection is an operational event, not a crash.
pub async fn run(state: Arc<Mutex<Aggregator>>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() || state.lock().await.is_shutting_down() {
            break;
        }
        if let Err(e) = connect_once(&state, &mut shutdown).await {
            warn!("jetstream connection error: {e:#}");
        }
        if *shutdown.borrow() || state.lock().await.is_shutting_down() {
            break;
        }
        info!("reconnecting in {}s", RECONNECT_DELAY.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown.changed() => {}
        }
    }
    info!("ingestor stopped");
}

async fn connect_once(
    state: &Arc<Mutex<Aggregator>>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let url = { state.lock().await.config().jetstream_url.clone() };
    info!(%url, "connecting to jetstream");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();
    info!("jetstream connected");
    aggregator::on_connected(state, shutdown.clone()).await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(msg) = msg else { break };
                let msg = msg?;
                match msg {
                    tungstenite::Message::Text(text) => {
                        handle_frame(state, &text).await;
                    }
                    tungstenite::Message::Ping(p) => {
                        // Keep the feed healthy across proxies.
                        let _ = ws_tx.send(tungstenite::Message::Pong(p)).await;
                    }
                    tungstenite::Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

/// Parse and dispatch one frame. Errors never escape: a bad frame is dropped,
/// a failed handler is logged and the stream keeps flowing.
async fn handle_frame(state: &Arc<Mutex<Aggregator>>, text: &str) {
    let event: JetstreamEvent = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("dropping undecodable frame: {e}");
            return;
        }
    };
    let JetstreamEvent::Commit(ev) = event else {
        return;
    };
    let Some(commit) = ev.commit else {
        return;
    };
    let kind = match commit.collection.as_str() {
        LIKE_COLLECTION => RefKind::Like,
        REPOST_COLLECTION => RefKind::Repost,
        _ => return,
    };
    let mut agg = state.lock().await;
    if let Err(e) = agg.handle_commit(kind, &ev.did, &commit) {
        warn!("{} handler error: {e:#}", kind.label());
    }
}
