/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::kv::KvStore;
use anyhow::{Context, Result};
use rocksdb::WriteBatch;
use serde::Serialize;
use std::sync::Arc;

pub const RECOVERY_BATCH_OPS: usize = 5_000;
pub const PRUNE_BATCH_OPS: usize = 2_000;

struct Scope {
    batch: WriteBatch,
    ops: usize,
    limit: usize,
}

/// Coalesces puts/deletes into atomic RocksDB batches. Recovery and the
/// pruner open a scope so their repairs commit in bounded atomic chunks;
/// outside any scope each operation is its own write. Scopes nest: opening a
/// second scope shadows the first until it ends, at which point the previous
/// scope is current again.
pub struct WriteBatcher {
    kv: Arc<KvStore>,
    scopes: Vec<Scope>,
}

impl WriteBatcher {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self {
            kv,
            scopes: Vec::new(),
        }
    }

    pub fn begin(&mut self, limit: usize) {
        self.scopes.push(Scope {
            batch: WriteBatch::default(),
            ops: 0,
            limit: limit.max(1),
        });
    }

    /// Flushes and closes the innermost scope.
    pub fn end(&mut self) -> Result<()> {
        let Some(scope) = self.scopes.pop() else {
            return Ok(());
        };
        if scope.ops > 0 {
            self.kv.write(scope.batch)?;
        }
        Ok(())
    }

    pub fn in_scope(&self) -> bool {
        !self.scopes.is_empty()
    }

    pub fn put_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        if let Some(scope) = self.scopes.last_mut() {
            let raw = serde_json::to_vec(value).with_context(|| format!("kv encode {key}"))?;
            scope.batch.put(key.as_bytes(), raw);
            scope.ops += 1;
            self.flush_if_full()?;
            return Ok(());
        }
        self.kv.put_json(key, value)
    }

    pub fn del(&mut self, key: &str) -> Result<()> {
        if let Some(scope) = self.scopes.last_mut() {
            scope.batch.delete(key.as_bytes());
            scope.ops += 1;
            self.flush_if_full()?;
            return Ok(());
        }
        self.kv.del(key)
    }

    fn flush_if_full(&mut self) -> Result<()> {
        let Some(scope) = self.scopes.last_mut() else {
            return Ok(());
        };
        if scope.ops < scope.limit {
            return Ok(());
        }
        let full = std::mem::take(&mut scope.batch);
        scope.ops = 0;
        self.kv.write(full)
    }
}
