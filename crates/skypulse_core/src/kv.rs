/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYPULSE Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Ordered key-value store over RocksDB. Keys are UTF-8, values JSON.
pub struct KvStore {
    db: DB,
    path: PathBuf,
}

impl KvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, &path)
            .with_context(|| format!("open state store: {}", path.display()))?;
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key.as_bytes())
            .with_context(|| format!("kv get {key}"))
    }

    /// Not-found is `Ok(None)`; a row that exists but is not JSON is an error.
    pub fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let Some(raw) = self.get_raw(key)? else {
            return Ok(None);
        };
        let value =
            serde_json::from_slice(&raw).with_context(|| format!("kv decode {key}"))?;
        Ok(Some(value))
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value).with_context(|| format!("kv encode {key}"))?;
        self.put_raw(key, &raw)
    }

    pub fn put_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .put(key.as_bytes(), value)
            .with_context(|| format!("kv put {key}"))
    }

    pub fn del(&self, key: &str) -> Result<()> {
        self.db
            .delete(key.as_bytes())
            .with_context(|| format!("kv del {key}"))
    }

    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch).context("kv batch write")
    }

    /// Ordered walk of all rows whose key starts with `prefix`. Values are
    /// decoded as JSON; a row that does not decode is yielded with the error
    /// so the caller can repair or delete it. Keys that are not valid UTF-8
    /// cannot belong to our keyspace and are deleted on the spot.
    /// Engine-level iteration errors end the walk.
    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (String, Result<serde_json::Value>)> + 'a {
        self.db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
            .take_while(move |item| match item {
                Ok((k, _)) => k.starts_with(prefix.as_bytes()),
                Err(_) => true,
            })
            .filter_map(move |item| {
                let (k, v) = match item {
                    Ok(kv) => kv,
                    Err(e) => {
                        warn!("kv scan error under {prefix}: {e}");
                        return None;
                    }
                };
                let key = match String::from_utf8(k.to_vec()) {
                    Ok(key) => key,
                    Err(_) => {
                        warn!("kv dropping non-utf8 key under {prefix}");
                        let _ = self.db.delete(&k);
                        return None;
                    }
                };
                let value =
                    serde_json::from_slice(&v).with_context(|| format!("kv decode {key}"));
                Some((key, value))
            })
    }

    pub fn compact_all(&self) {
        self.db.compact_range::<&[u8], &[u8]>(None, None);
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().context("kv flush")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, KvStore) {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().join("db")).unwrap();
        (dir, kv)
    }

    #[test]
    fn roundtrip_and_not_found() {
        let (_dir, kv) = open_temp();
        assert!(kv.get_json("meta:nextPostId").unwrap().is_none());
        kv.put_json("meta:nextPostId", &7u64).unwrap();
        assert_eq!(
            kv.get_json("meta:nextPostId").unwrap(),
            Some(serde_json::json!(7))
        );
        kv.del("meta:nextPostId").unwrap();
        assert!(kv.get_raw("meta:nextPostId").unwrap().is_none());
    }

    #[test]
    fn prefix_scan_is_ordered_and_bounded() {
        let (_dir, kv) = open_temp();
        kv.put_json("like:did:a/1", &10u64).unwrap();
        kv.put_json("like:did:b/2", &11u64).unwrap();
        kv.put_json("post:at://x", &serde_json::json!({"likes": 1}))
            .unwrap();
        kv.put_json("repost:did:a/1", &12u64).unwrap();

        let rows: Vec<(String, u64)> = kv
            .scan_prefix("like:")
            .map(|(k, v)| (k, v.unwrap().as_u64().unwrap()))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("like:did:a/1".to_string(), 10),
                ("like:did:b/2".to_string(), 11)
            ]
        );

        let posts: Vec<String> = kv.scan_prefix("post:").map(|(k, _)| k).collect();
        assert_eq!(posts, vec!["post:at://x"]);
    }

    #[test]
    fn malformed_values_are_yielded_as_errors() {
        let (_dir, kv) = open_temp();
        kv.put_json("like:did:a/1", &10u64).unwrap();
        kv.put_raw("like:did:b/2", b"not json").unwrap();

        let rows: Vec<(String, Result<serde_json::Value>)> =
            kv.scan_prefix("like:").collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].1.is_ok());
        assert_eq!(rows[1].0, "like:did:b/2");
        assert!(rows[1].1.is_err());
    }

    #[test]
    fn atomic_batch_applies_all_ops() {
        let (_dir, kv) = open_temp();
        kv.put_json("a", &1u64).unwrap();
        let mut batch = WriteBatch::default();
        batch.put(b"b", serde_json::to_vec(&2u64).unwrap());
        batch.delete(b"a");
        kv.write(batch).unwrap();
        assert!(kv.get_raw("a").unwrap().is_none());
        assert_eq!(kv.get_json("b").unwrap(), Some(serde_json::json!(2)));
    }
}
