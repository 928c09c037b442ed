// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent key-value medium shared by every execution context.
//!
//! This is the only shared mutable state in the system. Writers use a single
//! "latest wins" write per key with no read-modify-write cycle; the cross-tab
//! protocol is designed to tolerate overwritten intermediate messages as long
//! as terminal ones (logout) are eventually observed.
//!
//! Two implementations:
//!
//! - [`MemoryStore`]: in-process, used by tests and by hosts that simulate
//!   several tabs inside one process.
//! - [`FileStore`]: one JSON value per key under a directory, exclusive
//!   file lock around the write plus rename, so the `vigil-agent` process and
//!   foreground contexts never observe torn values.

use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::security::locks::{resilient_read, resilient_write};

/// Store key for the persisted session snapshot.
pub const KEY_SESSION_SNAPSHOT: &str = "vigil:session";

/// Store key for the lockout record. Survives page reloads.
pub const KEY_LOCKOUT: &str = "vigil:lockout";

/// Store key for the single cross-tab broadcast slot.
pub const KEY_BROADCAST: &str = "vigil:broadcast";

/// Shared persisted medium. Implementations must be cheap to call from timer
/// callbacks; anything slow belongs behind [`with_retry`].
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> EngineResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> EngineResult<()>;
    fn remove(&self, key: &str) -> EngineResult<()>;
}

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Base delay for the first retry.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Ceiling for the backoff delay.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

/// Run a store operation, retrying transient failures with capped exponential
/// backoff. Non-transient errors propagate immediately.
///
/// Transient failures are never escalated into a logout by themselves; the
/// caller decides what repeated exhaustion means.
pub async fn with_retry<T, F>(op: &'static str, attempts: u32, mut f: F) -> EngineResult<T>
where
    F: FnMut() -> EngineResult<T>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut last_attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && last_attempt < attempts => {
                tracing::warn!(
                    "IO_RETRY | op={op} attempt={last_attempt} delay_ms={} error={err}",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
                last_attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// In-process store. Multiple simulated tabs share one instance behind an
/// `Arc`, which makes it the natural test double for the browser's storage.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently present. Test diagnostics only.
    pub fn len(&self) -> usize {
        resilient_read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> EngineResult<Option<String>> {
        Ok(resilient_read(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        resilient_write(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> EngineResult<()> {
        resilient_write(&self.entries).remove(key);
        Ok(())
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// Directory-backed store used by the standalone agent. One file per key,
/// writes go through a temp file and rename while holding an exclusive lock
/// on a directory-wide lockfile.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| EngineError::transient("store.open", e))?;
        Ok(Self { dir })
    }

    /// Default location under the platform data directory.
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("vigil")
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys use ':' as a namespace separator; keep filenames portable.
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    fn lockfile(&self) -> EngineResult<fs::File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(".lock"))
            .map_err(|e| EngineError::transient("store.lock", e))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> EngineResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::transient("store.get", e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let lock = self.lockfile()?;
        lock.lock_exclusive()
            .map_err(|e| EngineError::transient("store.lock", e))?;
        let result = fs::write(&tmp, value)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|e| EngineError::transient("store.set", e));
        let _ = lock.unlock();
        result
    }

    fn remove(&self, key: &str) -> EngineResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::transient("store.remove", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "v1").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v1"));
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_memory_store_shared_between_contexts() {
        let store = Arc::new(MemoryStore::new());
        let writer = Arc::clone(&store);
        writer.set(KEY_BROADCAST, "logout").unwrap();
        assert_eq!(store.get(KEY_BROADCAST).unwrap().as_deref(), Some("logout"));
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.set(KEY_SESSION_SNAPSHOT, r#"{"a":1}"#).unwrap();
        assert_eq!(
            store.get(KEY_SESSION_SNAPSHOT).unwrap().as_deref(),
            Some(r#"{"a":1}"#)
        );
        store.remove(KEY_SESSION_SNAPSHOT).unwrap();
        assert_eq!(store.get(KEY_SESSION_SNAPSHOT).unwrap(), None);
        // removing a missing key is not an error
        store.remove(KEY_SESSION_SNAPSHOT).unwrap();
    }

    #[test]
    fn test_file_store_latest_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        for i in 0..10 {
            store.set(KEY_BROADCAST, &format!("msg-{i}")).unwrap();
        }
        assert_eq!(store.get(KEY_BROADCAST).unwrap().as_deref(), Some("msg-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_after_transient_failures() {
        let mut calls = 0;
        let result = with_retry("store.set", 5, || {
            calls += 1;
            if calls < 3 {
                Err(EngineError::transient(
                    "store.set",
                    std::io::Error::new(std::io::ErrorKind::Other, "flaky"),
                ))
            } else {
                Ok(calls)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_gives_up_after_attempts() {
        let result: EngineResult<()> = with_retry("store.set", 3, || {
            Err(EngineError::transient(
                "store.set",
                std::io::Error::new(std::io::ErrorKind::Other, "down"),
            ))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_does_not_retry_fatal_errors() {
        let mut calls = 0;
        let result: EngineResult<()> = with_retry("store.set", 5, || {
            calls += 1;
            Err(EngineError::config("bad"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
