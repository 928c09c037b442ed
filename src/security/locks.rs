// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poisoning-resilient lock helpers.
//!
//! A panic while holding a lock must not cascade into a denial of service for
//! the session engine: losing the security state or the in-memory store to a
//! poisoned lock would leave every tab unable to enforce timeouts. When a
//! guard comes back poisoned we log a critical event and recover the data
//! anyway; stale state is preferable to no enforcement at all.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "vigil::locks",
                event = "LOCK_POISONED_READ",
                "CRITICAL: RwLock poisoned during read acquisition; recovering. \
                 A thread panicked while holding this lock. Investigate the panic cause."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "vigil::locks",
                event = "LOCK_POISONED_WRITE",
                "CRITICAL: RwLock poisoned during write acquisition; recovering. \
                 A thread panicked while holding this lock. Investigate the panic cause."
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_and_write_normal() {
        let lock = RwLock::new(1);
        {
            let mut guard = resilient_write(&lock);
            *guard = 2;
        }
        assert_eq!(*resilient_read(&lock), 2);
    }

    #[test]
    fn test_recovers_after_poisoning() {
        let lock = Arc::new(RwLock::new(41));
        let poisoner = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let _guard = poisoner.write().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        {
            let mut guard = resilient_write(&lock);
            *guard += 1;
        }
        assert_eq!(*resilient_read(&lock), 42);
    }
}
