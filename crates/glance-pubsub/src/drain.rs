// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Drain lock used to let in-flight request sections finish before shutdown.
//!
//! Readers are request handlers; the writer is the shutdown sequence. The
//! lock is write-preferring: once a writer is waiting, new readers queue
//! behind it, so a steady trickle of requests cannot postpone shutdown
//! forever.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// The writer could not acquire the lock before its deadline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("drain lock not acquired within {waited:?} ({readers} readers still active)")]
pub struct LockTimeout {
    /// How long the writer waited.
    pub waited: Duration,
    /// Readers still holding the lock when the deadline passed.
    pub readers: usize,
}

/// Reader/writer lock for graceful shutdown.
///
/// Cloning yields a handle to the same lock.
#[derive(Clone, Debug, Default)]
pub struct DrainLock {
    lock: Arc<RwLock<()>>,
    readers: Arc<AtomicUsize>,
}

impl DrainLock {
    /// Create an unlocked drain lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a request section. Waits while a writer holds or awaits the lock.
    pub async fn read(&self) -> DrainReadGuard {
        let guard = Arc::clone(&self.lock).read_owned().await;
        DrainReadGuard::new(guard, &self.readers)
    }

    /// Enter a request section without waiting; `None` if a writer holds or
    /// awaits the lock.
    pub fn try_read(&self) -> Option<DrainReadGuard> {
        let guard = Arc::clone(&self.lock).try_read_owned().ok()?;
        Some(DrainReadGuard::new(guard, &self.readers))
    }

    /// Acquire the writer side once every reader has left, waiting at most
    /// `timeout`.
    ///
    /// While this call is pending, new readers block. On timeout the pending
    /// acquisition is abandoned and readers are admitted again.
    pub async fn write(&self, timeout: Duration) -> Result<DrainWriteGuard, LockTimeout> {
        match tokio::time::timeout(timeout, Arc::clone(&self.lock).write_owned()).await {
            Ok(guard) => Ok(DrainWriteGuard { _guard: guard }),
            Err(_) => Err(LockTimeout {
                waited: timeout,
                readers: self.readers(),
            }),
        }
    }

    /// Number of request sections currently inside the lock.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }
}

/// Held by a request section; releases on drop.
#[derive(Debug)]
pub struct DrainReadGuard {
    _guard: OwnedRwLockReadGuard<()>,
    readers: Arc<AtomicUsize>,
}

impl DrainReadGuard {
    fn new(guard: OwnedRwLockReadGuard<()>, readers: &Arc<AtomicUsize>) -> Self {
        readers.fetch_add(1, Ordering::SeqCst);
        Self {
            _guard: guard,
            readers: Arc::clone(readers),
        }
    }
}

impl Drop for DrainReadGuard {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held by the shutdown sequence; releases on drop.
#[derive(Debug)]
pub struct DrainWriteGuard {
    _guard: OwnedRwLockWriteGuard<()>,
}
