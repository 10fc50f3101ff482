//! In-flight write coalescing.
//!
//! While a put, retrieve or multipart completion is computing a hash and
//! has not yet committed its name mapping, readers of that (identity, name)
//! must block rather than observe a missing or stale mapping. The registry
//! holds one closed-on-release broadcast signal per in-flight key; the
//! mutex guards only the map itself and is never held across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

type Key = (String, String);

struct Entry {
    /// Distinguishes successive writes to the same key, so a finished
    /// guard never evicts its successor's registration.
    epoch: u64,
    rx: watch::Receiver<()>,
}

/// Registry of in-flight writes keyed by (identity, name).
#[derive(Default)]
pub struct WriteCoalescer {
    inner: Arc<Mutex<HashMap<Key, Entry>>>,
    next_epoch: AtomicU64,
}

impl WriteCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a write on (identity, name).
    ///
    /// The returned guard releases all blocked readers when dropped; since
    /// drop runs on every exit path, release is a guarantee rather than
    /// best-effort. Starting a second write on the same key supersedes the
    /// first registration, mirroring the upsert semantics of the mapping
    /// it protects.
    pub fn begin_write(&self, identity: &str, name: &str) -> WriteGuard {
        let (tx, rx) = watch::channel(());
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let key = (identity.to_string(), name.to_string());
        {
            let mut map = self.inner.lock().expect("coalescer registry poisoned");
            map.insert(key.clone(), Entry { epoch, rx });
        }
        WriteGuard {
            registry: Arc::clone(&self.inner),
            key,
            epoch,
            _tx: tx,
        }
    }

    /// Block until no write is in flight for (identity, name).
    ///
    /// Loops, since a new write can begin between a release and the
    /// re-check. Returns whether any waiting happened at all; callers
    /// surface that for diagnostics, correctness does not depend on it.
    pub async fn await_if_writing(&self, identity: &str, name: &str) -> bool {
        let key = (identity.to_string(), name.to_string());
        let mut waited = false;
        loop {
            let rx = {
                let map = self.inner.lock().expect("coalescer registry poisoned");
                map.get(&key).map(|entry| entry.rx.clone())
            };
            match rx {
                None => return waited,
                Some(mut rx) => {
                    waited = true;
                    // Resolves with Err once the writer's sender drops;
                    // there is deliberately no timeout.
                    let _ = rx.changed().await;
                }
            }
        }
    }

    /// Whether a write is currently registered for (identity, name).
    pub fn is_writing(&self, identity: &str, name: &str) -> bool {
        let map = self.inner.lock().expect("coalescer registry poisoned");
        map.contains_key(&(identity.to_string(), name.to_string()))
    }
}

/// RAII registration of one in-flight write.
pub struct WriteGuard {
    registry: Arc<Mutex<HashMap<Key, Entry>>>,
    key: Key,
    epoch: u64,
    _tx: watch::Sender<()>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let mut map = self.registry.lock().expect("coalescer registry poisoned");
        if let Some(entry) = map.get(&self.key) {
            if entry.epoch == self.epoch {
                map.remove(&self.key);
            }
        }
        // The sender drops with the guard, closing the channel and waking
        // every receiver.
    }
}
