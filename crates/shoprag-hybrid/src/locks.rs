use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use shoprag_core::error::{Error, Result};

/// One async mutex per key, created on demand. Idle entries are pruned
/// whenever another key is locked.
#[derive(Debug)]
pub(crate) struct KeyedLocks<K> {
    inner: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    pub(crate) async fn lock(&self, key: &K) -> Result<OwnedMutexGuard<()>> {
        let mutex = {
            let mut map = self
                .inner
                .lock()
                .map_err(|_| Error::IndexCorruption("document lock table poisoned".into()))?;
            map.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(map.entry(key.clone()).or_default())
        };
        Ok(mutex.lock_owned().await)
    }
}
