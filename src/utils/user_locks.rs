use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-user async mutexes. Holding the guard serializes every ledger
/// read-modify-write for that user inside this process.
#[derive(Clone, Default)]
pub struct UserLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .inner
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drops entries nobody is holding or waiting on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before.saturating_sub(self.inner.len())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
