use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use futures_util::future::join_all;
use tokio::{sync::Mutex, time::Instant};

use crate::platform::ProcessControl;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    alive: bool,
    observed_at: Instant,
}

/// Answers "is this pid still running" with a short-lived cache in front of the OS.
///
/// The cache is only an optimization: entries older than the TTL are ignored and
/// overwritten by the next probe, never trusted.
pub struct LivenessChecker {
    control: Arc<dyn ProcessControl>,
    ttl: Duration,
    cache: Mutex<HashMap<u32, CacheEntry>>,
}

impl LivenessChecker {
    pub fn new(control: Arc<dyn ProcessControl>, ttl: Duration) -> Self {
        Self {
            control,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn control(&self) -> &Arc<dyn ProcessControl> {
        &self.control
    }

    async fn cached(&self, pid: u32) -> Option<bool> {
        let cache = self.cache.lock().await;
        let e = cache.get(&pid)?;
        (e.observed_at.elapsed() < self.ttl).then_some(e.alive)
    }

    pub async fn is_alive(&self, pid: Option<u32>) -> bool {
        let Some(pid) = pid else {
            return false;
        };
        if let Some(alive) = self.cached(pid).await {
            return alive;
        }
        self.probe_fresh(pid).await
    }

    /// Skips the cache, asks the OS, and records the answer.
    pub async fn probe_fresh(&self, pid: u32) -> bool {
        let alive = self.control.is_alive(pid).await;
        self.cache.lock().await.insert(
            pid,
            CacheEntry {
                alive,
                observed_at: Instant::now(),
            },
        );
        alive
    }

    /// All probes are in flight together; the caller waits for the whole batch.
    pub async fn check_many(&self, pids: impl IntoIterator<Item = u32>) -> HashMap<u32, bool> {
        let unique: HashSet<u32> = pids.into_iter().collect();
        join_all(
            unique
                .into_iter()
                .map(|pid| async move { (pid, self.is_alive(Some(pid)).await) }),
        )
        .await
        .into_iter()
        .collect()
    }

    pub async fn probe_many_fresh(&self, pids: impl IntoIterator<Item = u32>) -> HashMap<u32, bool> {
        let unique: HashSet<u32> = pids.into_iter().collect();
        join_all(
            unique
                .into_iter()
                .map(|pid| async move { (pid, self.probe_fresh(pid).await) }),
        )
        .await
        .into_iter()
        .collect()
    }
}
