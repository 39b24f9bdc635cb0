use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::Clock;

/// Bounded retries when a concurrent caller wins the compare-and-swap.
const CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_reset_at: OffsetDateTime,
}

/// Backing store for rate-limit windows.
///
/// The in-process [`MemoryRateLimitStore`] is scoped to one server instance;
/// a store shared between instances only has to provide the same three
/// primitives.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get(
        &self,
        key: &str,
    ) -> Option<RateLimitEntry>;

    async fn set(
        &self,
        key: &str,
        entry: RateLimitEntry,
    );

    /// Writes `new` only if the stored value still equals `expected`
    /// (`None` meaning absent).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<RateLimitEntry>,
        new: RateLimitEntry,
    ) -> bool;

    /// Drops every entry whose window ended at or before `now`.
    async fn remove_expired(
        &self,
        now: OffsetDateTime,
    ) -> usize;
}

#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    entries: DashMap<String, RateLimitEntry>,
}

impl MemoryRateLimitStore {
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn get(
        &self,
        key: &str,
    ) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    async fn set(
        &self,
        key: &str,
        entry: RateLimitEntry,
    ) {
        self.entries.insert(key.to_string(), entry);
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<RateLimitEntry>,
        new: RateLimitEntry,
    ) -> bool {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected == Some(*occupied.get()) {
                    occupied.insert(new);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(new);
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn remove_expired(
        &self,
        now: OffsetDateTime,
    ) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.window_reset_at > now);
        before.saturating_sub(self.entries.len())
    }
}

/// Fixed-window request counter keyed by caller identity.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        limit: u32,
        window: Duration,
    ) -> Self {
        Self { store, clock, limit: limit.max(1), window }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Counts one request for `key` and reports whether it fits the window.
    ///
    /// An expired window is replaced with a fresh one starting at `count = 1`,
    /// never carried over.
    pub async fn allow(
        &self,
        key: &str,
    ) -> bool {
        for _ in 0..CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = self.store.get(key).await;

            let next = match current {
                Some(entry) if now < entry.window_reset_at => {
                    if entry.count >= self.limit {
                        debug!(
                            "rate limit exceeded: key={}, count={}, limit={}",
                            key, entry.count, self.limit
                        );
                        return false;
                    }
                    RateLimitEntry { count: entry.count + 1, ..entry }
                }
                _ => RateLimitEntry {
                    count: 1,
                    window_reset_at: now + self.window,
                },
            };

            if self.store.compare_and_swap(key, current, next).await {
                return true;
            }
        }

        warn!(
            "rate limit contention, denying request: key={}, attempts={}",
            key, CAS_ATTEMPTS
        );
        false
    }

    pub async fn sweep(&self) -> usize {
        self.store.remove_expired(self.clock.now()).await
    }
}

/// Periodically evicts finished windows so the key space does not grow
/// with every distinct caller ever seen.
pub async fn spawn_rate_limit_sweeper(
    limiter: Arc<RateLimiter>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every.max(Duration::from_secs(1)));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("rate limit sweeper stopping");
                break;
            }
            _ = ticker.tick() => {
                let removed = limiter.sweep().await;
                if removed > 0 {
                    debug!("rate limit sweep: removed={removed}");
                }
            }
        }
    }
}
