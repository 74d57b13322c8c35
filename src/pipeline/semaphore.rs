//! Cluster-wide admission control for local inference.
//!
//! Local inference saturates under concurrent load, so at most `permits`
//! callers may hold a slot at once. Each slot is a key with a TTL in a shared
//! coordination store (`lock:gpu:1`, `lock:gpu:2`, ...), taken with an atomic
//! set-if-absent and released with a delete. The TTL reclaims slots held by
//! a crashed process.
//!
//! - `acquire()` tries every slot once and never blocks.
//! - `run_with_lock()` polls until a slot frees up or `max_wait` elapses,
//!   runs the closure, and releases the slot on every exit path (including
//!   panics, through `SlotGuard`'s `Drop`).
//! - `ping()` measures a store round-trip for health reporting only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

use crate::config::LockConfig;

#[derive(Error, Debug)]
pub enum SemaphoreError {
    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("Could not acquire {key} within {max_wait_ms}ms (TTL={ttl_secs}s)")]
    LockTimeout {
        key: String,
        max_wait_ms: u128,
        ttl_secs: u64,
    },
}

// ═══════════════════════════════════════════════════════════
// Coordination store
// ═══════════════════════════════════════════════════════════

/// Shared key store with the three operations the semaphore needs.
pub trait CoordinationStore: Send + Sync {
    /// Atomically set `key` if absent, expiring after `ttl`. True if set.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, SemaphoreError>;

    fn delete(&self, key: &str) -> Result<(), SemaphoreError>;

    /// Round-trip latency to the store.
    fn ping(&self) -> Result<Duration, SemaphoreError>;

    fn backend_name(&self) -> &'static str;
}

/// Process-local store, used when no shared store is configured.
#[derive(Default)]
pub struct InMemoryCoordinationStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, (String, Instant)>> {
        // A panicking holder cannot leave the map half-written; keep going.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CoordinationStore for InMemoryCoordinationStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, SemaphoreError> {
        let now = Instant::now();
        let mut entries = self.entries();
        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), SemaphoreError> {
        self.entries().remove(key);
        Ok(())
    }

    fn ping(&self) -> Result<Duration, SemaphoreError> {
        let started = Instant::now();
        drop(self.entries());
        Ok(started.elapsed())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Connection timeout for the shared store.
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis-backed store shared by every process of the fleet.
///
/// Connects lazily and drops the connection after any error, so an outage
/// only fails the calls made while it lasts.
pub struct RedisCoordinationStore {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
}

impl RedisCoordinationStore {
    /// Parse the URL; no connection is made until first use.
    pub fn open(url: &str) -> Result<Self, SemaphoreError> {
        let client = redis::Client::open(url).map_err(|e| SemaphoreError::Store(e.to_string()))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, SemaphoreError> {
        let mut slot = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            let conn = self
                .client
                .get_connection_with_timeout(REDIS_CONNECT_TIMEOUT)
                .map_err(|e| SemaphoreError::Store(e.to_string()))?;
            *slot = Some(conn);
        }

        let Some(conn) = slot.as_mut() else {
            return Err(SemaphoreError::Store("No connection".into()));
        };
        match op(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                *slot = None;
                Err(SemaphoreError::Store(e.to_string()))
            }
        }
    }
}

impl CoordinationStore for RedisCoordinationStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, SemaphoreError> {
        let ttl_secs = ttl.as_secs().max(1);
        let reply: Option<String> = self.with_connection(|conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query(conn)
        })?;
        Ok(reply.is_some())
    }

    fn delete(&self, key: &str) -> Result<(), SemaphoreError> {
        use redis::Commands;
        self.with_connection(|conn| conn.del(key))
    }

    fn ping(&self) -> Result<Duration, SemaphoreError> {
        let started = Instant::now();
        let _pong: String = self.with_connection(|conn| redis::cmd("PING").query(conn))?;
        Ok(started.elapsed())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════
// Semaphore
// ═══════════════════════════════════════════════════════════

/// Per-call lock parameters.
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub ttl: Duration,
    pub max_wait: Duration,
}

/// One held slot of the semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSlot(usize);

impl LockSlot {
    pub fn index(&self) -> usize {
        self.0
    }
}

pub struct ConcurrencySemaphore {
    store: Arc<dyn CoordinationStore>,
    key_prefix: String,
    permits: usize,
    poll_interval: Duration,
    defaults: LockOptions,
    /// Value written into held keys, identifies this process in the store.
    holder: String,
}

impl ConcurrencySemaphore {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &LockConfig) -> Self {
        Self {
            store,
            key_prefix: config.key.clone(),
            permits: config.permits.max(1),
            poll_interval: config.poll_interval,
            defaults: LockOptions {
                ttl: config.ttl,
                max_wait: config.max_wait,
            },
            holder: Uuid::new_v4().to_string(),
        }
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Options from configuration.
    pub fn default_options(&self) -> LockOptions {
        self.defaults
    }

    pub fn store_name(&self) -> &'static str {
        self.store.backend_name()
    }

    fn slot_key(&self, slot: usize) -> String {
        format!("{}:{}", self.key_prefix, slot + 1)
    }

    /// Try each slot once. `None` when all are held.
    pub fn acquire(&self, ttl: Duration) -> Result<Option<LockSlot>, SemaphoreError> {
        for slot in 0..self.permits {
            if self.store.set_if_absent(&self.slot_key(slot), &self.holder, ttl)? {
                tracing::debug!(key = %self.slot_key(slot), "Inference slot acquired");
                return Ok(Some(LockSlot(slot)));
            }
        }
        Ok(None)
    }

    /// Unconditionally delete the slot key.
    pub fn release(&self, slot: LockSlot) -> Result<(), SemaphoreError> {
        self.store.delete(&self.slot_key(slot.0))?;
        tracing::debug!(key = %self.slot_key(slot.0), "Inference slot released");
        Ok(())
    }

    /// Wait for a slot, run `f`, release the slot.
    ///
    /// Fails with `LockTimeout` once `max_wait` elapses without a slot, and
    /// with `Store` if the coordination store is unreachable; `f` is not run
    /// in either case.
    pub fn run_with_lock<T, E, F>(&self, options: LockOptions, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<SemaphoreError>,
    {
        let slot = self.wait_for_slot(options)?;
        let _guard = SlotGuard { semaphore: self, slot };
        f()
    }

    fn wait_for_slot(&self, options: LockOptions) -> Result<LockSlot, SemaphoreError> {
        let started = Instant::now();
        loop {
            if let Some(slot) = self.acquire(options.ttl)? {
                let waited = started.elapsed();
                if waited > self.poll_interval {
                    tracing::info!(waited_ms = waited.as_millis() as u64, "Inference slot acquired after waiting");
                }
                return Ok(slot);
            }

            let elapsed = started.elapsed();
            if elapsed >= options.max_wait {
                tracing::warn!(
                    key = %self.key_prefix,
                    max_wait_ms = options.max_wait.as_millis() as u64,
                    "Inference slot acquisition timed out"
                );
                return Err(SemaphoreError::LockTimeout {
                    key: self.key_prefix.clone(),
                    max_wait_ms: options.max_wait.as_millis(),
                    ttl_secs: options.ttl.as_secs(),
                });
            }
            std::thread::sleep(self.poll_interval.min(options.max_wait - elapsed));
        }
    }

    /// Round-trip to the coordination store.
    pub fn ping(&self) -> Result<Duration, SemaphoreError> {
        self.store.ping()
    }
}

/// Releases its slot when dropped, on success, error or unwind alike.
struct SlotGuard<'a> {
    semaphore: &'a ConcurrencySemaphore,
    slot: LockSlot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.semaphore.release(self.slot) {
            // The TTL reclaims the slot eventually.
            tracing::warn!(slot = self.slot.0 + 1, error = %e, "Failed to release inference slot");
        }
    }
}
