//! Ephemeral keyed file registry.
//!
//! The registry is the authoritative in-memory state of the bot: a map
//! from short opaque keys to media records with absolute-TTL expiry, plus
//! a per-user sliding-window request log for rate limiting. Expiry runs
//! two-tier: expired records are deleted lazily when fetched, and an
//! amortized sweep removes the rest every N insertions.
//!
//! All operations execute as atomic critical sections over a single
//! process-wide mutex. Critical sections perform no I/O and are short;
//! snapshot persistence works on a clone taken via [`Registry::export`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

/// Length of generated keys in hex characters (32 bits of entropy).
const KEY_LEN: usize = 8;

/// Attempts to generate a key that does not collide with a live one
/// before giving up. With a 32-bit key space this budget is spent only
/// when the registry is pathologically full.
const MAX_KEY_ATTEMPTS: u32 = 16;

/// Sliding rate-limit window in seconds (fixed at one hour).
const RATE_WINDOW_SECS: i64 = 3600;

/// Errors produced by registry operations.
///
/// Registry operations perform no I/O; the only failure mode is an
/// invariant violation, which is fatal by policy.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The collision-avoidance retry budget was exhausted. Indicates the
    /// key space is too small for the number of live records.
    #[error("key generation failed after {0} attempts: key space exhausted")]
    KeySpaceExhausted(u32),
}

/// Kind of media a record points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Generic document / file attachment
    Document,
    /// Video
    Video,
    /// Photo
    Photo,
    /// Audio track
    Audio,
}

/// One published media item, keyed by its short key in the registry map.
///
/// Field renames match the persisted JSON layout (`id`, `type`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    /// Opaque Telegram file identifier, handed back unmodified on send
    #[serde(rename = "id")]
    pub file_id: String,
    /// Media kind, selects the send method
    #[serde(rename = "type")]
    pub kind: MediaKind,
    /// Insertion time, epoch seconds; never changes after creation
    pub created_at: i64,
    /// Successful fetch count; mutated only by [`Registry::fetch`]
    pub access_count: u64,
}

/// Point-in-time registry statistics, as reported by `/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live (physically present) records
    pub record_count: usize,
    /// Sum of access counts over live records
    pub total_accesses: u64,
    /// Users with at least one logged, possibly stale, request timestamp
    pub active_user_count: usize,
}

/// Tunable registry parameters. The rate window itself is fixed at one
/// hour and is not part of the configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Absolute time-to-live of a record, measured from insertion
    pub ttl: Duration,
    /// Maximum admitted requests per user within the sliding window
    pub rate_limit: usize,
    /// Run an expiry sweep every this many insertions (0 disables the
    /// amortized trigger; lazy expiry-on-read still applies)
    pub prune_every: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(48 * 3600),
            rate_limit: 10,
            prune_every: 50,
        }
    }
}

/// State guarded by the registry mutex.
#[derive(Default)]
struct Inner {
    records: HashMap<String, MediaRecord>,
    user_requests: HashMap<i64, Vec<i64>>,
    insertions: u64,
}

/// Concurrent short-key media registry.
///
/// Explicitly constructed and owned by the process wiring; handlers
/// receive it behind an `Arc`. Lifecycle: optionally pre-populated via
/// [`Registry::restore`] at startup, drained via [`Registry::export`]
/// for snapshots.
pub struct Registry {
    ttl_secs: i64,
    rate_limit: usize,
    prune_every: u64,
    inner: Mutex<Inner>,
}

impl Registry {
    /// Creates an empty registry with the given parameters.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        let ttl_secs = i64::try_from(config.ttl.as_secs()).unwrap_or(i64::MAX);
        Self {
            ttl_secs,
            rate_limit: config.rate_limit,
            prune_every: config.prune_every,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Stores a media reference and returns its new short key.
    ///
    /// Every `prune_every`-th insertion triggers an expiry sweep before
    /// the key is returned.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::KeySpaceExhausted`] if no collision-free
    /// key could be generated. This indicates a configuration problem
    /// (key space too small) and is treated as fatal by callers.
    pub fn insert(&self, file_id: String, kind: MediaKind) -> Result<String, RegistryError> {
        self.insert_at(file_id, kind, Utc::now().timestamp())
    }

    fn insert_at(
        &self,
        file_id: String,
        kind: MediaKind,
        now: i64,
    ) -> Result<String, RegistryError> {
        let mut inner = self.lock();
        let key = generate_key(&inner.records)?;
        inner.records.insert(
            key.clone(),
            MediaRecord {
                file_id,
                kind,
                created_at: now,
                access_count: 0,
            },
        );

        inner.insertions += 1;
        if self.prune_every > 0 && inner.insertions.is_multiple_of(self.prune_every) {
            let removed = prune_locked(&mut inner, self.ttl_secs, now);
            if removed > 0 {
                debug!(removed, "amortized sweep removed expired records");
            }
        }

        Ok(key)
    }

    /// Looks up a live record, bumping its access count.
    ///
    /// Returns `None` if the key is absent or the record's age strictly
    /// exceeds the TTL; an expired record is removed as a side effect
    /// (lazy expiry-on-read). The expiry check and the increment happen
    /// under one lock acquisition, so no concurrent sweep can interleave
    /// between them.
    pub fn fetch(&self, key: &str) -> Option<MediaRecord> {
        self.fetch_at(key, Utc::now().timestamp())
    }

    fn fetch_at(&self, key: &str, now: i64) -> Option<MediaRecord> {
        let mut inner = self.lock();
        let expired = now - inner.records.get(key)?.created_at > self.ttl_secs;
        if expired {
            inner.records.remove(key);
            return None;
        }
        let record = inner.records.get_mut(key)?;
        record.access_count += 1;
        Some(record.clone())
    }

    /// Removes every expired record and returns how many were removed.
    ///
    /// Runs automatically on an amortized schedule inside [`Registry::insert`]
    /// and optionally after a snapshot load; also exposed to the admin
    /// `/cleanup` command.
    pub fn prune_expired(&self) -> usize {
        self.prune_expired_at(Utc::now().timestamp())
    }

    fn prune_expired_at(&self, now: i64) -> usize {
        let mut inner = self.lock();
        prune_locked(&mut inner, self.ttl_secs, now)
    }

    /// Atomically checks the user's sliding-window quota and records the
    /// request when admitted.
    ///
    /// Stale timestamps are purged first; if the purged log is already at
    /// the cap the request is denied and nothing is recorded. Two
    /// concurrent calls cannot both take the last slot.
    pub fn check_and_record_request(&self, user_id: i64) -> bool {
        self.check_and_record_request_at(user_id, Utc::now().timestamp())
    }

    fn check_and_record_request_at(&self, user_id: i64, now: i64) -> bool {
        let mut inner = self.lock();
        let cutoff = now - RATE_WINDOW_SECS;
        let log = inner.user_requests.entry(user_id).or_default();
        log.retain(|&stamp| stamp > cutoff);
        if log.len() >= self.rate_limit {
            return false;
        }
        log.push(now);
        true
    }

    /// Returns a point-in-time snapshot of registry statistics.
    ///
    /// Read-only; expired-but-unswept records still count until the next
    /// sweep or expiring fetch removes them.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let inner = self.lock();
        RegistryStats {
            record_count: inner.records.len(),
            total_accesses: inner.records.values().map(|r| r.access_count).sum(),
            active_user_count: inner.user_requests.len(),
        }
    }

    /// Replaces the record map with snapshot data (startup load path).
    ///
    /// Duplicate keys cannot survive the map representation, so key
    /// uniqueness is inherited from the encoding. Bulk population does
    /// not advance the insertion counter and never triggers the
    /// amortized sweep; the post-load full sweep covers records that
    /// expired while the process was down.
    pub fn restore(&self, records: HashMap<String, MediaRecord>) {
        let mut inner = self.lock();
        inner.records = records;
    }

    /// Clones the live record map for the snapshot store.
    ///
    /// The clone is taken under the lock; serialization and file I/O
    /// happen outside it. Rate-window state is deliberately excluded.
    #[must_use]
    pub fn export(&self) -> HashMap<String, MediaRecord> {
        self.lock().records.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned mutex only means another operation panicked; the
        // map itself is never left partially updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn prune_locked(inner: &mut Inner, ttl_secs: i64, now: i64) -> usize {
    let before = inner.records.len();
    inner.records.retain(|_, record| now - record.created_at <= ttl_secs);
    before - inner.records.len()
}

fn generate_key(records: &HashMap<String, MediaRecord>) -> Result<String, RegistryError> {
    for _ in 0..MAX_KEY_ATTEMPTS {
        let mut key = Uuid::new_v4().simple().to_string();
        key.truncate(KEY_LEN);
        if !records.contains_key(&key) {
            return Ok(key);
        }
    }
    error!(
        attempts = MAX_KEY_ATTEMPTS,
        "key space exhausted while generating a short key"
    );
    Err(RegistryError::KeySpaceExhausted(MAX_KEY_ATTEMPTS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn registry(ttl_secs: u64, rate_limit: usize, prune_every: u64) -> Registry {
        Registry::new(RegistryConfig {
            ttl: Duration::from_secs(ttl_secs),
            rate_limit,
            prune_every,
        })
    }

    #[test]
    fn concurrent_inserts_yield_distinct_keys() {
        let registry = Arc::new(registry(3600, 10, 0));
        let keys = Mutex::new(HashSet::new());

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let key = registry
                            .insert("file".to_string(), MediaKind::Document)
                            .expect("insert");
                        keys.lock().expect("keys lock").insert(key);
                    }
                });
            }
        });

        assert_eq!(keys.lock().expect("keys lock").len(), 400);
        assert_eq!(registry.stats().record_count, 400);
    }

    #[test]
    fn generated_keys_are_short_hex() {
        let registry = registry(3600, 10, 0);
        let key = registry
            .insert("file".to_string(), MediaKind::Photo)
            .expect("insert");
        assert_eq!(key.len(), KEY_LEN);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fetch_respects_ttl_boundary() {
        let registry = registry(100, 10, 0);
        let t0 = 1_000_000;
        let key = registry
            .insert_at("file".to_string(), MediaKind::Video, t0)
            .expect("insert");

        // Age == TTL is still live; only strictly older records expire.
        assert!(registry.fetch_at(&key, t0 + 100).is_some());
        assert!(registry.fetch_at(&key, t0 + 101).is_none());

        // Lazy expiry removed it physically as well.
        assert_eq!(registry.stats().record_count, 0);
        assert!(registry.fetch_at(&key, t0).is_none());
    }

    #[test]
    fn access_count_tracks_successful_fetches() {
        let registry = registry(3600, 10, 0);
        let key = registry
            .insert("file".to_string(), MediaKind::Audio)
            .expect("insert");

        for expected in 1..=5 {
            let record = registry.fetch(&key).expect("live record");
            assert_eq!(record.access_count, expected);
        }
        let missed = registry.fetch("unknown0");
        assert!(missed.is_none());
        assert_eq!(registry.stats().total_accesses, 5);
    }

    #[test]
    fn concurrent_fetches_lose_no_increments() {
        let registry = Arc::new(registry(3600, 10, 0));
        let key = registry
            .insert("file".to_string(), MediaKind::Document)
            .expect("insert");
        let observed = Mutex::new(HashSet::new());

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        let record = registry.fetch(&key).expect("live record");
                        observed
                            .lock()
                            .expect("observed lock")
                            .insert(record.access_count);
                    }
                });
            }
        });

        let observed = observed.lock().expect("observed lock");
        // 200 fetches, 200 distinct counter values, none lost.
        assert_eq!(observed.len(), 200);
        assert_eq!(observed.iter().max(), Some(&200));
        assert_eq!(registry.stats().total_accesses, 200);
    }

    #[test]
    fn prune_removes_only_expired_records() {
        let registry = registry(100, 10, 0);
        let t0 = 500_000;
        let old = registry
            .insert_at("old".to_string(), MediaKind::Photo, t0)
            .expect("insert");
        let fresh = registry
            .insert_at("fresh".to_string(), MediaKind::Photo, t0 + 90)
            .expect("insert");

        assert_eq!(registry.prune_expired_at(t0 + 150), 1);
        assert_eq!(registry.prune_expired_at(t0 + 150), 0);
        assert!(registry.fetch_at(&old, t0 + 150).is_none());
        assert!(registry.fetch_at(&fresh, t0 + 150).is_some());
    }

    #[test]
    fn amortized_sweep_fires_on_schedule() {
        let registry = registry(10, 10, 5);
        let t0 = 0;
        for _ in 0..4 {
            registry
                .insert_at("stale".to_string(), MediaKind::Document, t0)
                .expect("insert");
        }
        // Fifth insertion crosses the interval and sweeps the stale four
        // before returning.
        registry
            .insert_at("live".to_string(), MediaKind::Document, t0 + 100)
            .expect("insert");
        assert_eq!(registry.stats().record_count, 1);
    }

    #[test]
    fn rate_window_boundary() {
        let registry = registry(3600, 10, 0);
        let t0 = 2_000_000;
        let user = 42;

        for i in 0..10 {
            assert!(registry.check_and_record_request_at(user, t0 + i));
        }
        // Cap reached inside the window; denial records nothing.
        assert!(!registry.check_and_record_request_at(user, t0 + 10));
        assert!(!registry.check_and_record_request_at(user, t0 + 11));

        // Once the first stamps fall out of the trailing hour, admission
        // resumes.
        assert!(registry.check_and_record_request_at(user, t0 + RATE_WINDOW_SECS + 1));
    }

    #[test]
    fn rate_windows_are_per_user() {
        let registry = registry(3600, 1, 0);
        let t0 = 0;
        assert!(registry.check_and_record_request_at(1, t0));
        assert!(!registry.check_and_record_request_at(1, t0));
        assert!(registry.check_and_record_request_at(2, t0));
        assert_eq!(registry.stats().active_user_count, 2);
    }

    #[test]
    fn restore_skips_amortized_sweep() {
        let registry = registry(100, 10, 1);
        let mut records = HashMap::new();
        records.insert(
            "aaaaaaaa".to_string(),
            MediaRecord {
                file_id: "stale".to_string(),
                kind: MediaKind::Video,
                created_at: 0,
                access_count: 3,
            },
        );
        registry.restore(records);

        // Bulk load admits expired records untouched; the explicit
        // post-load sweep reclaims them.
        assert_eq!(registry.stats().record_count, 1);
        assert_eq!(registry.prune_expired_at(1_000), 1);
    }

    #[test]
    fn end_to_end_lifecycle() {
        let registry = registry(48 * 3600, 10, 0);
        let t0 = 1_700_000_000;
        let key = registry
            .insert_at("ref-A".to_string(), MediaKind::Video, t0)
            .expect("insert");

        let first = registry.fetch_at(&key, t0).expect("first fetch");
        assert_eq!(first.access_count, 1);
        let second = registry.fetch_at(&key, t0 + 60).expect("second fetch");
        assert_eq!(second.access_count, 2);

        let after_ttl = t0 + 48 * 3600 + 3600;
        assert!(registry.fetch_at(&key, after_ttl).is_none());
        assert_eq!(registry.stats().record_count, 0);
    }
}
