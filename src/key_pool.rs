//! API Key Pool
//!
//! Rotating set of API keys for one provider. All mutable state (rotation
//! cursor, last-used timestamps, rate-limit windows) lives behind a single
//! mutex per pool, held only for the select-and-record step of a claim and
//! never across a network call.
//!
//! Quota is charged at claim time: a claimed slot stays consumed whatever the
//! outcome of the request that uses it.

use crate::error::{CompletionError, LimitOrigin};
use crate::provider_config::RotationStrategy;
use crate::rate_limiter::{KeyWindow, RateLimiter};
use crate::util::key_fingerprint;
use rand::Rng;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Opaque identifier of a key inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(usize);

/// A key handed out by [`KeyPool::claim`]
#[derive(Clone)]
pub struct ClaimedKey {
    value: String,
    handle: KeyHandle,
    fingerprint: String,
}

impl ClaimedKey {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn handle(&self) -> KeyHandle {
        self.handle
    }

    /// Short, non-reversible identifier safe to log
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Debug for ClaimedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedKey")
            .field("handle", &self.handle)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

#[derive(Debug)]
struct KeySlot {
    value: String,
    fingerprint: String,
    last_used_at: Option<Instant>,
    window: KeyWindow,
    claims: u64,
}

#[derive(Debug)]
struct PoolState {
    cursor: usize,
    slots: Vec<KeySlot>,
}

/// Statistics about a key pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPoolStats {
    pub total_keys: usize,
    pub available_keys: usize,
    pub limited_keys: usize,
    pub total_claims: u64,
    pub keys: Vec<KeyStats>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStats {
    pub fingerprint: String,
    pub claims: u64,
    pub in_window: usize,
    pub limited: bool,
}

pub struct KeyPool {
    provider: String,
    strategy: RotationStrategy,
    limiter: RateLimiter,
    state: Mutex<PoolState>,
}

impl KeyPool {
    /// Build a pool. Empty values and duplicates are dropped, keeping the
    /// first occurrence so insertion order is preserved.
    pub fn new(
        provider: impl Into<String>,
        keys: Vec<String>,
        strategy: RotationStrategy,
        limiter: RateLimiter,
    ) -> Self {
        let mut slots: Vec<KeySlot> = Vec::with_capacity(keys.len());
        for key in keys {
            let key = key.trim().to_string();
            if key.is_empty() || slots.iter().any(|s| s.value == key) {
                continue;
            }
            slots.push(KeySlot {
                fingerprint: key_fingerprint(&key),
                value: key,
                last_used_at: None,
                window: KeyWindow::new(),
                claims: 0,
            });
        }
        Self::from_slots(provider.into(), slots, strategy, limiter)
    }

    /// A pool with one credential-less slot, for providers that take no key.
    /// The slot still carries a rate-limit window.
    pub fn anonymous(provider: impl Into<String>, limiter: RateLimiter) -> Self {
        let slot = KeySlot {
            value: String::new(),
            fingerprint: "anonymous".to_string(),
            last_used_at: None,
            window: KeyWindow::new(),
            claims: 0,
        };
        Self::from_slots(
            provider.into(),
            vec![slot],
            RotationStrategy::RoundRobin,
            limiter,
        )
    }

    fn from_slots(
        provider: String,
        slots: Vec<KeySlot>,
        strategy: RotationStrategy,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            provider,
            strategy,
            limiter,
            state: Mutex::new(PoolState { cursor: 0, slots }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock cannot leave a slot half-written:
        // every mutation is a single field store.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claim a key that is currently under its rate limit.
    pub fn claim(&self) -> Result<ClaimedKey, CompletionError> {
        self.claim_at(Instant::now())
    }

    /// [`claim`](Self::claim) evaluated at an explicit instant.
    pub fn claim_at(&self, now: Instant) -> Result<ClaimedKey, CompletionError> {
        let mut state = self.lock();
        if state.slots.is_empty() {
            return Err(CompletionError::MissingKeys {
                provider: self.provider.clone(),
            });
        }

        let limiter = self.limiter;
        let candidates: Vec<usize> = state
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| (!limiter.is_limited(&mut slot.window, now)).then_some(i))
            .collect();

        if candidates.is_empty() {
            let retry_after = state
                .slots
                .iter_mut()
                .filter_map(|slot| limiter.next_available_at(&mut slot.window, now))
                .min()
                .map(|at| at.saturating_duration_since(now));
            tracing::debug!(
                provider = %self.provider,
                retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                "All keys rate limited"
            );
            return Err(CompletionError::RateLimitExceeded {
                provider: self.provider.clone(),
                model: None,
                origin: LimitOrigin::Local,
                retry_after,
            });
        }

        let index = match self.strategy {
            RotationStrategy::RoundRobin => {
                let len = state.slots.len();
                let start = state.cursor % len;
                let chosen = (0..len)
                    .map(|offset| (start + offset) % len)
                    .find(|i| candidates.contains(i))
                    .unwrap_or(candidates[0]);
                state.cursor = (chosen + 1) % len;
                chosen
            }
            RotationStrategy::Random => {
                candidates[rand::thread_rng().gen_range(0..candidates.len())]
            }
            RotationStrategy::LeastRecentlyUsed => {
                // Never-used keys (None) sort before any timestamp; min_by_key
                // keeps the first minimum, i.e. the earliest inserted.
                *candidates
                    .iter()
                    .min_by_key(|&&i| state.slots[i].last_used_at)
                    .unwrap_or(&candidates[0])
            }
        };

        let slot = &mut state.slots[index];
        slot.last_used_at = Some(now);
        slot.claims += 1;
        limiter.record(&mut slot.window, now);

        tracing::debug!(
            provider = %self.provider,
            key = %slot.fingerprint,
            strategy = ?self.strategy,
            "Claimed API key"
        );

        Ok(ClaimedKey {
            value: slot.value.clone(),
            handle: KeyHandle(index),
            fingerprint: slot.fingerprint.clone(),
        })
    }

    /// Put a key in cooldown, e.g. after the provider answered 429.
    pub fn cool_down(&self, handle: KeyHandle, duration: Duration) {
        self.cool_down_at(handle, Instant::now(), duration);
    }

    pub fn cool_down_at(&self, handle: KeyHandle, now: Instant, duration: Duration) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(handle.0) {
            self.limiter.penalize(&mut slot.window, now, duration);
            tracing::warn!(
                provider = %self.provider,
                key = %slot.fingerprint,
                cooldown_secs = duration.as_secs_f64(),
                "Key placed in cooldown"
            );
        }
    }

    /// True when every key is limited right now.
    pub fn all_limited(&self) -> bool {
        let now = Instant::now();
        let limiter = self.limiter;
        let mut state = self.lock();
        state
            .slots
            .iter_mut()
            .all(|slot| limiter.is_limited(&mut slot.window, now))
    }

    pub fn stats(&self) -> KeyPoolStats {
        let now = Instant::now();
        let limiter = self.limiter;
        let mut state = self.lock();

        let keys: Vec<KeyStats> = state
            .slots
            .iter_mut()
            .map(|slot| {
                let limited = limiter.is_limited(&mut slot.window, now);
                KeyStats {
                    fingerprint: slot.fingerprint.clone(),
                    claims: slot.claims,
                    in_window: slot.window.count(now),
                    limited,
                }
            })
            .collect();

        let limited_keys = keys.iter().filter(|k| k.limited).count();
        KeyPoolStats {
            total_keys: keys.len(),
            available_keys: keys.len() - limited_keys,
            limited_keys,
            total_claims: keys.iter().map(|k| k.claims).sum(),
            keys,
        }
    }
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool")
            .field("provider", &self.provider)
            .field("strategy", &self.strategy)
            .field("limiter", &self.limiter)
            .field("keys", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::WINDOW;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keys(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_round_robin_visits_each_key_in_order() {
        let pool = KeyPool::new(
            "test",
            keys(&["key1", "key2", "key3"]),
            RotationStrategy::RoundRobin,
            RateLimiter::unlimited(),
        );

        let seen: Vec<String> = (0..4)
            .map(|_| pool.claim().unwrap().value().to_string())
            .collect();
        assert_eq!(seen, vec!["key1", "key2", "key3", "key1"]);
    }

    #[test]
    fn test_round_robin_skips_limited_key() {
        let pool = KeyPool::new(
            "test",
            keys(&["key1", "key2", "key3"]),
            RotationStrategy::RoundRobin,
            RateLimiter::unlimited(),
        );
        let now = Instant::now();

        let first = pool.claim_at(now).unwrap();
        assert_eq!(first.value(), "key1");

        // key2 is next in line but cooling down
        pool.cool_down_at(KeyHandle(1), now, Duration::from_secs(30));
        assert_eq!(pool.claim_at(now).unwrap().value(), "key3");
        assert_eq!(pool.claim_at(now).unwrap().value(), "key1");
        assert_eq!(pool.claim_at(now).unwrap().value(), "key3");

        // once key2 recovers it rejoins the rotation
        let later = now + Duration::from_secs(31);
        assert_eq!(pool.claim_at(later).unwrap().value(), "key1");
        assert_eq!(pool.claim_at(later).unwrap().value(), "key2");
    }

    #[test]
    fn test_duplicates_and_blanks_dropped() {
        let pool = KeyPool::new(
            "test",
            keys(&["a", "", "b", "a", "  "]),
            RotationStrategy::RoundRobin,
            RateLimiter::unlimited(),
        );
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_empty_pool_reports_missing_keys() {
        let pool = KeyPool::new(
            "groq",
            vec![],
            RotationStrategy::RoundRobin,
            RateLimiter::unlimited(),
        );
        assert!(matches!(
            pool.claim(),
            Err(CompletionError::MissingKeys { provider }) if provider == "groq"
        ));
    }

    #[test]
    fn test_rate_limit_rejects_k_plus_one_claim_and_recovers() {
        let pool = KeyPool::new(
            "test",
            keys(&["only"]),
            RotationStrategy::RoundRobin,
            RateLimiter::new(Some(2)),
        );
        let start = Instant::now();

        pool.claim_at(start).unwrap();
        pool.claim_at(start + Duration::from_secs(10)).unwrap();

        let err = pool
            .claim_at(start + Duration::from_secs(20))
            .unwrap_err();
        match err {
            CompletionError::RateLimitExceeded {
                origin,
                retry_after,
                ..
            } => {
                assert_eq!(origin, LimitOrigin::Local);
                assert_eq!(retry_after, Some(Duration::from_secs(40)));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // the first claim ages out at start + 60s
        assert!(pool.claim_at(start + WINDOW).is_ok());
    }

    #[test]
    fn test_retry_after_is_minimum_across_keys() {
        let pool = KeyPool::new(
            "test",
            keys(&["a", "b"]),
            RotationStrategy::RoundRobin,
            RateLimiter::new(Some(1)),
        );
        let start = Instant::now();
        pool.claim_at(start).unwrap();
        pool.claim_at(start + Duration::from_secs(15)).unwrap();

        let err = pool
            .claim_at(start + Duration::from_secs(20))
            .unwrap_err();
        assert!(matches!(
            err,
            CompletionError::RateLimitExceeded {
                retry_after: Some(d),
                ..
            } if d == Duration::from_secs(40)
        ));
    }

    #[test]
    fn test_lru_prefers_unused_then_oldest() {
        let pool = KeyPool::new(
            "test",
            keys(&["a", "b", "c"]),
            RotationStrategy::LeastRecentlyUsed,
            RateLimiter::unlimited(),
        );
        let t0 = Instant::now();

        assert_eq!(pool.claim_at(t0).unwrap().value(), "a");
        assert_eq!(
            pool.claim_at(t0 + Duration::from_secs(1)).unwrap().value(),
            "b"
        );
        assert_eq!(
            pool.claim_at(t0 + Duration::from_secs(2)).unwrap().value(),
            "c"
        );
        // all used: oldest wins
        assert_eq!(
            pool.claim_at(t0 + Duration::from_secs(3)).unwrap().value(),
            "a"
        );
        assert_eq!(
            pool.claim_at(t0 + Duration::from_secs(4)).unwrap().value(),
            "b"
        );
    }

    #[test]
    fn test_lru_ties_broken_by_insertion_order() {
        let pool = KeyPool::new(
            "test",
            keys(&["a", "b"]),
            RotationStrategy::LeastRecentlyUsed,
            RateLimiter::unlimited(),
        );
        let t0 = Instant::now();
        pool.claim_at(t0).unwrap();
        pool.claim_at(t0).unwrap();
        // both used at t0
        assert_eq!(pool.claim_at(t0).unwrap().value(), "a");
    }

    #[test]
    fn test_random_only_returns_candidates() {
        let pool = KeyPool::new(
            "test",
            keys(&["a", "b", "c"]),
            RotationStrategy::Random,
            RateLimiter::unlimited(),
        );
        let now = Instant::now();
        pool.cool_down_at(KeyHandle(0), now, Duration::from_secs(60));
        pool.cool_down_at(KeyHandle(2), now, Duration::from_secs(60));

        for _ in 0..20 {
            assert_eq!(pool.claim_at(now).unwrap().value(), "b");
        }
    }

    #[test]
    fn test_anonymous_pool_claims_empty_credential() {
        let pool = KeyPool::anonymous("ollama", RateLimiter::new(Some(1)));
        let now = Instant::now();
        let claimed = pool.claim_at(now).unwrap();
        assert_eq!(claimed.value(), "");
        assert!(pool.claim_at(now).is_err());
    }

    #[test]
    fn test_stats_track_claims_and_limits() {
        let pool = KeyPool::new(
            "test",
            keys(&["a", "b"]),
            RotationStrategy::RoundRobin,
            RateLimiter::new(Some(1)),
        );
        pool.claim().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total_keys, 2);
        assert_eq!(stats.limited_keys, 1);
        assert_eq!(stats.available_keys, 1);
        assert_eq!(stats.total_claims, 1);
        assert!(stats.keys.iter().all(|k| k.fingerprint.len() == 12));
        assert!(!pool.all_limited());
        pool.claim().unwrap();
        assert!(pool.all_limited());
    }

    #[test]
    fn test_debug_does_not_leak_key_values() {
        let pool = KeyPool::new(
            "test",
            keys(&["sk-secret-value"]),
            RotationStrategy::RoundRobin,
            RateLimiter::unlimited(),
        );
        let claimed = pool.claim().unwrap();
        assert!(!format!("{claimed:?}").contains("sk-secret-value"));
        assert!(!format!("{pool:?}").contains("sk-secret-value"));
    }

    #[test]
    fn test_concurrent_claims_never_exceed_quota() {
        let pool = KeyPool::new(
            "test",
            keys(&["a", "b"]),
            RotationStrategy::RoundRobin,
            RateLimiter::new(Some(5)),
        );
        let granted = AtomicUsize::new(0);
        let values = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..5 {
                        if let Ok(key) = pool.claim() {
                            granted.fetch_add(1, Ordering::SeqCst);
                            values.lock().unwrap().push(key.value().to_string());
                        }
                    }
                });
            }
        });

        // 2 keys x 5 per minute
        assert_eq!(granted.load(Ordering::SeqCst), 10);
        let values = values.into_inner().unwrap();
        let distinct: HashSet<_> = values.iter().collect();
        assert_eq!(distinct.len(), 2);
        assert_eq!(values.iter().filter(|v| *v == "a").count(), 5);
    }
}
