//! Per-client admission control.
//!
//! Each client key owns a token bucket: tokens accrue continuously at one per
//! `refill_interval` up to `capacity`, and every admitted request spends one.
//! Buckets are created full on first sight.
//!
//! The key → bucket map is a [`DashMap`]; creating a new entry is serialized
//! so the map never grows past `max_clients`. Each bucket carries its own
//! mutex, so a flood from one key only contends on that key's lock.
//!
//! Memory stays bounded under key churn two ways: [`AdmissionController::sweep`]
//! drops buckets idle for longer than `idle_ttl` (a bucket idle that long has
//! refilled and is indistinguishable from a fresh one), and inserting at
//! `max_clients` evicts the least recently seen tenth of the map in one pass,
//! so the scan is paid once per batch rather than once per new key.
//!
//! A bucket is retired under its own lock before it leaves the map. A caller
//! still holding a retired bucket looks the key up again instead of spending
//! from a bucket nobody else can see.

use dashmap::DashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::StashError;

/// Share of `max_clients` freed by one eviction pass.
const EVICTION_DIVISOR: usize = 10;

/// Tunables for the admission controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Maximum burst per client.
    pub capacity: u32,
    /// Time to accrue one token.
    pub refill_interval: Duration,
    /// Upper bound on tracked client keys.
    pub max_clients: usize,
    /// Buckets unused for this long are dropped by `sweep`.
    pub idle_ttl: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            refill_interval: Duration::from_secs(5),
            max_clients: 100_000,
            idle_ttl: Duration::from_secs(600),
        }
    }
}

impl AdmissionConfig {
    /// Idle period after which a bucket is guaranteed to be full again.
    fn effective_idle_ttl(&self) -> Duration {
        let refill_to_full = self.refill_interval.saturating_mul(self.capacity.max(1));
        self.idle_ttl.max(refill_to_full)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// Time until the next token, if denied.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Admission::Allowed => None,
            Admission::Denied { retry_after } => Some(*retry_after),
        }
    }

    /// Convert a denial into [`StashError::RateLimited`].
    pub fn into_result(self) -> Result<(), StashError> {
        match self {
            Admission::Allowed => Ok(()),
            Admission::Denied { retry_after } => Err(StashError::RateLimited { retry_after }),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    /// Always within `[0, capacity]`.
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
    /// Set once the bucket has been removed from the map.
    retired: bool,
}

/// A single client's bucket. Safe to share between concurrent callers.
#[derive(Debug)]
struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: now,
                last_seen: now,
                retired: false,
            }),
        }
    }

    /// `None` if the bucket was retired; the caller must look the key up again.
    fn try_acquire(&self, config: &AdmissionConfig, now: Instant) -> Option<Admission> {
        let capacity = f64::from(config.capacity);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.retired {
            return None;
        }

        let elapsed = now.saturating_duration_since(state.last_refill);
        let accrued = if config.refill_interval.is_zero() {
            capacity
        } else {
            elapsed.as_secs_f64() / config.refill_interval.as_secs_f64()
        };
        state.tokens = (state.tokens + accrued).min(capacity);
        if now > state.last_refill {
            state.last_refill = now;
        }
        if now > state.last_seen {
            state.last_seen = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Some(Admission::Allowed)
        } else {
            let missing = 1.0 - state.tokens;
            Some(Admission::Denied {
                retry_after: config.refill_interval.mul_f64(missing),
            })
        }
    }

    /// Retire the bucket if `pred` holds for its current state.
    fn retire_if(&self, pred: impl FnOnce(&BucketState) -> bool) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.retired && pred(&state) {
            state.retired = true;
        }
        state.retired
    }

    fn last_seen(&self) -> Instant {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_seen
    }

    fn tokens(&self) -> f64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).tokens
    }
}

/// Token-bucket admission controller keyed by client.
///
/// Construct once and share it (behind an `Arc`) with every request handler.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    buckets: DashMap<String, Arc<TokenBucket>>,
    insert_lock: Mutex<()>,
    eviction_passes: AtomicUsize,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            insert_lock: Mutex::new(()),
            eviction_passes: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Try to spend one token for `client`.
    pub fn allow(&self, client: &str) -> bool {
        self.check(client).is_allowed()
    }

    pub fn check(&self, client: &str) -> Admission {
        self.check_at(client, Instant::now())
    }

    /// Admission check against an explicit clock reading.
    pub fn check_at(&self, client: &str, now: Instant) -> Admission {
        let decision = loop {
            if let Some(decision) = self.bucket_for(client, now).try_acquire(&self.config, now) {
                break decision;
            }
        };

        if let Admission::Denied { retry_after } = decision {
            tracing::debug!(
                client = %client,
                retry_after_ms = retry_after.as_millis() as u64,
                "Admission denied"
            );
        }

        decision
    }

    /// Current token count for `client`, if tracked.
    pub fn tokens(&self, client: &str) -> Option<f64> {
        self.buckets.get(client).map(|b| b.tokens())
    }

    /// Number of tracked client keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Eviction passes run because the map was full.
    pub fn eviction_passes(&self) -> usize {
        self.eviction_passes.load(Ordering::Relaxed)
    }

    fn bucket_for(&self, client: &str, now: Instant) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(client) {
            return Arc::clone(bucket.value());
        }

        let _guard = self.insert_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Another caller may have created it while we waited.
        if let Some(bucket) = self.buckets.get(client) {
            return Arc::clone(bucket.value());
        }

        // Buckets touched during a pass survive it; go again until there is room.
        while self.buckets.len() >= self.config.max_clients.max(1) {
            self.make_room(now);
        }

        let bucket = Arc::new(TokenBucket::full(self.config.capacity, now));
        self.buckets.insert(client.to_string(), Arc::clone(&bucket));
        tracing::trace!(client = %client, tracked = self.buckets.len(), "Tracking new client");
        bucket
    }

    /// Free a batch of slots in one scan. Caller holds `insert_lock`.
    fn make_room(&self, now: Instant) {
        self.eviction_passes.fetch_add(1, Ordering::Relaxed);

        let ttl = self.config.effective_idle_ttl();
        let mut candidates: Vec<(Instant, String)> = Vec::with_capacity(self.buckets.len());
        let mut idle = 0;
        for entry in self.buckets.iter() {
            let last_seen = entry.value().last_seen();
            if now.saturating_duration_since(last_seen) > ttl {
                idle += 1;
            }
            candidates.push((last_seen, entry.key().clone()));
        }

        let max = self.config.max_clients.max(1);
        let target = max - (max / EVICTION_DIVISOR).max(1);
        let excess = candidates.len().saturating_sub(target).max(idle).min(candidates.len());
        if excess == 0 {
            return;
        }
        if excess < candidates.len() {
            candidates.select_nth_unstable_by_key(excess - 1, |(seen, _)| *seen);
        }

        let mut evicted = 0;
        for (seen, key) in candidates.into_iter().take(excess) {
            // Skip buckets touched since the scan.
            let removed = self
                .buckets
                .remove_if(&key, |_, bucket| bucket.retire_if(|state| state.last_seen <= seen));
            if removed.is_some() {
                evicted += 1;
            }
        }

        tracing::warn!(
            evicted = evicted,
            remaining = self.buckets.len(),
            "Evicted admission state to stay within max_clients"
        );
    }

    /// Drop buckets idle past the configured TTL. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let ttl = self.config.effective_idle_ttl();
        let before = self.buckets.len();

        self.buckets.retain(|_, bucket| {
            !bucket.retire_if(|state| now.saturating_duration_since(state.last_seen) > ttl)
        });

        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            tracing::info!(
                removed = removed,
                remaining = self.buckets.len(),
                "Admission sweep completed"
            );
        }
        removed
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

/// Normalize a peer address into a client key.
///
/// IPv4 clients key on their address. IPv6 clients key on their /64, the
/// smallest block a single host is usually handed. IPv4-mapped IPv6
/// addresses fold back to IPv4. Ports are always dropped.
pub fn client_key(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => {
                let s = v6.segments();
                let prefix = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
                format!("{prefix}/64")
            }
        },
    }
}

/// Spawn a background task that periodically sweeps idle admission state.
pub fn spawn_sweeper(
    controller: Arc<AdmissionController>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Admission sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    controller.sweep(Instant::now());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_first_request_allowed_second_denied() {
        let controller = AdmissionController::default();
        let t0 = Instant::now();

        assert!(controller.check_at("10.0.0.1", t0).is_allowed());
        let denied = controller.check_at("10.0.0.1", t0 + Duration::from_millis(900));
        assert!(!denied.is_allowed());
    }

    #[test]
    fn test_refill_after_interval() {
        let controller = AdmissionController::default();
        let t0 = Instant::now();

        assert!(controller.check_at("10.0.0.1", t0).is_allowed());
        assert!(!controller.check_at("10.0.0.1", t0 + secs(1)).is_allowed());
        assert!(controller.check_at("10.0.0.1", t0 + secs(5)).is_allowed());
        assert!(!controller.check_at("10.0.0.1", t0 + secs(6)).is_allowed());
    }

    #[test]
    fn test_denied_reports_retry_after() {
        let controller = AdmissionController::default();
        let t0 = Instant::now();

        controller.check_at("k", t0);
        let retry = controller
            .check_at("k", t0 + secs(2))
            .retry_after()
            .expect("should be denied");
        assert!(retry > secs(2) && retry <= secs(3), "retry_after = {retry:?}");
    }

    #[test]
    fn test_keys_are_independent() {
        let controller = AdmissionController::default();
        let t0 = Instant::now();

        assert!(controller.check_at("a", t0).is_allowed());
        assert!(controller.check_at("b", t0).is_allowed());
        assert!(!controller.check_at("a", t0).is_allowed());
        assert_eq!(controller.len(), 2);
    }

    #[test]
    fn test_tokens_never_exceed_capacity() {
        let controller = AdmissionController::new(AdmissionConfig {
            capacity: 3,
            ..AdmissionConfig::default()
        });
        let t0 = Instant::now();

        assert!(controller.check_at("k", t0).is_allowed());
        // A long pause must not bank more than capacity.
        controller.check_at("k", t0 + secs(3600));
        let tokens = controller.tokens("k").unwrap();
        assert!((0.0..=3.0).contains(&tokens));
        assert!((tokens - 2.0).abs() < 1e-9);

        assert!(controller.check_at("k", t0 + secs(3600)).is_allowed());
        assert!(controller.check_at("k", t0 + secs(3600)).is_allowed());
        assert!(!controller.check_at("k", t0 + secs(3600)).is_allowed());
        assert!(controller.tokens("k").unwrap() >= 0.0);
    }

    #[test]
    fn test_clock_going_backwards_is_harmless() {
        let controller = AdmissionController::default();
        let t0 = Instant::now() + secs(10);

        assert!(controller.check_at("k", t0).is_allowed());
        assert!(!controller.check_at("k", t0 - secs(5)).is_allowed());
        assert!(controller.check_at("k", t0 + secs(5)).is_allowed());
    }

    #[test]
    fn test_concurrent_flood_admits_one() {
        let controller = Arc::new(AdmissionController::default());
        let now = Instant::now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let controller = Arc::clone(&controller);
                thread::spawn(move || controller.check_at("flood", now).is_allowed())
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(allowed, 1);
        assert_eq!(controller.len(), 1);
    }

    #[test]
    fn test_sweep_drops_idle_buckets() {
        let controller = AdmissionController::new(AdmissionConfig {
            idle_ttl: secs(60),
            ..AdmissionConfig::default()
        });
        let t0 = Instant::now();

        controller.check_at("old", t0);
        controller.check_at("fresh", t0 + secs(50));

        assert_eq!(controller.sweep(t0 + secs(61)), 1);
        assert_eq!(controller.len(), 1);
        assert!(controller.tokens("fresh").is_some());
        assert!(controller.tokens("old").is_none());
    }

    #[test]
    fn test_sweep_never_drops_before_refill() {
        // idle_ttl shorter than a full refill is raised to the refill period.
        let controller = AdmissionController::new(AdmissionConfig {
            idle_ttl: secs(1),
            ..AdmissionConfig::default()
        });
        let t0 = Instant::now();

        controller.check_at("k", t0);
        assert_eq!(controller.sweep(t0 + secs(3)), 0);
        assert!(!controller.check_at("k", t0 + secs(3)).is_allowed());
    }

    #[test]
    fn test_max_clients_bound() {
        let controller = AdmissionController::new(AdmissionConfig {
            max_clients: 4,
            ..AdmissionConfig::default()
        });
        let t0 = Instant::now();

        for i in 0..20u64 {
            controller.check_at(&format!("client-{i}"), t0 + Duration::from_millis(i));
            assert!(controller.len() <= 4);
        }

        // The most recent clients survive eviction.
        assert!(controller.tokens("client-19").is_some());
        assert!(controller.tokens("client-0").is_none());
    }

    #[test]
    fn test_eviction_is_batched_at_capacity() {
        let controller = AdmissionController::new(AdmissionConfig {
            max_clients: 1000,
            ..AdmissionConfig::default()
        });
        let t0 = Instant::now();

        for i in 0..1000u64 {
            controller.check_at(&format!("early-{i}"), t0 + Duration::from_millis(i));
        }
        assert_eq!(controller.len(), 1000);
        assert_eq!(controller.eviction_passes(), 0);

        // A stream of unseen keys at capacity pays one scan per hundred inserts.
        for i in 0..1000u64 {
            controller.check_at(&format!("late-{i}"), t0 + secs(2) + Duration::from_millis(i));
            assert!(controller.len() <= 1000);
        }
        assert!(
            controller.eviction_passes() <= 11,
            "passes = {}",
            controller.eviction_passes()
        );

        assert!(controller.tokens("late-999").is_some());
        assert!(controller.tokens("early-0").is_none());
    }

    #[test]
    fn test_retired_bucket_cannot_admit() {
        let controller = AdmissionController::default();
        let t0 = Instant::now();

        assert!(controller.check_at("k", t0).is_allowed());

        // A caller that fetched the bucket just before a sweep removed it.
        let held = controller.bucket_for("k", t0 + secs(1));
        assert_eq!(controller.sweep(t0 + secs(700)), 1);
        assert!(held.try_acquire(controller.config(), t0 + secs(700)).is_none());

        assert!(controller.check_at("k", t0 + secs(700)).is_allowed());
        assert!(!controller.check_at("k", t0 + secs(701)).is_allowed());
        assert_eq!(controller.len(), 1);
    }

    #[test]
    fn test_into_result() {
        assert!(Admission::Allowed.into_result().is_ok());
        let err = Admission::Denied { retry_after: secs(5) }.into_result().unwrap_err();
        assert!(matches!(err, StashError::RateLimited { retry_after } if retry_after == secs(5)));
    }

    #[test]
    fn test_client_key_normalization() {
        let v4: SocketAddr = "192.168.1.7:51234".parse().unwrap();
        assert_eq!(client_key(&v4), "192.168.1.7");

        let mapped: SocketAddr = "[::ffff:192.168.1.7]:443".parse().unwrap();
        assert_eq!(client_key(&mapped), "192.168.1.7");

        let v6: SocketAddr = "[2001:db8::1]:8080".parse().unwrap();
        assert_eq!(client_key(&v6), "2001:db8::/64");

        // One host rotating through its /64 is still one client.
        let rotated: SocketAddr = "[2001:db8::dead:beef:1:2]:9000".parse().unwrap();
        assert_eq!(client_key(&rotated), client_key(&v6));

        let neighbour: SocketAddr = "[2001:db8:0:1::5]:8080".parse().unwrap();
        assert_eq!(client_key(&neighbour), "2001:db8:0:1::/64");
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let controller = Arc::new(AdmissionController::default());
        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(Arc::clone(&controller), Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
