//! The shared delivery gate.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::headers::RateLimitHeaders;
use crate::route::RouteKey;

const GLOBAL_WINDOW: Duration = Duration::from_secs(1);
const INVALID_WINDOW: Duration = Duration::from_secs(600);
const INVALID_CAP: u32 = 10_000;
const INVALID_WARN_AT: u32 = INVALID_CAP * 8 / 10;

/// Budget of one destination bucket.
#[derive(Debug)]
struct RouteBucket {
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_at: Option<Instant>,
    blocked_until: Option<Instant>,
    last_used: Instant,
}

impl RouteBucket {
    fn new(now: Instant) -> Self {
        Self {
            limit: None,
            remaining: None,
            reset_at: None,
            blocked_until: None,
            last_used: now,
        }
    }

    /// How long a request must wait, or `None` if it may go now.
    fn wait_time(&self, now: Instant) -> Option<Duration> {
        if let Some(until) = self.blocked_until.filter(|u| *u > now) {
            return Some(until - now);
        }
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset)) if reset > now => Some(reset - now),
            _ => None,
        }
    }

    /// Take one request from the budget.
    fn consume(&mut self, now: Instant) {
        if self.reset_at.is_some_and(|r| r <= now) {
            self.remaining = self.limit;
            self.reset_at = None;
        }
        if self.blocked_until.is_some_and(|b| b <= now) {
            self.blocked_until = None;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        self.last_used = now;
    }

    fn apply(&mut self, headers: &RateLimitHeaders, now: Instant) {
        if let Some(limit) = headers.limit {
            self.limit = Some(limit);
        }
        if let Some(remaining) = headers.remaining {
            self.remaining = Some(remaining);
        }
        if let Some(after) = headers.reset_after {
            self.reset_at = Some(now + after);
        }
        self.last_used = now;
    }

    fn block(&mut self, until: Instant, now: Instant) {
        self.remaining = Some(0);
        self.blocked_until = Some(self.blocked_until.map_or(until, |b| b.max(until)));
        self.reset_at = Some(self.reset_at.map_or(until, |r| r.max(until)));
        self.last_used = now;
    }
}

/// Sliding one-second window shared by every route.
#[derive(Debug)]
struct GlobalWindow {
    sent: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl GlobalWindow {
    fn prune(&mut self, now: Instant) {
        while self
            .sent
            .front()
            .is_some_and(|t| now.duration_since(*t) >= GLOBAL_WINDOW)
        {
            self.sent.pop_front();
        }
    }

    fn try_take(&mut self, now: Instant, limit: u32) -> Result<(), Duration> {
        if let Some(until) = self.blocked_until {
            if until > now {
                return Err(until - now);
            }
            self.blocked_until = None;
        }
        self.prune(now);
        if self.sent.len() < limit as usize {
            self.sent.push_back(now);
            return Ok(());
        }
        // Full window: wait for the oldest entry to age out.
        let oldest = self.sent.front().copied().unwrap_or(now);
        Err((oldest + GLOBAL_WINDOW).saturating_duration_since(now))
    }
}

/// 401/403/429 responses counted over a fixed ten-minute window.
#[derive(Debug)]
struct InvalidRequests {
    count: u32,
    window_start: Instant,
}

#[derive(Debug, Default)]
struct Registry {
    routes: HashMap<RouteKey, Arc<Mutex<RouteBucket>>>,
    by_hash: HashMap<String, Arc<Mutex<RouteBucket>>>,
}

/// Snapshot of limiter state for health reports.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub active_buckets: usize,
    pub global_limit: u32,
    /// Requests sent in the last second.
    pub global_rate: usize,
    /// Seconds left on a global block, if any.
    pub global_blocked_secs: Option<f64>,
    pub invalid_requests: u32,
    pub invalid_request_cap: u32,
    pub buckets: Vec<BucketStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    pub route: RouteKey,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Seconds until the route may send again, when it must wait.
    pub wait_secs: Option<f64>,
}

/// Rate limiter shared by all workers.
pub struct RateLimiter {
    global_limit: u32,
    global: Mutex<GlobalWindow>,
    registry: RwLock<Registry>,
    invalid: Mutex<InvalidRequests>,
}

impl RateLimiter {
    pub fn new(global_per_second: u32) -> Self {
        Self {
            global_limit: global_per_second.max(1),
            global: Mutex::new(GlobalWindow {
                sent: VecDeque::new(),
                blocked_until: None,
            }),
            registry: RwLock::new(Registry::default()),
            invalid: Mutex::new(InvalidRequests {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Wait until one request on `route` is allowed, then claim it.
    ///
    /// Route budget and global window must both admit the request at
    /// the moment it is claimed. A global slot taken while the route
    /// became blocked in the meantime is forfeited.
    pub async fn acquire(&self, route: &RouteKey) {
        let bucket = self.bucket(route).await;
        loop {
            let wait = bucket.lock().await.wait_time(Instant::now());
            if let Some(wait) = wait {
                debug!(%route, wait_ms = wait.as_millis() as u64, "route bucket exhausted, waiting");
                sleep(wait).await;
                continue;
            }

            self.take_global_slot().await;

            let mut guard = bucket.lock().await;
            let now = Instant::now();
            if guard.wait_time(now).is_none() {
                guard.consume(now);
                return;
            }
        }
    }

    /// Update the route's bucket from a response's headers.
    pub async fn observe(&self, route: &RouteKey, headers: &HeaderMap) {
        let parsed = RateLimitHeaders::parse(headers);
        if parsed.is_empty() {
            return;
        }
        let bucket = self.resolve(route, parsed.bucket.as_deref()).await;
        bucket.lock().await.apply(&parsed, Instant::now());
    }

    /// Enforce a 429: block the route (or everything, when `global`)
    /// until `retry_after` has elapsed.
    pub async fn on_429(&self, route: &RouteKey, retry_after: Duration, global: bool) {
        let now = Instant::now();
        let until = now + retry_after;
        if global {
            let mut window = self.global.lock().await;
            window.blocked_until = Some(window.blocked_until.map_or(until, |b| b.max(until)));
            warn!(%route, retry_after_ms = retry_after.as_millis() as u64, "global rate limit hit");
        } else {
            warn!(%route, retry_after_ms = retry_after.as_millis() as u64, "route rate limited");
        }
        // The route itself is blocked in both cases.
        self.bucket(route).await.lock().await.block(until, now);
    }

    /// Count 401/403/429 responses against the invalid-request cap.
    pub async fn record_status(&self, status: u16) {
        if !matches!(status, 401 | 403 | 429) {
            return;
        }
        let mut invalid = self.invalid.lock().await;
        let now = Instant::now();
        if now.duration_since(invalid.window_start) >= INVALID_WINDOW {
            invalid.count = 0;
            invalid.window_start = now;
        }
        invalid.count += 1;
        if invalid.count == INVALID_WARN_AT + 1 {
            warn!(
                count = invalid.count,
                cap = INVALID_CAP,
                "invalid request count approaching cap"
            );
        }
    }

    /// Drop buckets unused for at least `idle`. Returns how many routes
    /// were evicted.
    pub async fn evict_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut registry = self.registry.write().await;
        let before = registry.routes.len();
        registry.routes.retain(|_, bucket| match bucket.try_lock() {
            Ok(b) => now.duration_since(b.last_used) < idle,
            // In use right now.
            Err(_) => true,
        });
        let Registry { routes, by_hash } = &mut *registry;
        by_hash.retain(|_, shared| routes.values().any(|b| Arc::ptr_eq(b, shared)));
        let evicted = before - routes.len();
        if evicted > 0 {
            debug!(evicted, "idle rate-limit buckets evicted");
        }
        evicted
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let (global_rate, global_blocked_secs) = {
            let mut window = self.global.lock().await;
            window.prune(now);
            let blocked = window
                .blocked_until
                .filter(|u| *u > now)
                .map(|u| (u - now).as_secs_f64());
            (window.sent.len(), blocked)
        };
        let invalid_requests = {
            let invalid = self.invalid.lock().await;
            if now.duration_since(invalid.window_start) >= INVALID_WINDOW {
                0
            } else {
                invalid.count
            }
        };

        let registry = self.registry.read().await;
        let mut buckets = Vec::with_capacity(registry.routes.len());
        for (route, bucket) in &registry.routes {
            let Ok(b) = bucket.try_lock() else { continue };
            buckets.push(BucketStats {
                route: route.clone(),
                limit: b.limit,
                remaining: b.remaining,
                wait_secs: b.wait_time(now).map(|w| w.as_secs_f64()),
            });
        }
        buckets.sort_by(|a, b| a.route.cmp(&b.route));

        RateLimiterStats {
            active_buckets: registry.routes.len(),
            global_limit: self.global_limit,
            global_rate,
            global_blocked_secs,
            invalid_requests,
            invalid_request_cap: INVALID_CAP,
            buckets,
        }
    }

    async fn take_global_slot(&self) {
        loop {
            let wait = {
                let mut window = self.global.lock().await;
                match window.try_take(Instant::now(), self.global_limit) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            debug!(wait_ms = wait.as_millis() as u64, "global rate window full, waiting");
            sleep(wait).await;
        }
    }

    /// The bucket currently serving `route`, created on first use.
    async fn bucket(&self, route: &RouteKey) -> Arc<Mutex<RouteBucket>> {
        if let Some(bucket) = self.registry.read().await.routes.get(route) {
            return bucket.clone();
        }
        self.registry
            .write()
            .await
            .routes
            .entry(route.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RouteBucket::new(Instant::now()))))
            .clone()
    }

    /// Like [`bucket`](Self::bucket), but re-points the route at the
    /// server-named bucket once one is reported.
    async fn resolve(&self, route: &RouteKey, hash: Option<&str>) -> Arc<Mutex<RouteBucket>> {
        let Some(hash) = hash else {
            return self.bucket(route).await;
        };
        let mut registry = self.registry.write().await;
        let current = registry
            .routes
            .entry(route.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RouteBucket::new(Instant::now()))))
            .clone();
        match registry.by_hash.get(hash).cloned() {
            Some(shared) if !Arc::ptr_eq(&shared, &current) => {
                debug!(%route, bucket = hash, "route joined shared bucket");
                registry.routes.insert(route.clone(), shared.clone());
                shared
            }
            Some(shared) => shared,
            None => {
                registry.by_hash.insert(hash.to_string(), current.clone());
                current
            }
        }
    }
}
