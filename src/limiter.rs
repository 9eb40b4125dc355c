//! Per-client token-bucket admission control.
//!
//! Buckets are created lazily on first sight of an identity with a burst of
//! twice the configured rate, refilled continuously at the configured rate,
//! and dropped a fixed five minutes after creation regardless of activity.
//! Each identity's bucket is mutated under its `DashMap` shard lock, so
//! concurrent calls for one identity are serialised while different
//! identities proceed in parallel.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::extract::ConnectInfo;
use axum::http::{Extensions, HeaderMap};
use dashmap::DashMap;

/// Lifetime of a bucket, counted from creation.
pub const BUCKET_TTL: Duration = Duration::from_secs(5 * 60);
/// Cadence of the background expiry sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allowed,
    Limited { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    created_at: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            created_at: now,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= BUCKET_TTL
    }
}

pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    /// `rate` is in requests per second; the burst capacity is `2 * rate`.
    pub fn new(rate: u32) -> Self {
        let rate = f64::from(rate);
        Self {
            rate,
            capacity: rate * 2.0,
            buckets: DashMap::new(),
        }
    }

    /// Withdraws one token for `identity`, returning whether it was available.
    pub fn allow(&self, identity: &str) -> bool {
        self.check(identity).is_allowed()
    }

    pub fn check(&self, identity: &str) -> Admission {
        self.check_at(identity, Instant::now())
    }

    pub(crate) fn check_at(&self, identity: &str, now: Instant) -> Admission {
        let mut bucket = self
            .buckets
            .entry(identity.to_owned())
            .or_insert_with(|| Bucket::full(self.capacity, now));

        if bucket.expired(now) {
            *bucket = Bucket::full(self.capacity, now);
        }

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Admission::Allowed
        } else {
            let deficit = 1.0 - bucket.tokens;
            let wait = if self.rate > 0.0 {
                deficit / self.rate
            } else {
                BUCKET_TTL.as_secs_f64()
            };
            Admission::Limited {
                retry_after: Duration::from_secs_f64(wait),
            }
        }
    }

    /// Drops every bucket older than [`BUCKET_TTL`].
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.expired(now));
        before.saturating_sub(self.buckets.len())
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    /// Runs [`RateLimiter::sweep`] every `every` until the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let evicted = limiter.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, tracked = limiter.tracked(), "rate limiter sweep");
                }
            }
        })
    }
}

/// Identity used to key rate-limit state: the `X-Forwarded-For` header
/// verbatim when present, otherwise the peer IP (port excluded, so one
/// client opening many connections shares a bucket).
pub fn client_identity(headers: &HeaderMap, extensions: &Extensions) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
