//! Sliding-window rate limiter criterion with lockout.
//!
//! Tracks request timestamps per address in a bounded window. Exceeding
//! `max_requests` inside the window locks the address out for
//! `lockout_seconds`; validations during the lockout keep reporting a
//! violation without touching the window.
//!
//! Eviction is strict: timestamps older than `now - window` leave the
//! deque before the current request is counted, and the current request is
//! appended before the threshold comparison, so the count always includes
//! the request being judged.

use crate::admission::criterion::Criterion;
use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::utils::time::unix_millis;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct AddrWindow {
    hits: VecDeque<i64>,
    locked_until_ms: i64,
}

/// Per-IP sliding-window request counter.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window_ms: i64,
    lockout_ms: i64,
    windows: Mutex<HashMap<IpAddr, AddrWindow>>,
}

impl RateLimiter {
    /// Build a limiter from configuration, validating its invariants.
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(Error::Config(errors.join("; ")));
        }
        Ok(Self {
            max_requests: config.max_requests,
            window_ms: config.window_ms as i64,
            lockout_ms: (config.lockout_seconds * 1000) as i64,
            windows: Mutex::new(HashMap::new()),
        })
    }

    /// Judge one request from `addr` at clock reading `now_ms`.
    ///
    /// Returns `true` on violation. Split out from [`Criterion::validate`]
    /// so tests can drive a synthetic clock.
    pub fn validate_at(&self, addr: IpAddr, now_ms: i64) -> bool {
        let Ok(mut windows) = self.windows.lock() else {
            return false;
        };
        let window = windows.entry(addr).or_default();

        if window.locked_until_ms > now_ms {
            return true;
        }

        let horizon = now_ms - self.window_ms;
        while window.hits.front().is_some_and(|&ts| ts < horizon) {
            window.hits.pop_front();
        }
        window.hits.push_back(now_ms);

        if window.hits.len() > self.max_requests {
            window.locked_until_ms = now_ms + self.lockout_ms;
            debug!(
                %addr,
                hits = window.hits.len(),
                lockout_ms = self.lockout_ms,
                "Rate limit breached, locking out"
            );
            return true;
        }

        false
    }

    /// Number of addresses currently tracked.
    pub fn tracked_addresses(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn purge_stale_at(&self, now_ms: i64) {
        let Ok(mut windows) = self.windows.lock() else {
            return;
        };
        let horizon = now_ms - self.window_ms;
        windows.retain(|_, window| {
            window.hits.iter().any(|&ts| ts >= horizon) || window.locked_until_ms > now_ms
        });
    }
}

#[async_trait]
impl Criterion for RateLimiter {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn validate(&self, addr: IpAddr) -> bool {
        self.validate_at(addr, unix_millis())
    }

    fn clear(&self, addr: IpAddr) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.remove(&addr);
        }
    }

    fn purge_stale(&self) {
        self.purge_stale_at(unix_millis());
    }
}
