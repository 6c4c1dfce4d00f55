//! # IP Admission
//!
//! Pre-dispatch accept/reject decisions keyed by client address.
//!
//! The store holds a whitelist (exact addresses and CIDR blocks, resolved
//! eagerly at registration), a ban map, and an ordered chain of pluggable
//! [`Criterion`] policies. `check` runs at accept time and wherever the
//! embedding service wants per-request policing.
//!
//! ## Decision order
//! 1. Whitelisted addresses pass unconditionally and are never banned.
//! 2. Criteria run in registration order; the first violation bans the
//!    address for the configured default duration and stops the chain.
//! 3. A live ban fails the check with a forbidden disposition.
//!
//! ## Lock discipline
//! The criterion chain and whitelist are mutable only while the store is
//! unlocked. The store locks itself at the first `check`; registration
//! afterwards fails rather than racing the accept path.

pub mod criterion;
pub mod rate_limit;

pub use criterion::Criterion;
pub use rate_limit::RateLimiter;

use crate::config::AdmissionConfig;
use crate::error::{Error, Result};
use crate::utils::metrics::global_metrics;
use crate::utils::time::unix_millis;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// An active ban. A record exists iff the address is currently banned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRecord {
    pub address: IpAddr,
    /// Unix milliseconds at which the ban lapses.
    pub expires_at_ms: i64,
    /// Whether the ban came from an explicit `try_ban` rather than a
    /// criterion violation.
    pub is_explicit: bool,
}

/// An eagerly-parsed CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CidrBlock {
    network: u128,
    prefix: u8,
    is_v6: bool,
}

impl CidrBlock {
    fn parse(text: &str) -> Result<Self> {
        let (addr_part, prefix_part) = text
            .split_once('/')
            .ok_or_else(|| Error::InvalidAddress(text.to_string()))?;
        let addr = parse_ip(addr_part)?;
        let prefix: u8 = prefix_part
            .parse()
            .map_err(|_| Error::InvalidAddress(text.to_string()))?;

        let (bits, max_prefix, is_v6) = match addr {
            IpAddr::V4(v4) => (u128::from(u32::from(v4)) << 96, 32, false),
            IpAddr::V6(v6) => (u128::from(v6), 128, true),
        };
        if prefix > max_prefix {
            return Err(Error::InvalidAddress(text.to_string()));
        }

        Ok(Self {
            network: bits & Self::mask(prefix, is_v6),
            prefix,
            is_v6,
        })
    }

    fn mask(prefix: u8, is_v6: bool) -> u128 {
        let width: u32 = if is_v6 { 128 } else { 32 };
        let host_bits = width - u32::from(prefix);
        let base = if prefix == 0 {
            0
        } else {
            u128::MAX << host_bits << (128 - width)
        };
        if is_v6 {
            base
        } else {
            // IPv4 bits live in the top 32 of the u128.
            base & (u128::from(u32::MAX) << 96)
        }
    }

    fn contains(&self, addr: IpAddr) -> bool {
        let (bits, is_v6) = match addr {
            IpAddr::V4(v4) => (u128::from(u32::from(v4)) << 96, false),
            IpAddr::V6(v6) => (u128::from(v6), true),
        };
        if is_v6 != self.is_v6 {
            return false;
        }
        bits & Self::mask(self.prefix, self.is_v6) == self.network
    }
}

/// Parse a dotted IPv4, plain IPv6, or bracketed IPv6 address.
fn parse_ip(text: &str) -> Result<IpAddr> {
    let trimmed = text
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(text);
    trimmed
        .parse::<IpAddr>()
        .map_err(|_| Error::InvalidAddress(text.to_string()))
}

/// Whitelist, ban map, and criterion chain behind one concurrency-safe
/// facade.
pub struct AdmissionStore {
    whitelist: RwLock<HashSet<IpAddr>>,
    whitelist_cidrs: RwLock<Vec<CidrBlock>>,
    bans: RwLock<HashMap<IpAddr, BanRecord>>,
    criteria: RwLock<Vec<Arc<dyn Criterion>>>,
    locked: AtomicBool,
    ban_time: Duration,
}

impl AdmissionStore {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            whitelist: RwLock::new(HashSet::new()),
            whitelist_cidrs: RwLock::new(Vec::new()),
            bans: RwLock::new(HashMap::new()),
            criteria: RwLock::new(Vec::new()),
            locked: AtomicBool::new(false),
            ban_time: config.ban_time(),
        }
    }

    /// Append a criterion to the chain. Fails once the store is locked.
    pub fn register_criterion(&self, criterion: Arc<dyn Criterion>) -> Result<()> {
        if self.locked.load(Ordering::Acquire) {
            return Err(Error::AdmissionLocked);
        }
        let mut criteria = self
            .criteria
            .write()
            .map_err(|_| Error::Config("criterion chain lock poisoned".into()))?;
        info!(criterion = criterion.name(), "Admission criterion registered");
        criteria.push(criterion);
        Ok(())
    }

    /// Add an exact address or CIDR block to the whitelist, resolved
    /// eagerly. Fails once the store is locked.
    pub fn add_to_whitelist(&self, entry: &str) -> Result<()> {
        if self.locked.load(Ordering::Acquire) {
            return Err(Error::AdmissionLocked);
        }
        if entry.contains('/') {
            let block = CidrBlock::parse(entry)?;
            if let Ok(mut cidrs) = self.whitelist_cidrs.write() {
                cidrs.push(block);
            }
        } else {
            let addr = parse_ip(entry)?;
            if let Ok(mut whitelist) = self.whitelist.write() {
                whitelist.insert(addr);
            }
        }
        Ok(())
    }

    /// Whether `addr` is whitelisted exactly or by CIDR membership.
    pub fn is_whitelisted(&self, addr: IpAddr) -> bool {
        if self
            .whitelist
            .read()
            .map(|w| w.contains(&addr))
            .unwrap_or(false)
        {
            return true;
        }
        self.whitelist_cidrs
            .read()
            .map(|cidrs| cidrs.iter().any(|c| c.contains(addr)))
            .unwrap_or(false)
    }

    /// Whether `addr` has a live ban.
    pub fn is_banned(&self, addr: IpAddr) -> bool {
        self.bans
            .read()
            .map(|bans| {
                bans.get(&addr)
                    .is_some_and(|ban| ban.expires_at_ms > unix_millis())
            })
            .unwrap_or(false)
    }

    /// Run the admission decision for `addr`.
    ///
    /// The first call locks the store's configuration. Whitelisted
    /// addresses short-circuit; otherwise every criterion is evaluated in
    /// order, a violation bans the address, and a live ban is forbidden.
    pub async fn check(&self, addr: IpAddr) -> Result<()> {
        self.locked.store(true, Ordering::Release);

        if self.is_whitelisted(addr) {
            return Ok(());
        }

        let chain: Vec<Arc<dyn Criterion>> = self
            .criteria
            .read()
            .map(|criteria| criteria.clone())
            .unwrap_or_default();
        for criterion in chain {
            if criterion.validate(addr).await {
                warn!(%addr, criterion = criterion.name(), "Criterion violation, banning");
                self.insert_ban(addr, false, unix_millis() + self.ban_time.as_millis() as i64);
                break;
            }
        }

        if self.is_banned(addr) {
            global_metrics().admission_rejection();
            return Err(Error::Forbidden(addr));
        }
        Ok(())
    }

    /// Upsert a ban for `addr`. `until_ms` defaults to now plus the
    /// configured ban time. Returns `false` for whitelisted addresses,
    /// which are never banned.
    pub fn try_ban(&self, addr: IpAddr, explicit: bool, until_ms: Option<i64>) -> bool {
        if self.is_whitelisted(addr) {
            return false;
        }
        let expires = until_ms.unwrap_or_else(|| unix_millis() + self.ban_time.as_millis() as i64);
        self.insert_ban(addr, explicit, expires);
        true
    }

    fn insert_ban(&self, addr: IpAddr, is_explicit: bool, expires_at_ms: i64) {
        if let Ok(mut bans) = self.bans.write() {
            bans.insert(
                addr,
                BanRecord {
                    address: addr,
                    expires_at_ms,
                    is_explicit,
                },
            );
            global_metrics().ban_issued();
        }
    }

    /// Remove a ban and clear criterion state for `addr`. Returns whether a
    /// record was removed.
    pub fn try_unban(&self, addr: IpAddr) -> bool {
        let removed = self
            .bans
            .write()
            .map(|mut bans| bans.remove(&addr).is_some())
            .unwrap_or(false);
        if let Ok(criteria) = self.criteria.read() {
            for criterion in criteria.iter() {
                criterion.clear(addr);
            }
        }
        if removed {
            debug!(%addr, "Ban removed");
        }
        removed
    }

    /// Remove expired bans and ask every criterion to drop stale state.
    /// Returns the number of bans purged.
    pub fn purge(&self) -> usize {
        let now = unix_millis();
        let purged = self
            .bans
            .write()
            .map(|mut bans| {
                let before = bans.len();
                bans.retain(|_, ban| ban.expires_at_ms > now);
                before - bans.len()
            })
            .unwrap_or(0);
        if let Ok(criteria) = self.criteria.read() {
            for criterion in criteria.iter() {
                criterion.purge_stale();
            }
        }
        if purged > 0 {
            debug!(purged, "Expired bans purged");
        }
        purged
    }

    /// Number of ban records currently held, expired or not.
    pub fn ban_count(&self) -> usize {
        self.bans.read().map(|b| b.len()).unwrap_or(0)
    }

    /// Snapshot of the ban record for `addr`, if any.
    pub fn ban_record(&self, addr: IpAddr) -> Option<BanRecord> {
        self.bans.read().ok()?.get(&addr).cloned()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Spawn the periodic purge task. Runs until aborted.
    pub fn spawn_purge(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                store.purge();
            }
        })
    }
}

impl std::fmt::Debug for AdmissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionStore")
            .field("locked", &self.is_locked())
            .field("bans", &self.ban_count())
            .finish_non_exhaustive()
    }
}
