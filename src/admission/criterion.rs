//! Pluggable admission criteria.
//!
//! A criterion judges whether an address violates a policy. The admission
//! store holds an ordered chain of criteria and evaluates them in
//! registration order on every check; the first violation bans the address
//! and stops the chain.

use async_trait::async_trait;
use std::net::IpAddr;

/// A policy evaluated against each requesting address.
///
/// `validate` is awaitable so criteria may consult external state; the
/// built-in rate limiter resolves immediately.
#[async_trait]
pub trait Criterion: Send + Sync {
    /// Short name used in logs and violation events.
    fn name(&self) -> &'static str;

    /// Returns `true` when `addr` violates this criterion.
    async fn validate(&self, addr: IpAddr) -> bool;

    /// Forget all state held for `addr` (called on unban).
    fn clear(&self, addr: IpAddr);

    /// Drop per-address state that can no longer affect a decision.
    fn purge_stale(&self);
}
