//! Rate limiting for password logins.
//!
//! Password attempts are limited per claimed username, so guessing against
//! one account cannot lock out everyone else.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

const DEFAULT_PER_SECOND: u32 = 1;
const DEFAULT_BURST: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("too many login attempts for {0:?}")]
pub struct RateLimited(pub String);

/// Per-user limiter for password logins.
#[derive(Clone)]
pub struct LoginRateLimiter {
    limiter: Arc<RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>>,
}

impl std::fmt::Debug for LoginRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRateLimiter")
            .field("tracked_users", &self.limiter.len())
            .finish()
    }
}

impl LoginRateLimiter {
    /// Allow `per_second` sustained attempts per user with bursts of
    /// `burst`. Zero falls back to the defaults.
    pub fn new(per_second: u32, burst: u32) -> Self {
        let per_second = NonZeroU32::new(per_second)
            .or(NonZeroU32::new(DEFAULT_PER_SECOND))
            .unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst)
            .or(NonZeroU32::new(DEFAULT_BURST))
            .unwrap_or(NonZeroU32::MIN);

        let quota = Quota::per_second(per_second).allow_burst(burst);
        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    pub fn check(&self, user: &str) -> Result<(), RateLimited> {
        self.limiter.check_key(&user.to_string()).map_err(|_| {
            tracing::warn!(%user, "password login rate limit exceeded");
            RateLimited(user.to_string())
        })
    }

    /// Forget users whose buckets have refilled.
    pub fn shrink(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }
}

impl Default for LoginRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PER_SECOND, DEFAULT_BURST)
    }
}
