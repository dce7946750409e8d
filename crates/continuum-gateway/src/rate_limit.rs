//! Per-identity sliding-window rate limiting
//!
//! Every identity owns an independently locked window cell inside a sharded
//! map, so admissions for unrelated identities never contend on one lock.
//! Windows are pruned lazily on access; there is no background sweep.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::identity::{Identity, IdentityId, Quota};

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    RateLimited { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }

    /// Retry hint rounded up to whole seconds, never zero.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Admission::Admitted => None,
            Admission::RateLimited { retry_after } => {
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                Some(secs.max(1))
            }
        }
    }
}

/// Admission instants that are still inside the window, oldest first
#[derive(Debug, Default)]
struct SlidingWindow {
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_admit(&mut self, now: Instant, quota: Quota) -> Admission {
        self.prune(now, quota.window);

        if self.admitted.len() < quota.count as usize {
            self.admitted.push_back(now);
            return Admission::Admitted;
        }

        // Full window: the slot frees up when the oldest admission ages out.
        let retry_after = self
            .admitted
            .front()
            .map(|oldest| quota.window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(quota.window);
        Admission::RateLimited { retry_after }
    }

    fn in_window(&self, now: Instant, window: Duration) -> usize {
        self.admitted
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < window)
            .count()
    }
}

/// Rate limiter shared by every in-flight request
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<IdentityId, Arc<Mutex<SlidingWindow>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one request for `identity` now.
    pub fn admit(&self, identity: &Identity) -> Admission {
        self.admit_at(identity, Instant::now())
    }

    /// Admit one request for `identity` at a given instant.
    pub fn admit_at(&self, identity: &Identity, now: Instant) -> Admission {
        let cell = self.cell(&identity.id);
        // Check-and-record is one critical section for this identity only.
        let decision = cell.lock().try_admit(now, identity.quota);

        if let Admission::RateLimited { retry_after } = decision {
            tracing::warn!(
                identity = %identity.name,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }
        decision
    }

    /// `(admitted in current window, quota count)` for an identity.
    pub fn status(&self, identity: &Identity) -> (u32, u32) {
        let used = self
            .windows
            .get(&identity.id)
            .map(|cell| cell.lock().in_window(Instant::now(), identity.quota.window))
            .unwrap_or(0);
        (used as u32, identity.quota.count)
    }

    /// Number of identities with counter state.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    fn cell(&self, id: &IdentityId) -> Arc<Mutex<SlidingWindow>> {
        if let Some(cell) = self.windows.get(id) {
            return Arc::clone(cell.value());
        }
        Arc::clone(self.windows.entry(id.clone()).or_default().value())
    }
}
