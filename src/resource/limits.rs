//! Adaptive concurrency limit shared by the host's workers

use super::{Domain, ResourceStats, ResourceStatsProvider};
use crate::errors::ResourceError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Slot limiter that recovery strategies can tighten under pressure.
///
/// The limiter reports `in_flight / base` as the `connections` domain, so
/// shrinking the live limit lowers the ratio as work drains instead of
/// inflating it.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    base: usize,
    min: usize,
    limit: AtomicUsize,
    in_flight: AtomicUsize,
}

impl ConcurrencyLimiter {
    pub fn new(base: usize, min: usize) -> Self {
        let base = base.max(1);
        let min = min.clamp(1, base);
        Self {
            base,
            min,
            limit: AtomicUsize::new(base),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Try to take a slot
    pub fn try_acquire(self: &Arc<Self>) -> Result<SlotPermit, ResourceError> {
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            let limit = self.limit.load(Ordering::SeqCst);
            if current >= limit {
                return Err(ResourceError::Unavailable(format!(
                    "concurrency limit reached ({} of {})",
                    current, limit
                )));
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }

        Ok(SlotPermit {
            limiter: Arc::clone(self),
        })
    }

    /// Halve the live limit (never below the floor). Returns slots removed.
    pub fn shrink(&self) -> usize {
        let mut removed = 0;
        let _ = self
            .limit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |limit| {
                let next = (limit / 2).max(self.min);
                removed = limit - next;
                Some(next)
            });
        if removed > 0 {
            info!(removed, limit = self.limit(), "Concurrency limit reduced");
        }
        removed
    }

    /// Step the live limit back toward base by one slot. Returns slots added.
    pub fn relax(&self) -> usize {
        let mut added = 0;
        let _ = self
            .limit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |limit| {
                let next = (limit + 1).min(self.base);
                added = next - limit;
                Some(next)
            });
        if added > 0 {
            debug!(limit = self.limit(), "Concurrency limit relaxed");
        }
        added
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held slot; released on drop.
#[derive(Debug)]
pub struct SlotPermit {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[async_trait::async_trait]
impl ResourceStatsProvider for ConcurrencyLimiter {
    fn domain(&self) -> Domain {
        Domain::Connections
    }

    async fn stats(&self) -> Result<ResourceStats, ResourceError> {
        Ok(
            ResourceStats::new(self.in_flight() as f64, self.base as f64, "connections")
                .with_meta("limit", self.limit()),
        )
    }
}
