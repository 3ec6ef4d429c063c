//! Built-in recovery strategies
//!
//! Each constructor returns a ready [`Strategy`] wired to a host-supplied
//! handle: caches that can shed memory, the shared concurrency limiter,
//! restartable components and the error tracker.

use super::{action_fn, ActionReport, RecoveryAction, Strategy};
use crate::resource::{ConcurrencyLimiter, Domain, ErrorKind, ErrorTracker, Snapshot, Status};
use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Something holding memory it can give back on request.
#[async_trait::async_trait]
pub trait Reclaimable: Send + Sync {
    fn name(&self) -> &str;

    /// Release what can be released at `pressure`. Returns bytes freed.
    async fn reclaim(&self, pressure: Status) -> anyhow::Result<u64>;
}

/// A component that can be torn down and brought back, such as a model
/// runtime or a worker pool.
#[async_trait::async_trait]
pub trait Restartable: Send + Sync {
    fn name(&self) -> &str;

    async fn restart(&self) -> anyhow::Result<()>;
}

struct ReclaimCaches {
    caches: Vec<Arc<dyn Reclaimable>>,
}

#[async_trait::async_trait]
impl RecoveryAction for ReclaimCaches {
    async fn run(&self, snapshot: &Snapshot) -> anyhow::Result<ActionReport> {
        if self.caches.is_empty() {
            bail!("no reclaimable caches registered");
        }

        let mut freed = 0u64;
        let mut failed = Vec::new();
        for cache in &self.caches {
            match cache.reclaim(snapshot.status).await {
                Ok(bytes) => {
                    debug!(cache = cache.name(), bytes, "Cache reclaimed");
                    freed += bytes;
                }
                Err(e) => failed.push(format!("{}: {:#}", cache.name(), e)),
            }
        }

        if failed.len() == self.caches.len() {
            bail!("every cache failed to reclaim ({})", failed.join("; "));
        }
        let report = ActionReport::released(freed as f64);
        Ok(if failed.is_empty() {
            report
        } else {
            report.with_detail(format!("partial: {}", failed.join("; ")))
        })
    }
}

/// Ask every cache to shed memory once `memory` reaches warning.
pub fn reclaim_caches(caches: Vec<Arc<dyn Reclaimable>>) -> Strategy {
    Strategy::builder("reclaim-caches", ReclaimCaches { caches })
        .description("Release memory held by in-process caches")
        .domain(Domain::Memory)
        .min_status(Status::Warning)
        .priority(10)
        .cooldown(Duration::from_secs(30))
        .build()
}

/// Halve the shared concurrency limit when connections or CPU turn critical.
/// The monitor steps the limit back up while the domain reads normal.
pub fn shrink_concurrency(limiter: Arc<ConcurrencyLimiter>) -> Strategy {
    let action = action_fn(move |_snapshot: Snapshot| {
        let limiter = Arc::clone(&limiter);
        async move {
            let removed = limiter.shrink();
            if removed == 0 {
                bail!("concurrency already at its floor of {}", limiter.limit());
            }
            Ok(ActionReport::released(removed as f64)
                .with_detail(format!("limit now {}", limiter.limit())))
        }
    });
    Strategy::builder("shrink-concurrency", action)
        .description("Reduce the number of concurrent operations")
        .domains([Domain::Connections, Domain::Cpu])
        .min_status(Status::Critical)
        .priority(20)
        .cooldown(Duration::from_secs(60))
        .build()
}

/// Restart `component` when the `kind` error channel turns critical.
pub fn restart_component(kind: ErrorKind, component: Arc<dyn Restartable>) -> Strategy {
    let name = format!("restart-{}", component.name());
    let action = action_fn(move |_snapshot: Snapshot| restart(Arc::clone(&component)));
    Strategy::builder(name, action)
        .description("Restart the component behind a failing error channel")
        .domain(Domain::Errors(kind))
        .min_status(Status::Critical)
        .priority(20)
        .cooldown(Duration::from_secs(120))
        .build()
}

async fn restart(component: Arc<dyn Restartable>) -> anyhow::Result<ActionReport> {
    component
        .restart()
        .await
        .with_context(|| format!("restarting {}", component.name()))?;
    info!(component = component.name(), "Component restarted");
    Ok(ActionReport::default().with_detail(format!("{} restarted", component.name())))
}

/// Clear the `kind` error window once it is exhausted, so a recovered
/// component is not judged on errors from before its recovery.
pub fn reset_error_window(kind: ErrorKind, tracker: Arc<ErrorTracker>) -> Strategy {
    let action = action_fn(move |_snapshot: Snapshot| {
        let tracker = Arc::clone(&tracker);
        async move {
            let dropped = tracker.reset(kind);
            Ok(ActionReport::released(dropped as f64))
        }
    });
    Strategy::builder(format!("reset-{}-window", kind.as_str()), action)
        .description("Forget windowed errors after the channel has been handled")
        .domain(Domain::Errors(kind))
        .min_status(Status::Exhausted)
        .priority(30)
        .cooldown(Duration::from_secs(60))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ErrorEvent, ResourceStats};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Cache {
        name: &'static str,
        bytes: Option<u64>,
    }

    #[async_trait::async_trait]
    impl Reclaimable for Cache {
        fn name(&self) -> &str {
            self.name
        }
        async fn reclaim(&self, _pressure: Status) -> anyhow::Result<u64> {
            self.bytes.context("cache locked")
        }
    }

    fn cache(name: &'static str, bytes: Option<u64>) -> Arc<dyn Reclaimable> {
        Arc::new(Cache { name, bytes })
    }

    struct Component {
        restarts: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Restartable for Component {
        fn name(&self) -> &str {
            "model-runtime"
        }
        async fn restart(&self) -> anyhow::Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn snapshot(domain: Domain, status: Status) -> Snapshot {
        Snapshot::measured(domain, ResourceStats::new(90.0, 100.0, "units")).classified(status)
    }

    #[tokio::test]
    async fn test_reclaim_caches_sums_released_bytes() {
        let strategy = reclaim_caches(vec![
            cache("thumbnails", Some(1024)),
            cache("embeddings", Some(2048)),
        ]);
        assert!(strategy.is_triggered(&snapshot(Domain::Memory, Status::Warning)));
        let report = strategy
            .action()
            .run(&snapshot(Domain::Memory, Status::Warning))
            .await
            .unwrap();
        assert_eq!(report.amount_released, 3072.0);
        assert!(report.detail.is_none());
    }

    #[tokio::test]
    async fn test_reclaim_caches_partial_and_total_failure() {
        let partial = reclaim_caches(vec![
            cache("a", Some(10)),
            cache("b", None),
        ]);
        let report = partial
            .action()
            .run(&snapshot(Domain::Memory, Status::Critical))
            .await
            .unwrap();
        assert_eq!(report.amount_released, 10.0);
        assert!(report.detail.unwrap().contains("b: cache locked"));

        let broken = reclaim_caches(vec![cache("b", None)]);
        assert!(broken
            .action()
            .run(&snapshot(Domain::Memory, Status::Critical))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_shrink_concurrency_until_floor() {
        let limiter = Arc::new(ConcurrencyLimiter::new(4, 2));
        let strategy = shrink_concurrency(Arc::clone(&limiter));
        let snap = snapshot(Domain::Connections, Status::Critical);
        assert!(!strategy.is_triggered(&snapshot(Domain::Connections, Status::Warning)));
        assert!(strategy.is_triggered(&snapshot(Domain::Cpu, Status::Critical)));

        let report = strategy.action().run(&snap).await.unwrap();
        assert_eq!(report.amount_released, 2.0);
        assert_eq!(limiter.limit(), 2);
        assert!(strategy.action().run(&snap).await.is_err());
    }

    #[tokio::test]
    async fn test_restart_component() {
        let component = Arc::new(Component {
            restarts: AtomicU32::new(0),
        });
        let strategy = restart_component(ErrorKind::AiService, component.clone());
        assert_eq!(strategy.name, "restart-model-runtime");
        let snap = snapshot(Domain::Errors(ErrorKind::AiService), Status::Critical);
        assert!(strategy.is_triggered(&snap));
        strategy.action().run(&snap).await.unwrap();
        assert_eq!(component.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_error_window_only_when_exhausted() {
        let tracker = Arc::new(ErrorTracker::new(Duration::from_secs(60), 4));
        for _ in 0..4 {
            tracker.record(&ErrorEvent::new(ErrorKind::Network, "refused"));
        }
        let strategy = reset_error_window(ErrorKind::Network, Arc::clone(&tracker));
        let domain = Domain::Errors(ErrorKind::Network);
        assert!(!strategy.is_triggered(&snapshot(domain, Status::Critical)));

        let report = strategy
            .action()
            .run(&snapshot(domain, Status::Exhausted))
            .await
            .unwrap();
        assert_eq!(report.amount_released, 4.0);
        assert_eq!(tracker.count(ErrorKind::Network), 0);
    }
}
