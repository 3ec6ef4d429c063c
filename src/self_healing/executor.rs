//! Recovery Executor
//!
//! Runs the applicable strategies for one domain as a single cycle. At most
//! one cycle per domain is in flight: a second non-forced call is rejected
//! with `BUSY`, a forced call waits for the guard and runs after it.

use super::panic_message;
use super::registry::{ApplicableStrategy, StrategyRegistry};
use crate::config::MonitorConfig;
use crate::errors::CycleRejected;
use crate::history::{HistoryEntry, HistoryStore};
use crate::observability::{LogLevel, LogSink};
use crate::resource::{Domain, Snapshot};
use crate::supervision::events::{EventBus, MonitorEvent};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Retry and throttle policy shared by every cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    /// Total attempts per strategy, including the first
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub min_inter_cycle_interval: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            min_inter_cycle_interval: Duration::from_secs(60),
        }
    }
}

impl From<&MonitorConfig> for RecoveryPolicy {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            min_inter_cycle_interval: config.min_inter_cycle_interval(),
        }
    }
}

/// Result of one strategy's attempt sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub strategy: String,
    pub domain: Domain,
    pub success: bool,
    pub amount_released: f64,
    /// Wall time across all attempts, retry delays included
    pub duration_ms: u64,
    pub attempts: u32,
    /// Last error, only when every attempt failed
    pub error: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A strategy left out of a cycle because it was cooling down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedStrategy {
    pub strategy: String,
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub domain: Domain,
    pub forced: bool,
    pub outcomes: Vec<RecoveryOutcome>,
    pub skipped: Vec<SkippedStrategy>,
    pub total_released: f64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl CycleReport {
    pub fn attempted(&self) -> bool {
        !self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().any(|o| o.success)
    }

    /// Something ran and nothing worked.
    pub fn failed(&self) -> bool {
        self.attempted() && !self.succeeded()
    }

    pub fn skipped_names(&self) -> Vec<&str> {
        self.skipped.iter().map(|s| s.strategy.as_str()).collect()
    }
}

/// Executor statistics
#[derive(Debug, Default)]
struct ExecutorStats {
    cycles: AtomicU64,
    rejected_busy: AtomicU64,
    rejected_throttled: AtomicU64,
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSummary {
    pub cycles: u64,
    pub rejected_busy: u64,
    pub rejected_throttled: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Successful outcomes over all outcomes; 0 before the first outcome
    pub success_rate: f64,
}

/// Recovery executor
pub struct RecoveryExecutor {
    registry: Arc<StrategyRegistry>,
    history: Arc<HistoryStore>,
    events: EventBus,
    sink: Arc<dyn LogSink>,
    policy: RwLock<RecoveryPolicy>,
    guards: Mutex<HashMap<Domain, Arc<tokio::sync::Mutex<()>>>>,
    last_completed: Mutex<HashMap<Domain, Instant>>,
    stats: ExecutorStats,
}

impl RecoveryExecutor {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        history: Arc<HistoryStore>,
        events: EventBus,
        sink: Arc<dyn LogSink>,
        policy: RecoveryPolicy,
    ) -> Self {
        Self {
            registry,
            history,
            events,
            sink,
            policy: RwLock::new(policy),
            guards: Mutex::new(HashMap::new()),
            last_completed: Mutex::new(HashMap::new()),
            stats: ExecutorStats::default(),
        }
    }

    pub fn policy(&self) -> RecoveryPolicy {
        self.policy.read().clone()
    }

    pub fn set_policy(&self, policy: RecoveryPolicy) {
        *self.policy.write() = policy;
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    /// Whether a cycle for `domain` currently holds the guard.
    pub fn is_running(&self, domain: Domain) -> bool {
        self.guards
            .lock()
            .get(&domain)
            .map(|g| g.try_lock().is_err())
            .unwrap_or(false)
    }

    fn guard(&self, domain: Domain) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.guards.lock().entry(domain).or_default())
    }

    /// Run one recovery cycle for `domain`.
    ///
    /// `snapshots` are the readings that justify the cycle; entries for other
    /// domains are ignored. A strategy matched by several snapshots runs once,
    /// against the most severe of them.
    pub async fn run_cycle(
        &self,
        domain: Domain,
        snapshots: &[Snapshot],
        forced: bool,
    ) -> Result<CycleReport, CycleRejected> {
        let guard = self.guard(domain);
        let held = if forced {
            guard.lock_owned().await
        } else {
            match guard.try_lock_owned() {
                Ok(held) => held,
                Err(_) => {
                    self.stats.rejected_busy.fetch_add(1, Ordering::Relaxed);
                    debug!(domain = %domain, "Recovery cycle rejected: busy");
                    return Err(CycleRejected::Busy { domain });
                }
            }
        };

        let policy = self.policy();
        if !forced {
            let last = self.last_completed.lock().get(&domain).copied();
            if let Some(last) = last {
                let elapsed = Instant::now().saturating_duration_since(last);
                if elapsed < policy.min_inter_cycle_interval {
                    drop(held);
                    self.stats.rejected_throttled.fetch_add(1, Ordering::Relaxed);
                    let retry_after_ms = (policy.min_inter_cycle_interval - elapsed).as_millis() as u64;
                    debug!(domain = %domain, retry_after_ms, "Recovery cycle rejected: throttled");
                    return Err(CycleRejected::Throttled {
                        domain,
                        retry_after_ms,
                    });
                }
            }
        }

        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        self.events.publish(MonitorEvent::CleanupStarted {
            domains: vec![domain],
            forced,
        });
        info!(domain = %domain, cycle = %cycle_id, forced, "Recovery cycle started");

        let mut outcomes = Vec::new();
        let mut skipped = Vec::new();
        for (candidate, snapshot) in self.select(domain, snapshots) {
            let strategy = &candidate.strategy;
            if !forced {
                if let Some(remaining) =
                    self.registry
                        .cooldown_remaining(candidate.id, strategy.cooldown, domain)
                {
                    debug!(
                        strategy = %strategy.name,
                        remaining_ms = remaining.as_millis() as u64,
                        "Strategy cooling down, skipped"
                    );
                    skipped.push(SkippedStrategy {
                        strategy: strategy.name.clone(),
                        remaining_ms: remaining.as_millis() as u64,
                    });
                    continue;
                }
            }

            let outcome = self.attempt(&candidate, &snapshot, domain, &policy).await;
            self.registry.mark_executed(candidate.id, domain, Instant::now());
            outcomes.push(outcome);
        }

        if !outcomes.is_empty() {
            self.last_completed.lock().insert(domain, Instant::now());
        }
        drop(held);

        let report = CycleReport {
            cycle_id,
            domain,
            forced,
            total_released: outcomes
                .iter()
                .filter(|o| o.success)
                .map(|o| o.amount_released)
                .sum(),
            outcomes,
            skipped,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        for outcome in &report.outcomes {
            self.history.record(HistoryEntry::Outcome(outcome.clone()));
        }
        self.announce(&report);
        Ok(report)
    }

    /// Applicable strategies for `domain` in priority order, each paired with
    /// the most severe snapshot that triggered it.
    fn select(&self, domain: Domain, snapshots: &[Snapshot]) -> Vec<(ApplicableStrategy, Snapshot)> {
        let mut chosen: Vec<(ApplicableStrategy, Snapshot)> = Vec::new();
        for snapshot in snapshots.iter().filter(|s| s.domain == domain) {
            let selection = self.registry.select(snapshot);
            for fault in &selection.faults {
                self.sink.log(
                    LogLevel::Warn,
                    "recovery",
                    &format!("{} trigger panicked on {}: {}", fault.strategy, domain, fault.error),
                    serde_json::to_value(fault).ok().as_ref(),
                );
            }
            for candidate in selection.applicable {
                match chosen.iter_mut().find(|(c, _)| c.id == candidate.id) {
                    Some((_, current)) => {
                        if (snapshot.status, snapshot.usage_ratio) > (current.status, current.usage_ratio) {
                            *current = snapshot.clone();
                        }
                    }
                    None => chosen.push((candidate, snapshot.clone())),
                }
            }
        }
        chosen.sort_by_key(|(c, _)| (c.strategy.priority, c.id));
        chosen
    }

    async fn attempt(
        &self,
        candidate: &ApplicableStrategy,
        snapshot: &Snapshot,
        domain: Domain,
        policy: &RecoveryPolicy,
    ) -> RecoveryOutcome {
        let strategy = &candidate.strategy;
        let max_attempts = strategy.max_retries.unwrap_or(policy.max_retries).max(1);
        let started = Instant::now();
        let mut attempts = 0;
        let mut last_error = None;
        let mut report = None;

        while attempts < max_attempts {
            attempts += 1;
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            match AssertUnwindSafe(strategy.action().run(snapshot))
                .catch_unwind()
                .await
            {
                Ok(Ok(r)) => {
                    report = Some(r);
                    break;
                }
                Ok(Err(e)) => last_error = Some(format!("{:#}", e)),
                Err(panic) => {
                    last_error = Some(format!("action panicked: {}", panic_message(&*panic)))
                }
            }
            warn!(
                strategy = %strategy.name,
                attempt = attempts,
                max_attempts,
                error = last_error.as_deref().unwrap_or_default(),
                "Recovery attempt failed"
            );
            if attempts < max_attempts && !policy.retry_delay.is_zero() {
                tokio::time::sleep(policy.retry_delay).await;
            }
        }

        let success = report.is_some();
        if success {
            self.stats.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        let report = report.unwrap_or_default();
        RecoveryOutcome {
            strategy: strategy.name.clone(),
            domain,
            success,
            amount_released: if success { report.amount_released } else { 0.0 },
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
            error: if success { None } else { last_error },
            detail: report.detail,
            timestamp: Utc::now(),
        }
    }

    fn announce(&self, report: &CycleReport) {
        let domain = report.domain;
        for outcome in &report.outcomes {
            let data = serde_json::to_value(outcome).ok();
            if outcome.success {
                self.sink.log(
                    LogLevel::Info,
                    "recovery",
                    &format!("{} recovered {} on {}", outcome.strategy, outcome.amount_released, domain),
                    data.as_ref(),
                );
                self.events.publish(MonitorEvent::RecoverySuccess {
                    domain,
                    strategy: outcome.strategy.clone(),
                });
            } else {
                self.sink.log(
                    LogLevel::Warn,
                    "recovery",
                    &format!(
                        "{} failed on {} after {} attempts",
                        outcome.strategy, domain, outcome.attempts
                    ),
                    data.as_ref(),
                );
            }
        }

        if report.failed() {
            let last = report
                .outcomes
                .iter()
                .rev()
                .find_map(|o| o.error.clone())
                .unwrap_or_default();
            let error = format!(
                "all {} strategies failed; last error: {}",
                report.outcomes.len(),
                last
            );
            warn!(domain = %domain, cycle = %report.cycle_id, error = %error, "Recovery cycle failed");
            self.events.publish(MonitorEvent::CleanupFailed { domain, error });
            self.events.publish(MonitorEvent::RecoveryFailed { domain });
        } else {
            info!(
                domain = %domain,
                cycle = %report.cycle_id,
                outcomes = report.outcomes.len(),
                skipped = report.skipped.len(),
                released = report.total_released,
                "Recovery cycle completed"
            );
            self.events.publish(MonitorEvent::CleanupCompleted {
                domain,
                outcomes: report.outcomes.clone(),
                total_released: report.total_released,
            });
        }
    }

    pub fn summary(&self) -> ExecutorSummary {
        let successes = self.stats.successes.load(Ordering::Relaxed);
        let failures = self.stats.failures.load(Ordering::Relaxed);
        let total = successes + failures;
        ExecutorSummary {
            cycles: self.stats.cycles.load(Ordering::Relaxed),
            rejected_busy: self.stats.rejected_busy.load(Ordering::Relaxed),
            rejected_throttled: self.stats.rejected_throttled.load(Ordering::Relaxed),
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            successes,
            failures,
            success_rate: if total == 0 {
                0.0
            } else {
                successes as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{LogRecord, MemoryLogSink};
    use crate::resource::{ResourceStats, Status};
    use crate::self_healing::{action_fn, ActionReport, Strategy};
    use std::sync::atomic::AtomicU32;

    struct Panics;

    #[async_trait::async_trait]
    impl crate::self_healing::RecoveryAction for Panics {
        async fn run(&self, _snapshot: &Snapshot) -> anyhow::Result<ActionReport> {
            panic!("boom")
        }
    }

    struct Fixture {
        executor: RecoveryExecutor,
        registry: Arc<StrategyRegistry>,
        history: Arc<HistoryStore>,
        events: EventBus,
        sink: Arc<MemoryLogSink>,
    }

    fn fixture(policy: RecoveryPolicy) -> Fixture {
        let registry = Arc::new(StrategyRegistry::new());
        let history = Arc::new(HistoryStore::new(Duration::from_secs(3600), 100));
        let events = EventBus::new(64);
        let sink = Arc::new(MemoryLogSink::new());
        let executor = RecoveryExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&history),
            events.clone(),
            sink.clone(),
            policy,
        );
        Fixture {
            executor,
            registry,
            history,
            events,
            sink,
        }
    }

    fn quick() -> RecoveryPolicy {
        RecoveryPolicy {
            max_retries: 3,
            retry_delay: Duration::ZERO,
            min_inter_cycle_interval: Duration::ZERO,
        }
    }

    fn critical(domain: Domain) -> Snapshot {
        Snapshot::measured(domain, ResourceStats::new(90.0, 100.0, "units")).classified(Status::Critical)
    }

    fn ok_strategy(name: &str, priority: u32, released: f64) -> Strategy {
        Strategy::builder(
            name,
            action_fn(move |_| async move { Ok(ActionReport::released(released)) }),
        )
        .domain(Domain::Memory)
        .priority(priority)
        .build()
    }

    #[tokio::test]
    async fn test_cycle_runs_in_priority_order_and_records_history() {
        let f = fixture(quick());
        f.registry.register(ok_strategy("second", 20, 2.0));
        f.registry.register(ok_strategy("first", 10, 1.0));

        let report = f
            .executor
            .run_cycle(Domain::Memory, &[critical(Domain::Memory)], false)
            .await
            .unwrap();
        let names: Vec<&str> = report.outcomes.iter().map(|o| o.strategy.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(report.total_released, 3.0);
        assert_eq!(f.history.aggregate(Domain::Memory).cleanup_count, 2);
        assert_eq!(f.sink.count("recovery"), 2);
    }

    #[tokio::test]
    async fn test_failing_strategy_does_not_stop_siblings() {
        let f = fixture(quick());
        f.registry.register(
            Strategy::builder(
                "broken",
                action_fn(|_| async { Err(anyhow::anyhow!("disk gone")) }),
            )
            .domain(Domain::Memory)
            .priority(1)
            .build(),
        );
        f.registry.register(ok_strategy("fine", 2, 5.0));

        let report = f
            .executor
            .run_cycle(Domain::Memory, &[critical(Domain::Memory)], false)
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.outcomes[0].success);
        assert_eq!(report.outcomes[0].attempts, 3);
        assert_eq!(report.outcomes[0].error.as_deref(), Some("disk gone"));
        assert!(report.outcomes[1].success);
        assert!(!report.failed());
    }

    #[tokio::test]
    async fn test_panicking_trigger_is_logged_and_skipped() {
        let f = fixture(quick());
        f.registry.register(
            Strategy::builder("fragile", action_fn(|_| async { Ok(ActionReport::released(9.0)) }))
                .domain(Domain::Memory)
                .priority(1)
                .trigger(|_| panic!("bad trigger"))
                .build(),
        );
        f.registry.register(ok_strategy("steady", 2, 1.0));

        let report = f
            .executor
            .run_cycle(Domain::Memory, &[critical(Domain::Memory)], false)
            .await
            .unwrap();
        let names: Vec<&str> = report.outcomes.iter().map(|o| o.strategy.as_str()).collect();
        assert_eq!(names, vec!["steady"]);
        assert_eq!(report.total_released, 1.0);

        let warnings: Vec<LogRecord> = f
            .sink
            .records()
            .into_iter()
            .filter(|r| r.level == LogLevel::Warn)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].category, "recovery");
        assert!(warnings[0].message.contains("fragile trigger panicked"));
        assert!(warnings[0].message.contains("bad trigger"));
    }

    #[tokio::test]
    async fn test_panicking_action_is_a_failed_attempt() {
        let f = fixture(RecoveryPolicy {
            max_retries: 2,
            ..quick()
        });
        f.registry.register(
            Strategy::builder("panics", Panics)
                .domain(Domain::Memory)
                .build(),
        );
        let mut sub = f.events.subscribe();

        let report = f
            .executor
            .run_cycle(Domain::Memory, &[critical(Domain::Memory)], false)
            .await
            .unwrap();
        assert!(report.failed());
        assert_eq!(report.outcomes[0].attempts, 2);
        assert!(report.outcomes[0].error.as_deref().unwrap().contains("boom"));

        let names: Vec<&str> = sub.drain().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["cleanup-started", "cleanup-failed", "recovery-failed"]);
    }

    #[tokio::test]
    async fn test_strategy_retry_cap_overrides_policy() {
        let f = fixture(quick());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        f.registry.register(
            Strategy::builder(
                "once",
                action_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(anyhow::anyhow!("nope")) }
                }),
            )
            .domain(Domain::Memory)
            .max_retries(1)
            .build(),
        );
        f.executor
            .run_cycle(Domain::Memory, &[critical(Domain::Memory)], false)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_cycle_completes_without_outcomes() {
        let f = fixture(quick());
        let mut sub = f.events.subscribe();
        let report = f
            .executor
            .run_cycle(Domain::Cpu, &[critical(Domain::Cpu)], false)
            .await
            .unwrap();
        assert!(!report.attempted());
        assert!(!report.failed());
        let names: Vec<&str> = sub.drain().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["cleanup-started", "cleanup-completed"]);
    }

    #[tokio::test]
    async fn test_snapshots_for_other_domains_are_ignored() {
        let f = fixture(quick());
        f.registry.register(ok_strategy("mem", 1, 1.0));
        let report = f
            .executor
            .run_cycle(Domain::Cpu, &[critical(Domain::Memory)], false)
            .await
            .unwrap();
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_rejects_then_forced_bypasses() {
        let f = fixture(RecoveryPolicy {
            min_inter_cycle_interval: Duration::from_secs(60),
            ..quick()
        });
        f.registry.register(ok_strategy("a", 1, 1.0));
        let snaps = [critical(Domain::Memory)];

        f.executor.run_cycle(Domain::Memory, &snaps, false).await.unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;

        match f.executor.run_cycle(Domain::Memory, &snaps, false).await {
            Err(CycleRejected::Throttled { retry_after_ms, .. }) => {
                assert_eq!(retry_after_ms, 45_000)
            }
            other => panic!("expected throttled, got {:?}", other.map(|r| r.cycle_id)),
        }
        assert!(f.executor.run_cycle(Domain::Memory, &snaps, true).await.is_ok());
        assert_eq!(f.executor.summary().rejected_throttled, 1);
    }

    #[tokio::test]
    async fn test_summary_computes_success_rate() {
        let f = fixture(quick());
        f.registry.register(ok_strategy("ok", 1, 1.0));
        f.registry.register(
            Strategy::builder("bad", action_fn(|_| async { Err(anyhow::anyhow!("x")) }))
                .domain(Domain::Memory)
                .priority(2)
                .build(),
        );
        f.executor
            .run_cycle(Domain::Memory, &[critical(Domain::Memory)], false)
            .await
            .unwrap();
        let summary = f.executor.summary();
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.attempts, 4);
        assert!((summary.success_rate - 0.5).abs() < f64::EPSILON);
    }
}
