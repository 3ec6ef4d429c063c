//! Supervision: periodic ticks, classification and auto-recovery per domain
//!
//! Each monitored domain gets its own timer task. A tick samples the domain,
//! classifies the reading, records it, announces it, and when the domain needs
//! attention and auto-cleanup is on, asks the executor for a recovery cycle.
//! Stopping a timer is cooperative: the tick in progress, including any
//! recovery it started, finishes before the task exits.

pub mod events;

pub use events::{EventBus, MonitorEvent, Subscription, SubscriptionHandle};

use crate::config::{ConfigStore, MonitorConfig, ThresholdSet, WatchHandle, MONITOR_CONFIG_KEY};
use crate::errors::{ConfigError, CycleRejected, VigilError};
use crate::history::{HistoryEntry, HistoryStore, Statistics};
use crate::observability::{LogLevel, LogSink, TracingLogSink};
use crate::resource::system::system_providers;
use crate::resource::{
    classify, ConcurrencyLimiter, Domain, ErrorEvent, ErrorTracker, ResourceStatsProvider, Sampler,
    Snapshot, Status,
};
use crate::self_healing::strategies::{reset_error_window, shrink_concurrency};
use crate::self_healing::{
    CycleReport, ExecutorSummary, RecoveryExecutor, RecoveryPolicy, Strategy, StrategyId,
    StrategyRegistry,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one tick saw and did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub snapshot: Snapshot,
    /// Status before this tick
    pub previous: Status,
    /// `None` when no cycle was requested
    pub cycle: Option<Result<CycleReport, CycleRejected>>,
}

impl TickReport {
    pub fn status_changed(&self) -> bool {
        !self.snapshot.is_unknown() && self.snapshot.status != self.previous
    }
}

/// Overall status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallStatus {
    fn from_statuses(statuses: impl IntoIterator<Item = Status>) -> Self {
        statuses
            .into_iter()
            .fold(OverallStatus::Healthy, |acc, s| match s {
                Status::Critical | Status::Exhausted => OverallStatus::Unhealthy,
                Status::Warning if acc == OverallStatus::Healthy => OverallStatus::Degraded,
                _ => acc,
            })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainHealth {
    pub domain: Domain,
    /// `None` until the first successful sample
    pub status: Option<Status>,
    pub monitored: bool,
    pub statistics: Statistics,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub status: OverallStatus,
    pub auto_cleanup: bool,
    pub domains: Vec<DomainHealth>,
    pub recovery: ExecutorSummary,
    pub generated_at: DateTime<Utc>,
}

struct Timer {
    interval: Duration,
    /// Re-armed when `monitoring_interval_ms` changes
    follows_config: bool,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct MonitorInner {
    config: RwLock<MonitorConfig>,
    sampler: Sampler,
    registry: Arc<StrategyRegistry>,
    executor: RecoveryExecutor,
    history: Arc<HistoryStore>,
    events: EventBus,
    sink: Arc<dyn LogSink>,
    limiter: Option<Arc<ConcurrencyLimiter>>,
    statuses: Mutex<HashMap<Domain, Status>>,
    timers: Mutex<HashMap<Domain, Timer>>,
    runtime: Mutex<Option<Handle>>,
    config_watch: Mutex<Option<WatchHandle>>,
    error_feed: Mutex<Option<JoinHandle<()>>>,
}

/// Composes a [`HealthMonitor`].
pub struct MonitorBuilder {
    config: MonitorConfig,
    providers: Vec<Arc<dyn ResourceStatsProvider>>,
    strategies: Vec<Strategy>,
    sink: Arc<dyn LogSink>,
    limiter: Option<Arc<ConcurrencyLimiter>>,
    error_tracker: Option<Arc<ErrorTracker>>,
    default_strategies: bool,
}

impl MonitorBuilder {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            strategies: Vec::new(),
            sink: Arc::new(TracingLogSink),
            limiter: None,
            error_tracker: None,
            default_strategies: false,
        }
    }

    pub fn provider(mut self, provider: Arc<dyn ResourceStatsProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Register the sysinfo-backed providers for memory, CPU, network,
    /// disk I/O and file handles.
    pub fn system_providers(mut self) -> Self {
        self.providers.extend(system_providers(&self.config.limits));
        self
    }

    /// Share `limiter` with the monitor; it becomes the `connections` provider
    /// and is relaxed again whenever the domain reads normal.
    pub fn limiter(mut self, limiter: Arc<ConcurrencyLimiter>) -> Self {
        self.providers.push(limiter.clone());
        self.limiter = Some(limiter);
        self
    }

    pub fn error_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.error_tracker = Some(tracker);
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Also register the built-ins that need no host handles: concurrency
    /// shrinking (when a limiter is set) and error-window resets for every
    /// monitored error channel.
    pub fn default_strategies(mut self) -> Self {
        self.default_strategies = true;
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Result<HealthMonitor, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let tracker = self.error_tracker.unwrap_or_else(|| {
            Arc::new(ErrorTracker::new(
                Duration::from_millis(config.errors.window_ms),
                config.errors.budget,
            ))
        });
        let sampler = Sampler::new(Arc::clone(&tracker));
        for provider in self.providers {
            sampler.register(provider);
        }

        let registry = Arc::new(StrategyRegistry::new());
        for strategy in self.strategies {
            registry.register(strategy);
        }
        if self.default_strategies {
            if let Some(limiter) = &self.limiter {
                registry.register(shrink_concurrency(Arc::clone(limiter)));
            }
            for domain in &config.domains {
                if let Domain::Errors(kind) = domain {
                    registry.register(reset_error_window(*kind, Arc::clone(&tracker)));
                }
            }
        }

        let history = Arc::new(HistoryStore::new(
            config.history_retention(),
            config.max_history_records,
        ));
        let events = EventBus::new(config.event_buffer);
        let executor = RecoveryExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&history),
            events.clone(),
            Arc::clone(&self.sink),
            RecoveryPolicy::from(&config),
        );

        Ok(HealthMonitor {
            inner: Arc::new(MonitorInner {
                config: RwLock::new(config),
                sampler,
                registry,
                executor,
                history,
                events,
                sink: self.sink,
                limiter: self.limiter,
                statuses: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                runtime: Mutex::new(Handle::try_current().ok()),
                config_watch: Mutex::new(None),
                error_feed: Mutex::new(None),
            }),
        })
    }
}

/// The monitoring engine. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    pub fn builder(config: MonitorConfig) -> MonitorBuilder {
        MonitorBuilder::new(config)
    }

    pub fn config(&self) -> MonitorConfig {
        self.inner.config.read().clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.inner.history
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.inner.registry
    }

    pub fn executor(&self) -> &RecoveryExecutor {
        &self.inner.executor
    }

    pub fn sampler(&self) -> &Sampler {
        &self.inner.sampler
    }

    pub fn limiter(&self) -> Option<&Arc<ConcurrencyLimiter>> {
        self.inner.limiter.as_ref()
    }

    pub fn register_strategy(&self, strategy: Strategy) -> StrategyId {
        self.inner.registry.register(strategy)
    }

    pub fn register_provider(&self, provider: Arc<dyn ResourceStatsProvider>) {
        self.inner.sampler.register(provider);
    }

    /// Last classified status of `domain`.
    pub fn status(&self, domain: Domain) -> Option<Status> {
        self.inner.statuses.lock().get(&domain).copied()
    }

    /// Sample, classify and record `domain` once, running auto-recovery if
    /// it is enabled and the domain needs it.
    pub async fn tick(&self, domain: Domain) -> TickReport {
        self.inner.tick(domain).await
    }

    /// Arm (or re-arm) the periodic timer for `domain` at a fixed interval.
    ///
    /// The interval must exceed `sample_timeout_ms`. It survives later changes
    /// to the configured interval, but falls back to it if a new sample
    /// timeout reaches it.
    pub fn start(&self, domain: Domain, interval: Duration) -> Result<(), VigilError> {
        self.inner.arm(domain, interval, false)?;
        self.inner.events.publish(MonitorEvent::MonitoringStarted {
            domains: vec![domain],
            interval_ms: interval.as_millis() as u64,
        });
        Ok(())
    }

    /// Arm every configured domain at the configured interval.
    pub fn start_all(&self) -> Result<(), VigilError> {
        let domains = self.inner.config.read().domains.clone();
        self.start_domains(&domains)
    }

    /// Arm `domains` at the configured interval. These timers follow later
    /// changes to `monitoring_interval_ms`.
    pub fn start_domains(&self, domains: &[Domain]) -> Result<(), VigilError> {
        let interval = self.inner.config.read().monitoring_interval();
        for domain in domains {
            self.inner.arm(*domain, interval, true)?;
        }
        info!(domains = domains.len(), interval_ms = interval.as_millis() as u64, "Monitoring started");
        self.inner.events.publish(MonitorEvent::MonitoringStarted {
            domains: domains.to_vec(),
            interval_ms: interval.as_millis() as u64,
        });
        Ok(())
    }

    /// Disarm `domain`. The tick in progress, if any, runs to completion.
    pub fn stop(&self, domain: Domain) -> bool {
        let stopped = self.inner.disarm(domain).is_some();
        if stopped {
            self.inner.events.publish(MonitorEvent::MonitoringStopped {
                domains: vec![domain],
            });
        }
        stopped
    }

    pub fn stop_all(&self) -> Vec<Domain> {
        let domains = self.running_domains();
        for domain in &domains {
            self.inner.disarm(*domain);
        }
        if !domains.is_empty() {
            self.inner.events.publish(MonitorEvent::MonitoringStopped {
                domains: domains.clone(),
            });
        }
        domains
    }

    /// Stop everything and wait for in-flight ticks to finish.
    pub async fn shutdown(&self) {
        let timers: Vec<(Domain, Timer)> = self.inner.timers.lock().drain().collect();
        let domains: Vec<Domain> = timers.iter().map(|(d, _)| *d).collect();
        for (_, timer) in &timers {
            let _ = timer.shutdown.send(true);
        }
        for (domain, timer) in timers {
            if let Err(e) = timer.task.await {
                warn!(domain = %domain, error = %e, "Tick task ended abnormally");
            }
        }
        if let Some(feed) = self.inner.error_feed.lock().take() {
            feed.abort();
        }
        self.inner.config_watch.lock().take();
        if !domains.is_empty() {
            self.inner
                .events
                .publish(MonitorEvent::MonitoringStopped { domains });
        }
        info!("Monitor shut down");
    }

    pub fn is_running(&self, domain: Domain) -> bool {
        self.inner.timers.lock().contains_key(&domain)
    }

    pub fn running_domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self.inner.timers.lock().keys().copied().collect();
        domains.sort();
        domains
    }

    /// Interval `domain` is armed with.
    pub fn interval(&self, domain: Domain) -> Option<Duration> {
        self.inner.timers.lock().get(&domain).map(|t| t.interval)
    }

    /// Sample each domain (all configured ones when `domains` is empty) and
    /// run a forced recovery cycle for it. Domains run concurrently.
    pub async fn force_cleanup(&self, domains: &[Domain]) -> Vec<Result<CycleReport, CycleRejected>> {
        let domains = if domains.is_empty() {
            self.inner.config.read().domains.clone()
        } else {
            domains.to_vec()
        };
        info!(domains = domains.len(), "Forced cleanup requested");
        futures::future::join_all(domains.into_iter().map(|domain| async move {
            let snapshot = self.inner.sample_and_observe(domain).await.0;
            self.inner
                .executor
                .run_cycle(domain, std::slice::from_ref(&snapshot), true)
                .await
        }))
        .await
    }

    /// Replace the configuration. An invalid configuration is rejected and
    /// the current one kept.
    pub fn update_config(&self, config: MonitorConfig) -> Result<(), ConfigError> {
        self.inner.apply_config(config)
    }

    pub fn update_thresholds(&self, domain: Domain, thresholds: ThresholdSet) -> Result<(), ConfigError> {
        let mut config = self.config();
        config.thresholds.insert(domain, thresholds);
        self.update_config(config)
    }

    pub fn set_auto_cleanup(&self, enabled: bool) -> Result<(), ConfigError> {
        let mut config = self.config();
        config.enable_auto_cleanup = enabled;
        self.update_config(config)
    }

    /// Load the `monitor` key from `store` now and follow later changes.
    /// Partial values are merged over the current configuration.
    pub fn bind_config_store(&self, store: &dyn ConfigStore) -> Result<(), VigilError> {
        if let Some(value) = store.get_value(MONITOR_CONFIG_KEY) {
            let config = merge_config(&self.config(), &value)?;
            self.update_config(config)?;
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = store.on_value_change(
            MONITOR_CONFIG_KEY,
            Arc::new(move |value: &serde_json::Value| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let current = inner.config.read().clone();
                match merge_config(&current, value) {
                    Ok(config) => {
                        // rejection is logged by apply_config
                        let _ = inner.apply_config(config);
                    }
                    Err(e) => inner.sink.log(
                        LogLevel::Warn,
                        "config",
                        &format!("Ignoring unreadable configuration: {}", e),
                        Some(value),
                    ),
                }
            }),
        );
        *self.inner.config_watch.lock() = Some(handle);
        Ok(())
    }

    /// Count an application error and re-evaluate its channel immediately.
    pub async fn record_error(&self, event: ErrorEvent) -> TickReport {
        self.inner.record_error(event).await
    }

    /// Consume error events from `source` until it closes or the monitor is
    /// dropped. Replaces any previously attached source.
    pub fn attach_error_source(&self, mut source: mpsc::Receiver<ErrorEvent>) -> Result<(), VigilError> {
        let handle = self.inner.runtime_handle()?;
        let weak = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            while let Some(event) = source.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.record_error(event).await;
            }
            debug!("Error source closed");
        });
        if let Some(previous) = self.inner.error_feed.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub fn summary(&self) -> HealthSummary {
        let config = self.config();
        let statuses = self.inner.statuses.lock().clone();
        let running = self.running_domains();

        let mut domains = config.domains.clone();
        for domain in statuses.keys() {
            if !domains.contains(domain) {
                domains.push(*domain);
            }
        }
        domains.sort();

        HealthSummary {
            status: OverallStatus::from_statuses(statuses.values().copied()),
            auto_cleanup: config.enable_auto_cleanup,
            domains: domains
                .into_iter()
                .map(|domain| DomainHealth {
                    domain,
                    status: statuses.get(&domain).copied(),
                    monitored: running.contains(&domain),
                    statistics: self.inner.history.aggregate(domain),
                })
                .collect(),
            recovery: self.inner.executor.summary(),
            generated_at: Utc::now(),
        }
    }
}

impl MonitorInner {
    async fn tick(&self, domain: Domain) -> TickReport {
        let (snapshot, previous) = self.sample_and_observe(domain).await;
        let auto = self.config.read().enable_auto_cleanup;

        let cycle = if auto && !snapshot.is_unknown() && snapshot.status.requires_action() {
            let result = self
                .executor
                .run_cycle(domain, std::slice::from_ref(&snapshot), false)
                .await;
            if let Err(rejected) = &result {
                debug!(domain = %domain, code = rejected.code(), "Auto-recovery skipped");
            }
            Some(result)
        } else {
            None
        };

        TickReport {
            snapshot,
            previous,
            cycle,
        }
    }

    async fn sample_and_observe(&self, domain: Domain) -> (Snapshot, Status) {
        let (thresholds, timeout) = {
            let config = self.config.read();
            (config.thresholds_for(domain), config.sample_timeout())
        };
        let raw = self.sampler.sample(domain, timeout).await;
        self.observe(raw, &thresholds)
    }

    /// Classify a reading, keep the status map current, record and announce.
    fn observe(&self, raw: Snapshot, thresholds: &ThresholdSet) -> (Snapshot, Status) {
        let domain = raw.domain;
        let previous = self.statuses.lock().get(&domain).copied().unwrap_or_default();
        let status = classify(&raw, thresholds, previous);
        let snapshot = raw.classified(status);

        if let Some(error) = &snapshot.error {
            self.sink.log(
                LogLevel::Warn,
                "sampler",
                &format!("{} sample failed: {}", domain, error),
                None,
            );
        } else {
            self.statuses.lock().insert(domain, status);
            if status != previous {
                let level = if status > previous {
                    LogLevel::Warn
                } else {
                    LogLevel::Info
                };
                self.sink.log(
                    level,
                    "status",
                    &format!("{}: {} -> {}", domain, previous, status),
                    Some(&serde_json::json!({ "usage_ratio": snapshot.usage_ratio })),
                );
                self.events.publish(MonitorEvent::StatusChanged {
                    domain,
                    from: previous,
                    to: status,
                });
            }
            if status == Status::Normal && matches!(domain, Domain::Connections | Domain::Cpu) {
                if let Some(limiter) = &self.limiter {
                    limiter.relax();
                }
            }
        }

        self.history.record(HistoryEntry::Snapshot(snapshot.clone()));
        self.events
            .publish(MonitorEvent::ResourceUpdated(vec![snapshot.clone()]));
        (snapshot, previous)
    }

    async fn record_error(&self, event: ErrorEvent) -> TickReport {
        self.sampler.error_tracker().record(&event);
        self.sink.log(
            LogLevel::Debug,
            "errors",
            &format!("{} error: {}", event.kind.as_str(), event.message),
            event.context.as_ref().map(|c| serde_json::json!({ "context": c })).as_ref(),
        );
        self.tick(event.domain()).await
    }

    fn runtime_handle(&self) -> Result<Handle, VigilError> {
        let mut runtime = self.runtime.lock();
        if let Some(handle) = runtime.as_ref() {
            return Ok(handle.clone());
        }
        let handle = Handle::try_current()
            .map_err(|_| VigilError::Internal("monitoring requires a tokio runtime".to_string()))?;
        *runtime = Some(handle.clone());
        Ok(handle)
    }

    /// Replace the timer for `domain`. The new task waits for the old one to
    /// wind down so ticks never overlap.
    fn arm(self: &Arc<Self>, domain: Domain, interval: Duration, follows_config: bool) -> Result<(), VigilError> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "interval".to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }
        let sample_timeout = self.config.read().sample_timeout();
        if interval <= sample_timeout {
            return Err(ConfigError::InvalidValue {
                field: "interval".to_string(),
                reason: format!(
                    "must exceed sample_timeout_ms ({})",
                    sample_timeout.as_millis()
                ),
            }
            .into());
        }
        let handle = self.runtime_handle()?;
        self.history.track(domain);

        let mut timers = self.timers.lock();
        let previous = timers.remove(&domain).map(|old| {
            let _ = old.shutdown.send(true);
            old.task
        });
        let (shutdown, rx) = watch::channel(false);
        let task = handle.spawn(tick_loop(Arc::downgrade(self), domain, interval, rx, previous));
        timers.insert(
            domain,
            Timer {
                interval,
                follows_config,
                shutdown,
                task,
            },
        );
        debug!(domain = %domain, interval_ms = interval.as_millis() as u64, "Timer armed");
        Ok(())
    }

    fn disarm(&self, domain: Domain) -> Option<JoinHandle<()>> {
        let timer = self.timers.lock().remove(&domain)?;
        let _ = timer.shutdown.send(true);
        debug!(domain = %domain, "Timer disarmed");
        Some(timer.task)
    }

    fn apply_config(self: &Arc<Self>, new: MonitorConfig) -> Result<(), ConfigError> {
        if let Err(e) = new.validate() {
            self.sink.log(
                LogLevel::Warn,
                "config",
                &format!("Rejected configuration update: {}", e),
                None,
            );
            return Err(e);
        }

        let old = std::mem::replace(&mut *self.config.write(), new.clone());
        self.executor.set_policy(RecoveryPolicy::from(&new));
        self.history
            .set_retention(new.history_retention(), new.max_history_records);
        self.sampler
            .error_tracker()
            .set_policy(Duration::from_millis(new.errors.window_ms), new.errors.budget);

        if old.thresholds != new.thresholds || old.default_thresholds != new.default_thresholds {
            let effective: BTreeMap<Domain, ThresholdSet> = new
                .domains
                .iter()
                .chain(new.thresholds.keys())
                .map(|d| (*d, new.thresholds_for(*d)))
                .collect();
            self.sink.log(
                LogLevel::Info,
                "config",
                "Thresholds updated",
                serde_json::to_value(&effective).ok().as_ref(),
            );
            self.events.publish(MonitorEvent::ThresholdsUpdated(effective));
        }

        if old.enable_auto_cleanup != new.enable_auto_cleanup {
            self.sink.log(
                LogLevel::Info,
                "config",
                if new.enable_auto_cleanup {
                    "Auto-cleanup enabled"
                } else {
                    "Auto-cleanup disabled; forced cleanup remains available"
                },
                None,
            );
        }

        let interval_changed = old.monitoring_interval_ms != new.monitoring_interval_ms;
        let timeout = new.sample_timeout();
        let rearm: Vec<Domain> = self
            .timers
            .lock()
            .iter()
            .filter(|(_, t)| (t.follows_config && interval_changed) || t.interval <= timeout)
            .map(|(domain, _)| *domain)
            .collect();
        for domain in rearm {
            if let Err(e) = self.arm(domain, new.monitoring_interval(), true) {
                warn!(domain = %domain, error = %e, "Failed to re-arm timer");
            }
        }
        if interval_changed {
            info!(interval_ms = new.monitoring_interval_ms, "Monitoring interval changed");
        }

        if old.event_buffer != new.event_buffer {
            debug!("Event buffer size applies on next start");
        }
        Ok(())
    }
}

async fn tick_loop(
    inner: Weak<MonitorInner>,
    domain: Domain,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.tick(domain).await;
    }
    debug!(domain = %domain, "Tick loop exited");
}

/// Overlay the keys of `value` on `current`.
fn merge_config(current: &MonitorConfig, value: &serde_json::Value) -> Result<MonitorConfig, ConfigError> {
    let mut merged = serde_json::to_value(current).map_err(|e| ConfigError::Parse(e.to_string()))?;
    match (merged.as_object_mut(), value.as_object()) {
        (Some(base), Some(overlay)) => {
            for (key, v) in overlay {
                base.insert(key.clone(), v.clone());
            }
        }
        _ => {
            return Err(ConfigError::Parse(
                "configuration value must be an object".to_string(),
            ))
        }
    }
    serde_json::from_value(merged).map_err(|e| ConfigError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryConfigStore;
    use crate::errors::ResourceError;
    use crate::observability::MemoryLogSink;
    use crate::resource::{ErrorKind, ResourceStats};
    use crate::self_healing::{action_fn, ActionReport};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Provider whose reading tests can move.
    struct Gauge {
        domain: Domain,
        permille: AtomicU64,
    }

    impl Gauge {
        fn new(domain: Domain, ratio: f64) -> Arc<Self> {
            Arc::new(Self {
                domain,
                permille: AtomicU64::new((ratio * 1000.0) as u64),
            })
        }

        fn set(&self, ratio: f64) {
            self.permille.store((ratio * 1000.0) as u64, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl ResourceStatsProvider for Gauge {
        fn domain(&self) -> Domain {
            self.domain
        }
        async fn stats(&self) -> Result<ResourceStats, ResourceError> {
            Ok(ResourceStats::new(
                self.permille.load(Ordering::SeqCst) as f64,
                1000.0,
                "units",
            ))
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            domains: vec![Domain::Memory],
            retry_delay_ms: 0,
            min_inter_cycle_interval_ms: 0,
            ..MonitorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_tick_classifies_and_records() {
        let gauge = Gauge::new(Domain::Memory, 0.9);
        let monitor = HealthMonitor::builder(config())
            .provider(gauge.clone())
            .build()
            .unwrap();
        let mut sub = monitor.subscribe();

        let report = monitor.tick(Domain::Memory).await;
        assert_eq!(report.snapshot.status, Status::Critical);
        assert!(report.status_changed());
        assert_eq!(monitor.status(Domain::Memory), Some(Status::Critical));
        assert_eq!(monitor.history().aggregate(Domain::Memory).critical_count, 1);

        let names: Vec<&str> = sub.drain().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["status-changed", "resource-updated", "cleanup-started", "cleanup-completed"]
        );
    }

    #[tokio::test]
    async fn test_unknown_sample_keeps_status_and_skips_recovery() {
        let gauge = Gauge::new(Domain::Memory, 0.9);
        let sink = Arc::new(MemoryLogSink::new());
        let monitor = HealthMonitor::builder(config())
            .provider(gauge)
            .log_sink(sink.clone())
            .build()
            .unwrap();
        monitor.tick(Domain::Memory).await;

        let report = monitor.tick(Domain::Cpu).await;
        assert!(report.snapshot.is_unknown());
        assert!(report.cycle.is_none());
        assert_eq!(monitor.status(Domain::Cpu), None);
        assert_eq!(sink.count("sampler"), 1);
    }

    #[tokio::test]
    async fn test_invalid_threshold_update_is_rejected() {
        let sink = Arc::new(MemoryLogSink::new());
        let monitor = HealthMonitor::builder(config())
            .log_sink(sink.clone())
            .build()
            .unwrap();
        let before = monitor.config().thresholds_for(Domain::Memory);

        let err = monitor
            .update_thresholds(Domain::Memory, ThresholdSet::new(0.9, 0.8, 0.95))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThresholds { .. }));
        assert_eq!(monitor.config().thresholds_for(Domain::Memory), before);
        assert_eq!(sink.count("config"), 1);
    }

    #[tokio::test]
    async fn test_threshold_update_publishes_event() {
        let monitor = HealthMonitor::builder(config()).build().unwrap();
        let mut sub = monitor.subscribe();
        monitor
            .update_thresholds(Domain::Memory, ThresholdSet::new(0.5, 0.6, 0.7))
            .unwrap();
        match sub.try_recv() {
            Some(MonitorEvent::ThresholdsUpdated(map)) => {
                assert_eq!(map[&Domain::Memory], ThresholdSet::new(0.5, 0.6, 0.7))
            }
            other => panic!("unexpected {:?}", other.map(|e| e.name())),
        }
    }

    #[tokio::test]
    async fn test_limiter_relaxes_when_connections_normal() {
        let limiter = Arc::new(ConcurrencyLimiter::new(8, 1));
        limiter.shrink();
        let monitor = HealthMonitor::builder(MonitorConfig {
            domains: vec![Domain::Connections],
            ..config()
        })
        .limiter(limiter.clone())
        .default_strategies()
        .build()
        .unwrap();
        assert_eq!(monitor.registry().names(), vec!["shrink-concurrency"]);

        monitor.tick(Domain::Connections).await;
        assert_eq!(limiter.limit(), 5);
    }

    #[tokio::test]
    async fn test_record_error_triggers_channel_recovery() {
        let mut cfg = config();
        cfg.domains = vec![Domain::Errors(ErrorKind::AiService)];
        cfg.errors.budget = 4;
        let monitor = HealthMonitor::builder(cfg)
            .default_strategies()
            .build()
            .unwrap();

        let mut last = None;
        for _ in 0..4 {
            last = Some(
                monitor
                    .record_error(ErrorEvent::new(ErrorKind::AiService, "model crashed"))
                    .await,
            );
        }
        let report = last.unwrap();
        assert_eq!(report.snapshot.status, Status::Exhausted);
        let cycle = report.cycle.unwrap().unwrap();
        assert_eq!(cycle.outcomes[0].strategy, "reset-ai_service-window");
        assert_eq!(monitor.sampler().error_tracker().count(ErrorKind::AiService), 0);
    }

    #[tokio::test]
    async fn test_bind_config_store_applies_and_follows_changes() {
        let store = InMemoryConfigStore::new();
        store.set_value(MONITOR_CONFIG_KEY, serde_json::json!({ "max_retries": 7 }));
        let sink = Arc::new(MemoryLogSink::new());
        let monitor = HealthMonitor::builder(config())
            .log_sink(sink.clone())
            .build()
            .unwrap();

        monitor.bind_config_store(&store).unwrap();
        assert_eq!(monitor.config().max_retries, 7);
        assert_eq!(monitor.executor().policy().max_retries, 7);

        store.set_value(MONITOR_CONFIG_KEY, serde_json::json!({ "enable_auto_cleanup": false }));
        assert!(!monitor.config().enable_auto_cleanup);
        assert_eq!(monitor.config().max_retries, 7);

        // invalid update keeps the previous configuration
        store.set_value(MONITOR_CONFIG_KEY, serde_json::json!({ "max_history_records": 0 }));
        assert_eq!(monitor.config().max_history_records, config().max_history_records);
        assert!(sink.count("config") >= 2);
    }

    #[tokio::test]
    async fn test_summary_reports_overall_status() {
        let memory = Gauge::new(Domain::Memory, 0.8);
        let cpu = Gauge::new(Domain::Cpu, 0.1);
        let monitor = HealthMonitor::builder(MonitorConfig {
            domains: vec![Domain::Memory, Domain::Cpu],
            enable_auto_cleanup: false,
            ..config()
        })
        .provider(memory.clone())
        .provider(cpu)
        .build()
        .unwrap();

        assert_eq!(monitor.summary().status, OverallStatus::Healthy);
        monitor.tick(Domain::Memory).await;
        monitor.tick(Domain::Cpu).await;
        let summary = monitor.summary();
        assert_eq!(summary.status, OverallStatus::Degraded);
        assert_eq!(summary.domains.len(), 2);

        memory.set(0.99);
        monitor.tick(Domain::Memory).await;
        assert_eq!(monitor.summary().status, OverallStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_custom_strategy_via_builder() {
        let monitor = HealthMonitor::builder(config())
            .provider(Gauge::new(Domain::Memory, 0.96))
            .strategy(
                Strategy::builder(
                    "drop-previews",
                    action_fn(|_| async { Ok(ActionReport::released(64.0)) }),
                )
                .domain(Domain::Memory)
                .min_status(Status::Exhausted)
                .build(),
            )
            .build()
            .unwrap();
        let report = monitor.tick(Domain::Memory).await;
        let cycle = report.cycle.unwrap().unwrap();
        assert_eq!(cycle.total_released, 64.0);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let monitor = HealthMonitor::builder(config()).build().unwrap();
        let err = monitor.start(Domain::Memory, Duration::from_secs(10)).unwrap_err();
        assert!(err.to_string().contains("tokio runtime"));
    }

    #[tokio::test]
    async fn test_start_rejects_interval_within_sample_timeout() {
        let monitor = HealthMonitor::builder(MonitorConfig {
            sample_timeout_ms: 1_000,
            ..config()
        })
        .build()
        .unwrap();

        let err = monitor.start(Domain::Memory, Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("sample_timeout_ms (1000)"));
        assert!(!monitor.is_running(Domain::Memory));

        assert!(monitor.start(Domain::Memory, Duration::from_millis(1_001)).is_ok());
        monitor.shutdown().await;
    }

    #[test]
    fn test_merge_config_rejects_non_objects() {
        assert!(merge_config(&MonitorConfig::default(), &serde_json::json!(5)).is_err());
    }
}
