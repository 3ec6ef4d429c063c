use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use vigil::resource::{ErrorEvent, ResourceStats, ResourceStatsProvider};
use vigil::self_healing::{action_fn, ActionReport};
use vigil::{
    Domain, ErrorKind, HealthMonitor, MonitorConfig, MonitorEvent, ResourceError, Status, Strategy,
};

/// Provider with a settable reading that counts how often it is read.
struct Gauge {
    domain: Domain,
    permille: AtomicU64,
    reads: AtomicUsize,
}

impl Gauge {
    fn new(domain: Domain, ratio: f64) -> Arc<Self> {
        Arc::new(Self {
            domain,
            permille: AtomicU64::new((ratio * 1000.0).round() as u64),
            reads: AtomicUsize::new(0),
        })
    }

    fn set(&self, ratio: f64) {
        self.permille
            .store((ratio * 1000.0).round() as u64, Ordering::SeqCst);
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ResourceStatsProvider for Gauge {
    fn domain(&self) -> Domain {
        self.domain
    }

    async fn stats(&self) -> Result<ResourceStats, ResourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(ResourceStats::new(
            self.permille.load(Ordering::SeqCst) as f64,
            1000.0,
            "bytes",
        ))
    }
}

fn config() -> MonitorConfig {
    MonitorConfig {
        domains: vec![Domain::Memory],
        retry_delay_ms: 0,
        min_inter_cycle_interval_ms: 0,
        sample_timeout_ms: 500,
        ..MonitorConfig::default()
    }
}

fn trim_strategy() -> Strategy {
    Strategy::builder(
        "trim-buffers",
        action_fn(|_| async { Ok(ActionReport::released(4096.0)) }),
    )
    .domain(Domain::Memory)
    .build()
}

#[tokio::test]
async fn test_ninety_percent_memory_is_critical() {
    let monitor = HealthMonitor::builder(config())
        .provider(Gauge::new(Domain::Memory, 0.90))
        .strategy(trim_strategy())
        .build()
        .unwrap();

    let report = monitor.tick(Domain::Memory).await;
    assert_eq!(report.snapshot.status, Status::Critical);
    assert!((report.snapshot.usage_ratio - 0.90).abs() < 1e-9);

    let cycle = report.cycle.expect("auto-cleanup runs").unwrap();
    assert_eq!(cycle.outcomes[0].strategy, "trim-buffers");
    assert!(cycle.outcomes[0].success);
}

#[tokio::test]
async fn test_panicking_trigger_does_not_take_down_the_tick() {
    let monitor = Arc::new(
        HealthMonitor::builder(config())
            .provider(Gauge::new(Domain::Memory, 0.90))
            .strategy(
                Strategy::builder(
                    "fragile",
                    action_fn(|_| async { Ok(ActionReport::released(1.0)) }),
                )
                .domain(Domain::Memory)
                .priority(1)
                .trigger(|_| panic!("bad trigger"))
                .build(),
            )
            .strategy(trim_strategy())
            .build()
            .unwrap(),
    );

    let ticking = Arc::clone(&monitor);
    let report = tokio::spawn(async move { ticking.tick(Domain::Memory).await })
        .await
        .expect("tick survives a panicking trigger");
    assert_eq!(report.snapshot.status, Status::Critical);
    let cycle = report.cycle.expect("auto-cleanup runs").unwrap();
    assert_eq!(cycle.outcomes.len(), 1);
    assert_eq!(cycle.outcomes[0].strategy, "trim-buffers");

    let results = monitor.force_cleanup(&[Domain::Memory]).await;
    let forced = results[0].as_ref().unwrap();
    assert_eq!(forced.total_released, 4096.0);
}

#[tokio::test]
async fn test_rising_load_publishes_each_transition() {
    let gauge = Gauge::new(Domain::Memory, 0.50);
    let monitor = HealthMonitor::builder(MonitorConfig {
        enable_auto_cleanup: false,
        ..config()
    })
    .provider(gauge.clone())
    .build()
    .unwrap();
    let mut sub = monitor.subscribe();

    for ratio in [0.50, 0.80, 0.90, 0.96, 0.40] {
        gauge.set(ratio);
        monitor.tick(Domain::Memory).await;
    }

    let transitions: Vec<(Status, Status)> = sub
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            MonitorEvent::StatusChanged { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (Status::Normal, Status::Warning),
            (Status::Warning, Status::Critical),
            (Status::Critical, Status::Exhausted),
            (Status::Exhausted, Status::Normal),
        ]
    );
    assert_eq!(monitor.history().aggregate(Domain::Memory).sample_count, 5);
}

#[tokio::test]
async fn test_auto_cleanup_disabled_still_allows_forced_cleanup() {
    let monitor = HealthMonitor::builder(MonitorConfig {
        enable_auto_cleanup: false,
        ..config()
    })
    .provider(Gauge::new(Domain::Memory, 0.97))
    .strategy(trim_strategy())
    .build()
    .unwrap();

    let report = monitor.tick(Domain::Memory).await;
    assert_eq!(report.snapshot.status, Status::Exhausted);
    assert!(report.cycle.is_none());
    assert_eq!(monitor.executor().summary().cycles, 0);

    let results = monitor.force_cleanup(&[Domain::Memory]).await;
    assert_eq!(results.len(), 1);
    let cycle = results[0].as_ref().unwrap();
    assert!(cycle.forced);
    assert_eq!(cycle.total_released, 4096.0);
}

#[tokio::test]
async fn test_forced_cleanup_of_quiet_domain_is_empty() {
    let monitor = HealthMonitor::builder(config())
        .provider(Gauge::new(Domain::Memory, 0.10))
        .strategy(trim_strategy())
        .build()
        .unwrap();

    let results = monitor.force_cleanup(&[]).await;
    let cycle = results[0].as_ref().unwrap();
    assert!(!cycle.attempted());
}

#[tokio::test(start_paused = true)]
async fn test_timer_ticks_until_stopped() {
    let gauge = Gauge::new(Domain::Memory, 0.10);
    let monitor = HealthMonitor::builder(config())
        .provider(gauge.clone())
        .build()
        .unwrap();

    assert_ok!(monitor.start(Domain::Memory, Duration::from_secs(1)));
    assert!(monitor.is_running(Domain::Memory));
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert!(gauge.reads() >= 3);

    assert!(monitor.stop(Domain::Memory));
    assert!(!monitor.stop(Domain::Memory));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after_stop = gauge.reads();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(gauge.reads(), after_stop);
    assert!(monitor.running_domains().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_interval_change_rearms_running_timers() {
    let monitor = HealthMonitor::builder(MonitorConfig {
        monitoring_interval_ms: 1_000,
        ..config()
    })
    .provider(Gauge::new(Domain::Memory, 0.10))
    .build()
    .unwrap();

    assert_ok!(monitor.start_all());
    assert_eq!(monitor.interval(Domain::Memory), Some(Duration::from_secs(1)));

    let mut updated = monitor.config();
    updated.monitoring_interval_ms = 5_000;
    monitor.update_config(updated).unwrap();
    assert_eq!(monitor.interval(Domain::Memory), Some(Duration::from_secs(5)));

    let mut invalid = monitor.config();
    invalid.monitoring_interval_ms = 0;
    assert_err!(monitor.update_config(invalid));
    assert_eq!(monitor.interval(Domain::Memory), Some(Duration::from_secs(5)));

    monitor.shutdown().await;
    assert!(!monitor.is_running(Domain::Memory));
}

#[tokio::test(start_paused = true)]
async fn test_interval_change_keeps_explicit_intervals() {
    let monitor = HealthMonitor::builder(MonitorConfig {
        monitoring_interval_ms: 1_000,
        ..config()
    })
    .provider(Gauge::new(Domain::Memory, 0.10))
    .provider(Gauge::new(Domain::Cpu, 0.10))
    .build()
    .unwrap();

    assert_ok!(monitor.start_all());
    assert_ok!(monitor.start(Domain::Cpu, Duration::from_secs(3)));

    let mut updated = monitor.config();
    updated.monitoring_interval_ms = 5_000;
    monitor.update_config(updated).unwrap();
    assert_eq!(monitor.interval(Domain::Memory), Some(Duration::from_secs(5)));
    assert_eq!(monitor.interval(Domain::Cpu), Some(Duration::from_secs(3)));

    // An explicit interval the new sample timeout no longer fits under
    // falls back to the configured one.
    let mut slower = monitor.config();
    slower.sample_timeout_ms = 4_000;
    monitor.update_config(slower).unwrap();
    assert_eq!(monitor.interval(Domain::Cpu), Some(Duration::from_secs(5)));

    let mut faster = monitor.config();
    faster.monitoring_interval_ms = 4_500;
    monitor.update_config(faster).unwrap();
    assert_eq!(monitor.interval(Domain::Cpu), Some(Duration::from_millis(4_500)));

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_rejects_interval_at_sample_timeout() {
    let monitor = HealthMonitor::builder(config())
        .provider(Gauge::new(Domain::Memory, 0.10))
        .build()
        .unwrap();

    assert_err!(monitor.start(Domain::Memory, Duration::from_millis(500)));
    assert_err!(monitor.start(Domain::Memory, Duration::from_millis(200)));
    assert!(!monitor.is_running(Domain::Memory));
    assert_ok!(monitor.start(Domain::Memory, Duration::from_millis(501)));
    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_publishes_stop_event() {
    let monitor = HealthMonitor::builder(config())
        .provider(Gauge::new(Domain::Memory, 0.10))
        .build()
        .unwrap();
    let mut sub = monitor.subscribe();

    monitor.start(Domain::Memory, Duration::from_secs(1)).unwrap();
    monitor.shutdown().await;

    let names: Vec<&str> = sub.drain().iter().map(|e| e.name()).collect();
    assert_eq!(names.first(), Some(&"monitoring-started"));
    assert_eq!(names.last(), Some(&"monitoring-stopped"));
}

#[tokio::test]
async fn test_attached_error_source_drives_channel_status() {
    let kind = ErrorKind::Network;
    let domain = Domain::Errors(kind);
    let mut cfg = config();
    cfg.domains = vec![domain];
    cfg.enable_auto_cleanup = false;
    cfg.errors.budget = 4;
    let monitor = HealthMonitor::builder(cfg).build().unwrap();

    let (tx, rx) = mpsc::channel(16);
    monitor.attach_error_source(rx).unwrap();
    for _ in 0..4 {
        tx.send(ErrorEvent::new(kind, "connection reset")).await.unwrap();
    }

    for _ in 0..100 {
        if monitor.status(domain) == Some(Status::Exhausted) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(monitor.status(domain), Some(Status::Exhausted));
    assert_eq!(monitor.sampler().error_tracker().count(kind), 4);
}
