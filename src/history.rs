//! History & Statistics Store
//!
//! A bounded, time-windowed record of snapshots and recovery outcomes per
//! domain. Eviction runs on every write: entries older than the retention
//! window go first, then the oldest entries beyond the count cap.
//!
//! Aggregates over usage (average/peak/min) and the recovery success rate are
//! computed from retained entries only. The per-status and cleanup counters
//! are cumulative since the domain was first tracked or last cleared.

use crate::resource::{Domain, Snapshot, Status};
use crate::self_healing::RecoveryOutcome;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HistoryEntry {
    Snapshot(Snapshot),
    Outcome(RecoveryOutcome),
}

impl HistoryEntry {
    pub fn domain(&self) -> Domain {
        match self {
            HistoryEntry::Snapshot(s) => s.domain,
            HistoryEntry::Outcome(o) => o.domain,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            HistoryEntry::Snapshot(s) => s.timestamp,
            HistoryEntry::Outcome(o) => o.timestamp,
        }
    }

    pub fn as_snapshot(&self) -> Option<&Snapshot> {
        match self {
            HistoryEntry::Snapshot(s) => Some(s),
            HistoryEntry::Outcome(_) => None,
        }
    }

    pub fn as_outcome(&self) -> Option<&RecoveryOutcome> {
        match self {
            HistoryEntry::Outcome(o) => Some(o),
            HistoryEntry::Snapshot(_) => None,
        }
    }
}

/// Filter for [`HistoryStore::query`]. Bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, at: DateTime<Utc>) -> bool {
        self.since.is_none_or(|s| at >= s) && self.until.is_none_or(|u| at <= u)
    }
}

/// Rolling aggregates for one domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub domain: Option<Domain>,
    pub avg_usage: f64,
    pub peak_usage: f64,
    pub min_usage: f64,
    /// Known snapshots currently retained
    pub sample_count: usize,
    pub normal_count: u64,
    pub warning_count: u64,
    pub critical_count: u64,
    pub exhausted_count: u64,
    /// Samples that could not be read
    pub unknown_count: u64,
    /// Recovery outcomes recorded
    pub cleanup_count: u64,
    /// Share of retained outcomes that succeeded; `None` with no outcomes
    pub success_rate: Option<f64>,
    pub total_released: f64,
    pub last_status: Option<Status>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    by_status: [u64; 4],
    unknown: u64,
    cleanups: u64,
}

#[derive(Debug)]
struct DomainHistory {
    entries: VecDeque<HistoryEntry>,
    counters: Counters,
    start_time: DateTime<Utc>,
    last_update: Option<DateTime<Utc>>,
}

impl DomainHistory {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            counters: Counters::default(),
            start_time: Utc::now(),
            last_update: None,
        }
    }

    fn evict(&mut self, policy: &RetentionPolicy, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        if let Some(cutoff) = now.checked_sub_signed(policy.retention) {
            self.entries.retain(|e| e.timestamp() >= cutoff);
        }
        while self.entries.len() > policy.max_records {
            self.entries.pop_front();
        }
        before - self.entries.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct RetentionPolicy {
    retention: chrono::Duration,
    max_records: usize,
}

impl RetentionPolicy {
    fn new(retention: Duration, max_records: usize) -> Self {
        Self {
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
            max_records,
        }
    }
}

/// Per-domain history with retention and rolling statistics.
pub struct HistoryStore {
    policy: RwLock<RetentionPolicy>,
    domains: Mutex<HashMap<Domain, DomainHistory>>,
}

impl HistoryStore {
    pub fn new(retention: Duration, max_records: usize) -> Self {
        Self {
            policy: RwLock::new(RetentionPolicy::new(retention, max_records)),
            domains: Mutex::new(HashMap::new()),
        }
    }

    /// Change retention; applied to existing entries right away.
    pub fn set_retention(&self, retention: Duration, max_records: usize) {
        let policy = RetentionPolicy::new(retention, max_records);
        *self.policy.write() = policy;
        let now = Utc::now();
        let evicted: usize = self
            .domains
            .lock()
            .values_mut()
            .map(|h| h.evict(&policy, now))
            .sum();
        if evicted > 0 {
            debug!(evicted, "History trimmed to new retention");
        }
    }

    /// Begin tracking `domain`, fixing its start time. No-op if already tracked.
    pub fn track(&self, domain: Domain) {
        self.domains.lock().entry(domain).or_insert_with(DomainHistory::new);
    }

    /// Append an entry, update counters and evict.
    ///
    /// Eviction runs over every domain, so idle domains also drop entries
    /// past retention. Returns entries evicted across all domains.
    pub fn record(&self, entry: HistoryEntry) -> usize {
        let policy = *self.policy.read();
        let now = Utc::now();
        let mut domains = self.domains.lock();
        let history = domains.entry(entry.domain()).or_insert_with(DomainHistory::new);

        match &entry {
            HistoryEntry::Snapshot(s) if s.is_unknown() => history.counters.unknown += 1,
            HistoryEntry::Snapshot(s) => history.counters.by_status[status_index(s.status)] += 1,
            HistoryEntry::Outcome(_) => history.counters.cleanups += 1,
        }
        history.last_update = Some(now);
        history.entries.push_back(entry);
        domains.values_mut().map(|h| h.evict(&policy, now)).sum()
    }

    /// Entries for `domain`, newest first.
    pub fn query(&self, domain: Domain, query: &HistoryQuery) -> Vec<HistoryEntry> {
        let domains = self.domains.lock();
        let Some(history) = domains.get(&domain) else {
            return Vec::new();
        };
        history
            .entries
            .iter()
            .rev()
            .filter(|e| query.matches(e.timestamp()))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Retained snapshots for `domain`, newest first.
    pub fn snapshots(&self, domain: Domain, query: &HistoryQuery) -> Vec<Snapshot> {
        let domains = self.domains.lock();
        let Some(history) = domains.get(&domain) else {
            return Vec::new();
        };
        history
            .entries
            .iter()
            .rev()
            .filter_map(HistoryEntry::as_snapshot)
            .filter(|s| query.matches(s.timestamp))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn len(&self, domain: Domain) -> usize {
        self.domains
            .lock()
            .get(&domain)
            .map(|h| h.entries.len())
            .unwrap_or(0)
    }

    pub fn aggregate(&self, domain: Domain) -> Statistics {
        let domains = self.domains.lock();
        let Some(history) = domains.get(&domain) else {
            return Statistics {
                domain: Some(domain),
                ..Statistics::default()
            };
        };

        let mut stats = Statistics {
            domain: Some(domain),
            normal_count: history.counters.by_status[0],
            warning_count: history.counters.by_status[1],
            critical_count: history.counters.by_status[2],
            exhausted_count: history.counters.by_status[3],
            unknown_count: history.counters.unknown,
            cleanup_count: history.counters.cleanups,
            start_time: Some(history.start_time),
            last_update: history.last_update,
            ..Statistics::default()
        };

        let mut sum = 0.0;
        let mut peak = f64::MIN;
        let mut min = f64::MAX;
        let mut outcomes = 0usize;
        let mut succeeded = 0usize;
        for entry in &history.entries {
            match entry {
                HistoryEntry::Snapshot(s) if !s.is_unknown() => {
                    sum += s.usage_ratio;
                    peak = peak.max(s.usage_ratio);
                    min = min.min(s.usage_ratio);
                    stats.sample_count += 1;
                    stats.last_status = Some(s.status);
                }
                HistoryEntry::Snapshot(_) => {}
                HistoryEntry::Outcome(o) => {
                    outcomes += 1;
                    if o.success {
                        succeeded += 1;
                        stats.total_released += o.amount_released;
                    }
                }
            }
        }

        if stats.sample_count > 0 {
            stats.avg_usage = sum / stats.sample_count as f64;
            stats.peak_usage = peak;
            stats.min_usage = min;
        }
        if outcomes > 0 {
            stats.success_rate = Some(succeeded as f64 / outcomes as f64);
        }
        stats
    }

    /// Tracked domains, sorted.
    pub fn domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self.domains.lock().keys().copied().collect();
        domains.sort();
        domains
    }

    /// Drop everything recorded for `domain` and restart its counters.
    pub fn clear(&self, domain: Domain) {
        if let Some(history) = self.domains.lock().get_mut(&domain) {
            *history = DomainHistory::new();
        }
    }

    pub fn clear_all(&self) {
        for history in self.domains.lock().values_mut() {
            *history = DomainHistory::new();
        }
    }
}

fn status_index(status: Status) -> usize {
    match status {
        Status::Normal => 0,
        Status::Warning => 1,
        Status::Critical => 2,
        Status::Exhausted => 3,
    }
}
