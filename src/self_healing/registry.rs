//! Strategy registry and cooldown bookkeeping

use super::Strategy;
use crate::resource::{Domain, Snapshot};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Registration handle, unique for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StrategyId(u64);

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Entry {
    id: StrategyId,
    strategy: Arc<Strategy>,
    enabled: bool,
}

/// A strategy selected for a snapshot.
#[derive(Debug, Clone)]
pub struct ApplicableStrategy {
    pub id: StrategyId,
    pub strategy: Arc<Strategy>,
}

/// A trigger predicate that panicked while being evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerFault {
    pub id: StrategyId,
    pub strategy: String,
    pub error: String,
}

/// Result of matching a snapshot against the registry.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub applicable: Vec<ApplicableStrategy>,
    pub faults: Vec<TriggerFault>,
}

/// Registered strategies, kept sorted by priority then registration order.
///
/// Cooldowns are tracked per (strategy, domain) pair, so a strategy bound to
/// both `cpu` and `connections` can act on each independently.
pub struct StrategyRegistry {
    entries: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
    last_executed: Mutex<HashMap<(StrategyId, Domain), Instant>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            last_executed: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, strategy: Strategy) -> StrategyId {
        let id = StrategyId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(
            strategy = %strategy.name,
            id = %id,
            priority = strategy.priority,
            "Recovery strategy registered"
        );
        let mut entries = self.entries.write();
        entries.push(Entry {
            id,
            enabled: strategy.enabled,
            strategy: Arc::new(strategy),
        });
        entries.sort_by_key(|e| (e.strategy.priority, e.id));
        id
    }

    /// Register `strategy` with `domain` added to its bindings.
    pub fn register_for(&self, domain: Domain, mut strategy: Strategy) -> StrategyId {
        if !strategy.domains.contains(&domain) {
            strategy.domains.push(domain);
        }
        self.register(strategy)
    }

    pub fn unregister(&self, id: StrategyId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        drop(entries);
        if removed {
            self.last_executed.lock().retain(|(sid, _), _| *sid != id);
        }
        removed
    }

    /// Enable or disable every strategy called `name`. Returns how many matched.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> usize {
        let mut matched = 0;
        for entry in self.entries.write().iter_mut().filter(|e| e.strategy.name == name) {
            entry.enabled = enabled;
            matched += 1;
        }
        if matched > 0 {
            debug!(strategy = name, enabled, "Strategy toggled");
        }
        matched
    }

    /// Enabled strategies whose domain and trigger match, in priority order.
    pub fn list_applicable(&self, snapshot: &Snapshot) -> Vec<ApplicableStrategy> {
        self.select(snapshot).applicable
    }

    /// Like [`list_applicable`](Self::list_applicable), also reporting
    /// triggers that panicked. Those strategies are left out.
    pub fn select(&self, snapshot: &Snapshot) -> Selection {
        let mut selection = Selection::default();
        for entry in self.entries.read().iter().filter(|e| e.enabled) {
            match entry.strategy.evaluate(snapshot) {
                Ok(true) => selection.applicable.push(ApplicableStrategy {
                    id: entry.id,
                    strategy: Arc::clone(&entry.strategy),
                }),
                Ok(false) => {}
                Err(error) => {
                    warn!(
                        strategy = %entry.strategy.name,
                        domain = %snapshot.domain,
                        error = %error,
                        "Strategy trigger panicked"
                    );
                    selection.faults.push(TriggerFault {
                        id: entry.id,
                        strategy: entry.strategy.name.clone(),
                        error,
                    });
                }
            }
        }
        selection
    }

    pub fn get(&self, id: StrategyId) -> Option<Arc<Strategy>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.id == id)
            .map(|e| Arc::clone(&e.strategy))
    }

    /// Names in priority order.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|e| e.strategy.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_executed(&self, id: StrategyId, domain: Domain) -> Option<Instant> {
        self.last_executed.lock().get(&(id, domain)).copied()
    }

    /// Time left before `id` may run on `domain` again, if any.
    pub fn cooldown_remaining(&self, id: StrategyId, cooldown: Duration, domain: Domain) -> Option<Duration> {
        let last = self.last_executed(id, domain)?;
        let elapsed = Instant::now().saturating_duration_since(last);
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    pub(crate) fn mark_executed(&self, id: StrategyId, domain: Domain, at: Instant) {
        self.last_executed.lock().insert((id, domain), at);
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
