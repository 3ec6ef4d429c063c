//! Self-Healing System
//!
//! Recovery strategies are plain data: a trigger predicate over a snapshot,
//! an async action, a priority and a cooldown. The registry keeps them in
//! priority order and remembers when each last ran; the executor runs the
//! applicable ones for a domain as one serialized cycle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Self-Healing Engine                       │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐   │
//! │  │ Strategy      │  │ Recovery      │  │ Built-in      │   │
//! │  │ Registry      │──│ Executor      │  │ Strategies    │   │
//! │  └───────────────┘  └───────────────┘  └───────────────┘   │
//! │     cooldowns          single-flight      caches, limits,   │
//! │     priorities         retries, throttle  restarts          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod executor;
pub mod registry;
pub mod strategies;

pub use executor::{
    CycleReport, ExecutorSummary, RecoveryExecutor, RecoveryOutcome, RecoveryPolicy,
    SkippedStrategy,
};
pub use registry::{ApplicableStrategy, Selection, StrategyId, StrategyRegistry, TriggerFault};

use crate::resource::{Domain, Snapshot, Status};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// What a successful action reports back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    /// Units released, in the domain's unit
    pub amount_released: f64,
    pub detail: Option<String>,
}

impl ActionReport {
    pub fn released(amount: f64) -> Self {
        Self {
            amount_released: amount,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The remedial work of a strategy. An `Err` (or a panic) is one failed attempt.
#[async_trait::async_trait]
pub trait RecoveryAction: Send + Sync {
    async fn run(&self, snapshot: &Snapshot) -> anyhow::Result<ActionReport>;
}

/// Adapter turning an async closure into a [`RecoveryAction`].
pub struct FnAction<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> RecoveryAction for FnAction<F>
where
    F: Fn(Snapshot) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ActionReport>> + Send,
{
    async fn run(&self, snapshot: &Snapshot) -> anyhow::Result<ActionReport> {
        (self.f)(snapshot.clone()).await
    }
}

/// Wrap an async closure as an action.
pub fn action_fn<F, Fut>(f: F) -> FnAction<F>
where
    F: Fn(Snapshot) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ActionReport>> + Send,
{
    FnAction { f }
}

pub type TriggerFn = Arc<dyn Fn(&Snapshot) -> bool + Send + Sync>;

/// A named remedial action bound to one or more domains.
#[derive(Clone)]
pub struct Strategy {
    pub name: String,
    pub description: String,
    pub domains: Vec<Domain>,
    pub priority: u32,
    pub cooldown: Duration,
    /// Per-strategy attempt cap; falls back to the executor policy
    pub max_retries: Option<u32>,
    pub enabled: bool,
    trigger: TriggerFn,
    action: Arc<dyn RecoveryAction>,
}

impl Strategy {
    pub fn builder(name: impl Into<String>, action: impl RecoveryAction + 'static) -> StrategyBuilder {
        StrategyBuilder::new(name.into(), Arc::new(action))
    }

    pub fn applies_to(&self, domain: Domain) -> bool {
        self.domains.contains(&domain)
    }

    /// Whether `snapshot` calls for this strategy. A panicking trigger counts
    /// as not triggered.
    pub fn is_triggered(&self, snapshot: &Snapshot) -> bool {
        self.evaluate(snapshot).unwrap_or(false)
    }

    /// Run the trigger against `snapshot`, returning the panic message if the
    /// predicate panicked.
    pub fn evaluate(&self, snapshot: &Snapshot) -> Result<bool, String> {
        if !self.applies_to(snapshot.domain) || snapshot.is_unknown() {
            return Ok(false);
        }
        catch_unwind(AssertUnwindSafe(|| (self.trigger)(snapshot)))
            .map_err(|panic| panic_message(&*panic))
    }

    pub fn action(&self) -> &Arc<dyn RecoveryAction> {
        &self.action
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("name", &self.name)
            .field("domains", &self.domains)
            .field("priority", &self.priority)
            .field("cooldown", &self.cooldown)
            .field("max_retries", &self.max_retries)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Builder for [`Strategy`]. Without an explicit trigger a strategy fires at
/// [`Status::Warning`] and above.
pub struct StrategyBuilder {
    strategy: Strategy,
}

impl StrategyBuilder {
    fn new(name: String, action: Arc<dyn RecoveryAction>) -> Self {
        Self {
            strategy: Strategy {
                name,
                description: String::new(),
                domains: Vec::new(),
                priority: 100,
                cooldown: Duration::from_secs(60),
                max_retries: None,
                enabled: true,
                trigger: min_status_trigger(Status::Warning),
                action,
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.strategy.description = description.into();
        self
    }

    pub fn domain(mut self, domain: Domain) -> Self {
        if !self.strategy.domains.contains(&domain) {
            self.strategy.domains.push(domain);
        }
        self
    }

    pub fn domains(self, domains: impl IntoIterator<Item = Domain>) -> Self {
        domains.into_iter().fold(self, |b, d| b.domain(d))
    }

    /// Lower runs first.
    pub fn priority(mut self, priority: u32) -> Self {
        self.strategy.priority = priority;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.strategy.cooldown = cooldown;
        self
    }

    pub fn max_retries(mut self, attempts: u32) -> Self {
        self.strategy.max_retries = Some(attempts);
        self
    }

    /// Fire once the snapshot reaches `status`.
    pub fn min_status(mut self, status: Status) -> Self {
        self.strategy.trigger = min_status_trigger(status);
        self
    }

    pub fn trigger(mut self, trigger: impl Fn(&Snapshot) -> bool + Send + Sync + 'static) -> Self {
        self.strategy.trigger = Arc::new(trigger);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.strategy.enabled = false;
        self
    }

    pub fn build(self) -> Strategy {
        self.strategy
    }
}

fn min_status_trigger(min: Status) -> TriggerFn {
    Arc::new(move |s: &Snapshot| s.status >= min)
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
