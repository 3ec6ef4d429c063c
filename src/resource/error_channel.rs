//! Sliding-window error accounting for application error channels

use super::{Domain, ErrorKind, ResourceStats};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Error reported by an upstream error source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    /// Operation or component that failed
    pub context: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn domain(&self) -> Domain {
        Domain::Errors(self.kind)
    }
}

#[derive(Debug, Default)]
struct Channel {
    seen: VecDeque<Instant>,
    last_message: Option<String>,
    total: u64,
}

#[derive(Debug, Clone, Copy)]
struct WindowPolicy {
    window: Duration,
    budget: u32,
}

/// Counts errors per kind inside a rolling window.
///
/// The channel's usage ratio is `errors in window / budget`, so a budget of
/// 20 with 10 recent errors reads as 50% load.
pub struct ErrorTracker {
    policy: Mutex<WindowPolicy>,
    channels: Mutex<HashMap<ErrorKind, Channel>>,
}

impl ErrorTracker {
    pub fn new(window: Duration, budget: u32) -> Self {
        Self {
            policy: Mutex::new(WindowPolicy {
                window,
                budget: budget.max(1),
            }),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_policy(&self, window: Duration, budget: u32) {
        *self.policy.lock() = WindowPolicy {
            window,
            budget: budget.max(1),
        };
    }

    /// Record one error occurrence.
    pub fn record(&self, event: &ErrorEvent) {
        let window = self.policy.lock().window;
        let now = Instant::now();
        let mut channels = self.channels.lock();
        let channel = channels.entry(event.kind).or_default();
        channel.seen.push_back(now);
        channel.last_message = Some(event.message.clone());
        channel.total += 1;
        prune(&mut channel.seen, now, window);
        debug!(kind = event.kind.as_str(), in_window = channel.seen.len(), "Error recorded");
    }

    /// Errors of `kind` inside the current window.
    pub fn count(&self, kind: ErrorKind) -> usize {
        let window = self.policy.lock().window;
        let now = Instant::now();
        let mut channels = self.channels.lock();
        channels
            .get_mut(&kind)
            .map(|c| {
                prune(&mut c.seen, now, window);
                c.seen.len()
            })
            .unwrap_or(0)
    }

    /// Reading for the `errors/<kind>` domain.
    pub fn stats(&self, kind: ErrorKind) -> ResourceStats {
        let policy = *self.policy.lock();
        let in_window = self.count(kind);
        let channels = self.channels.lock();
        let channel = channels.get(&kind);

        let mut stats = ResourceStats::new(in_window as f64, policy.budget as f64, "errors")
            .with_meta("window_ms", policy.window.as_millis() as u64)
            .with_meta("total", channel.map(|c| c.total).unwrap_or(0));
        if let Some(message) = channel.and_then(|c| c.last_message.clone()) {
            stats = stats.with_meta("last_error", message);
        }
        stats
    }

    /// Forget the windowed errors of `kind`, returning how many were dropped.
    pub fn reset(&self, kind: ErrorKind) -> usize {
        let mut channels = self.channels.lock();
        channels
            .get_mut(&kind)
            .map(|c| {
                let dropped = c.seen.len();
                c.seen.clear();
                dropped
            })
            .unwrap_or(0)
    }
}

fn prune(seen: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while seen
        .front()
        .map(|t| now.duration_since(*t) > window)
        .unwrap_or(false)
    {
        seen.pop_front();
    }
}
