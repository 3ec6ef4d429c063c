//! Point-in-time sampling of one domain

use super::{Domain, ErrorTracker, ResourceStatsProvider, Snapshot};
use crate::errors::ResourceError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Turns provider readings into snapshots.
///
/// `sample` never fails: a provider error, a missing provider, or a read that
/// overruns its timeout all produce an unknown snapshot carrying the reason.
pub struct Sampler {
    providers: RwLock<HashMap<Domain, Arc<dyn ResourceStatsProvider>>>,
    errors: Arc<ErrorTracker>,
}

impl Sampler {
    pub fn new(errors: Arc<ErrorTracker>) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            errors,
        }
    }

    /// Register (or replace) the provider for its domain.
    pub fn register(&self, provider: Arc<dyn ResourceStatsProvider>) {
        let domain = provider.domain();
        if self.providers.write().insert(domain, provider).is_some() {
            debug!(domain = %domain, "Stats provider replaced");
        }
    }

    pub fn has_provider(&self, domain: Domain) -> bool {
        domain.is_error_channel() || self.providers.read().contains_key(&domain)
    }

    pub fn domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self.providers.read().keys().copied().collect();
        domains.sort();
        domains
    }

    pub fn error_tracker(&self) -> &Arc<ErrorTracker> {
        &self.errors
    }

    /// Read `domain`, bounded by `timeout`.
    pub async fn sample(&self, domain: Domain, timeout: Duration) -> Snapshot {
        if let Domain::Errors(kind) = domain {
            return Snapshot::measured(domain, self.errors.stats(kind));
        }

        let provider = self.providers.read().get(&domain).cloned();
        let Some(provider) = provider else {
            return Snapshot::unknown(domain, &ResourceError::NoProvider(domain));
        };

        match tokio::time::timeout(timeout, provider.stats()).await {
            Ok(Ok(stats)) => Snapshot::measured(domain, stats),
            Ok(Err(e)) => {
                warn!(domain = %domain, error = %e, "Sample failed");
                Snapshot::unknown(domain, &e)
            }
            Err(_) => {
                let e = ResourceError::Timeout {
                    domain,
                    timeout_ms: timeout.as_millis() as u64,
                };
                warn!(domain = %domain, error = %e, "Sample timed out");
                Snapshot::unknown(domain, &e)
            }
        }
    }
}
