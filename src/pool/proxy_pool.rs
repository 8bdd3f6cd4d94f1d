//! Proxy pool: lease freshness, replenishment and least-recently-used hand-out
//!
//! - Expired leases are swept on every acquire
//! - Leases ending within the replacement threshold are never handed out
//! - Replenishment happens synchronously, under the pool lock, so concurrent
//!   callers trigger a single provider call
//! - New leases are validated once, concurrently, when they enter the pool
//! - When replenishment comes up empty the pool runs without a proxy and
//!   leaves the provider alone for `degraded-retry-secs`

use crate::config::ProxyConfig;
use crate::state::Lease;
use crate::transport::{ProxyProvider, ProxyValidator};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Smallest batch requested from the provider
const MIN_REPLENISH_BATCH: usize = 5;

/// Owns the proxy leases of the run
pub struct ProxyPool {
    leases: Mutex<Vec<Lease>>,
    /// Only locked while `leases` is held
    degraded_until: Mutex<Option<Instant>>,
    provider: Option<Arc<dyn ProxyProvider>>,
    validator: Option<Arc<dyn ProxyValidator>>,
    config: ProxyConfig,
}

impl ProxyPool {
    /// Creates a pool backed by `provider`
    pub fn new(config: ProxyConfig, provider: Arc<dyn ProxyProvider>) -> Self {
        Self {
            leases: Mutex::new(Vec::new()),
            degraded_until: Mutex::new(None),
            provider: Some(provider),
            validator: None,
            config,
        }
    }

    /// A pool that never hands out a lease
    pub fn disabled() -> Self {
        Self {
            leases: Mutex::new(Vec::new()),
            degraded_until: Mutex::new(None),
            provider: None,
            validator: None,
            config: ProxyConfig::default(),
        }
    }

    /// Validates every new lease with `validator` before admitting it
    pub fn with_validator(mut self, validator: Arc<dyn ProxyValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.provider.is_some()
    }

    /// Hands out the least-recently-used lease that is not about to expire
    ///
    /// # Returns
    ///
    /// * `Some(Lease)` - A lease that stays usable beyond the replacement threshold
    /// * `None` - Proxies are disabled or the pool is degraded to running without one
    pub async fn acquire(&self) -> Option<Lease> {
        self.acquire_many(1).await.into_iter().next()
    }

    /// Hands out up to `n` distinct leases
    ///
    /// Fewer than `n` are returned only when the provider cannot supply enough.
    /// Leases inside the replacement threshold are never handed out.
    pub async fn acquire_many(&self, n: usize) -> Vec<Lease> {
        if n == 0 || !self.is_enabled() {
            return Vec::new();
        }

        let mut leases = self.leases.lock().await;
        sweep(&mut leases, Instant::now());

        let margin = self.config.replacement_threshold();
        let fresh = count_fresh(&leases, Instant::now(), margin);
        if leases.len() < self.config.min_pool_size || fresh < n {
            let mut degraded_until = self.degraded_until.lock().await;
            let retry_at = *degraded_until;
            match retry_at {
                Some(until) if until > Instant::now() => {
                    tracing::trace!("Proxy pool degraded, next replenishment at {:?}", until);
                }
                _ => {
                    self.replenish(&mut leases, n).await;
                    *degraded_until = self.degraded_deadline(&leases);
                }
            }
        }

        // The provider call may have taken a while
        let now = Instant::now();
        sweep(&mut leases, now);

        let mut fresh_idx: Vec<usize> = (0..leases.len())
            .filter(|&i| !leases[i].expires_soon(now, margin))
            .collect();
        fresh_idx.sort_by_key(|&i| leases[i].usage_key());
        fresh_idx.truncate(n);

        if fresh_idx.is_empty() {
            tracing::debug!("No proxy lease available, continuing without a proxy");
        }

        fresh_idx
            .into_iter()
            .map(|i| {
                let lease = &mut leases[i];
                lease.last_used_at = Some(now);
                lease.task_count += 1;
                lease.clone()
            })
            .collect()
    }

    /// When replenishment left no usable lease, the instant before which it is not retried
    fn degraded_deadline(&self, leases: &[Lease]) -> Option<Instant> {
        let retry = self.config.degraded_retry();
        let now = Instant::now();
        if retry.is_zero() || count_fresh(leases, now, self.config.replacement_threshold()) > 0 {
            return None;
        }
        tracing::warn!(
            "Proxy pool degraded to no proxy, next replenishment in {}s",
            retry.as_secs()
        );
        Some(now + retry)
    }

    /// Requests and validates new leases until the pool is healthy or attempts run out
    async fn replenish(&self, leases: &mut Vec<Lease>, wanted: usize) {
        let Some(provider) = &self.provider else {
            return;
        };
        let margin = self.config.replacement_threshold();

        for attempt in 1..=self.config.replenish_attempts {
            let fresh = count_fresh(leases, Instant::now(), margin);
            let target = self.config.min_pool_size.max(wanted);
            if fresh >= wanted && leases.len() >= self.config.min_pool_size {
                return;
            }
            let request = target.saturating_sub(leases.len()).max(wanted.saturating_sub(fresh));
            let request = request.max(MIN_REPLENISH_BATCH);

            tracing::info!(
                "Replenishing proxy pool (attempt {}/{}): requesting {} leases, {} held",
                attempt,
                self.config.replenish_attempts,
                request,
                leases.len()
            );

            let provisioned = match provider.provision(request).await {
                Ok(provisioned) => provisioned,
                Err(e) => {
                    tracing::warn!("Proxy provisioning failed: {}", e);
                    continue;
                }
            };

            let now = Instant::now();
            let mut keys: HashSet<String> = leases.iter().map(Lease::key).collect();
            let candidates: Vec<Lease> = provisioned
                .into_iter()
                .filter(|lease| !lease.is_expired(now) && keys.insert(lease.key()))
                .collect();

            let admitted = self.validate_batch(candidates).await;
            let count = admitted.len();
            leases.extend(admitted);
            tracing::info!("Admitted {} new leases ({} held)", count, leases.len());
        }

        if count_fresh(leases, Instant::now(), margin) == 0 {
            tracing::warn!(
                "Proxy replenishment exhausted after {} attempts",
                self.config.replenish_attempts
            );
        }
    }

    /// Validates a provisioned batch concurrently; returns the leases that passed
    async fn validate_batch(&self, candidates: Vec<Lease>) -> Vec<Lease> {
        let Some(validator) = &self.validator else {
            return candidates
                .into_iter()
                .map(|mut lease| {
                    lease.valid = true;
                    lease
                })
                .collect();
        };

        let mut checks = JoinSet::new();
        for lease in candidates {
            let validator = Arc::clone(validator);
            checks.spawn(async move {
                let passed = validator.validate(&lease).await;
                (lease, passed)
            });
        }

        let mut admitted = Vec::new();
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((mut lease, true)) => {
                    lease.valid = true;
                    admitted.push(lease);
                }
                Ok((lease, false)) => {
                    tracing::debug!("Discarding lease {} after failed validation", lease.endpoint);
                }
                Err(e) => tracing::warn!("Lease validation task failed: {}", e),
            }
        }
        admitted
    }

    /// Removes leases whose `expires_at` has passed
    ///
    /// # Returns
    ///
    /// The number of leases removed
    pub async fn sweep_expired(&self) -> usize {
        let mut leases = self.leases.lock().await;
        sweep(&mut leases, Instant::now())
    }

    /// Records a network failure through `lease`; discards it at the failure limit
    ///
    /// # Returns
    ///
    /// `true` when the lease is no longer in the pool, either discarded now or
    /// gone already. Holders must stop using it.
    pub async fn report_failure(&self, lease: &Lease) -> bool {
        let key = lease.key();
        let mut leases = self.leases.lock().await;
        let Some(index) = leases.iter().position(|held| held.key() == key) else {
            return true;
        };
        leases[index].failures += 1;
        if leases[index].failures < self.config.max_failures {
            return false;
        }
        let removed = leases.remove(index);
        tracing::info!(
            "Discarded lease {} after {} failures",
            removed.endpoint,
            removed.failures
        );
        true
    }

    /// Removes a lease immediately
    pub async fn discard(&self, lease: &Lease) {
        let key = lease.key();
        self.leases.lock().await.retain(|held| held.key() != key);
    }

    pub async fn len(&self) -> usize {
        self.leases.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<Lease> {
        self.leases.lock().await.clone()
    }
}

fn sweep(leases: &mut Vec<Lease>, now: Instant) -> usize {
    let before = leases.len();
    leases.retain(|lease| !lease.is_expired(now));
    let removed = before - leases.len();
    if removed > 0 {
        tracing::debug!("Swept {} expired leases", removed);
    }
    removed
}

fn count_fresh(leases: &[Lease], now: Instant, margin: std::time::Duration) -> usize {
    leases
        .iter()
        .filter(|lease| !lease.expires_soon(now, margin))
        .count()
}
