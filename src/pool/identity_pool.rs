//! Identity pool: account selection, cooldown and health
//!
//! All selection and mutation happens under one mutex, so two workers can
//! never be handed the same identity for overlapping work. `select` marks the
//! chosen identity busy before returning; `release` frees it and applies the
//! consequences of the attempt.

use crate::config::{Config, IdentitiesConfig};
use crate::state::Identity;
use crate::transport::{SessionError, SessionProvider};
use crate::work::FailureKind;
use crate::{Result, SluiceError};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};

/// How an attempt went, from the identity's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Clears the error count
    Success,
    /// Hard block signal; always starts a cooldown
    Blocked,
    /// Counts toward the error threshold
    Error,
    /// Not the identity's fault (network trouble, missing post)
    Neutral,
}

impl ReleaseOutcome {
    /// Maps an execution failure onto its identity consequence
    pub fn for_failure(failure: &FailureKind) -> Self {
        match failure {
            FailureKind::Blocked { .. } => Self::Blocked,
            FailureKind::Malformed(_) | FailureKind::Other(_) => Self::Error,
            FailureKind::Network(_) | FailureKind::Timeout | FailureKind::Rejected(_) => {
                Self::Neutral
            }
        }
    }
}

/// Owns every identity of the run
pub struct IdentityPool {
    identities: Mutex<Vec<Identity>>,
    released: Notify,
    config: IdentitiesConfig,
    error_threshold: u32,
}

impl IdentityPool {
    /// Creates a pool over the given identities
    ///
    /// # Arguments
    ///
    /// * `identities` - Initial identities; all are expected to be healthy
    /// * `config` - Cooldown schedule
    /// * `error_threshold` - Generic errors before an identity is cooled down
    pub fn new(identities: Vec<Identity>, config: IdentitiesConfig, error_threshold: u32) -> Self {
        Self {
            identities: Mutex::new(identities),
            released: Notify::new(),
            config,
            error_threshold,
        }
    }

    /// Builds the pool from the `[[identity]]` entries of a configuration
    pub fn from_config(config: &Config) -> Self {
        let identities = config
            .identity
            .iter()
            .map(|entry| Identity::new(entry.id.clone(), entry.credential.clone()))
            .collect();
        Self::new(
            identities,
            config.identities.clone(),
            config.backoff.error_threshold,
        )
    }

    /// Selects the best available identity and marks it used
    ///
    /// Picks the identity minimizing (error count, last use, request count)
    /// among healthy, idle identities that are not cooling down. When none
    /// qualifies, waits until the earliest cooldown ends (plus a buffer) or
    /// until another worker releases an identity, then tries again.
    ///
    /// # Returns
    ///
    /// * `Ok(Identity)` - A snapshot of the selected identity
    /// * `Err(SluiceError::NoIdentityAvailable)` - No identity is healthy
    pub async fn select(&self) -> Result<Identity> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let wake_at = {
                let mut identities = self.identities.lock().await;
                let now = Instant::now();

                if !identities.iter().any(|identity| identity.healthy) {
                    tracing::error!("All {} identities are unhealthy", identities.len());
                    return Err(SluiceError::NoIdentityAvailable);
                }

                if let Some(index) = best_candidate(&identities, now) {
                    let chosen = &mut identities[index];
                    chosen.record_use(now);
                    tracing::trace!(
                        "Selected identity {} (errors={}, requests={})",
                        chosen.id,
                        chosen.error_count,
                        chosen.request_count
                    );
                    return Ok(chosen.clone());
                }

                earliest_cooldown_end(&identities, now)
            };

            match wake_at {
                Some(until) => {
                    let until = until + self.config.wait_buffer();
                    tracing::info!(
                        "All identities busy or cooling down, waiting {:?}",
                        until.saturating_duration_since(Instant::now())
                    );
                    tokio::select! {
                        _ = sleep_until(until) => {}
                        _ = &mut released => {}
                    }
                }
                None => {
                    tracing::trace!("All healthy identities are busy, waiting for a release");
                    released.await;
                }
            }
        }
    }

    /// Returns an identity to the pool and applies the attempt's consequences
    ///
    /// # Returns
    ///
    /// The cooldown started by this release, if any
    pub async fn release(&self, id: &str, outcome: ReleaseOutcome) -> Option<Duration> {
        let cooldown = {
            let mut identities = self.identities.lock().await;
            let Some(identity) = identities.iter_mut().find(|identity| identity.id == id) else {
                tracing::warn!("Release of unknown identity {}", id);
                return None;
            };
            let now = Instant::now();
            identity.busy = false;
            identity.last_used_at = Some(now);

            match outcome {
                ReleaseOutcome::Success => {
                    identity.error_count = 0;
                    None
                }
                ReleaseOutcome::Blocked => {
                    identity.error_count += 1;
                    let duration = self.config.cooldown_for(identity.error_count);
                    identity.cool_down(now, duration);
                    tracing::warn!(
                        "Identity {} blocked ({} consecutive errors), cooling down for {} min",
                        identity.id,
                        identity.error_count,
                        duration.as_secs() / 60
                    );
                    Some(duration)
                }
                ReleaseOutcome::Error => {
                    identity.error_count += 1;
                    if identity.error_count >= self.error_threshold {
                        let duration = self.config.base_cooldown();
                        identity.cool_down(now, duration);
                        tracing::warn!(
                            "Identity {} reached {} errors, cooling down for {} min",
                            identity.id,
                            identity.error_count,
                            duration.as_secs() / 60
                        );
                        Some(duration)
                    } else {
                        None
                    }
                }
                ReleaseOutcome::Neutral => None,
            }
        };

        self.released.notify_waiters();
        cooldown
    }

    /// Marks an identity's session as dead; it is never selected again
    pub async fn mark_dead(&self, id: &str) {
        {
            let mut identities = self.identities.lock().await;
            if let Some(identity) = identities.iter_mut().find(|identity| identity.id == id) {
                identity.healthy = false;
                identity.busy = false;
                tracing::error!("Identity {} marked unhealthy", id);
            }
        }
        self.released.notify_waiters();
    }

    /// Acquires a session for every healthy identity
    ///
    /// Identities whose session is confirmed dead become unhealthy; other
    /// failures are logged and leave the identity usable.
    ///
    /// # Returns
    ///
    /// The number of healthy identities afterwards
    pub async fn establish_sessions(&self, provider: &dyn SessionProvider) -> usize {
        for identity in self.snapshot().await {
            if !identity.healthy {
                continue;
            }
            if let Err(e) = self.refresh_session(&identity.id, provider).await {
                tracing::warn!("Could not establish session for {}: {}", identity.id, e);
            }
        }
        self.healthy_count().await
    }

    /// Re-derives the session of one identity
    ///
    /// The provider is called without holding the pool lock.
    pub async fn refresh_session(
        &self,
        id: &str,
        provider: &dyn SessionProvider,
    ) -> std::result::Result<(), SessionError> {
        let Some(identity) = self.get(id).await else {
            return Err(SessionError::Unavailable(format!("unknown identity {}", id)));
        };

        match provider.acquire_session(&identity).await {
            Ok(session) => {
                let mut identities = self.identities.lock().await;
                if let Some(identity) = identities.iter_mut().find(|identity| identity.id == id) {
                    identity.session = Some(session);
                }
                tracing::debug!("Refreshed session for identity {}", id);
                Ok(())
            }
            Err(SessionError::Dead(reason)) => {
                self.mark_dead(id).await;
                Err(SessionError::Dead(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Copies of every identity, in pool order
    pub async fn snapshot(&self) -> Vec<Identity> {
        self.identities.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Identity> {
        self.identities
            .lock()
            .await
            .iter()
            .find(|identity| identity.id == id)
            .cloned()
    }

    pub async fn healthy_count(&self) -> usize {
        self.identities
            .lock()
            .await
            .iter()
            .filter(|identity| identity.healthy)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.identities.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Index of the available identity with the smallest selection key
fn best_candidate(identities: &[Identity], now: Instant) -> Option<usize> {
    identities
        .iter()
        .enumerate()
        .filter(|(_, identity)| identity.is_available(now))
        .min_by_key(|(_, identity)| identity.selection_key())
        .map(|(index, _)| index)
}

/// Earliest end of a cooldown among healthy identities
fn earliest_cooldown_end(identities: &[Identity], now: Instant) -> Option<Instant> {
    identities
        .iter()
        .filter(|identity| identity.healthy)
        .filter_map(|identity| identity.cooldown_until)
        .filter(|until| *until > now)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn create_test_pool(ids: &[&str]) -> IdentityPool {
        let identities = ids.iter().map(|id| Identity::new(*id, "cred")).collect();
        IdentityPool::new(identities, IdentitiesConfig::default(), 5)
    }

    struct FixedSessions;

    #[async_trait]
    impl SessionProvider for FixedSessions {
        async fn acquire_session(
            &self,
            identity: &Identity,
        ) -> std::result::Result<String, SessionError> {
            match identity.id.as_str() {
                "dead" => Err(SessionError::Dead("password changed".into())),
                "flaky" => Err(SessionError::Unavailable("login page down".into())),
                _ => Ok(format!("session-{}", identity.id)),
            }
        }
    }

    #[tokio::test]
    async fn test_select_prefers_unused_identity() {
        let pool = create_test_pool(&["a", "b"]);

        let first = pool.select().await.unwrap();
        let second = pool.select().await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.request_count, 1);
        assert!(first.busy);
    }

    #[tokio::test]
    async fn test_select_prefers_fewer_errors() {
        let pool = create_test_pool(&["a", "b"]);
        let a = pool.select().await.unwrap();
        pool.release(&a.id, ReleaseOutcome::Error).await;

        let b = pool.select().await.unwrap();
        pool.release(&b.id, ReleaseOutcome::Success).await;

        // "b" was used more recently but has no errors
        let next = pool.select().await.unwrap();
        assert_eq!(next.id, b.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_identity_cools_down_and_waits() {
        let pool = create_test_pool(&["solo"]);
        let identity = pool.select().await.unwrap();
        let cooldown = pool.release(&identity.id, ReleaseOutcome::Blocked).await;
        assert_eq!(cooldown, Some(Duration::from_secs(15 * 60)));

        let before = Instant::now();
        let again = pool.select().await.unwrap();
        let waited = before.elapsed();

        assert_eq!(again.id, "solo");
        assert!(waited >= Duration::from_secs(15 * 60));
        assert!(waited <= Duration::from_secs(15 * 60 + 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_grows_with_consecutive_errors() {
        let pool = create_test_pool(&["solo"]);

        let id = pool.select().await.unwrap().id;
        let first = pool.release(&id, ReleaseOutcome::Blocked).await;
        let id = pool.select().await.unwrap().id;
        let second = pool.release(&id, ReleaseOutcome::Blocked).await;

        assert_eq!(first, Some(Duration::from_secs(15 * 60)));
        assert_eq!(second, Some(Duration::from_secs(20 * 60)));

        let id = pool.select().await.unwrap().id;
        pool.release(&id, ReleaseOutcome::Success).await;
        let identity = pool.get("solo").await.unwrap();
        assert_eq!(identity.error_count, 0);
        assert!(!identity.busy);
    }

    #[tokio::test]
    async fn test_error_threshold_triggers_cooldown() {
        let pool = IdentityPool::new(
            vec![Identity::new("a", "")],
            IdentitiesConfig::default(),
            2,
        );

        let a = pool.select().await.unwrap();
        assert_eq!(pool.release(&a.id, ReleaseOutcome::Error).await, None);

        let a = pool.select().await.unwrap();
        let cooldown = pool.release(&a.id, ReleaseOutcome::Error).await;
        assert_eq!(cooldown, Some(Duration::from_secs(15 * 60)));

        let identity = pool.get("a").await.unwrap();
        assert!(identity.is_cooling(Instant::now()));
        assert!(identity.healthy);
    }

    #[tokio::test]
    async fn test_neutral_release_keeps_error_count() {
        let pool = create_test_pool(&["a"]);
        let a = pool.select().await.unwrap();
        pool.release(&a.id, ReleaseOutcome::Error).await;
        let a = pool.select().await.unwrap();
        assert_eq!(pool.release(&a.id, ReleaseOutcome::Neutral).await, None);
        assert_eq!(pool.get("a").await.unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn test_no_healthy_identity_is_fatal() {
        let pool = create_test_pool(&["a", "b"]);
        pool.mark_dead("a").await;
        pool.mark_dead("b").await;

        let result = pool.select().await;
        assert!(matches!(result, Err(SluiceError::NoIdentityAvailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_fails_when_last_identity_dies() {
        let pool = Arc::new(create_test_pool(&["a"]));
        let held = pool.select().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.select().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.mark_dead(&held.id).await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SluiceError::NoIdentityAvailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_selects_never_share_an_identity() {
        let pool = Arc::new(create_test_pool(&["a", "b", "c"]));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move { pool.select().await.unwrap().id }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_establish_sessions() {
        let pool = create_test_pool(&["alive", "dead", "flaky"]);
        let healthy = pool.establish_sessions(&FixedSessions).await;
        assert_eq!(healthy, 2);

        let alive = pool.get("alive").await.unwrap();
        assert_eq!(alive.session.as_deref(), Some("session-alive"));

        let dead = pool.get("dead").await.unwrap();
        assert!(!dead.healthy);

        let flaky = pool.get("flaky").await.unwrap();
        assert!(flaky.healthy);
        assert!(flaky.session.is_none());
    }

    #[test]
    fn test_release_outcome_mapping() {
        assert_eq!(
            ReleaseOutcome::for_failure(&FailureKind::Blocked {
                status: Some(403),
                reason: String::new()
            }),
            ReleaseOutcome::Blocked
        );
        assert_eq!(
            ReleaseOutcome::for_failure(&FailureKind::Malformed(String::new())),
            ReleaseOutcome::Error
        );
        assert_eq!(
            ReleaseOutcome::for_failure(&FailureKind::Timeout),
            ReleaseOutcome::Neutral
        );
    }

    proptest! {
        #[test]
        fn prop_cooling_identities_are_never_selected(
            offsets in prop::collection::vec(-600i64..600, 1..12),
            errors in prop::collection::vec(0u32..4, 12),
        ) {
            let now = Instant::now() + Duration::from_secs(3600);
            let identities: Vec<Identity> = offsets
                .iter()
                .enumerate()
                .map(|(i, offset)| {
                    let mut identity = Identity::new(format!("id-{}", i), "");
                    identity.error_count = errors[i];
                    if *offset >= 0 {
                        identity.cooldown_until = Some(now + Duration::from_secs(*offset as u64));
                    } else {
                        identity.cooldown_until = Some(now - Duration::from_secs(offset.unsigned_abs()));
                    }
                    identity
                })
                .collect();

            match best_candidate(&identities, now) {
                Some(index) => {
                    prop_assert!(!identities[index].is_cooling(now));
                    let best = identities[index].selection_key();
                    for other in identities.iter().filter(|i| i.is_available(now)) {
                        prop_assert!(best <= other.selection_key());
                    }
                }
                None => prop_assert!(identities.iter().all(|i| i.is_cooling(now))),
            }
        }
    }
}
