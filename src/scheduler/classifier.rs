//! Failure classification and run-wide backoff state
//!
//! The classifier turns a typed `FailureKind` into a `Decision` for the
//! worker that saw it. It also owns the counters that span the whole run:
//! - Consecutive network/timeout failures, which trigger a run-wide pause
//! - Block events, which abort the run once they exceed the ceiling
//! - The pause gate every worker waits on before issuing a request

use crate::config::BackoffConfig;
use crate::scheduler::backoff::{uniform_ms, BackoffPolicy};
use crate::work::{FailureKind, WorkUnit};
use crate::SluiceError;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// What the worker does after a failed attempt
#[derive(Debug)]
pub enum Decision {
    /// Wait `delay`, then try again with the next attempt number
    Retry {
        delay: Duration,
        refresh_session: bool,
        rotate_proxy: bool,
    },

    /// Hard rate limit: return the unit to the backlog for another identity
    CoolDown { refresh_session: bool },

    /// Stop working on this unit
    Abandon,

    /// Stop the whole run
    Fatal(SluiceError),
}

#[derive(Debug, Default)]
struct ClassifierState {
    consecutive_timeouts: u32,
    consecutive_successes: u32,
    block_events: u32,
    long_pauses: u32,
    paused_until: Option<Instant>,
}

/// Decides how each failed attempt is handled
pub struct BackoffClassifier {
    config: BackoffConfig,
    max_attempts: u32,
    policy: BackoffPolicy,
    state: Mutex<ClassifierState>,
}

impl BackoffClassifier {
    pub fn new(config: BackoffConfig, max_attempts: u32) -> Self {
        Self {
            policy: BackoffPolicy::from_config(&config),
            config,
            max_attempts: max_attempts.max(1),
            state: Mutex::new(ClassifierState::default()),
        }
    }

    /// Classifies the failure of `unit`'s current attempt
    ///
    /// # Arguments
    ///
    /// * `unit` - The unit whose attempt failed, with its current attempt number
    /// * `failure` - What the executor reported
    ///
    /// # Returns
    ///
    /// The decision for the worker. Counters are updated before returning.
    pub async fn classify(&self, unit: &WorkUnit, failure: &FailureKind) -> Decision {
        let exhausted = unit.attempt >= self.max_attempts;
        let refresh_session = unit.attempt == 2;
        let mut state = self.state.lock().await;
        state.consecutive_successes = 0;

        match failure {
            FailureKind::Malformed(_) => {
                if exhausted {
                    return Decision::Abandon;
                }
                let floor = uniform_ms(
                    self.config.malformed_delay_min_ms,
                    self.config.malformed_delay_max_ms,
                );
                Decision::Retry {
                    delay: floor.max(self.policy.jittered_delay(unit.attempt)),
                    refresh_session,
                    rotate_proxy: true,
                }
            }

            FailureKind::Network(_) | FailureKind::Timeout => {
                state.consecutive_timeouts += 1;
                if state.consecutive_timeouts >= self.config.timeout_threshold {
                    let pause = Duration::from_secs(self.config.timeout_pause_secs);
                    tracing::warn!(
                        "{} consecutive network failures, pausing the run for {}s",
                        state.consecutive_timeouts,
                        pause.as_secs()
                    );
                    let until = Instant::now() + pause;
                    state.paused_until = Some(state.paused_until.map_or(until, |u| u.max(until)));
                    state.long_pauses += 1;
                    state.consecutive_timeouts /= 2;
                }
                if exhausted {
                    return Decision::Abandon;
                }
                let floor = uniform_ms(
                    self.config.transient_delay_min_ms,
                    self.config.transient_delay_max_ms,
                );
                Decision::Retry {
                    delay: floor.max(self.policy.jittered_delay(unit.attempt)),
                    refresh_session,
                    rotate_proxy: false,
                }
            }

            FailureKind::Blocked { .. } => {
                state.block_events += 1;
                if state.block_events > self.config.block_ceiling {
                    tracing::error!(
                        "Block event {} exceeds the ceiling of {}, aborting",
                        state.block_events,
                        self.config.block_ceiling
                    );
                    return Decision::Fatal(SluiceError::BlockCeilingExceeded {
                        blocks: state.block_events,
                        ceiling: self.config.block_ceiling,
                    });
                }
                tracing::warn!(
                    "Unit {} blocked ({}/{} block events this run)",
                    unit.id,
                    state.block_events,
                    self.config.block_ceiling
                );
                if exhausted {
                    Decision::Abandon
                } else {
                    Decision::CoolDown { refresh_session }
                }
            }

            FailureKind::Rejected(_) => Decision::Abandon,

            FailureKind::Other(_) => {
                if exhausted {
                    return Decision::Abandon;
                }
                Decision::Retry {
                    delay: self.policy.jittered_delay(unit.attempt),
                    refresh_session,
                    rotate_proxy: false,
                }
            }
        }
    }

    /// Records a successful attempt
    ///
    /// Enough consecutive successes clear the network failure counter.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_successes += 1;
        if state.consecutive_successes >= self.config.timeout_reset_successes
            && state.consecutive_timeouts > 0
        {
            tracing::debug!(
                "{} consecutive successes, clearing network failure counter",
                state.consecutive_successes
            );
            state.consecutive_timeouts = 0;
        }
    }

    /// Clears every run-wide counter and lifts any pause
    pub async fn reset(&self) {
        *self.state.lock().await = ClassifierState::default();
    }

    /// Suspends the caller while a run-wide pause is active
    pub async fn wait_if_paused(&self) {
        loop {
            let until = {
                let state = self.state.lock().await;
                match state.paused_until {
                    Some(until) if until > Instant::now() => until,
                    _ => return,
                }
            };
            // The pause may have been extended while we slept
            sleep_until(until).await;
        }
    }

    pub async fn pause_remaining(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        state
            .paused_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }

    pub async fn consecutive_timeouts(&self) -> u32 {
        self.state.lock().await.consecutive_timeouts
    }

    pub async fn block_events(&self) -> u32 {
        self.state.lock().await.block_events
    }

    /// Run-wide pauses triggered so far
    pub async fn long_pauses(&self) -> u32 {
        self.state.lock().await.long_pauses
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::WorkKind;

    fn create_test_classifier() -> BackoffClassifier {
        BackoffClassifier::new(BackoffConfig::default(), 3)
    }

    fn create_test_unit(attempt: u32) -> WorkUnit {
        let mut unit = WorkUnit::new("42", WorkKind::PostDetail, "");
        unit.attempt = attempt;
        unit
    }

    fn blocked() -> FailureKind {
        FailureKind::Blocked {
            status: Some(412),
            reason: "precondition failed".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifteen_timeouts_pause_once_and_halve() {
        let classifier = create_test_classifier();
        let unit = create_test_unit(1);

        for _ in 0..14 {
            classifier.classify(&unit, &FailureKind::Timeout).await;
        }
        assert_eq!(classifier.consecutive_timeouts().await, 14);
        assert_eq!(classifier.long_pauses().await, 0);

        classifier.classify(&unit, &FailureKind::Timeout).await;
        assert_eq!(classifier.long_pauses().await, 1);
        assert_eq!(classifier.consecutive_timeouts().await, 7);

        let remaining = classifier.pause_remaining().await.unwrap();
        assert_eq!(remaining, Duration::from_secs(300));

        let start = Instant::now();
        classifier.wait_if_paused().await;
        assert!(start.elapsed() >= Duration::from_secs(300));
        assert!(classifier.pause_remaining().await.is_none());
        assert_eq!(classifier.consecutive_timeouts().await, 7);
    }

    #[tokio::test]
    async fn test_successes_reset_timeout_counter() {
        let classifier = create_test_classifier();
        let unit = create_test_unit(1);

        for _ in 0..4 {
            classifier
                .classify(&unit, &FailureKind::Network("refused".into()))
                .await;
        }
        classifier.record_success().await;
        classifier.record_success().await;
        assert_eq!(classifier.consecutive_timeouts().await, 4);

        classifier.record_success().await;
        assert_eq!(classifier.consecutive_timeouts().await, 0);
    }

    #[tokio::test]
    async fn test_failure_breaks_success_streak() {
        let classifier = create_test_classifier();
        let unit = create_test_unit(1);

        classifier.classify(&unit, &FailureKind::Timeout).await;
        classifier.record_success().await;
        classifier.record_success().await;
        classifier.classify(&unit, &FailureKind::Timeout).await;
        classifier.record_success().await;
        assert_eq!(classifier.consecutive_timeouts().await, 2);
    }

    #[tokio::test]
    async fn test_block_cools_down_then_abandons_when_exhausted() {
        let classifier = create_test_classifier();

        assert!(matches!(
            classifier.classify(&create_test_unit(1), &blocked()).await,
            Decision::CoolDown {
                refresh_session: false
            }
        ));
        assert!(matches!(
            classifier.classify(&create_test_unit(2), &blocked()).await,
            Decision::CoolDown {
                refresh_session: true
            }
        ));
        assert!(matches!(
            classifier.classify(&create_test_unit(3), &blocked()).await,
            Decision::Abandon
        ));
        assert_eq!(classifier.block_events().await, 3);
    }

    #[tokio::test]
    async fn test_block_ceiling_is_fatal() {
        let classifier = create_test_classifier();
        let unit = create_test_unit(1);

        for _ in 0..6 {
            let decision = classifier.classify(&unit, &blocked()).await;
            assert!(!matches!(decision, Decision::Fatal(_)));
        }

        match classifier.classify(&unit, &blocked()).await {
            Decision::Fatal(SluiceError::BlockCeilingExceeded { blocks, ceiling }) => {
                assert_eq!(blocks, 7);
                assert_eq!(ceiling, 6);
            }
            other => panic!("expected fatal decision, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_starts_a_new_run() {
        let classifier = create_test_classifier();
        let unit = create_test_unit(1);
        for _ in 0..6 {
            classifier.classify(&unit, &blocked()).await;
        }
        for _ in 0..15 {
            classifier
                .classify(&unit, &FailureKind::Network("refused".to_string()))
                .await;
        }
        assert!(classifier.pause_remaining().await.is_some());

        classifier.reset().await;
        assert_eq!(classifier.block_events().await, 0);
        assert_eq!(classifier.consecutive_timeouts().await, 0);
        assert_eq!(classifier.long_pauses().await, 0);
        assert!(classifier.pause_remaining().await.is_none());

        // A fresh run gets the whole block allowance again
        let decision = classifier.classify(&unit, &blocked()).await;
        assert!(matches!(decision, Decision::CoolDown { .. }));
        assert_eq!(classifier.block_events().await, 1);
    }

    #[tokio::test]
    async fn test_rejected_is_abandoned_immediately() {
        let classifier = create_test_classifier();
        let decision = classifier
            .classify(&create_test_unit(1), &FailureKind::Rejected("gone".into()))
            .await;
        assert!(matches!(decision, Decision::Abandon));
    }

    #[tokio::test]
    async fn test_malformed_waits_longer_and_rotates() {
        let classifier = create_test_classifier();
        match classifier
            .classify(&create_test_unit(1), &FailureKind::Malformed("empty".into()))
            .await
        {
            Decision::Retry {
                delay,
                rotate_proxy,
                refresh_session,
            } => {
                assert!(delay >= Duration::from_millis(5000));
                assert!(rotate_proxy);
                assert!(!refresh_session);
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_attempt_requests_session_refresh() {
        let classifier = create_test_classifier();
        match classifier
            .classify(&create_test_unit(2), &FailureKind::Other("boom".into()))
            .await
        {
            Decision::Retry {
                refresh_session, ..
            } => assert!(refresh_session),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exhausted_transient_is_abandoned() {
        let classifier = create_test_classifier();
        let decision = classifier
            .classify(&create_test_unit(3), &FailureKind::Timeout)
            .await;
        assert!(matches!(decision, Decision::Abandon));
        assert_eq!(classifier.consecutive_timeouts().await, 1);
    }
}
