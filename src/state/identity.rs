use std::time::Duration;
use tokio::time::Instant;

/// An account usable to perform scraping requests
///
/// Owned by the `IdentityPool`; workers only ever see snapshots. Timestamps
/// use the tokio clock so cooldowns follow paused time in tests.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Stable account identifier
    pub id: String,

    /// Opaque credential material (cookie string, token, ...)
    pub credential: String,

    /// Session handle returned by the session provider
    pub session: Option<String>,

    /// False once the session is confirmed dead; never reverts during a run
    pub healthy: bool,

    /// Consecutive errors since the last success
    pub error_count: u32,

    /// Requests issued with this identity
    pub request_count: u64,

    /// When this identity was last handed out or released
    pub last_used_at: Option<Instant>,

    /// Not selectable before this instant
    pub cooldown_until: Option<Instant>,

    /// Currently paired with an in-flight unit
    pub busy: bool,
}

impl Identity {
    /// Creates a healthy, unused identity
    pub fn new(id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            credential: credential.into(),
            session: None,
            healthy: true,
            error_count: 0,
            request_count: 0,
            last_used_at: None,
            cooldown_until: None,
            busy: false,
        }
    }

    /// Returns true while the cooldown deadline is in the future
    pub fn is_cooling(&self, now: Instant) -> bool {
        matches!(self.cooldown_until, Some(until) if until > now)
    }

    /// Healthy, idle and not cooling down
    pub fn is_available(&self, now: Instant) -> bool {
        self.healthy && !self.busy && !self.is_cooling(now)
    }

    /// Ordering key for selection; the smallest key wins
    ///
    /// Never-used identities sort before used ones because `None < Some(_)`.
    pub fn selection_key(&self) -> (u32, Option<Instant>, u64) {
        (self.error_count, self.last_used_at, self.request_count)
    }

    /// Time left in the current cooldown, if any
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Marks the identity as handed out for one request
    pub fn record_use(&mut self, now: Instant) {
        self.request_count += 1;
        self.last_used_at = Some(now);
        self.busy = true;
    }

    /// Starts a cooldown of the given length
    pub fn cool_down(&mut self, now: Instant, duration: Duration) {
        self.cooldown_until = Some(now + duration);
    }
}
