use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Sumi-Sluice
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub identities: IdentitiesConfig,
    #[serde(default, rename = "identity")]
    pub identity: Vec<IdentityEntry>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    pub transport: TransportConfig,
    pub output: OutputConfig,
}

/// Worker pool and checkpoint cadence
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of units in flight at once
    pub concurrency: u32,

    /// Attempts per unit before it is abandoned
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Upper bound on a single execution (seconds)
    #[serde(rename = "request-timeout-secs")]
    pub request_timeout_secs: u64,

    /// Flush progress after this many terminal units
    #[serde(rename = "flush-every")]
    pub flush_every: u32,

    /// Flush progress at least this often (seconds)
    #[serde(rename = "flush-interval-secs")]
    pub flush_interval_secs: u64,

    /// Whole-backlog resubmissions of abandoned units
    #[serde(rename = "resubmit-rounds")]
    pub resubmit_rounds: u32,

    #[serde(rename = "resubmit-pause-min-secs")]
    pub resubmit_pause_min_secs: u64,

    #[serde(rename = "resubmit-pause-max-secs")]
    pub resubmit_pause_max_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 3,
            request_timeout_secs: 30,
            flush_every: 10,
            flush_interval_secs: 30,
            resubmit_rounds: 2,
            resubmit_pause_min_secs: 5,
            resubmit_pause_max_secs: 15,
        }
    }
}

impl SchedulerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Human-like spacing between requests
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Lower bound of the uniform pre-request delay (milliseconds)
    #[serde(rename = "min-interval-ms")]
    pub min_interval_ms: u64,

    /// Upper bound of the uniform pre-request delay (milliseconds)
    #[serde(rename = "max-interval-ms")]
    pub max_interval_ms: u64,

    /// Extra uniform jitter added on top (milliseconds)
    #[serde(rename = "jitter-ms")]
    pub jitter_ms: u64,

    /// Insert a long pause on every Nth request of an identity (0 disables)
    #[serde(rename = "long-pause-every")]
    pub long_pause_every: u64,

    #[serde(rename = "long-pause-min-secs")]
    pub long_pause_min_secs: u64,

    #[serde(rename = "long-pause-max-secs")]
    pub long_pause_max_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1500,
            max_interval_ms: 4000,
            jitter_ms: 1500,
            long_pause_every: 100,
            long_pause_min_secs: 30,
            long_pause_max_secs: 60,
        }
    }
}

/// Retry delays and run-wide failure thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(rename = "base-delay-ms")]
    pub base_delay_ms: u64,

    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: u64,

    /// Symmetric jitter applied to the exponential delay (0.5 = +/-50%)
    #[serde(rename = "jitter-ratio")]
    pub jitter_ratio: f64,

    #[serde(rename = "malformed-delay-min-ms")]
    pub malformed_delay_min_ms: u64,

    #[serde(rename = "malformed-delay-max-ms")]
    pub malformed_delay_max_ms: u64,

    #[serde(rename = "transient-delay-min-ms")]
    pub transient_delay_min_ms: u64,

    #[serde(rename = "transient-delay-max-ms")]
    pub transient_delay_max_ms: u64,

    /// Consecutive network/timeout failures that trigger a run-wide pause
    #[serde(rename = "timeout-threshold")]
    pub timeout_threshold: u32,

    #[serde(rename = "timeout-pause-secs")]
    pub timeout_pause_secs: u64,

    /// Consecutive successes that clear the timeout counter
    #[serde(rename = "timeout-reset-successes")]
    pub timeout_reset_successes: u32,

    /// Block events tolerated in one run before it aborts
    #[serde(rename = "block-ceiling")]
    pub block_ceiling: u32,

    /// Generic errors on one identity before it is cooled down
    #[serde(rename = "error-threshold")]
    pub error_threshold: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 3000,
            max_delay_ms: 12000,
            jitter_ratio: 0.5,
            malformed_delay_min_ms: 5000,
            malformed_delay_max_ms: 10000,
            transient_delay_min_ms: 2000,
            transient_delay_max_ms: 5000,
            timeout_threshold: 15,
            timeout_pause_secs: 300,
            timeout_reset_successes: 3,
            block_ceiling: 6,
            error_threshold: 5,
        }
    }
}

/// Cooldown schedule shared by all identities
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentitiesConfig {
    /// Cooldown after the first block (minutes)
    #[serde(rename = "cooldown-base-mins")]
    pub cooldown_base_mins: u64,

    /// Added per additional consecutive error (minutes)
    #[serde(rename = "cooldown-step-mins")]
    pub cooldown_step_mins: u64,

    #[serde(rename = "cooldown-max-mins")]
    pub cooldown_max_mins: u64,

    /// Slack added when waiting for the earliest cooldown to end
    #[serde(rename = "wait-buffer-ms")]
    pub wait_buffer_ms: u64,
}

impl Default for IdentitiesConfig {
    fn default() -> Self {
        Self {
            cooldown_base_mins: 15,
            cooldown_step_mins: 5,
            cooldown_max_mins: 60,
            wait_buffer_ms: 1000,
        }
    }
}

impl IdentitiesConfig {
    /// Cooldown applied after `errors` consecutive errors (at least 1)
    pub fn cooldown_for(&self, errors: u32) -> Duration {
        let extra = u64::from(errors.saturating_sub(1)).saturating_mul(self.cooldown_step_mins);
        let mins = self
            .cooldown_base_mins
            .saturating_add(extra)
            .min(self.cooldown_max_mins);
        Duration::from_secs(mins * 60)
    }

    pub fn base_cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_base_mins * 60)
    }

    pub fn wait_buffer(&self) -> Duration {
        Duration::from_millis(self.wait_buffer_ms)
    }
}

/// One account available to the run
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityEntry {
    pub id: String,

    /// Opaque credential material handed to the session provider
    #[serde(default)]
    pub credential: String,
}

/// Proxy pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,

    /// Endpoint returning a JSON list of proxy leases
    #[serde(rename = "provider-url")]
    pub provider_url: Option<String>,

    /// Replenish when fewer leases than this are held
    #[serde(rename = "min-pool-size")]
    pub min_pool_size: usize,

    /// Leases expiring within this margin are not handed out (seconds)
    #[serde(rename = "replacement-threshold-secs")]
    pub replacement_threshold_secs: u64,

    #[serde(rename = "replenish-attempts")]
    pub replenish_attempts: u32,

    /// After replenishment comes up empty, skip the provider for this long (seconds)
    #[serde(rename = "degraded-retry-secs")]
    pub degraded_retry_secs: u64,

    /// Known-good endpoint used to validate fresh leases
    #[serde(rename = "validation-url")]
    pub validation_url: Option<String>,

    #[serde(rename = "validation-timeout-secs")]
    pub validation_timeout_secs: u64,

    /// Chance that a worker rotates its lease before a request
    #[serde(rename = "rotate-probability")]
    pub rotate_probability: f64,

    /// Rotate deterministically every N requests (0 disables)
    #[serde(rename = "rotate-every")]
    pub rotate_every: u64,

    /// Network failures before a lease is discarded
    #[serde(rename = "max-failures")]
    pub max_failures: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider_url: None,
            min_pool_size: 10,
            replacement_threshold_secs: 60,
            replenish_attempts: 3,
            degraded_retry_secs: 30,
            validation_url: None,
            validation_timeout_secs: 10,
            rotate_probability: 0.3,
            rotate_every: 0,
            max_failures: 3,
        }
    }
}

impl ProxyConfig {
    pub fn replacement_threshold(&self) -> Duration {
        Duration::from_secs(self.replacement_threshold_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    pub fn degraded_retry(&self) -> Duration {
        Duration::from_secs(self.degraded_retry_secs)
    }
}

/// HTTP execution settings
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Request URL with `{id}`, `{kind}` and `{payload}` placeholders
    #[serde(rename = "url-template")]
    pub url_template: String,

    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,
}

fn default_user_agent() -> String {
    format!("sumi-sluice/{}", env!("CARGO_PKG_VERSION"))
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the SQLite progress database
    #[serde(rename = "database-path")]
    pub database_path: String,
}
