use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Network address and credentials of a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: "http".to_string(),
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// `host:port`, used as the lease key inside the pool
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Proxy URL suitable for an HTTP client
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.protocol, user, pass, self.host, self.port
            ),
            _ => format!("{}://{}:{}", self.protocol, self.host, self.port),
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    // Never print credentials
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// A time-bounded proxy network path
#[derive(Debug, Clone)]
pub struct Lease {
    pub endpoint: ProxyEndpoint,

    /// Unusable at or after this instant
    pub expires_at: Instant,

    pub last_used_at: Option<Instant>,

    /// Number of times the lease was handed out
    pub task_count: u64,

    /// Set once the lease passed validation
    pub valid: bool,

    /// Network failures attributed to this lease
    pub failures: u32,
}

impl Lease {
    pub fn new(endpoint: ProxyEndpoint, expires_at: Instant) -> Self {
        Self {
            endpoint,
            expires_at,
            last_used_at: None,
            task_count: 0,
            valid: false,
            failures: 0,
        }
    }

    /// Convenience constructor for a lease valid for `ttl` from now
    pub fn with_ttl(endpoint: ProxyEndpoint, ttl: Duration) -> Self {
        Self::new(endpoint, Instant::now() + ttl)
    }

    pub fn key(&self) -> String {
        self.endpoint.address()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// True when the lease ends within `margin`
    pub fn expires_soon(&self, now: Instant, margin: Duration) -> bool {
        self.expires_at.saturating_duration_since(now) < margin
    }

    /// Ordering key for least-recently-used selection
    pub fn usage_key(&self) -> (Option<Instant>, u64) {
        (self.last_used_at, self.task_count)
    }
}
