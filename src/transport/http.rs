//! reqwest-backed collaborators
//!
//! This is the only place that looks at raw HTTP responses. It handles:
//! - Building clients with the configured user agent and optional proxy
//! - Translating statuses, bodies and transport errors into `FailureKind`
//! - Fetching proxy leases from a provider endpoint
//! - Validating a lease against a known-good URL

use crate::config::{Config, ProxyConfig, TransportConfig};
use crate::state::{Identity, Lease, ProxyEndpoint};
use crate::transport::{
    ProvisionError, ProxyProvider, ProxyValidator, SessionError, SessionProvider, UnitExecutor,
};
use crate::work::{ExecutionOutput, FailureKind, WorkUnit};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Statuses that mean the platform is throttling or refusing the caller
const BLOCK_STATUSES: [u16; 3] = [403, 412, 429];

/// Response text that signals throttling or a login wall
const BLOCK_PHRASES: [&str; 8] = [
    "访问频率过高",
    "请求过于频繁",
    "need login",
    "访问受限",
    "请求被拒绝",
    "操作太频繁",
    "无权限",
    "请登录",
];

/// JSON fields that carry a platform error message
const MESSAGE_FIELDS: [&str; 3] = ["msg", "message", "error"];

/// Lease lifetime assumed when the provider omits an expiry
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// Proxied clients kept per executor before the cache is cleared
const MAX_CACHED_CLIENTS: usize = 64;

/// Builds an HTTP client
///
/// # Arguments
///
/// * `user_agent` - The User-Agent header value
/// * `timeout` - Total request timeout
/// * `proxy` - Route every request through this lease, if given
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Invalid proxy URL or TLS backend failure
pub fn build_http_client(
    user_agent: &str,
    timeout: Duration,
    proxy: Option<&Lease>,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .gzip(true)
        .brotli(true);

    if let Some(lease) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(lease.endpoint.url())?);
    }

    builder.build()
}

/// Translates a response into an output or a typed failure
///
/// | Condition | Result |
/// |-----------|--------|
/// | HTTP 403 / 412 / 429 | `Blocked` |
/// | Throttling or login phrase in the body | `Blocked` |
/// | HTTP 404 / 410 | `Rejected` |
/// | HTTP 5xx | `Network` |
/// | Other non-2xx | `Other` |
/// | Empty or non-JSON body | `Malformed` |
///
/// Items are counted from a JSON `data` array, a top-level array, or 1.
pub fn classify_response(status: u16, body: &str) -> Result<ExecutionOutput, FailureKind> {
    if BLOCK_STATUSES.contains(&status) {
        return Err(FailureKind::Blocked {
            status: Some(status),
            reason: format!("HTTP {}", status),
        });
    }

    let parsed = serde_json::from_str::<Value>(body).ok();

    // Only error text is searched, never a successful payload
    let searched = match &parsed {
        Some(value) => message_text(value),
        None => body.to_string(),
    };
    if let Some(phrase) = find_block_phrase(&searched) {
        return Err(FailureKind::Blocked {
            status: Some(status),
            reason: phrase.to_string(),
        });
    }

    match status {
        404 | 410 => return Err(FailureKind::Rejected(format!("HTTP {}", status))),
        500..=599 => return Err(FailureKind::Network(format!("server error {}", status))),
        200..=299 => {}
        _ => return Err(FailureKind::Other(format!("unexpected status {}", status))),
    }

    if body.trim().is_empty() {
        return Err(FailureKind::Malformed("empty body".to_string()));
    }
    let Some(value) = parsed else {
        return Err(FailureKind::Malformed("body is not JSON".to_string()));
    };

    let items = value
        .get("data")
        .and_then(Value::as_array)
        .or_else(|| value.as_array())
        .map_or(1, Vec::len);

    Ok(ExecutionOutput::new(body, items as u64))
}

fn message_text(value: &Value) -> String {
    MESSAGE_FIELDS
        .iter()
        .filter_map(|field| value.get(*field).and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn find_block_phrase(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    BLOCK_PHRASES
        .iter()
        .copied()
        .find(|phrase| lowered.contains(phrase))
}

/// Maps a transport error to a failure kind
fn failure_from_error(err: reqwest::Error) -> FailureKind {
    if err.is_timeout() {
        FailureKind::Timeout
    } else if err.is_connect() || err.is_request() {
        FailureKind::Network(err.to_string())
    } else if err.is_decode() || err.is_body() {
        FailureKind::Malformed(err.to_string())
    } else {
        FailureKind::Other(err.to_string())
    }
}

/// Fills `{id}`, `{kind}` and `{payload}` in a URL template
pub fn render_url(template: &str, unit: &WorkUnit) -> String {
    let payload: String = url::form_urlencoded::byte_serialize(unit.payload.as_bytes()).collect();
    template
        .replace("{id}", &unit.id)
        .replace("{kind}", unit.kind.as_str())
        .replace("{payload}", &payload)
}

/// Executes units as HTTP GET requests
pub struct HttpExecutor {
    direct: Client,
    url_template: String,
    user_agent: String,
    timeout: Duration,
    proxied: Mutex<HashMap<String, Client>>,
}

impl HttpExecutor {
    pub fn new(transport: &TransportConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            direct: build_http_client(&transport.user_agent, timeout, None)?,
            url_template: transport.url_template.clone(),
            user_agent: transport.user_agent.clone(),
            timeout,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        Self::new(&config.transport, config.scheduler.request_timeout())
    }

    /// The client for `lease`, built on first use
    fn client_for(&self, lease: Option<&Lease>) -> Result<Client, reqwest::Error> {
        let Some(lease) = lease else {
            return Ok(self.direct.clone());
        };

        let mut clients = self.proxied.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&lease.key()) {
            return Ok(client.clone());
        }
        if clients.len() >= MAX_CACHED_CLIENTS {
            clients.clear();
        }
        let client = build_http_client(&self.user_agent, self.timeout, Some(lease))?;
        clients.insert(lease.key(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl UnitExecutor for HttpExecutor {
    async fn execute(
        &self,
        identity: &Identity,
        lease: Option<&Lease>,
        unit: &WorkUnit,
    ) -> Result<ExecutionOutput, FailureKind> {
        let client = self
            .client_for(lease)
            .map_err(|e| FailureKind::Other(format!("cannot build client: {}", e)))?;
        let url = render_url(&self.url_template, unit);

        let cookie = identity
            .session
            .as_deref()
            .unwrap_or(identity.credential.as_str());
        let mut request = client.get(&url);
        if !cookie.is_empty() {
            request = request.header(header::COOKIE, cookie);
        }

        let response = request.send().await.map_err(failure_from_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(failure_from_error)?;
        tracing::trace!("GET {} -> {} ({} bytes)", url, status, body.len());

        classify_response(status, &body)
    }
}

/// One lease as returned by the provider endpoint
#[derive(Debug, Deserialize)]
struct ProviderLease {
    ip: String,
    port: u16,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    password: Option<String>,
    /// Unix timestamp (seconds) after which the lease is dead
    #[serde(default)]
    expired_time_ts: Option<i64>,
    #[serde(default)]
    protocol: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProviderPayload {
    List(Vec<ProviderLease>),
    Wrapped { data: Vec<ProviderLease> },
}

impl ProviderLease {
    fn into_lease(self, now_ts: i64, now: Instant) -> Lease {
        let mut endpoint = ProxyEndpoint::new(self.ip, self.port);
        if let Some(protocol) = self.protocol.filter(|p| !p.is_empty()) {
            endpoint.protocol = protocol;
        }
        if let (Some(user), Some(password)) = (self.user, self.password) {
            if !user.is_empty() {
                endpoint = endpoint.with_credentials(user, password);
            }
        }

        let ttl = match self.expired_time_ts {
            Some(ts) => Duration::from_secs(ts.saturating_sub(now_ts).max(0) as u64),
            None => DEFAULT_LEASE_TTL,
        };
        Lease::new(endpoint, now + ttl)
    }
}

/// Provisions leases from `provider-url?num=<n>`
pub struct HttpProxyProvider {
    client: Client,
    provider_url: String,
}

impl HttpProxyProvider {
    pub fn new(provider_url: impl Into<String>, client: Client) -> Self {
        Self {
            client,
            provider_url: provider_url.into(),
        }
    }

    /// Returns `None` when no provider URL is configured
    pub fn from_config(
        proxy: &ProxyConfig,
        transport: &TransportConfig,
    ) -> Result<Option<Self>, reqwest::Error> {
        let Some(url) = &proxy.provider_url else {
            return Ok(None);
        };
        let client = build_http_client(&transport.user_agent, proxy.validation_timeout(), None)?;
        Ok(Some(Self::new(url.clone(), client)))
    }
}

#[async_trait]
impl ProxyProvider for HttpProxyProvider {
    async fn provision(&self, count: usize) -> Result<Vec<Lease>, ProvisionError> {
        let response = self
            .client
            .get(&self.provider_url)
            .query(&[("num", count)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::Request(format!("HTTP {}", status.as_u16())));
        }

        let body = response.text().await?;
        let payload: ProviderPayload = serde_json::from_str(&body)
            .map_err(|e| ProvisionError::Malformed(e.to_string()))?;
        let entries = match payload {
            ProviderPayload::List(entries) => entries,
            ProviderPayload::Wrapped { data } => data,
        };

        let now_ts = Utc::now().timestamp();
        let now = Instant::now();
        let leases: Vec<Lease> = entries
            .into_iter()
            .map(|entry| entry.into_lease(now_ts, now))
            .collect();
        tracing::debug!("Provider returned {} leases for {} requested", leases.len(), count);
        Ok(leases)
    }
}

/// Validates a lease with one GET through it
pub struct HttpProxyValidator {
    validation_url: String,
    user_agent: String,
    timeout: Duration,
}

impl HttpProxyValidator {
    pub fn new(validation_url: impl Into<String>, user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            validation_url: validation_url.into(),
            user_agent: user_agent.into(),
            timeout,
        }
    }

    /// Returns `None` when no validation URL is configured
    pub fn from_config(proxy: &ProxyConfig, transport: &TransportConfig) -> Option<Self> {
        proxy.validation_url.as_ref().map(|url| {
            Self::new(url.clone(), transport.user_agent.clone(), proxy.validation_timeout())
        })
    }
}

#[async_trait]
impl ProxyValidator for HttpProxyValidator {
    async fn validate(&self, lease: &Lease) -> bool {
        let client = match build_http_client(&self.user_agent, self.timeout, Some(lease)) {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!("Lease {} has an unusable proxy URL: {}", lease.endpoint, e);
                return false;
            }
        };

        match client.get(&self.validation_url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::debug!(
                    "Lease {} failed validation with HTTP {}",
                    lease.endpoint,
                    response.status().as_u16()
                );
                false
            }
            Err(e) => {
                tracing::debug!("Lease {} failed validation: {}", lease.endpoint, e);
                false
            }
        }
    }
}

/// Uses each identity's configured credential as its session cookie
#[derive(Debug, Default)]
pub struct CredentialSessions;

#[async_trait]
impl SessionProvider for CredentialSessions {
    async fn acquire_session(&self, identity: &Identity) -> Result<String, SessionError> {
        let credential = identity.credential.trim();
        if credential.is_empty() {
            return Err(SessionError::Dead(format!(
                "identity {} has no credential",
                identity.id
            )));
        }
        Ok(credential.to_string())
    }
}
