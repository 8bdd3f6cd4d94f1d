use crate::config::types::{
    BackoffConfig, Config, IdentitiesConfig, IdentityEntry, OutputConfig, PacingConfig,
    ProxyConfig, SchedulerConfig, TransportConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_scheduler_config(&config.scheduler)?;
    validate_pacing_config(&config.pacing)?;
    validate_backoff_config(&config.backoff)?;
    validate_identities_config(&config.identities)?;
    validate_identity_entries(&config.identity)?;
    validate_proxy_config(&config.proxy)?;
    validate_transport_config(&config.transport)?;
    validate_output_config(&config.output)?;
    Ok(())
}

fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.concurrency < 1 || config.concurrency > 100 {
        return Err(ConfigError::Validation(format!(
            "concurrency must be between 1 and 100, got {}",
            config.concurrency
        )));
    }

    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "max_attempts must be >= 1, got {}",
            config.max_attempts
        )));
    }

    if config.request_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "request_timeout_secs must be >= 1".to_string(),
        ));
    }

    if config.flush_every < 1 {
        return Err(ConfigError::Validation(format!(
            "flush_every must be >= 1, got {}",
            config.flush_every
        )));
    }

    check_bounds(
        "resubmit_pause",
        config.resubmit_pause_min_secs,
        config.resubmit_pause_max_secs,
    )
}

fn validate_pacing_config(config: &PacingConfig) -> Result<(), ConfigError> {
    check_bounds(
        "pacing interval",
        config.min_interval_ms,
        config.max_interval_ms,
    )?;
    check_bounds(
        "long_pause",
        config.long_pause_min_secs,
        config.long_pause_max_secs,
    )
}

fn validate_backoff_config(config: &BackoffConfig) -> Result<(), ConfigError> {
    if config.base_delay_ms == 0 {
        return Err(ConfigError::Validation(
            "base_delay_ms must be > 0".to_string(),
        ));
    }

    check_bounds("backoff delay", config.base_delay_ms, config.max_delay_ms)?;

    if !(0.0..=1.0).contains(&config.jitter_ratio) {
        return Err(ConfigError::Validation(format!(
            "jitter_ratio must be between 0.0 and 1.0, got {}",
            config.jitter_ratio
        )));
    }

    check_bounds(
        "malformed delay",
        config.malformed_delay_min_ms,
        config.malformed_delay_max_ms,
    )?;
    check_bounds(
        "transient delay",
        config.transient_delay_min_ms,
        config.transient_delay_max_ms,
    )?;

    if config.timeout_threshold < 2 {
        return Err(ConfigError::Validation(format!(
            "timeout_threshold must be >= 2, got {}",
            config.timeout_threshold
        )));
    }

    if config.timeout_reset_successes < 1 {
        return Err(ConfigError::Validation(
            "timeout_reset_successes must be >= 1".to_string(),
        ));
    }

    if config.error_threshold < 1 {
        return Err(ConfigError::Validation(
            "error_threshold must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_identities_config(config: &IdentitiesConfig) -> Result<(), ConfigError> {
    if config.cooldown_base_mins == 0 {
        return Err(ConfigError::Validation(
            "cooldown_base_mins must be > 0".to_string(),
        ));
    }

    check_bounds(
        "cooldown",
        config.cooldown_base_mins,
        config.cooldown_max_mins,
    )
}

/// Identity ids must be present, non-empty and unique
fn validate_identity_entries(entries: &[IdentityEntry]) -> Result<(), ConfigError> {
    if entries.is_empty() {
        return Err(ConfigError::Validation(
            "at least one [[identity]] entry is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for entry in entries {
        if entry.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "identity id cannot be empty".to_string(),
            ));
        }
        if !seen.insert(entry.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate identity id '{}'",
                entry.id
            )));
        }
    }

    Ok(())
}

fn validate_proxy_config(config: &ProxyConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&config.rotate_probability) {
        return Err(ConfigError::Validation(format!(
            "rotate_probability must be between 0.0 and 1.0, got {}",
            config.rotate_probability
        )));
    }

    if let Some(url) = &config.validation_url {
        Url::parse(url)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid validation-url: {}", e)))?;
    }

    if !config.enabled {
        return Ok(());
    }

    let provider = config.provider_url.as_deref().ok_or_else(|| {
        ConfigError::Validation("provider-url is required when proxies are enabled".to_string())
    })?;
    Url::parse(provider)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid provider-url: {}", e)))?;

    if config.min_pool_size < 1 {
        return Err(ConfigError::Validation(
            "min_pool_size must be >= 1".to_string(),
        ));
    }

    if config.replenish_attempts < 1 {
        return Err(ConfigError::Validation(
            "replenish_attempts must be >= 1".to_string(),
        ));
    }

    if config.max_failures < 1 {
        return Err(ConfigError::Validation(
            "max_failures must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_transport_config(config: &TransportConfig) -> Result<(), ConfigError> {
    if !config.url_template.contains("{id}") && !config.url_template.contains("{payload}") {
        return Err(ConfigError::Validation(format!(
            "url-template must reference {{id}} or {{payload}}, got '{}'",
            config.url_template
        )));
    }

    // Placeholders are not valid URL syntax everywhere, so check a filled-in sample.
    let sample = config
        .url_template
        .replace("{id}", "0")
        .replace("{kind}", "post-detail")
        .replace("{payload}", "x");
    let url = Url::parse(&sample)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid url-template: {}", e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Validation(format!(
            "url-template must use http or https, got '{}'",
            url.scheme()
        )));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn check_bounds(name: &str, min: u64, max: u64) -> Result<(), ConfigError> {
    if min > max {
        return Err(ConfigError::Validation(format!(
            "{} minimum ({}) exceeds maximum ({})",
            name, min, max
        )));
    }
    Ok(())
}
