use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
    pub notifier: NotifierConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub request_timeout_ms: u64,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7420".to_string(),
            request_timeout_ms: 30_000,
            max_body_bytes: 65_536,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub store_dsn: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { store_dsn: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disable the cache entirely; every read becomes a store read.
    pub disabled: bool,
    pub group_ttl_secs: u64,
    pub active_journey_ttl_secs: u64,
    pub journey_header_ttl_secs: u64,
    pub journey_full_ttl_secs: u64,
    pub instance_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            group_ttl_secs: 300,
            active_journey_ttl_secs: 3_600,
            journey_header_ttl_secs: 3_600,
            journey_full_ttl_secs: 120,
            instance_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret for the HMAC token verifier.
    pub hmac_secret: String,
    pub token_max_age_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            hmac_secret: "dev-only-shared-secret".to_string(),
            token_max_age_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub enabled: bool,
    pub webhook_url: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: "http://127.0.0.1:7421/notify".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per window for journey endpoints.
    pub journey_requests_per_window: u32,
    pub window_secs: u64,
    /// Minimum spacing between accepted location frames per instance.
    pub location_throttle_min_ms: u64,
    pub location_throttle_max_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            journey_requests_per_window: 50,
            window_secs: 900,
            location_throttle_min_ms: 1_500,
            location_throttle_max_ms: 3_000,
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<CoordinatorConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(CoordinatorConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: CoordinatorConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

impl CoordinatorConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(bind) = std::env::var("WAYFARIAND_BIND") {
            if !bind.trim().is_empty() {
                self.server.bind = bind;
            }
        }

        if let Ok(dsn) = std::env::var("WAYFARIAN_STORE_DSN") {
            if !dsn.trim().is_empty() {
                self.storage.store_dsn = Some(dsn);
            }
        }

        if let Ok(flag) = std::env::var("WAYFARIAN_CACHE_DISABLE") {
            if let Ok(b) = flag.trim().parse::<bool>() {
                self.cache.disabled = b;
            }
        }

        if let Ok(secs) = std::env::var("WAYFARIAN_TOKEN_MAX_AGE_SECS") {
            if let Ok(n) = secs.trim().parse::<u64>() {
                self.auth.token_max_age_secs = n;
            }
        }

        if let Ok(flag) = std::env::var("WAYFARIAN_NOTIFIER_ENABLE") {
            if let Ok(b) = flag.trim().parse::<bool>() {
                self.notifier.enabled = b;
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_ttls() {
        let cfg = CoordinatorConfig::default();
        assert!(cfg.cache.group_ttl_secs > 0);
        assert!(!cfg.cache.disabled);
        assert!(!cfg.notifier.enabled);
    }

    #[test]
    fn parse_toml_uses_defaults_for_missing_fields() {
        let parsed: CoordinatorConfig = toml::from_str(
            r#"
            [server]
            bind = "127.0.0.1:9999"
            "#,
        )
        .expect("parse toml");

        assert_eq!(parsed.server.bind, "127.0.0.1:9999");
        assert_eq!(parsed.server.request_timeout_ms, 30_000);
        assert_eq!(parsed.cache.group_ttl_secs, 300);
    }

    #[test]
    fn env_overrides_apply_on_top_of_file() {
        // SAFETY: test runs single-threaded per-process env var access here;
        // no other test in this module touches WAYFARIAN_CACHE_DISABLE.
        unsafe {
            std::env::set_var("WAYFARIAN_CACHE_DISABLE", "true");
        }
        let cfg = CoordinatorConfig::default().with_env_overrides();
        assert!(cfg.cache.disabled);
        unsafe {
            std::env::remove_var("WAYFARIAN_CACHE_DISABLE");
        }
    }
}
