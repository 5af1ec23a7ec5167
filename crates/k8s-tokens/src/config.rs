//! Configuration for token sources and the token verifier.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults matching the well-known Kubernetes secret mounts. The
//! `from_vars` variants exist so tests can inject values without touching
//! the process environment.

use crate::error::ConfigError;
use crate::oidc::RetryPolicy;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default root of the multi-audience projected tokens volume.
pub const DEFAULT_TOKENS_DIR: &str = "/var/run/secrets/tokens";

/// Default root of the cluster service-account volume.
pub const DEFAULT_SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Default polling fallback interval.
///
/// The platform refreshes tokens at about 80% of their lifetime and the
/// minimal refresh interval is 10 minutes, so one minute keeps the cache
/// convergent even when filesystem notifications are lost.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default validity interval of the cached JWKS key set.
pub const DEFAULT_JWKS_VALID_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Environment variable overriding the tokens directory.
pub const TOKENS_DIR_VAR: &str = "K8S_TOKENS_DIR";

/// Environment variable overriding the service-account directory.
pub const SERVICE_ACCOUNT_DIR_VAR: &str = "K8S_SERVICE_ACCOUNT_DIR";

/// Environment variable overriding the polling interval, in seconds.
pub const POLL_INTERVAL_VAR: &str = "K8S_TOKENS_POLL_INTERVAL_SECONDS";

/// Environment variable overriding the JWKS validity interval, in seconds.
pub const JWKS_VALID_INTERVAL_VAR: &str = "K8S_JWKS_VALID_INTERVAL_SECONDS";

/// Configuration for the on-disk token sources.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Root of the multi-audience tokens volume (`{audience}/token` layout).
    pub tokens_dir: PathBuf,

    /// Root of the service-account volume (single `token` file), cached
    /// under the reserved [`crate::audience::DEFAULT`] audience.
    pub service_account_dir: PathBuf,

    /// Polling fallback interval for the watch loop.
    pub poll_interval: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            tokens_dir: PathBuf::from(DEFAULT_TOKENS_DIR),
            service_account_dir: PathBuf::from(DEFAULT_SERVICE_ACCOUNT_DIR),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl TokenConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidInterval` if the polling interval
    /// variable is present but not a positive integer number of seconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a map (for testing).
    ///
    /// # Errors
    ///
    /// Same as [`TokenConfig::from_env`].
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let tokens_dir = vars
            .get(TOKENS_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKENS_DIR));

        let service_account_dir = vars
            .get(SERVICE_ACCOUNT_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVICE_ACCOUNT_DIR));

        let poll_interval = parse_interval(vars, POLL_INTERVAL_VAR, DEFAULT_POLL_INTERVAL)?;

        Ok(Self {
            tokens_dir,
            service_account_dir,
            poll_interval,
        })
    }

    /// Set the tokens directory.
    #[must_use]
    pub fn with_tokens_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tokens_dir = dir.into();
        self
    }

    /// Set the service-account directory.
    #[must_use]
    pub fn with_service_account_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.service_account_dir = dir.into();
        self
    }

    /// Set the polling fallback interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Configuration for [`crate::TokenVerifier`].
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Audience that verified tokens must carry.
    pub audience: String,

    /// Expected issuer. When `None`, the issuer is resolved by decoding
    /// (without verifying) the bootstrap service-account token.
    pub issuer: Option<String>,

    /// How long a fetched key set stays valid before a time-based refresh.
    /// Independent of key-id-miss-triggered refreshes.
    pub jwks_valid_interval: Duration,

    /// Backoff schedule for identity-provider requests.
    pub retry_policy: RetryPolicy,
}

impl VerifierConfig {
    /// Create a configuration for the given expected audience, taking the
    /// JWKS validity interval from the environment when set.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidInterval` if the JWKS validity interval
    /// variable is present but unparsable.
    pub fn new(audience: impl Into<String>) -> Result<Self, ConfigError> {
        let vars = env::vars().collect();
        let jwks_valid_interval =
            parse_interval(&vars, JWKS_VALID_INTERVAL_VAR, DEFAULT_JWKS_VALID_INTERVAL)?;

        Ok(Self {
            audience: audience.into(),
            issuer: None,
            jwks_valid_interval,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Set the expected issuer, skipping bootstrap-token resolution.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Set the JWKS validity interval.
    #[must_use]
    pub fn with_jwks_valid_interval(mut self, interval: Duration) -> Self {
        self.jwks_valid_interval = interval;
        self
    }

    /// Set the backoff schedule for identity-provider requests.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

fn parse_interval(
    vars: &HashMap<String, String>,
    var: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match vars.get(var) {
        None => Ok(default),
        Some(raw) => {
            let secs: u64 = raw.parse().map_err(|e| ConfigError::InvalidInterval {
                var: var.to_string(),
                reason: format!("{e}: {raw:?}"),
            })?;
            if secs == 0 {
                return Err(ConfigError::InvalidInterval {
                    var: var.to_string(),
                    reason: "interval must be positive".to_string(),
                });
            }
            Ok(Duration::from_secs(secs))
        }
    }
}
