//! HTTP client for the cluster identity provider.
//!
//! Two operations: resolve the JWKS endpoint from the issuer's discovery
//! document, and fetch the JWKS document itself. Both authenticate with the
//! workload's own service-account token.
//!
//! # Security
//!
//! Server errors (5xx) are retried with exponential backoff and jitter;
//! everything else — transport failures, non-5xx statuses, empty bodies —
//! is terminal on first occurrence, since it indicates a configuration or
//! protocol problem that retrying cannot fix.

use crate::audience;
use crate::error::OidcError;
use crate::source::TokenSource;
use rand::Rng;
use reqwest::Url;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Path of the issuer discovery document, relative to the issuer URL.
const DISCOVERY_PATH: &str = ".well-known/openid-configuration";

/// Backoff schedule for 5xx responses.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per retry.
    pub base_delay: Duration,
    /// Upper bound on the exponential delay, before jitter.
    pub max_delay: Duration,
    /// Uniform random addition to every delay, to spread out retry storms.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            max_jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based).
    fn delay_before(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(20);
        let capped = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Discovery document; every field except the JWKS endpoint is ignored.
#[derive(Debug, Deserialize)]
struct IssuerMetadata {
    jwks_uri: String,
}

/// Authenticated client for issuer discovery and JWKS retrieval.
pub struct OidcClient {
    http: reqwest::Client,
    token_source: Arc<dyn TokenSource>,
    retry: RetryPolicy,
}

impl OidcClient {
    /// Create a client with the default retry policy.
    ///
    /// # Errors
    ///
    /// Returns `OidcError::Client` when the HTTP client cannot be built.
    pub fn new(token_source: Arc<dyn TokenSource>) -> Result<Self, OidcError> {
        Self::with_retry_policy(token_source, RetryPolicy::default())
    }

    /// Create a client with an explicit retry policy.
    ///
    /// # Errors
    ///
    /// Returns `OidcError::Client` when the HTTP client cannot be built.
    pub fn with_retry_policy(
        token_source: Arc<dyn TokenSource>,
        retry: RetryPolicy,
    ) -> Result<Self, OidcError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OidcError::Client(e.to_string()))?;

        Ok(Self {
            http,
            token_source,
            retry,
        })
    }

    /// Resolve the issuer's JWKS endpoint from its discovery document.
    ///
    /// # Errors
    ///
    /// Propagates retrieval failures; returns `OidcError::InvalidMetadata`
    /// when the document is unparsable or lacks `jwks_uri`.
    pub async fn jwks_uri(&self, issuer: &str) -> Result<String, OidcError> {
        let url = format!("{}/{DISCOVERY_PATH}", issuer.trim_end_matches('/'));
        let body = self.get_with_retry(&url).await?;

        let metadata: IssuerMetadata =
            serde_json::from_str(&body).map_err(|e| OidcError::InvalidMetadata {
                url,
                reason: e.to_string(),
            })?;
        debug!(target: "k8s_tokens.oidc", jwks_uri = %metadata.jwks_uri, "Resolved JWKS endpoint");
        Ok(metadata.jwks_uri)
    }

    /// Fetch the raw JWKS document from a previously resolved endpoint.
    ///
    /// # Errors
    ///
    /// Propagates retrieval failures; the body is returned unparsed.
    pub async fn jwks_document(&self, jwks_uri: &str) -> Result<String, OidcError> {
        self.get_with_retry(jwks_uri).await
    }

    /// Authenticated GET with 5xx-only retries.
    ///
    /// The bearer token is fetched once per logical request, not per
    /// attempt: a retry re-sends the same credential.
    async fn get_with_retry(&self, url: &str) -> Result<String, OidcError> {
        let parsed = Url::parse(url).map_err(|e| OidcError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let bearer = self.token_source.token(audience::DEFAULT).await?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let response = self
                .http
                .get(parsed.clone())
                .bearer_auth(bearer.expose_secret())
                .send()
                .await
                .map_err(|e| OidcError::Transport {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

            let status = response.status();
            if status.is_success() {
                let body = response.text().await.map_err(|e| OidcError::Transport {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
                if body.trim().is_empty() {
                    return Err(OidcError::EmptyBody {
                        url: url.to_string(),
                    });
                }
                return Ok(body);
            }

            if !status.is_server_error() {
                return Err(OidcError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            if attempt >= self.retry.max_attempts {
                return Err(OidcError::RetriesExhausted {
                    status: status.as_u16(),
                    url: url.to_string(),
                    attempts: attempt,
                });
            }

            let delay = self.retry.delay_before(attempt - 1);
            warn!(
                target: "k8s_tokens.oidc",
                status = status.as_u16(),
                url = %url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Server error, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
