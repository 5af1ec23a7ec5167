//! Lazily refreshed token source.
//!
//! [`CachingTokenSource`] rescans the token volumes at most once per poll
//! interval, triggered by lookups rather than by a background task. It is
//! the fallback for environments where inotify is unavailable or where no
//! long-lived runtime exists to host a watcher.

use super::{scan_service_account_root, scan_tokens_root, TokenRecord, TokenSource};
use crate::audience;
use crate::config::TokenConfig;
use crate::error::TokenError;
use crate::refresh::CacheRefresher;
use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;
use tracing::warn;

type Records = HashMap<String, TokenRecord>;

/// Token source that rescans the volume roots when its cache expires.
///
/// All lookups within one poll interval are served from the same snapshot;
/// the first lookup past the deadline performs the rescan and concurrent
/// lookups wait for it instead of scanning again.
pub struct CachingTokenSource {
    cache: CacheRefresher<Records, TokenError>,
}

impl CachingTokenSource {
    /// Create a source over the roots in `config`.
    ///
    /// No filesystem access happens here; the first lookup performs the
    /// initial scan.
    #[must_use]
    pub fn new(config: TokenConfig) -> Self {
        let cache = CacheRefresher::new(config.poll_interval, move |previous| {
            let config = config.clone();
            async move { Ok(rescan(&config, previous.as_deref())) }
        });
        Self { cache }
    }
}

/// Build the next record snapshot.
///
/// A failure to list the tokens root keeps the previous per-audience
/// records instead of dropping them, so a transient volume hiccup never
/// empties the cache. The service-account record always overrides the
/// reserved default audience.
fn rescan(config: &TokenConfig, previous: Option<&Records>) -> Records {
    let mut records = match scan_tokens_root(&config.tokens_dir) {
        Ok(records) => records,
        Err(e) => {
            warn!(
                target: "k8s_tokens.source",
                root = %config.tokens_dir.display(),
                error = %e,
                "Failed to list tokens root, keeping previous records"
            );
            previous.cloned().unwrap_or_default()
        }
    };

    records.insert(
        audience::DEFAULT.to_string(),
        scan_service_account_root(&config.service_account_dir),
    );
    records
}

#[async_trait]
impl TokenSource for CachingTokenSource {
    async fn token(&self, audience: &str) -> Result<SecretString, TokenError> {
        let records = self.cache.get().await?;
        match records.get(audience) {
            Some(record) => record.resolve(audience),
            None => Err(TokenError::UnknownAudience(audience.to_string())),
        }
    }

    async fn shutdown(&self) {
        // No background work; cached records remain readable.
    }
}
