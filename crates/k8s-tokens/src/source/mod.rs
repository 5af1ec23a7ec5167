//! Token sources and the cross-source selection rule.
//!
//! A [`TokenSource`] hands out per-audience bearer tokens backed by the
//! platform's projected-volume mounts. Two implementations exist:
//! [`WatchingTokenSource`] reacts to filesystem notifications with a
//! polling fallback, [`CachingTokenSource`] rescans lazily on expiry.
//!
//! # Security
//!
//! Tokens are held as [`secrecy::SecretString`] end to end so they never
//! appear in `Debug` output or log lines.

use crate::error::TokenError;
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;

mod caching;
mod scan;
mod watching;

pub use caching::CachingTokenSource;
pub use watching::WatchingTokenSource;

pub(crate) use scan::{scan_service_account_root, scan_tokens_root, TokenRecord};

/// A provider of audience-scoped bearer tokens.
///
/// Implementations are cheap to call on the hot path: the filesystem is
/// only touched by background refreshes, never per lookup.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current token for `audience`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::UnknownAudience`] when no credential for the
    /// audience is provisioned, or [`TokenError::Unreadable`] when the last
    /// read of its file failed.
    async fn token(&self, audience: &str) -> Result<SecretString, TokenError>;

    /// Relative preference when several sources are registered. The source
    /// with the highest priority wins; ties go to the earliest registered.
    fn priority(&self) -> i32 {
        0
    }

    /// Stop background work. Subsequent [`TokenSource::token`] calls keep
    /// returning the last cached values.
    async fn shutdown(&self);
}

/// Pick the preferred source from a non-empty registration list.
///
/// Returns `None` only for an empty list. Selection is by descending
/// [`TokenSource::priority`]; the first registered source wins ties, so
/// adding an equal-priority source never changes an existing deployment.
#[must_use]
pub fn select_source(sources: &[Arc<dyn TokenSource>]) -> Option<Arc<dyn TokenSource>> {
    let mut best: Option<&Arc<dyn TokenSource>> = None;
    for source in sources {
        match best {
            Some(current) if source.priority() <= current.priority() => {}
            _ => best = Some(source),
        }
    }
    best.map(Arc::clone)
}
