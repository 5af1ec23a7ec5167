//! Event-driven token source.
//!
//! [`WatchingTokenSource`] keeps an in-memory token map current by reacting
//! to rotation-marker events on the volume roots, with a periodic rescan as
//! a convergence bound. Lookups never touch the filesystem.

use super::{scan_service_account_root, scan_tokens_root, TokenRecord, TokenSource};
use crate::audience;
use crate::config::TokenConfig;
use crate::error::{ConfigError, TokenError};
use crate::watch::VolumeWatcher;
use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

type Records = Arc<RwLock<HashMap<String, TokenRecord>>>;

/// Token source kept fresh by filesystem notifications.
///
/// Construction scans both roots synchronously so the first lookup already
/// sees a populated cache, then spawns one watcher per root. Records are
/// inserted or overwritten but never removed: an audience that disappears
/// from disk keeps serving its last known token until shutdown.
pub struct WatchingTokenSource {
    records: Records,
    tokens_watcher: VolumeWatcher,
    service_account_watcher: VolumeWatcher,
}

impl WatchingTokenSource {
    /// Build the source and start watching. Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::BadStorageRoot` when either root cannot be
    /// registered for notifications.
    pub fn new(config: TokenConfig) -> Result<Self, ConfigError> {
        let records: Records = Arc::new(RwLock::new(HashMap::new()));

        rescan_tokens(&records, &config.tokens_dir);
        rescan_service_account(&records, &config.service_account_dir);

        let tokens_watcher = {
            let records = Arc::clone(&records);
            let root = config.tokens_dir.clone();
            VolumeWatcher::spawn(&config.tokens_dir, config.poll_interval, move || {
                rescan_tokens(&records, &root);
            })?
        };

        let service_account_watcher = {
            let records = Arc::clone(&records);
            let root = config.service_account_dir.clone();
            VolumeWatcher::spawn(&config.service_account_dir, config.poll_interval, move || {
                rescan_service_account(&records, &root);
            })?
        };

        Ok(Self {
            records,
            tokens_watcher,
            service_account_watcher,
        })
    }
}

fn rescan_tokens(records: &Records, root: &Path) {
    match scan_tokens_root(root) {
        Ok(scanned) => {
            let mut records = records.write().unwrap_or_else(PoisonError::into_inner);
            // The reserved default audience belongs to the service-account
            // root; a same-named directory here must not shadow it.
            records.extend(
                scanned
                    .into_iter()
                    .filter(|(name, _)| name != audience::DEFAULT),
            );
        }
        Err(e) => {
            warn!(
                target: "k8s_tokens.source",
                root = %root.display(),
                error = %e,
                "Failed to list tokens root, keeping previous records"
            );
        }
    }
}

fn rescan_service_account(records: &Records, root: &Path) {
    let record = scan_service_account_root(root);
    records
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(audience::DEFAULT.to_string(), record);
}

#[async_trait]
impl TokenSource for WatchingTokenSource {
    async fn token(&self, audience: &str) -> Result<SecretString, TokenError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        match records.get(audience) {
            Some(record) => record.resolve(audience),
            None => Err(TokenError::UnknownAudience(audience.to_string())),
        }
    }

    async fn shutdown(&self) {
        self.tokens_watcher.shutdown().await;
        self.service_account_watcher.shutdown().await;
    }
}
