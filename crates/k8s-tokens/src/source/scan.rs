//! Directory scanning for projected-volume token files.
//!
//! A tokens root holds one directory per audience with a `token` file
//! inside, reached through the platform's atomically-repointed snapshot
//! links. A service-account root holds a single `token` file that is cached
//! under the reserved [`crate::audience::DEFAULT`] audience.

use crate::error::TokenError;
use secrecy::SecretString;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

/// Name of the per-audience credential file.
const TOKEN_FILE: &str = "token";

/// Cached outcome of the last read for one audience.
///
/// Replaced wholesale on every refresh; a captured failure is re-raised to
/// every caller until the next successful read so that repeated lookups of
/// a broken audience do not re-hit the filesystem.
#[derive(Debug, Clone)]
pub(crate) enum TokenRecord {
    Ready(SecretString),
    Failed(String),
}

impl TokenRecord {
    pub(crate) fn resolve(&self, audience: &str) -> Result<SecretString, TokenError> {
        match self {
            TokenRecord::Ready(token) => Ok(token.clone()),
            TokenRecord::Failed(reason) => Err(TokenError::Unreadable {
                audience: audience.to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

/// Whether a directory entry name is a valid audience name.
///
/// Audience directories contain neither dots nor separators, which keeps
/// the hidden snapshot entries (`..data`, `..2024_...`) out of the cache.
fn is_audience_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('.') && !name.contains('/')
}

/// Scan a multi-audience tokens root into per-audience records.
///
/// Walks one level of `root`, matching the `{audience}/token` shape and
/// following symlinks on read. An audience directory without a token file
/// is skipped; a token file that exists but cannot be read yields a
/// captured failure record.
///
/// # Errors
///
/// Fails only when the root itself cannot be listed; per-audience read
/// failures are captured in the returned records instead.
pub(crate) fn scan_tokens_root(root: &Path) -> io::Result<HashMap<String, TokenRecord>> {
    let mut records = HashMap::new();

    for entry in fs::read_dir(root)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    target: "k8s_tokens.scan",
                    root = %root.display(),
                    error = %e,
                    "Skipping unreadable directory entry"
                );
                continue;
            }
        };

        let name = entry.file_name();
        let Some(audience) = name.to_str() else {
            continue;
        };
        if !is_audience_name(audience) {
            continue;
        }

        let token_path = entry.path().join(TOKEN_FILE);
        // Existence check follows symlinks, same as the read below.
        if !token_path.is_file() {
            continue;
        }

        debug!(target: "k8s_tokens.scan", audience = %audience, "Updating cache for audience");
        let record = match fs::read_to_string(&token_path) {
            Ok(token) => TokenRecord::Ready(SecretString::from(token)),
            Err(e) => TokenRecord::Failed(format!(
                "error reading token from {}: {e}",
                token_path.display()
            )),
        };
        records.insert(audience.to_string(), record);
    }

    Ok(records)
}

/// Read the single service-account token under `root`.
///
/// Always produces a record: a failed read is captured so callers get the
/// error synchronously rather than an `UnknownAudience` miss.
pub(crate) fn scan_service_account_root(root: &Path) -> TokenRecord {
    let token_path = root.join(TOKEN_FILE);
    match fs::read_to_string(&token_path) {
        Ok(token) => TokenRecord::Ready(SecretString::from(token)),
        Err(e) => TokenRecord::Failed(format!(
            "error reading token from {}: {e}",
            token_path.display()
        )),
    }
}
