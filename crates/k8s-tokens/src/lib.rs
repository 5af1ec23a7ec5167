//! Client-side security library for workloads running on an orchestrated
//! cluster.
//!
//! Two concerns:
//!
//! - **Token access**: the platform materializes audience-scoped bearer
//!   tokens as files on projected volumes and rotates them by atomically
//!   repointing a snapshot link. [`TokenSource`] implementations keep an
//!   in-memory cache of those files current — [`WatchingTokenSource`] via
//!   filesystem notifications with a polling fallback,
//!   [`CachingTokenSource`] via lazy rescans on lookup.
//! - **Token verification**: [`TokenVerifier`] checks bearer tokens
//!   presented by callers against the cluster identity provider, using
//!   issuer discovery and a self-refreshing JWKS key cache.
//!
//! Both caches are built on [`CacheRefresher`], a generic time-bounded
//! single-value cache that runs its updater at most once per expiry window
//! regardless of caller concurrency.
//!
//! # Security
//!
//! Token values are wrapped in [`secrecy::SecretString`] and never appear
//! in `Debug` output or logs. Verification never accepts a token on
//! structural checks alone; the signature is always checked against keys
//! fetched from the identity provider over an authenticated channel.

pub mod audience;
pub mod config;
pub mod error;
pub mod oidc;
pub mod refresh;
pub mod source;
pub mod verifier;

mod watch;

pub use config::{TokenConfig, VerifierConfig};
pub use error::{ConfigError, OidcError, TokenError, VerifyError};
pub use oidc::{OidcClient, RetryPolicy};
pub use refresh::CacheRefresher;
pub use source::{select_source, CachingTokenSource, TokenSource, WatchingTokenSource};
pub use verifier::{Claims, TokenVerifier};
