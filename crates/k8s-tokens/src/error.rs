//! Error types shared across the crate.
//!
//! The taxonomy separates startup problems (`ConfigError`), per-call token
//! cache failures (`TokenError`), identity-provider HTTP failures
//! (`OidcError`) and token verification failures (`VerifyError`), so that
//! callers can always distinguish "bad token" from "infrastructure problem".

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// These are fatal at startup: a bad path or an unparsable interval means
/// the process is misconfigured and retrying cannot help.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An interval environment variable could not be parsed as seconds.
    #[error("Invalid interval in {var}: {reason}")]
    InvalidInterval { var: String, reason: String },

    /// A configured storage root does not exist or cannot be watched.
    #[error("Cannot watch token storage root {root}: {reason}")]
    BadStorageRoot { root: String, reason: String },
}

/// Errors surfaced by [`crate::TokenSource::token`].
///
/// `Clone` because failed reads are cached per audience and re-raised to
/// every caller until the next successful refresh.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    /// No record exists for the requested audience.
    #[error("Unknown token audience: {0}")]
    UnknownAudience(String),

    /// The last filesystem read for this audience failed.
    #[error("Failed to read token for audience {audience}: {reason}")]
    Unreadable { audience: String, reason: String },
}

/// Errors raised by [`crate::OidcClient`].
///
/// Only `RetriesExhausted` is preceded by internal retries; every other
/// variant is terminal and raised on first occurrence, since it indicates
/// a configuration or protocol problem retries cannot fix.
#[derive(Debug, Error)]
pub enum OidcError {
    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    /// The outbound bearer token could not be obtained.
    #[error("Bearer token unavailable: {0}")]
    Token(#[from] TokenError),

    /// The request URL is not a valid URL.
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The request failed at the transport level (DNS, TLS, timeout).
    #[error("Transport error for GET {url}: {reason}")]
    Transport { url: String, reason: String },

    /// The endpoint answered with a non-2xx, non-5xx status.
    #[error("Unexpected status {status} for GET {url}")]
    Status { status: u16, url: String },

    /// The endpoint answered 2xx with an empty body.
    #[error("Empty response body for GET {url}")]
    EmptyBody { url: String },

    /// The endpoint kept answering 5xx until the retry budget ran out.
    #[error("Server error {status} for GET {url} after {attempts} attempts")]
    RetriesExhausted {
        status: u16,
        url: String,
        attempts: u32,
    },

    /// The issuer metadata document could not be parsed or lacks `jwks_uri`.
    #[error("Invalid issuer metadata from {url}: {reason}")]
    InvalidMetadata { url: String, reason: String },
}

/// Errors raised by [`crate::TokenVerifier`].
///
/// Verification errors are per-call facts about the presented token and are
/// never retried automatically. `Discovery` is the one infrastructure
/// family: it means the key material could not be obtained, not that the
/// token is bad.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The token is not a structurally valid JWT.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// A structural claim check failed (issuer, audience, subject, expiry).
    #[error("Invalid claims: {0}")]
    InvalidClaims(String),

    /// The signing key id is absent from the key set even after a refresh.
    #[error("No verification key for key id {0:?}")]
    KeyNotFound(String),

    /// The signature does not verify against the resolved key.
    #[error("Token signature is invalid")]
    BadSignature,

    /// Issuer discovery or JWKS retrieval failed.
    #[error("Key discovery failed: {0}")]
    Discovery(#[from] OidcError),

    /// The issuer could not be resolved from the bootstrap token.
    #[error("Failed to resolve issuer from bootstrap token: {0}")]
    Bootstrap(String),

    /// The JWKS document could not be parsed into usable keys.
    #[error("Invalid JWKS document from {url}: {reason}")]
    InvalidKeySet { url: String, reason: String },
}
