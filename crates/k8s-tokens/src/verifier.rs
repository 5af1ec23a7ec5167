//! Bearer-token verification against the cluster identity provider.
//!
//! Verification runs in two phases. Structural claim checks come first and
//! are pure string/JSON work: shape, expiration, subject, issuer, audience.
//! Only a token that passes them reaches signature verification against the
//! cached JWKS key set. The key cache refreshes on a validity interval and,
//! de-duplicated, on an unknown key id — the rotation case where the
//! provider signs with a key fetched before the last refresh.
//!
//! # Security
//!
//! Structural checks never substitute for signature verification; a token
//! is only accepted after both phases pass. Expiration uses a fixed
//! 30-second clock-skew allowance.

use crate::audience;
use crate::config::VerifierConfig;
use crate::error::VerifyError;
use crate::oidc::OidcClient;
use crate::refresh::CacheRefresher;
use crate::source::TokenSource;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet};
use jsonwebtoken::{decode_header, Algorithm, DecodingKey};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tolerated skew between this host's clock and the issuer's, in seconds.
const CLOCK_SKEW_SECONDS: i64 = 30;

/// Upper bound on accepted token size. Anything larger is rejected before
/// any decoding work.
const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// Verified claims of an accepted token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub issuer: String,
    pub audience: Vec<String>,
    pub subject: String,
    pub issued_at: Option<i64>,
    pub expires_at: i64,
    /// Key id of the key that verified the signature.
    pub key_id: String,
}

/// Claim forms as they appear on the wire, before validation.
#[derive(Debug, Deserialize)]
struct RawClaims {
    iss: Option<String>,
    aud: Option<RawAudience>,
    sub: Option<String>,
    iat: Option<i64>,
    exp: Option<i64>,
}

/// The audience claim is a bare string or an array of strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAudience {
    One(String),
    Many(Vec<String>),
}

impl RawAudience {
    fn contains(&self, expected: &str) -> bool {
        match self {
            RawAudience::One(aud) => aud == expected,
            RawAudience::Many(auds) => auds.iter().any(|aud| aud == expected),
        }
    }

    fn into_vec(self) -> Vec<String> {
        match self {
            RawAudience::One(aud) => vec![aud],
            RawAudience::Many(auds) => auds,
        }
    }
}

struct VerificationKey {
    algorithm: Algorithm,
    key: DecodingKey,
}

/// One fetched JWKS snapshot, keyed by key id. Replaced wholesale on
/// refresh, never merged.
struct KeySet {
    keys: HashMap<String, VerificationKey>,
}

impl KeySet {
    fn from_document(document: &str, url: &str) -> Result<Self, VerifyError> {
        let jwks: JwkSet =
            serde_json::from_str(document).map_err(|e| VerifyError::InvalidKeySet {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                warn!(target: "k8s_tokens.verifier", "Skipping JWKS entry without key id");
                continue;
            };
            let Some(algorithm) = algorithm_of(jwk) else {
                warn!(
                    target: "k8s_tokens.verifier",
                    kid = %kid,
                    "Skipping JWKS entry with unsupported algorithm"
                );
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, VerificationKey { algorithm, key });
                }
                Err(e) => {
                    warn!(
                        target: "k8s_tokens.verifier",
                        kid = %kid,
                        error = %e,
                        "Skipping unusable JWKS entry"
                    );
                }
            }
        }

        if keys.is_empty() {
            warn!(target: "k8s_tokens.verifier", url = %url, "JWKS document yielded no usable keys");
        }
        Ok(Self { keys })
    }
}

/// Signing algorithm for a JWKS entry: the declared `alg` when present,
/// otherwise inferred from the key type.
fn algorithm_of(jwk: &Jwk) -> Option<Algorithm> {
    if let Some(alg) = jwk.common.key_algorithm {
        return Algorithm::from_str(&alg.to_string()).ok();
    }
    match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        AlgorithmParameters::OctetKeyPair(params) => match params.curve {
            EllipticCurve::Ed25519 => Some(Algorithm::EdDSA),
            _ => None,
        },
        AlgorithmParameters::EllipticCurve(params) => match params.curve {
            EllipticCurve::P256 => Some(Algorithm::ES256),
            EllipticCurve::P384 => Some(Algorithm::ES384),
            _ => None,
        },
        AlgorithmParameters::OctetKey(_) => Some(Algorithm::HS256),
    }
}

/// Verifier of caller-presented bearer tokens.
///
/// Construction resolves the issuer, discovers the JWKS endpoint and
/// performs the initial key fetch; any failure there is a constructor
/// error. The verifier holds no background resources — the token source's
/// lifetime belongs to the caller.
pub struct TokenVerifier {
    audience: String,
    issuer: String,
    keys: CacheRefresher<KeySet, VerifyError>,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Build a verifier for the audience in `config`.
    ///
    /// The issuer comes from the config when set, otherwise from the `iss`
    /// claim of the workload's own service-account token (decoded without
    /// verification — it only bootstraps discovery, the discovered JWKS is
    /// what establishes trust).
    ///
    /// # Errors
    ///
    /// Returns `VerifyError::Bootstrap` when no issuer can be resolved, or
    /// a `Discovery`/`InvalidKeySet` error when the initial metadata or key
    /// fetch fails.
    pub async fn new(
        config: VerifierConfig,
        token_source: Arc<dyn TokenSource>,
    ) -> Result<Self, VerifyError> {
        let oidc = Arc::new(OidcClient::with_retry_policy(
            Arc::clone(&token_source),
            config.retry_policy.clone(),
        )?);

        let issuer = match config.issuer {
            Some(issuer) => issuer,
            None => bootstrap_issuer(token_source.as_ref()).await?,
        };
        debug!(target: "k8s_tokens.verifier", issuer = %issuer, "Resolved token issuer");

        let jwks_uri = oidc.jwks_uri(&issuer).await?;

        let keys = CacheRefresher::new(config.jwks_valid_interval, move |_previous| {
            let oidc = Arc::clone(&oidc);
            let jwks_uri = jwks_uri.clone();
            async move {
                let document = oidc.jwks_document(&jwks_uri).await?;
                KeySet::from_document(&document, &jwks_uri)
            }
        });
        keys.get().await?;

        Ok(Self {
            audience: config.audience,
            issuer,
            keys,
        })
    }

    /// Verify a presented bearer token and return its claims.
    ///
    /// # Errors
    ///
    /// `Malformed` for anything that is not a decodable JWT, `InvalidClaims`
    /// for a structural claim failure, `KeyNotFound`/`BadSignature` for
    /// signature failures, `Discovery` when a needed key refresh fails.
    pub async fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        if token.len() > MAX_TOKEN_SIZE_BYTES {
            return Err(VerifyError::Malformed(format!(
                "token exceeds {MAX_TOKEN_SIZE_BYTES} bytes"
            )));
        }

        let header =
            decode_header(token).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| VerifyError::Malformed("token header has no kid".to_string()))?;

        let raw = decode_payload(token)?;
        let claims = validate_claims(
            raw,
            &self.issuer,
            &self.audience,
            chrono::Utc::now().timestamp(),
            &kid,
        )?;

        // Unknown kid forces one de-duplicated refresh; a second miss on
        // the refreshed set is terminal.
        let key_set = self
            .keys
            .get_or_refresh(|keys| !keys.keys.contains_key(&kid))
            .await?;
        let Some(verification_key) = key_set.keys.get(&kid) else {
            return Err(VerifyError::KeyNotFound(kid));
        };

        if header.alg != verification_key.algorithm {
            return Err(VerifyError::BadSignature);
        }

        let (message, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| VerifyError::Malformed("token has no signature part".to_string()))?;
        let valid = jsonwebtoken::crypto::verify(
            signature,
            message.as_bytes(),
            &verification_key.key,
            verification_key.algorithm,
        )
        .map_err(|_| VerifyError::BadSignature)?;
        if !valid {
            return Err(VerifyError::BadSignature);
        }

        Ok(claims)
    }

    /// The issuer this verifier was resolved against.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }
}

/// Issuer of the workload's own service-account token, decoded without
/// signature verification.
async fn bootstrap_issuer(token_source: &dyn TokenSource) -> Result<String, VerifyError> {
    let token = token_source
        .token(audience::DEFAULT)
        .await
        .map_err(|e| VerifyError::Bootstrap(e.to_string()))?;

    let raw = decode_payload(token.expose_secret())
        .map_err(|e| VerifyError::Bootstrap(e.to_string()))?;
    match raw.iss {
        Some(issuer) if !issuer.is_empty() => Ok(issuer),
        _ => Err(VerifyError::Bootstrap(
            "service-account token has no issuer claim".to_string(),
        )),
    }
}

fn decode_payload(token: &str) -> Result<RawClaims, VerifyError> {
    let mut parts = token.split('.');
    let (Some(_), Some(payload), Some(_), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(VerifyError::Malformed(
            "token does not have three dot-separated parts".to_string(),
        ));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| VerifyError::Malformed(format!("payload is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| VerifyError::Malformed(format!("payload is not a JSON object: {e}")))
}

/// Structural claim checks; `now` is a Unix timestamp in seconds.
fn validate_claims(
    raw: RawClaims,
    expected_issuer: &str,
    expected_audience: &str,
    now: i64,
    kid: &str,
) -> Result<Claims, VerifyError> {
    let Some(expires_at) = raw.exp else {
        return Err(VerifyError::InvalidClaims(
            "missing expiration claim".to_string(),
        ));
    };
    if expires_at + CLOCK_SKEW_SECONDS <= now {
        return Err(VerifyError::InvalidClaims("token has expired".to_string()));
    }

    let subject = match raw.sub {
        Some(sub) if !sub.is_empty() => sub,
        _ => {
            return Err(VerifyError::InvalidClaims(
                "missing subject claim".to_string(),
            ))
        }
    };

    let issuer = match raw.iss {
        Some(iss) if iss == expected_issuer => iss,
        Some(iss) => {
            return Err(VerifyError::InvalidClaims(format!(
                "issuer {iss:?} does not match expected issuer"
            )))
        }
        None => {
            return Err(VerifyError::InvalidClaims(
                "missing issuer claim".to_string(),
            ))
        }
    };

    let audience = match raw.aud {
        Some(aud) if aud.contains(expected_audience) => aud.into_vec(),
        Some(_) => {
            return Err(VerifyError::InvalidClaims(format!(
                "audience does not include {expected_audience:?}"
            )))
        }
        None => {
            return Err(VerifyError::InvalidClaims(
                "missing audience claim".to_string(),
            ))
        }
    };

    Ok(Claims {
        issuer,
        audience,
        subject,
        issued_at: raw.iat,
        expires_at,
        key_id: kid.to_string(),
    })
}
