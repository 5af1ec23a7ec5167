//! Token verification integration tests.
//!
//! Runs a [`TokenVerifier`] against a mocked identity provider serving the
//! discovery document and JWKS, with tokens signed by in-test Ed25519 keys.

// Test code is allowed to use expect/unwrap for assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use k8s_tokens::{TokenError, TokenSource, TokenVerifier, VerifierConfig, VerifyError};
use ring::signature::{Ed25519KeyPair, KeyPair};
use secrecy::SecretString;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AUDIENCE: &str = "my-service";

/// Claims for test tokens.
#[derive(Debug, Clone, Serialize)]
struct TestClaims {
    iss: String,
    aud: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    iat: i64,
    exp: i64,
}

impl TestClaims {
    fn valid(issuer: &str) -> Self {
        let now = Utc::now().timestamp();
        Self {
            iss: issuer.to_string(),
            aud: AUDIENCE.to_string(),
            sub: Some("system:serviceaccount:ns:caller".to_string()),
            iat: now,
            exp: now + 600,
        }
    }
}

/// Test keypair for signing tokens.
struct TestKeypair {
    kid: String,
    public_key_bytes: Vec<u8>,
    private_key_pkcs8: Vec<u8>,
}

impl TestKeypair {
    fn new(seed: u8, kid: &str) -> Self {
        // Create deterministic seed
        let mut seed_bytes = [0u8; 32];
        seed_bytes[0] = seed;
        for (i, byte) in seed_bytes.iter_mut().enumerate().skip(1) {
            *byte = seed.wrapping_mul(i as u8).wrapping_add(i as u8);
        }

        let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
            .expect("Failed to create test keypair");

        let public_key_bytes = key_pair.public_key().as_ref().to_vec();
        let private_key_pkcs8 = build_pkcs8_from_seed(&seed_bytes);

        Self {
            kid: kid.to_string(),
            public_key_bytes,
            private_key_pkcs8,
        }
    }

    fn sign_token(&self, claims: &TestClaims) -> String {
        let encoding_key = EncodingKey::from_ed_der(&self.private_key_pkcs8);
        let mut header = Header::new(Algorithm::EdDSA);
        header.typ = Some("JWT".to_string());
        header.kid = Some(self.kid.clone());

        encode(&header, claims, &encoding_key).expect("Failed to sign token")
    }

    fn jwk_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kty": "OKP",
            "kid": self.kid,
            "crv": "Ed25519",
            "x": URL_SAFE_NO_PAD.encode(&self.public_key_bytes),
            "alg": "EdDSA",
            "use": "sig"
        })
    }
}

/// Build PKCS#8 v1 document from Ed25519 seed.
fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    let mut pkcs8 = Vec::new();

    // Outer SEQUENCE tag
    pkcs8.push(0x30);
    pkcs8.push(0x2e); // Length: 46 bytes

    // Version: INTEGER 0
    pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]);

    // Algorithm Identifier: SEQUENCE
    pkcs8.push(0x30);
    pkcs8.push(0x05); // Length: 5 bytes
                      // OID for Ed25519: 1.3.101.112
    pkcs8.extend_from_slice(&[0x06, 0x03, 0x2b, 0x65, 0x70]);

    // Private Key: OCTET STRING
    pkcs8.push(0x04);
    pkcs8.push(0x22); // Length: 34 bytes
                      // Inner OCTET STRING with seed
    pkcs8.push(0x04);
    pkcs8.push(0x20); // Length: 32 bytes
    pkcs8.extend_from_slice(seed);

    pkcs8
}

/// Token source returning one fixed service-account token.
struct StaticTokenSource(SecretString);

impl StaticTokenSource {
    fn new(token: impl Into<String>) -> Arc<dyn TokenSource> {
        Arc::new(Self(SecretString::from(token.into())))
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self, _audience: &str) -> Result<SecretString, TokenError> {
        Ok(self.0.clone())
    }

    async fn shutdown(&self) {}
}

fn jwks_body(keypairs: &[&TestKeypair]) -> serde_json::Value {
    serde_json::json!({
        "keys": keypairs.iter().map(|kp| kp.jwk_json()).collect::<Vec<_>>(),
    })
}

/// Mock identity provider: discovery document plus an initial JWKS mount.
async fn mock_idp(keypairs: &[&TestKeypair]) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "issuer": server.uri(),
            "jwks_uri": format!("{}/keys", server.uri()),
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body(keypairs)))
        .mount(&server)
        .await;

    server
}

fn config(issuer: &str) -> VerifierConfig {
    VerifierConfig::new(AUDIENCE)
        .unwrap()
        .with_issuer(issuer)
        .with_jwks_valid_interval(Duration::from_secs(3600))
}

async fn verifier_for(server: &MockServer) -> TokenVerifier {
    TokenVerifier::new(config(&server.uri()), StaticTokenSource::new("sa-token"))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_valid_token_yields_claims() {
    let keypair = TestKeypair::new(1, "k1");
    let server = mock_idp(&[&keypair]).await;
    let verifier = verifier_for(&server).await;

    let claims_in = TestClaims::valid(&server.uri());
    let token = keypair.sign_token(&claims_in);

    let claims = verifier.verify(&token).await.unwrap();
    assert_eq!(claims.subject, "system:serviceaccount:ns:caller");
    assert_eq!(claims.issuer, server.uri());
    assert_eq!(claims.audience, vec![AUDIENCE]);
    assert_eq!(claims.expires_at, claims_in.exp);
    assert_eq!(claims.key_id, "k1");
}

#[tokio::test]
async fn test_tampered_signature_rejected() {
    let keypair = TestKeypair::new(1, "k1");
    let server = mock_idp(&[&keypair]).await;
    let verifier = verifier_for(&server).await;

    let token = keypair.sign_token(&TestClaims::valid(&server.uri()));

    // Splice in the signature from a token over different claims.
    let mut other_claims = TestClaims::valid(&server.uri());
    other_claims.sub = Some("somebody-else".to_string());
    let other_token = keypair.sign_token(&other_claims);
    let other_signature = other_token.rsplit('.').next().unwrap();

    let message = token.rsplit_once('.').unwrap().0;
    let tampered = format!("{message}.{other_signature}");

    let err = verifier.verify(&tampered).await.unwrap_err();
    assert!(matches!(err, VerifyError::BadSignature), "got: {err}");
}

#[tokio::test]
async fn test_wrong_audience_rejected_before_signature_check() {
    let keypair = TestKeypair::new(1, "k1");
    let server = mock_idp(&[&keypair]).await;
    let verifier = verifier_for(&server).await;

    let mut claims = TestClaims::valid(&server.uri());
    claims.aud = "someone-else".to_string();
    let token = keypair.sign_token(&claims);

    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, VerifyError::InvalidClaims(_)), "got: {err}");
}

#[tokio::test]
async fn test_expired_token_rejected() {
    let keypair = TestKeypair::new(1, "k1");
    let server = mock_idp(&[&keypair]).await;
    let verifier = verifier_for(&server).await;

    let mut claims = TestClaims::valid(&server.uri());
    claims.exp = Utc::now().timestamp() - 100;
    let token = keypair.sign_token(&claims);

    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, VerifyError::InvalidClaims(_)), "got: {err}");
    assert!(err.to_string().contains("expired"));
}

#[tokio::test]
async fn test_missing_subject_rejected() {
    let keypair = TestKeypair::new(1, "k1");
    let server = mock_idp(&[&keypair]).await;
    let verifier = verifier_for(&server).await;

    let mut claims = TestClaims::valid(&server.uri());
    claims.sub = None;
    let token = keypair.sign_token(&claims);

    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, VerifyError::InvalidClaims(_)), "got: {err}");
}

#[tokio::test]
async fn test_wrong_issuer_rejected() {
    let keypair = TestKeypair::new(1, "k1");
    let server = mock_idp(&[&keypair]).await;
    let verifier = verifier_for(&server).await;

    let mut claims = TestClaims::valid(&server.uri());
    claims.iss = "https://evil.example".to_string();
    let token = keypair.sign_token(&claims);

    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, VerifyError::InvalidClaims(_)), "got: {err}");
}

#[tokio::test]
async fn test_garbage_token_is_malformed() {
    let keypair = TestKeypair::new(1, "k1");
    let server = mock_idp(&[&keypair]).await;
    let verifier = verifier_for(&server).await;

    let err = verifier.verify("not-a-jwt").await.unwrap_err();
    assert!(matches!(err, VerifyError::Malformed(_)), "got: {err}");
}

#[tokio::test]
async fn test_multiple_known_keys_both_verify() {
    let k1 = TestKeypair::new(1, "k1");
    let k2 = TestKeypair::new(2, "k2");
    let server = mock_idp(&[&k1, &k2]).await;
    let verifier = verifier_for(&server).await;

    let claims = TestClaims::valid(&server.uri());
    assert!(verifier.verify(&k1.sign_token(&claims)).await.is_ok());
    assert!(verifier.verify(&k2.sign_token(&claims)).await.is_ok());
}

#[tokio::test]
async fn test_unknown_kid_refreshes_then_succeeds() {
    let k1 = TestKeypair::new(1, "k1");
    let k2 = TestKeypair::new(2, "k2");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "issuer": server.uri(),
            "jwks_uri": format!("{}/keys", server.uri()),
        })))
        .mount(&server)
        .await;

    // Initial fetch sees only k1; the provider rotates to {k1, k2} after.
    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body(&[&k1])))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body(&[&k1, &k2])))
        .expect(1)
        .mount(&server)
        .await;

    let verifier = verifier_for(&server).await;
    let claims = TestClaims::valid(&server.uri());

    // Signed with the key the initial fetch has not seen: one forced
    // refresh, then success.
    assert!(verifier.verify(&k2.sign_token(&claims)).await.is_ok());

    // Cached now; no further fetches (mock expectations enforce this).
    assert!(verifier.verify(&k2.sign_token(&claims)).await.is_ok());
    assert!(verifier.verify(&k1.sign_token(&claims)).await.is_ok());
}

#[tokio::test]
async fn test_unknown_kid_after_refresh_is_key_not_found() {
    let k1 = TestKeypair::new(1, "k1");
    let k3 = TestKeypair::new(3, "k3");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "issuer": server.uri(),
            "jwks_uri": format!("{}/keys", server.uri()),
        })))
        .mount(&server)
        .await;
    // The key set never contains k3: initial fetch plus exactly one
    // miss-triggered refresh.
    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body(&[&k1])))
        .expect(2)
        .mount(&server)
        .await;

    let verifier = verifier_for(&server).await;
    let claims = TestClaims::valid(&server.uri());

    let err = verifier.verify(&k3.sign_token(&claims)).await.unwrap_err();
    assert!(
        matches!(err, VerifyError::KeyNotFound(ref kid) if kid == "k3"),
        "got: {err}"
    );
}

#[tokio::test]
async fn test_issuer_resolved_from_bootstrap_token() {
    let keypair = TestKeypair::new(1, "k1");
    let server = mock_idp(&[&keypair]).await;

    // Unsigned bootstrap token carrying the issuer claim; it is only
    // decoded, never verified.
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"EdDSA","kid":"boot"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::json!({
            "iss": server.uri(),
            "sub": "system:serviceaccount:ns:me",
            "exp": Utc::now().timestamp() + 600,
        })
        .to_string(),
    );
    let signature = URL_SAFE_NO_PAD.encode("unchecked");
    let bootstrap = format!("{header}.{payload}.{signature}");

    let config = VerifierConfig::new(AUDIENCE)
        .unwrap()
        .with_jwks_valid_interval(Duration::from_secs(3600));
    let verifier = TokenVerifier::new(config, StaticTokenSource::new(bootstrap))
        .await
        .unwrap();
    assert_eq!(verifier.issuer(), server.uri());

    let token = keypair.sign_token(&TestClaims::valid(&server.uri()));
    assert!(verifier.verify(&token).await.is_ok());
}

#[tokio::test]
async fn test_bootstrap_token_without_issuer_fails_construction() {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"EdDSA"}"#);
    let payload = URL_SAFE_NO_PAD.encode(r#"{"sub":"me"}"#);
    let bootstrap = format!("{header}.{payload}.e30");

    let config = VerifierConfig::new(AUDIENCE).unwrap();
    let err = TokenVerifier::new(config, StaticTokenSource::new(bootstrap))
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::Bootstrap(_)), "got: {err}");
}
