use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, Header, Validation, decode, decode_header};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::cache::PlatformCache;
use crate::error::VerifyError;
use crate::helpers::now_secs;
use crate::jwks::JwksCacheManager;

pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(5);
/// Asymmetric algorithms accepted for subject tokens.
pub const SUBJECT_TOKEN_ALGORITHMS: &[Algorithm] = &[Algorithm::RS256, Algorithm::PS256];
pub const ID_TOKEN_ALGORITHMS: &[Algorithm] = &[Algorithm::RS256];

const LOG_TARGET: &str = "jwks";

#[derive(Debug, Clone)]
pub struct VerifyOptions<'a> {
    pub issuer: &'a Url,
    pub audience: &'a str,
    pub algorithms: &'a [Algorithm],
    pub subject: Option<&'a str>,
    pub max_token_age: Option<Duration>,
    pub max_auth_age: Option<Duration>,
}

impl<'a> VerifyOptions<'a> {
    pub fn new(issuer: &'a Url, audience: &'a str) -> Self {
        Self {
            issuer,
            audience,
            algorithms: SUBJECT_TOKEN_ALGORITHMS,
            subject: None,
            max_token_age: None,
            max_auth_age: None,
        }
    }

    pub fn algorithms(mut self, algorithms: &'a [Algorithm]) -> Self {
        self.algorithms = algorithms;
        self
    }

    pub fn subject(mut self, subject: &'a str) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn max_token_age(mut self, age: Duration) -> Self {
        self.max_token_age = Some(age);
        self
    }

    pub fn max_auth_age(mut self, age: Duration) -> Self {
        self.max_auth_age = Some(age);
        self
    }
}

/// Claims of a token whose signature, issuer, audience and expiry were checked.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedTokenPayload {
    pub sub: String,
    pub iss: String,
    pub aud: Vec<String>,
    pub exp: u64,
    pub iat: Option<u64>,
    pub org_id: Option<String>,
    pub cnf: Option<Value>,
    pub claims: Map<String, Value>,
}

impl VerifiedTokenPayload {
    fn from_claims(claims: Map<String, Value>) -> Result<Self, VerifyError> {
        let sub = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VerifyError::claim("sub"))?
            .to_string();

        let aud = match claims.get("aud") {
            Some(Value::String(single)) => vec![single.clone()],
            Some(Value::Array(many)) => many
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            sub,
            iss: string_claim(&claims, "iss").unwrap_or_default(),
            aud,
            exp: numeric_claim(&claims, "exp").unwrap_or_default(),
            iat: numeric_claim(&claims, "iat"),
            org_id: string_claim(&claims, "org_id"),
            cnf: claims.get("cnf").filter(|v| !v.is_null()).cloned(),
            claims,
        })
    }

    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    pub fn is_sender_constrained(&self) -> bool {
        self.cnf.is_some()
    }
}

fn string_claim(claims: &Map<String, Value>, name: &str) -> Option<String> {
    claims.get(name).and_then(Value::as_str).map(str::to_string)
}

fn numeric_claim(claims: &Map<String, Value>, name: &str) -> Option<u64> {
    let value = claims.get(name)?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

/// Verifies bearer tokens against the issuer's published keys.
pub struct TokenVerifier {
    jwks: Arc<JwksCacheManager>,
    leeway: Duration,
}

impl TokenVerifier {
    pub fn new(jwks: Arc<JwksCacheManager>) -> Self {
        Self {
            jwks,
            leeway: DEFAULT_LEEWAY,
        }
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    pub fn jwks(&self) -> &Arc<JwksCacheManager> {
        &self.jwks
    }

    /// Runs every check and classifies the first failure. A key lookup miss
    /// gets one forced key refresh and one more attempt.
    pub async fn verify(
        &self,
        token: &str,
        options: &VerifyOptions<'_>,
        cache: &dyn PlatformCache,
    ) -> Result<VerifiedTokenPayload, VerifyError> {
        let header = self.inspect(token, options)?;

        match self.verify_with_keys(token, &header, options, cache, false).await {
            Err(err) if err.triggers_refresh() => {
                tracing::info!(
                    target: LOG_TARGET,
                    kid = ?header.kid,
                    error = %err,
                    "refreshing jwks after key lookup miss"
                );
                self.verify_with_keys(token, &header, options, cache, true)
                    .await
            }
            other => other,
        }
    }

    /// Structural checks that need no key: header, algorithm, unverified expiry.
    fn inspect(&self, token: &str, options: &VerifyOptions<'_>) -> Result<Header, VerifyError> {
        let header =
            decode_header(token).map_err(|e| VerifyError::Malformed(format!("header: {e}")))?;
        if !options.algorithms.contains(&header.alg) {
            return Err(VerifyError::Malformed(format!(
                "algorithm {:?} is not allowed",
                header.alg
            )));
        }

        let claims = unverified_claims(token)?;
        if let Some(exp) = numeric_claim(&claims, "exp")
            && exp.saturating_add(self.leeway.as_secs()) < now_secs()
        {
            return Err(VerifyError::Expired);
        }

        Ok(header)
    }

    async fn verify_with_keys(
        &self,
        token: &str,
        header: &Header,
        options: &VerifyOptions<'_>,
        cache: &dyn PlatformCache,
        force_refresh: bool,
    ) -> Result<VerifiedTokenPayload, VerifyError> {
        let resolver = self
            .jwks
            .get_verification_keys(options.issuer, cache, force_refresh)
            .await
            .map_err(VerifyError::KeySource)?;
        let key = resolver.select(header.kid.as_deref(), header.alg)?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway.as_secs();
        validation.validate_nbf = true;
        validation.set_issuer(&[options.issuer.as_str()]);
        validation.set_audience(&[options.audience]);
        validation.required_spec_claims = HashSet::from([
            "exp".to_string(),
            "iss".to_string(),
            "aud".to_string(),
        ]);

        let token_data = decode::<Map<String, Value>>(token, key, &validation)?;
        let payload = VerifiedTokenPayload::from_claims(token_data.claims)?;
        self.check_optional_claims(&payload, options)?;

        Ok(payload)
    }

    fn check_optional_claims(
        &self,
        payload: &VerifiedTokenPayload,
        options: &VerifyOptions<'_>,
    ) -> Result<(), VerifyError> {
        let now = now_secs();
        let leeway = self.leeway.as_secs();

        if let Some(expected) = options.subject
            && payload.sub != expected
        {
            return Err(VerifyError::claim("sub"));
        }

        if let Some(max_age) = options.max_token_age {
            let iat = payload.iat.ok_or_else(|| VerifyError::claim("iat"))?;
            if iat > now.saturating_add(leeway) {
                return Err(VerifyError::claim("iat"));
            }
            if iat.saturating_add(max_age.as_secs()).saturating_add(leeway) < now {
                return Err(VerifyError::Expired);
            }
        }

        if let Some(max_age) = options.max_auth_age {
            let auth_time = numeric_claim(&payload.claims, "auth_time")
                .ok_or_else(|| VerifyError::claim("auth_time"))?;
            if auth_time.saturating_add(max_age.as_secs()).saturating_add(leeway) < now {
                return Err(VerifyError::claim("auth_time"));
            }
        }

        Ok(())
    }
}

fn unverified_claims(token: &str) -> Result<Map<String, Value>, VerifyError> {
    let segment = token
        .split('.')
        .nth(1)
        .ok_or_else(|| VerifyError::Malformed("missing payload segment".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| VerifyError::Malformed(format!("payload encoding: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| VerifyError::Malformed(format!("payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::VerifyErrorKind;
    use jsonwebtoken::{EncodingKey, encode};
    use serde_json::json;

    const FIXTURE_RSA_PRIVATE_PEM: &str = include_str!("../fixtures/test-keys/rsa-private.pem");
    const FIXTURE_WRONG_RSA_PRIVATE_PEM: &str =
        include_str!("../fixtures/test-keys/wrong-key-private.pem");
    const FIXTURE_JWKS_JSON: &str = include_str!("../fixtures/test-keys/jwks.json");
    const AUDIENCE: &str = "https://api.example.com";

    struct Fixture {
        _server: mockito::ServerGuard,
        issuer: Url,
        verifier: TokenVerifier,
        cache: MemoryCache,
    }

    async fn fixture() -> Fixture {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/.well-known/jwks.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(FIXTURE_JWKS_JSON)
            .create_async()
            .await;
        let issuer = Url::parse(&format!("{}/", server.url())).unwrap();
        let jwks = Arc::new(JwksCacheManager::new(reqwest::Client::new()));

        Fixture {
            _server: server,
            issuer,
            verifier: TokenVerifier::new(jwks),
            cache: MemoryCache::new(),
        }
    }

    fn sign_token_with_claims(claims: &Value, private_pem: &str, kid: &str) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        let key = EncodingKey::from_rsa_pem(private_pem.as_bytes()).expect("valid rsa private key");
        encode(&header, claims, &key).expect("token should be signed")
    }

    fn claims(issuer: &Url) -> Value {
        let now = now_secs();
        json!({
            "sub": "auth0|subject",
            "iss": issuer.as_str(),
            "aud": AUDIENCE,
            "iat": now,
            "exp": now + 300,
        })
    }

    async fn verify(fx: &Fixture, token: &str) -> Result<VerifiedTokenPayload, VerifyError> {
        let options = VerifyOptions::new(&fx.issuer, AUDIENCE);
        fx.verifier.verify(token, &options, &fx.cache).await
    }

    #[tokio::test]
    async fn valid_token_round_trips() {
        let fx = fixture().await;
        let mut claims = claims(&fx.issuer);
        claims["org_id"] = json!("org_123");
        let token = sign_token_with_claims(&claims, FIXTURE_RSA_PRIVATE_PEM, "test-key");

        let payload = verify(&fx, &token).await.unwrap();
        assert_eq!(payload.sub, "auth0|subject");
        assert_eq!(payload.aud, vec![AUDIENCE.to_string()]);
        assert_eq!(payload.iss, fx.issuer.as_str());
        assert_eq!(payload.org_id.as_deref(), Some("org_123"));
        assert!(!payload.is_sender_constrained());
    }

    #[tokio::test]
    async fn expired_wins_over_bad_signature() {
        let fx = fixture().await;
        let mut claims = claims(&fx.issuer);
        claims["exp"] = json!(now_secs() - 3600);

        let forged = sign_token_with_claims(&claims, FIXTURE_WRONG_RSA_PRIVATE_PEM, "test-key");
        assert_eq!(verify(&fx, &forged).await.unwrap_err().kind(), VerifyErrorKind::Expired);

        let genuine = sign_token_with_claims(&claims, FIXTURE_RSA_PRIVATE_PEM, "test-key");
        assert_eq!(verify(&fx, &genuine).await.unwrap_err().kind(), VerifyErrorKind::Expired);
    }

    #[tokio::test]
    async fn clock_skew_within_leeway_is_tolerated() {
        let fx = fixture().await;
        let mut claims = claims(&fx.issuer);
        claims["exp"] = json!(now_secs() - 2);
        let token = sign_token_with_claims(&claims, FIXTURE_RSA_PRIVATE_PEM, "test-key");
        assert!(verify(&fx, &token).await.is_ok());
    }

    #[tokio::test]
    async fn claim_mismatches_are_claim_invalid() {
        let fx = fixture().await;

        let mut wrong_aud = claims(&fx.issuer);
        wrong_aud["aud"] = json!("https://someone-else.example.com");
        let token = sign_token_with_claims(&wrong_aud, FIXTURE_RSA_PRIVATE_PEM, "test-key");
        let err = verify(&fx, &token).await.unwrap_err();
        assert!(matches!(err, VerifyError::ClaimInvalid { ref claim } if claim == "aud"));

        let mut wrong_iss = claims(&fx.issuer);
        wrong_iss["iss"] = json!("https://evil.example.com/");
        let token = sign_token_with_claims(&wrong_iss, FIXTURE_RSA_PRIVATE_PEM, "test-key");
        let err = verify(&fx, &token).await.unwrap_err();
        assert!(matches!(err, VerifyError::ClaimInvalid { ref claim } if claim == "iss"));

        let mut no_sub = claims(&fx.issuer);
        no_sub["sub"] = json!(12345);
        let token = sign_token_with_claims(&no_sub, FIXTURE_RSA_PRIVATE_PEM, "test-key");
        let err = verify(&fx, &token).await.unwrap_err();
        assert!(matches!(err, VerifyError::ClaimInvalid { ref claim } if claim == "sub"));
    }

    #[tokio::test]
    async fn wrong_key_is_signature_invalid() {
        let fx = fixture().await;
        let token =
            sign_token_with_claims(&claims(&fx.issuer), FIXTURE_WRONG_RSA_PRIVATE_PEM, "test-key");
        assert_eq!(
            verify(&fx, &token).await.unwrap_err().kind(),
            VerifyErrorKind::SignatureInvalid
        );
    }

    #[tokio::test]
    async fn unknown_kid_is_key_not_found_after_refresh() {
        let fx = fixture().await;
        let token =
            sign_token_with_claims(&claims(&fx.issuer), FIXTURE_RSA_PRIVATE_PEM, "missing-kid");
        let err = verify(&fx, &token).await.unwrap_err();
        assert!(matches!(err, VerifyError::KeyNotFound { kid: Some(ref k) } if k == "missing-kid"));
    }

    #[tokio::test]
    async fn symmetric_and_garbage_tokens_are_malformed() {
        let fx = fixture().await;
        let hs = encode(
            &Header::new(Algorithm::HS256),
            &claims(&fx.issuer),
            &EncodingKey::from_secret(b"shared"),
        )
        .unwrap();
        assert_eq!(verify(&fx, &hs).await.unwrap_err().kind(), VerifyErrorKind::Malformed);
        assert_eq!(
            verify(&fx, "not-a-token").await.unwrap_err().kind(),
            VerifyErrorKind::Malformed
        );
    }

    #[tokio::test]
    async fn tokens_from_the_future_are_rejected() {
        let fx = fixture().await;

        let mut immature = claims(&fx.issuer);
        immature["nbf"] = json!(now_secs() + 3600);
        let token = sign_token_with_claims(&immature, FIXTURE_RSA_PRIVATE_PEM, "test-key");
        let err = verify(&fx, &token).await.unwrap_err();
        assert!(matches!(err, VerifyError::ClaimInvalid { ref claim } if claim == "nbf"));

        let mut skewed = claims(&fx.issuer);
        skewed["nbf"] = json!(now_secs() + 2);
        let token = sign_token_with_claims(&skewed, FIXTURE_RSA_PRIVATE_PEM, "test-key");
        assert!(verify(&fx, &token).await.is_ok());

        let mut issued_later = claims(&fx.issuer);
        issued_later["iat"] = json!(now_secs() + 3600);
        let token = sign_token_with_claims(&issued_later, FIXTURE_RSA_PRIVATE_PEM, "test-key");
        let age = VerifyOptions::new(&fx.issuer, AUDIENCE).max_token_age(Duration::from_secs(600));
        let err = fx.verifier.verify(&token, &age, &fx.cache).await.unwrap_err();
        assert!(matches!(err, VerifyError::ClaimInvalid { ref claim } if claim == "iat"));
    }

    #[tokio::test]
    async fn subject_and_age_constraints() {
        let fx = fixture().await;
        let mut old = claims(&fx.issuer);
        old["iat"] = json!(now_secs() - 3600);
        old["auth_time"] = json!(now_secs() - 3600);
        let token = sign_token_with_claims(&old, FIXTURE_RSA_PRIVATE_PEM, "test-key");

        let subject = VerifyOptions::new(&fx.issuer, AUDIENCE).subject("auth0|other");
        let err = fx.verifier.verify(&token, &subject, &fx.cache).await.unwrap_err();
        assert!(matches!(err, VerifyError::ClaimInvalid { ref claim } if claim == "sub"));

        let age = VerifyOptions::new(&fx.issuer, AUDIENCE).max_token_age(Duration::from_secs(600));
        let err = fx.verifier.verify(&token, &age, &fx.cache).await.unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::Expired);

        let auth = VerifyOptions::new(&fx.issuer, AUDIENCE).max_auth_age(Duration::from_secs(60));
        let err = fx.verifier.verify(&token, &auth, &fx.cache).await.unwrap_err();
        assert!(matches!(err, VerifyError::ClaimInvalid { ref claim } if claim == "auth_time"));
    }
}
