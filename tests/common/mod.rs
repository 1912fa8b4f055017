#![allow(dead_code)]

use identity_actions::cache::{CacheExpiry, CacheRecord, MemoryCache, PlatformCache};
use identity_actions::error::CacheError;
use identity_actions::event::{AuthenticationEvent, RequestedScopes, Secrets, Session, Transaction, User};
use identity_actions::runtime::ActionRuntime;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use mockito::{Mock, ServerGuard};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const RSA_PRIVATE_PEM: &str = include_str!("../../fixtures/test-keys/rsa-private.pem");
pub const WRONG_RSA_PRIVATE_PEM: &str = include_str!("../../fixtures/test-keys/wrong-key-private.pem");
pub const JWKS_JSON: &str = include_str!("../../fixtures/test-keys/jwks.json");
pub const JWKS_ROTATED_OUT_JSON: &str = include_str!("../../fixtures/test-keys/jwks-rotated-out.json");
pub const KID: &str = "test-key";

pub const APP_CLIENT_ID: &str = "app-client";
pub const SERVICE_CLIENT_ID: &str = "svc-client";
pub const SERVICE_CLIENT_SECRET: &str = "svc-secret";
pub const ACTION_SECRET: &str = "transaction-binding-secret";
pub const PRIMARY_USER_ID: &str = "auth0|primary";

/// A mock tenant: discovery, keys and token endpoint all live on one server.
pub struct Tenant {
    pub server: ServerGuard,
    pub host: String,
    pub issuer: String,
    pub runtime: ActionRuntime,
    pub cache: MemoryCache,
}

impl Tenant {
    pub async fn start() -> Self {
        let server = mockito::Server::new_async().await;
        let host = server.host_with_port();
        let issuer = format!("http://{host}/");
        Self {
            server,
            host,
            issuer,
            runtime: ActionRuntime::with_client(reqwest::Client::new()).with_issuer_scheme("http"),
            cache: MemoryCache::new(),
        }
    }

    pub async fn mock_discovery(&mut self) -> Mock {
        let base = self.issuer.trim_end_matches('/').to_string();
        self.server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "issuer": self.issuer,
                    "authorization_endpoint": format!("{base}/authorize"),
                    "token_endpoint": format!("{base}/oauth/token"),
                    "jwks_uri": format!("{base}/.well-known/jwks.json"),
                })
                .to_string(),
            )
            .create_async()
            .await
    }

    pub async fn mock_jwks(&mut self, body: &str) -> Mock {
        self.server
            .mock("GET", "/.well-known/jwks.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }
}

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs()
}

pub fn sign(claims: &Value, private_pem: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    let key = EncodingKey::from_rsa_pem(private_pem.as_bytes()).expect("valid rsa private key");
    encode(&header, claims, &key).expect("token should be signed")
}

/// A post-login event asking to link an account.
pub fn link_event(tenant: &Tenant) -> AuthenticationEvent {
    let mut event = AuthenticationEvent {
        user: Some(User {
            user_id: PRIMARY_USER_ID.to_string(),
            email: Some("jane@example.com".to_string()),
            email_verified: Some(true),
            ..Default::default()
        }),
        session: Some(Session {
            id: Some("session-1".to_string()),
            created_at: None,
        }),
        transaction: Some(Transaction {
            protocol: Some("oidc-basic-profile".to_string()),
            requested_scopes: RequestedScopes::from_delimited("openid profile link_account"),
            response_type: Some(vec!["code".to_string()]),
            redirect_uri: Some("https://app.example.com/callback".to_string()),
            state: Some("app-state".to_string()),
            locale: Some("en".to_string()),
            ..Default::default()
        }),
        secrets: [
            ("AUTH0_CLIENT_ID", SERVICE_CLIENT_ID),
            ("AUTH0_CLIENT_SECRET", SERVICE_CLIENT_SECRET),
            ("ACTION_SECRET", ACTION_SECRET),
        ]
        .into_iter()
        .collect::<Secrets>(),
        ..Default::default()
    };
    event.client.client_id = APP_CLIENT_ID.to_string();
    event.request.hostname = tenant.host.clone();
    event.request.ip = Some("203.0.113.7".to_string());
    event
}

pub fn exchange_secrets() -> Vec<(&'static str, &'static str)> {
    vec![
        ("SUBJECT_TOKEN_AUDIENCE", "https://api.example.com"),
        ("ALLOWED_CLIENT_IDS", r#"["exchange-client"]"#),
        ("ALLOWED_TARGET_AUDIENCES", r#"["https://downstream.example.com"]"#),
        ("ALLOWED_SCOPES", r#"["openid","read:data"]"#),
    ]
}

pub fn subject_claims(tenant: &Tenant) -> Value {
    let now = now();
    json!({
        "sub": "auth0|subject",
        "iss": tenant.issuer,
        "aud": "https://api.example.com",
        "iat": now,
        "exp": now + 300,
    })
}

/// A platform cache whose every call fails.
#[derive(Default)]
pub struct BrokenCache {
    pub calls: AtomicUsize,
}

impl PlatformCache for BrokenCache {
    fn get(&self, _key: &str) -> Result<Option<CacheRecord>, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Unavailable("connection reset".to_string()))
    }

    fn set(&self, _key: &str, _value: &str, _expiry: CacheExpiry) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Unavailable("connection reset".to_string()))
    }
}
