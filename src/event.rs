//! Per-invocation snapshot handed over by the identity platform.
//!
//! Field names follow the host's JSON so an event can be deserialized as-is.
//! Nothing in here is mutated once the handler starts.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthenticationEvent {
    pub user: Option<User>,
    pub client: Client,
    pub session: Option<Session>,
    pub transaction: Option<Transaction>,
    pub authentication: Option<Authentication>,
    pub resource_server: Option<ResourceServer>,
    pub organization: Option<Organization>,
    pub request: Request,
    pub secrets: Secrets,
    pub configuration: BTreeMap<String, String>,
}

impl AuthenticationEvent {
    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.id.as_deref())
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.request
            .query
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn organization_id(&self) -> Option<&str> {
        self.organization.as_ref().map(|o| o.id.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct User {
    pub user_id: String,
    pub email: Option<String>,
    /// Absent when the connection does not report verification.
    pub email_verified: Option<bool>,
    #[serde(alias = "enrolledFactors")]
    pub enrolled_factors: Vec<EnrolledFactor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnrolledFactor {
    #[serde(alias = "type")]
    pub method: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Client {
    pub client_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Session {
    pub id: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Transaction {
    pub protocol: Option<String>,
    pub requested_scopes: RequestedScopes,
    pub response_type: Option<Vec<String>>,
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
    pub locale: Option<String>,
    pub subject_token: Option<String>,
    pub subject_token_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Authentication {
    pub methods: Vec<AuthenticationMethod>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthenticationMethod {
    pub name: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourceServer {
    pub identifier: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Organization {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Request {
    pub hostname: String,
    pub ip: Option<String>,
    pub query: BTreeMap<String, String>,
}

/// Scopes as requested by the caller. The host sends either a space separated
/// string or an array; both end up as a list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "ScopeInput")]
pub struct RequestedScopes(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum ScopeInput {
    Delimited(String),
    List(Vec<String>),
}

impl From<ScopeInput> for RequestedScopes {
    fn from(input: ScopeInput) -> Self {
        match input {
            ScopeInput::Delimited(value) => Self::from_delimited(&value),
            ScopeInput::List(items) => Self(items),
        }
    }
}

impl RequestedScopes {
    pub fn from_delimited(value: &str) -> Self {
        Self(value.split_whitespace().map(str::to_string).collect())
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.iter().any(|s| s == scope)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl<S: Into<String>> FromIterator<S> for RequestedScopes {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Tenant secrets. Values never show up in `Debug` output.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Secrets(BTreeMap<String, String>);

impl Secrets {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "[redacted]")))
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Secrets {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// The hook point an event arrived on. Each kind is routed to its own flow.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "trigger", content = "event", rename_all = "snake_case")]
pub enum Trigger {
    PostLogin(AuthenticationEvent),
    ContinuePostLogin(AuthenticationEvent),
    CustomTokenExchange(AuthenticationEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scopes_accept_string_or_array() {
        let tx: Transaction =
            serde_json::from_value(json!({"requested_scopes": "openid  read:data"})).unwrap();
        assert_eq!(tx.requested_scopes.as_slice(), ["openid", "read:data"]);

        let tx: Transaction =
            serde_json::from_value(json!({"requested_scopes": ["openid", "link_account"]}))
                .unwrap();
        assert!(tx.requested_scopes.contains("link_account"));
        assert!(!tx.requested_scopes.contains("link"));
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let secrets: Secrets = [("ACTION_SECRET", "super-secret-value")].into_iter().collect();
        let rendered = format!("{secrets:?}");
        assert!(rendered.contains("ACTION_SECRET"));
        assert!(!rendered.contains("super-secret-value"));
    }

    #[test]
    fn trigger_is_tagged_by_kind() {
        let trigger: Trigger = serde_json::from_value(json!({
            "trigger": "custom_token_exchange",
            "event": {
                "client": {"client_id": "cli"},
                "request": {"hostname": "tenant.example.com"},
                "user": {"user_id": "auth0|1", "enrolledFactors": [{"type": "otp"}]}
            }
        }))
        .unwrap();

        match trigger {
            Trigger::CustomTokenExchange(event) => {
                assert_eq!(event.client.client_id, "cli");
                let user = event.user().unwrap();
                assert_eq!(user.enrolled_factors[0].method, "otp");
            }
            other => panic!("unexpected trigger {other:?}"),
        }
    }
}
