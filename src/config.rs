//! Per-invocation option sets, rebuilt from the event's secrets and
//! configuration maps on every call.

use secrecy::SecretString;
use std::collections::HashSet;

use crate::error::ConfigError;
use crate::event::AuthenticationEvent;
use crate::helpers::{is_yes, split_list};

const DEFAULT_LINKING_DEBUG: &str = "account-linking:error";
const EXCHANGE_BASE_DEBUG: &str = "token-exchange:error";

/// Non-empty setting, configuration first, then secrets.
fn configured<'a>(event: &'a AuthenticationEvent, key: &str) -> Option<&'a str> {
    event
        .configuration
        .get(key)
        .map(String::as_str)
        .or_else(|| event.secrets.get(key))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Non-empty setting, secrets first, then configuration.
fn secret<'a>(event: &'a AuthenticationEvent, key: &str) -> Option<&'a str> {
    event
        .secrets
        .get(key)
        .or_else(|| event.configuration.get(key).map(String::as_str))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn require_secret(event: &AuthenticationEvent, key: &'static str) -> Result<String, ConfigError> {
    secret(event, key)
        .map(str::to_string)
        .ok_or(ConfigError::Missing(key))
}

fn parse_string_array(value: &str, name: &'static str) -> Result<Vec<String>, ConfigError> {
    let parsed: serde_json::Value =
        serde_json::from_str(value).map_err(|source| ConfigError::NotJson { name, source })?;

    let items = parsed
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or(ConfigError::NotStringArray(name))?;

    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or(ConfigError::NotStringArray(name))
        })
        .collect()
}

fn require_array(
    event: &AuthenticationEvent,
    key: &'static str,
) -> Result<HashSet<String>, ConfigError> {
    let raw = secret(event, key).ok_or(ConfigError::Missing(key))?;
    Ok(parse_string_array(raw, key)?.into_iter().collect())
}

/// Which clients may start linking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAllowList {
    Any,
    Only(Vec<String>),
    /// The setting was present but would not parse. No client is allowed.
    Invalid(String),
}

impl ClientAllowList {
    fn from_setting(raw: Option<&str>) -> Self {
        match raw {
            None => Self::Any,
            Some(raw) if raw.starts_with('[') => {
                match parse_string_array(raw, "ALLOWED_CLIENT_IDS") {
                    Ok(ids) => Self::Only(ids),
                    Err(err) => Self::Invalid(err.to_string()),
                }
            }
            Some(raw) => Self::Only(split_list(raw)),
        }
    }
}

/// Options shaping the account-linking flow. Building these never fails, so
/// logins unrelated to linking are never blocked by a bad setting.
#[derive(Debug, Clone)]
pub struct LinkingOptions {
    pub debug: String,
    pub enforce_mfa: bool,
    pub enforce_email_verification: bool,
    pub pin_ip_address: bool,
    pub require_id_token_hint: bool,
    pub allowed_client_ids: ClientAllowList,
    pub service_client_id: Option<String>,
}

impl LinkingOptions {
    pub fn from_event(event: &AuthenticationEvent) -> Self {
        Self {
            debug: configured(event, "DEBUG")
                .unwrap_or(DEFAULT_LINKING_DEBUG)
                .to_string(),
            enforce_mfa: configured(event, "ENFORCE_MFA").is_some_and(is_yes),
            enforce_email_verification: configured(event, "ENFORCE_EMAIL_VERIFICATION")
                .is_some_and(is_yes),
            pin_ip_address: configured(event, "PIN_IP_ADDRESS").is_some_and(is_yes),
            require_id_token_hint: configured(event, "REQUIRE_ID_TOKEN_HINT")
                .is_none_or(|v| !v.eq_ignore_ascii_case("no")),
            allowed_client_ids: ClientAllowList::from_setting(configured(
                event,
                "ALLOWED_CLIENT_IDS",
            )),
            service_client_id: secret(event, "AUTH0_CLIENT_ID").map(str::to_string),
        }
    }

    pub fn client_allowed(&self, client_id: &str) -> bool {
        match &self.allowed_client_ids {
            ClientAllowList::Any => true,
            ClientAllowList::Only(ids) => ids.iter().any(|id| id == client_id),
            ClientAllowList::Invalid(_) => false,
        }
    }
}

/// Credentials the linking flow needs once a link request is confirmed.
pub struct LinkingCredentials {
    pub client_id: String,
    pub client_secret: SecretString,
    pub action_secret: SecretString,
    pub domain: String,
}

impl LinkingCredentials {
    pub fn from_event(event: &AuthenticationEvent) -> Result<Self, ConfigError> {
        let domain = secret(event, "AUTH0_DOMAIN")
            .map(str::to_string)
            .or_else(|| {
                let host = event.request.hostname.trim();
                (!host.is_empty()).then(|| host.to_string())
            })
            .ok_or(ConfigError::Missing("AUTH0_DOMAIN"))?;

        Ok(Self {
            client_id: require_secret(event, "AUTH0_CLIENT_ID")?,
            client_secret: SecretString::from(require_secret(event, "AUTH0_CLIENT_SECRET")?),
            action_secret: SecretString::from(require_secret(event, "ACTION_SECRET")?),
            domain,
        })
    }
}

impl std::fmt::Debug for LinkingCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkingCredentials")
            .field("client_id", &self.client_id)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Where the scope allow-list runs relative to signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeCheck {
    #[default]
    BeforeVerify,
    AfterVerify,
}

/// How an `org_id` claim on a subject token is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrganizationPolicy {
    #[default]
    Reject,
    MatchRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExchangeProfile {
    pub scope_check: ScopeCheck,
    pub organization_policy: OrganizationPolicy,
    pub provision_connection: Option<String>,
}

impl ExchangeProfile {
    fn from_event(event: &AuthenticationEvent) -> Result<Self, ConfigError> {
        let scope_check = match configured(event, "SCOPE_CHECK") {
            None | Some("before_verify") => ScopeCheck::BeforeVerify,
            Some("after_verify") => ScopeCheck::AfterVerify,
            Some(other) => {
                return Err(ConfigError::Unsupported {
                    name: "SCOPE_CHECK",
                    value: other.to_string(),
                });
            }
        };

        let organization_policy = match configured(event, "ORGANIZATION_POLICY") {
            None | Some("reject") => OrganizationPolicy::Reject,
            Some("match") => OrganizationPolicy::MatchRequest,
            Some(other) => {
                return Err(ConfigError::Unsupported {
                    name: "ORGANIZATION_POLICY",
                    value: other.to_string(),
                });
            }
        };

        Ok(Self {
            scope_check,
            organization_policy,
            provision_connection: configured(event, "PROVISION_CONNECTION").map(str::to_string),
        })
    }
}

/// Validated token-exchange settings.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub subject_token_audience: String,
    pub allowed_clients: HashSet<String>,
    pub allowed_audiences: HashSet<String>,
    pub allowed_scopes: HashSet<String>,
    pub subject_token_type: Option<String>,
    pub profile: ExchangeProfile,
}

impl ExchangeConfig {
    pub fn from_event(event: &AuthenticationEvent) -> Result<Self, ConfigError> {
        Ok(Self {
            subject_token_audience: require_secret(event, "SUBJECT_TOKEN_AUDIENCE")?,
            allowed_clients: require_array(event, "ALLOWED_CLIENT_IDS")?,
            allowed_audiences: require_array(event, "ALLOWED_TARGET_AUDIENCES")?,
            allowed_scopes: require_array(event, "ALLOWED_SCOPES")?,
            subject_token_type: secret(event, "SUBJECT_TOKEN_TYPE").map(str::to_string),
            profile: ExchangeProfile::from_event(event)?,
        })
    }
}

/// Exchange logging always keeps errors on, extra namespaces are appended.
/// Read before the rest of the configuration so load failures are logged.
pub(crate) fn exchange_debug(event: &AuthenticationEvent) -> String {
    match secret(event, "DEBUG") {
        Some(extra) => format!("{EXCHANGE_BASE_DEBUG},{extra}"),
        None => EXCHANGE_BASE_DEBUG.to_string(),
    }
}
