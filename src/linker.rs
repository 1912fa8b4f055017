use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::cache::{CacheExpiry, PlatformCache, safe_get, safe_set};
use crate::error::ActionError;
use crate::oidc::{self, ClientAuth, ProviderMetadata};

pub const MANAGEMENT_TOKEN_CACHE_KEY: &str = "management-token";
/// Cached tokens expire this long before the issuer says they do.
const TOKEN_SAFETY_MARGIN_SECS: u64 = 60;
const LOG_TARGET: &str = "account_linking";

/// `provider|user_id` split on the first separator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecondaryIdentity {
    pub provider: String,
    pub user_id: String,
}

impl FromStr for SecondaryIdentity {
    type Err = ActionError;

    fn from_str(subject: &str) -> Result<Self, Self::Err> {
        match subject.split_once('|') {
            Some((provider, user_id)) if !provider.is_empty() && !user_id.is_empty() => Ok(Self {
                provider: provider.to_string(),
                user_id: user_id.to_string(),
            }),
            _ => Err(ActionError::Provider(format!(
                "subject '{subject}' is not a provider-qualified identity"
            ))),
        }
    }
}

/// Management API client for the tenant's identity store.
pub struct ManagementClient<'a> {
    http: &'a reqwest::Client,
    api_base: Url,
    token: String,
}

impl<'a> ManagementClient<'a> {
    pub fn new(http: &'a reqwest::Client, api_base: Url, token: String) -> Self {
        Self {
            http,
            api_base,
            token,
        }
    }

    /// Reuses the cached client-credentials token or requests a new one.
    pub async fn connect(
        http: &'a reqwest::Client,
        cache: &dyn PlatformCache,
        metadata: &ProviderMetadata,
        client: &ClientAuth<'_>,
        tenant_base: &Url,
        audience: &str,
    ) -> Result<Self, ActionError> {
        let api_base = tenant_base.join("api/v2/")?;

        if let Some(record) = safe_get(cache, MANAGEMENT_TOKEN_CACHE_KEY) {
            return Ok(Self::new(http, api_base, record.value));
        }

        tracing::debug!(target: LOG_TARGET, "requesting management api token");
        let tokens = oidc::client_credentials_grant(http, metadata, client, audience).await?;
        let token = tokens
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ActionError::Provider("no access token returned for management api".to_string())
            })?;

        match tokens.expires_in {
            Some(expires_in) if expires_in > TOKEN_SAFETY_MARGIN_SECS => safe_set(
                cache,
                MANAGEMENT_TOKEN_CACHE_KEY,
                &token,
                CacheExpiry::Ttl(Duration::from_secs(expires_in - TOKEN_SAFETY_MARGIN_SECS)),
            ),
            _ => tracing::debug!(target: LOG_TARGET, "management token too short-lived to cache"),
        }

        Ok(Self::new(http, api_base, token))
    }

    /// Attaches `secondary` to `primary_user_id`. The store applies it as one
    /// operation, so a failure leaves nothing to undo.
    pub async fn link(
        &self,
        primary_user_id: &str,
        secondary: &SecondaryIdentity,
    ) -> Result<(), ActionError> {
        let url = self
            .api_base
            .join(&format!("users/{}/identities", encode_segment(primary_user_id)))?;

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(secondary)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ActionError::Provider(format!(
                "link identities returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// User ids carry `|`, which must be escaped inside a path segment.
fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
