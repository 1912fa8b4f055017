//! The slice of an OpenID relying party the linking flow needs: discovery,
//! the authorization request, and the token endpoint grants.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

use crate::binder::DerivedVerifier;
use crate::error::ActionError;

const DISCOVERY_PATH: &str = ".well-known/openid-configuration";

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
}

pub async fn discover(
    http: &reqwest::Client,
    issuer: &Url,
) -> Result<ProviderMetadata, ActionError> {
    let url = issuer.join(DISCOVERY_PATH)?;
    let response = http.get(url).send().await?.error_for_status()?;
    let metadata: ProviderMetadata = response.json().await?;

    if metadata.issuer.trim().is_empty()
        || metadata.authorization_endpoint.trim().is_empty()
        || metadata.token_endpoint.trim().is_empty()
        || metadata.jwks_uri.trim().is_empty()
    {
        return Err(ActionError::Provider(
            "discovery document is missing mandatory fields".to_string(),
        ));
    }

    Ok(metadata)
}

/// Client authentication for token endpoint calls (`client_secret_post`).
pub struct ClientAuth<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a SecretString,
}

#[derive(Debug, Clone)]
pub struct AuthorizationRequest<'a> {
    pub redirect_uri: &'a str,
    pub code_challenge: String,
    pub connection: Option<&'a str>,
    pub connection_scope: Option<&'a str>,
    pub scope: &'a str,
    pub max_age: Option<&'a str>,
}

/// Authorization code request with an S256 PKCE challenge.
pub fn authorization_url(
    metadata: &ProviderMetadata,
    client_id: &str,
    request: &AuthorizationRequest<'_>,
) -> Result<Url, ActionError> {
    let mut url = Url::parse(&metadata.authorization_endpoint)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", request.redirect_uri)
            .append_pair("code_challenge", &request.code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("scope", request.scope);
        if let Some(connection) = request.connection {
            query.append_pair("connection", connection);
        }
        if let Some(max_age) = request.max_age {
            query.append_pair("max_age", max_age);
        }
        if let Some(connection_scope) = request.connection_scope {
            query.append_pair("connection_scope", connection_scope);
        }
    }
    Ok(url)
}

/// Pulls the authorization code out of the callback parameters. Provider
/// errors are kept for the server log only.
pub fn callback_code(query: &BTreeMap<String, String>) -> Result<&str, ActionError> {
    if let Some(error) = query.get("error") {
        return Err(ActionError::Provider(format!(
            "authorization failed: {error} {}",
            query.get("error_description").map_or("", String::as_str)
        )));
    }

    query
        .get("code")
        .map(String::as_str)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ActionError::Provider("callback is missing the authorization code".to_string()))
}

#[derive(Clone, Default, Deserialize)]
pub struct TokenSet {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &self.access_token.as_ref().map(|_| "[redacted]"))
            .field("id_token", &self.id_token.as_ref().map(|_| "[redacted]"))
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}

pub async fn authorization_code_grant(
    http: &reqwest::Client,
    metadata: &ProviderMetadata,
    client: &ClientAuth<'_>,
    code: &str,
    redirect_uri: &str,
    verifier: &DerivedVerifier,
) -> Result<TokenSet, ActionError> {
    let tokens = token_request(
        http,
        metadata,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", verifier.as_str()),
            ("client_id", client.client_id),
            ("client_secret", client.client_secret.expose_secret()),
        ],
    )
    .await?;

    if tokens.id_token.is_none() {
        return Err(ActionError::Provider(
            "token response missing id_token".to_string(),
        ));
    }
    Ok(tokens)
}

pub async fn client_credentials_grant(
    http: &reqwest::Client,
    metadata: &ProviderMetadata,
    client: &ClientAuth<'_>,
    audience: &str,
) -> Result<TokenSet, ActionError> {
    token_request(
        http,
        metadata,
        &[
            ("grant_type", "client_credentials"),
            ("audience", audience),
            ("client_id", client.client_id),
            ("client_secret", client.client_secret.expose_secret()),
        ],
    )
    .await
}

async fn token_request(
    http: &reqwest::Client,
    metadata: &ProviderMetadata,
    form: &[(&str, &str)],
) -> Result<TokenSet, ActionError> {
    let response = http.post(&metadata.token_endpoint).form(form).send().await?;

    if !response.status().is_success() {
        return Err(ActionError::Provider(format!(
            "token endpoint returned {}",
            response.status()
        )));
    }

    Ok(response.json().await?)
}
