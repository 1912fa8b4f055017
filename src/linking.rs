//! Account-linking orchestration for the post-login hooks.
//!
//! Linking takes two invocations. The first one redirects the user to the
//! tenant's authorization endpoint with a PKCE challenge derived from the
//! transaction. The second one is entered when the platform sends the user
//! back, re-derives the verifier, redeems the code and links the identity.
//! Nothing is kept between the two calls.

use std::time::Duration;
use url::Url;

use crate::binder::derive_verifier;
use crate::cache::PlatformCache;
use crate::config::{ClientAllowList, LinkingCredentials, LinkingOptions};
use crate::directive::{EffectDirective, FactorChallenge};
use crate::error::ActionError;
use crate::event::{AuthenticationEvent, User};
use crate::linker::{ManagementClient, SecondaryIdentity};
use crate::oidc::{self, AuthorizationRequest, ClientAuth, ProviderMetadata};
use crate::policy;
use crate::runtime::ActionRuntime;
use crate::verifier::{ID_TOKEN_ALGORITHMS, VerifyOptions};

pub const LINK_ACCOUNT_SCOPE: &str = "link_account";
pub const LINKING_PROTOCOLS: &[&str] = &[
    "oidc-basic-profile",
    "oidc-implicit-profile",
    "oauth2-device-code",
    "oidc-hybrid-profile",
];

const ID_TOKEN_HINT_MAX_AGE: Duration = Duration::from_secs(600);
const LINKED_ID_TOKEN_MAX_AUTH_AGE: Duration = Duration::from_secs(60);
const BASELINE_SCOPE: &str = "openid profile email";
const RESUME_PATH: &str = "continue";

pub(crate) const START_FAILED: &str = "Unexpected Error trying to start account linking";
pub(crate) const COMPLETE_FAILED: &str = "Failed to complete account linking";
const ID_TOKEN_HINT_INVALID: &str =
    "ID_TOKEN_HINT Invalid: The `id_token_hint` does not conform to the authorization policy";
const MANAGEMENT_FAILED: &str = "Failed to link users";
const LINK_FAILED: &str = "error linking";

const LOG_TARGET: &str = "account_linking";

/// A link request asks for the `link_account` scope over an interactive
/// protocol, from a client the tenant allows to link.
pub fn is_link_request(event: &AuthenticationEvent, options: &LinkingOptions) -> bool {
    let Some(tx) = event.transaction.as_ref() else {
        return false;
    };

    let wants_link = tx.requested_scopes.contains(LINK_ACCOUNT_SCOPE)
        && tx
            .protocol
            .as_deref()
            .is_some_and(|p| LINKING_PROTOCOLS.contains(&p));
    if !wants_link {
        return false;
    }

    if let ClientAllowList::Invalid(err) = &options.allowed_client_ids {
        tracing::error!(target: LOG_TARGET, error = %err, "ignoring link request, client allow-list is invalid");
    }
    options.client_allowed(&event.client.client_id)
}

/// First post-login call: starts linking for link requests, otherwise
/// enforces step-up on nested transactions.
pub async fn on_execute_post_login(
    runtime: &ActionRuntime,
    event: &AuthenticationEvent,
    cache: &dyn PlatformCache,
) -> EffectDirective {
    let options = LinkingOptions::from_event(event);
    runtime.apply_debug(&options.debug);

    if !is_link_request(event, &options) {
        return nested_transaction(event, &options);
    }

    match initiate(runtime, event, cache, &options).await {
        Ok(directive) => directive,
        Err(err) => {
            tracing::error!(target: LOG_TARGET, error = %err, "failed to start account linking");
            EffectDirective::deny_access(START_FAILED)
        }
    }
}

/// Second post-login call, after the user authenticated the identity to link.
pub async fn on_continue_post_login(
    runtime: &ActionRuntime,
    event: &AuthenticationEvent,
    cache: &dyn PlatformCache,
) -> EffectDirective {
    let options = LinkingOptions::from_event(event);
    runtime.apply_debug(&options.debug);

    if !is_link_request(event, &options) {
        return EffectDirective::Continue;
    }

    let resumed = match resume(runtime, event, cache, &options).await {
        Ok(resumed) => resumed,
        Err(err) => {
            tracing::warn!(target: LOG_TARGET, error = %err, "failed to complete account linking");
            return EffectDirective::deny_access(COMPLETE_FAILED);
        }
    };

    if resumed.subject == resumed.primary_user_id {
        tracing::info!(target: LOG_TARGET, "identity is already the primary account");
        return EffectDirective::Continue;
    }

    link_accounts(runtime, cache, &resumed).await
}

/// Step-up for transactions run by the linking service client itself, so a
/// second factor also binds the embedded login.
fn nested_transaction(event: &AuthenticationEvent, options: &LinkingOptions) -> EffectDirective {
    let is_nested = options
        .service_client_id
        .as_deref()
        .is_some_and(|id| id == event.client.client_id);
    if !is_nested || !options.enforce_mfa {
        return EffectDirective::Continue;
    }

    let factors = event
        .user()
        .map(|user| user.enrolled_factors.as_slice())
        .unwrap_or_default();
    if factors.is_empty() {
        return EffectDirective::Continue;
    }

    tracing::debug!(target: LOG_TARGET, factors = factors.len(), "challenging nested transaction");
    EffectDirective::ChallengeWithAny {
        factors: factors
            .iter()
            .map(|factor| FactorChallenge::for_enrolled_method(&factor.method))
            .collect(),
    }
}

async fn initiate(
    runtime: &ActionRuntime,
    event: &AuthenticationEvent,
    cache: &dyn PlatformCache,
    options: &LinkingOptions,
) -> Result<EffectDirective, ActionError> {
    let user = event.user().ok_or(ActionError::MissingEventField("user"))?;
    let credentials = LinkingCredentials::from_event(event)?;
    let issuer = runtime.issuer_for(event)?;

    if !id_token_hint_accepted(runtime, event, cache, options, user, &issuer).await {
        return Ok(EffectDirective::deny_access(ID_TOKEN_HINT_INVALID));
    }

    if options.enforce_mfa
        && let Err(violation) = policy::check_mfa_completed(event, user)
    {
        tracing::info!(target: LOG_TARGET, %violation, "linking refused");
        return Ok(violation.directive());
    }
    if options.enforce_email_verification
        && let Err(violation) = policy::check_email_verified(user)
    {
        tracing::info!(target: LOG_TARGET, %violation, "linking refused");
        return Ok(violation.directive());
    }

    let verifier = derive_verifier(event, &credentials.action_secret, options.pin_ip_address)?;
    let metadata = oidc::discover(runtime.http(), &issuer).await?;
    let redirect_uri = issuer.join(RESUME_PATH)?;

    let request = AuthorizationRequest {
        redirect_uri: redirect_uri.as_str(),
        code_challenge: verifier.code_challenge(),
        connection: event.query("requested_connection"),
        connection_scope: event.query("requested_connection_scope"),
        scope: BASELINE_SCOPE,
        max_age: Some("0"),
    };
    let url = oidc::authorization_url(&metadata, &credentials.client_id, &request)?;

    tracing::info!(
        target: LOG_TARGET,
        user_id = %user.user_id,
        connection = ?request.connection,
        "redirecting to start account linking"
    );
    Ok(EffectDirective::Redirect { url: url.into() })
}

async fn id_token_hint_accepted(
    runtime: &ActionRuntime,
    event: &AuthenticationEvent,
    cache: &dyn PlatformCache,
    options: &LinkingOptions,
    user: &User,
    issuer: &Url,
) -> bool {
    let Some(hint) = event.query("id_token_hint") else {
        if options.require_id_token_hint {
            tracing::warn!(target: LOG_TARGET, "id_token_hint is required but missing");
            return false;
        }
        return true;
    };

    let verify = VerifyOptions::new(issuer, &event.client.client_id)
        .algorithms(ID_TOKEN_ALGORITHMS)
        .subject(&user.user_id)
        .max_token_age(ID_TOKEN_HINT_MAX_AGE);

    match runtime.verifier().verify(hint, &verify, cache).await {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(target: LOG_TARGET, kind = ?err.kind(), error = %err, "id_token_hint rejected");
            false
        }
    }
}

struct Resumed {
    issuer: Url,
    primary_user_id: String,
    subject: String,
    credentials: LinkingCredentials,
    metadata: ProviderMetadata,
}

async fn resume(
    runtime: &ActionRuntime,
    event: &AuthenticationEvent,
    cache: &dyn PlatformCache,
    options: &LinkingOptions,
) -> Result<Resumed, ActionError> {
    let user = event.user().ok_or(ActionError::MissingEventField("user"))?;
    let credentials = LinkingCredentials::from_event(event)?;
    let issuer = runtime.issuer_for(event)?;

    let verifier = derive_verifier(event, &credentials.action_secret, options.pin_ip_address)?;
    let metadata = oidc::discover(runtime.http(), &issuer).await?;
    let code = oidc::callback_code(&event.request.query)?;
    let redirect_uri = issuer.join(RESUME_PATH)?;

    let client = ClientAuth {
        client_id: &credentials.client_id,
        client_secret: &credentials.client_secret,
    };
    let tokens = oidc::authorization_code_grant(
        runtime.http(),
        &metadata,
        &client,
        code,
        redirect_uri.as_str(),
        &verifier,
    )
    .await?;
    let id_token = tokens
        .id_token
        .as_deref()
        .ok_or_else(|| ActionError::Provider("token response missing id_token".to_string()))?;

    let token_issuer = Url::parse(&metadata.issuer)?;
    let verify = VerifyOptions::new(&token_issuer, &credentials.client_id)
        .algorithms(ID_TOKEN_ALGORITHMS)
        .max_auth_age(LINKED_ID_TOKEN_MAX_AUTH_AGE);
    let payload = runtime.verifier().verify(id_token, &verify, cache).await?;

    Ok(Resumed {
        issuer,
        primary_user_id: user.user_id.clone(),
        subject: payload.sub,
        credentials,
        metadata,
    })
}

async fn link_accounts(
    runtime: &ActionRuntime,
    cache: &dyn PlatformCache,
    resumed: &Resumed,
) -> EffectDirective {
    let secondary: SecondaryIdentity = match resumed.subject.parse() {
        Ok(secondary) => secondary,
        Err(err) => {
            tracing::error!(target: LOG_TARGET, error = %err, "cannot link identity");
            return EffectDirective::deny_access(LINK_FAILED);
        }
    };

    let credentials = &resumed.credentials;
    let client = ClientAuth {
        client_id: &credentials.client_id,
        client_secret: &credentials.client_secret,
    };
    let audience = format!("https://{}/api/v2/", credentials.domain);

    let management = ManagementClient::connect(
        runtime.http(),
        cache,
        &resumed.metadata,
        &client,
        &resumed.issuer,
        &audience,
    )
    .await;
    let management = match management {
        Ok(management) => management,
        Err(err) => {
            tracing::error!(target: LOG_TARGET, error = %err, "management api unavailable");
            return EffectDirective::deny_access(MANAGEMENT_FAILED);
        }
    };

    match management.link(&resumed.primary_user_id, &secondary).await {
        Ok(()) => {
            tracing::info!(
                target: LOG_TARGET,
                provider = %secondary.provider,
                "linked identity to primary account"
            );
            EffectDirective::Continue
        }
        Err(err) => {
            tracing::error!(target: LOG_TARGET, error = %err, "linking identities failed");
            EffectDirective::deny_access(LINK_FAILED)
        }
    }
}
