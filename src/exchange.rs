//! Custom token exchange: trade a subject token issued by this tenant for a
//! token aimed at an allow-listed downstream audience.
//!
//! Cheap allow-list checks run before any key material is fetched. The first
//! failing check decides the outcome.

use serde_json::{Map, Value};

use crate::cache::PlatformCache;
use crate::config::{ExchangeConfig, ScopeCheck, exchange_debug};
use crate::directive::{EffectDirective, UserProvisioning};
use crate::error::{ActionError, VerifyError};
use crate::event::{AuthenticationEvent, Transaction};
use crate::policy::{self, PolicyViolation};
use crate::runtime::ActionRuntime;
use crate::verifier::{VerifiedTokenPayload, VerifyOptions};

pub(crate) const EXCHANGE_FAILED: &str = "Token exchange failed";

/// Claims copied onto a provisioned user when present on the subject token.
const PROFILE_CLAIMS: &[&str] = &[
    "email",
    "email_verified",
    "name",
    "given_name",
    "family_name",
    "nickname",
    "username",
];

const LOG_TARGET: &str = "token_exchange";

/// Why an exchange stopped short of issuing an identity.
#[derive(Debug)]
enum Rejection {
    Policy(PolicyViolation),
    Verification(VerifyError),
    Internal(ActionError),
}

impl From<PolicyViolation> for Rejection {
    fn from(violation: PolicyViolation) -> Self {
        Self::Policy(violation)
    }
}

impl From<VerifyError> for Rejection {
    fn from(err: VerifyError) -> Self {
        Self::Verification(err)
    }
}

impl From<ActionError> for Rejection {
    fn from(err: ActionError) -> Self {
        Self::Internal(err)
    }
}

impl Rejection {
    fn into_directive(self) -> EffectDirective {
        match self {
            Self::Policy(violation) => {
                tracing::warn!(target: LOG_TARGET, %violation, "token exchange denied");
                violation.directive()
            }
            Self::Verification(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    kind = ?err.kind(),
                    error = %err,
                    "subject token rejected"
                );
                EffectDirective::reject_subject_token(verification_message(&err))
            }
            Self::Internal(err) => {
                tracing::error!(target: LOG_TARGET, error = %err, "token exchange failed");
                EffectDirective::deny("server_error", EXCHANGE_FAILED)
            }
        }
    }
}

/// User-facing reason for a failed verification. Says which check failed,
/// never what the token contained.
pub fn verification_message(err: &VerifyError) -> String {
    match err {
        VerifyError::Expired => "The subject token has expired".to_string(),
        VerifyError::SignatureInvalid => "Token signature verification failed".to_string(),
        VerifyError::ClaimInvalid { claim } => match claim.as_str() {
            "aud" => "Token audience does not match expected value".to_string(),
            "iss" => "Token issuer does not match expected value".to_string(),
            "sub" => "Token missing valid subject claim".to_string(),
            other => format!("Token claim '{other}' validation failed"),
        },
        VerifyError::KeyNotFound { .. } | VerifyError::KeySource(_) => {
            "No matching signing key found for token".to_string()
        }
        VerifyError::KeyAmbiguous { .. } => "Multiple matching signing keys found".to_string(),
        VerifyError::Malformed(_) => "The subject token is invalid".to_string(),
    }
}

pub async fn on_custom_token_exchange(
    runtime: &ActionRuntime,
    event: &AuthenticationEvent,
    cache: &dyn PlatformCache,
) -> EffectDirective {
    runtime.apply_debug(&exchange_debug(event));

    let transaction = event.transaction.as_ref();
    let Some(subject_token) = transaction
        .and_then(|tx| tx.subject_token.as_deref())
        .filter(|token| !token.is_empty())
    else {
        return EffectDirective::deny("invalid_request", "subject_token is required");
    };

    let config = match ExchangeConfig::from_event(event) {
        Ok(config) => config,
        Err(err) if err.is_json_parse() => {
            tracing::error!(target: LOG_TARGET, error = %err, "failed to parse token exchange configuration");
            return EffectDirective::deny("server_error", EXCHANGE_FAILED);
        }
        Err(err) => {
            tracing::error!(target: LOG_TARGET, error = %err, "invalid token exchange configuration");
            return EffectDirective::deny("server_error", EXCHANGE_FAILED);
        }
    };

    let default_transaction = Transaction::default();
    let transaction = transaction.unwrap_or(&default_transaction);

    match exchange(runtime, event, transaction, subject_token, &config, cache).await {
        Ok(directive) => directive,
        Err(rejection) => rejection.into_directive(),
    }
}

async fn exchange(
    runtime: &ActionRuntime,
    event: &AuthenticationEvent,
    transaction: &Transaction,
    subject_token: &str,
    config: &ExchangeConfig,
    cache: &dyn PlatformCache,
) -> Result<EffectDirective, Rejection> {
    policy::check_client(&event.client.client_id, &config.allowed_clients)?;
    policy::check_audience(
        event
            .resource_server
            .as_ref()
            .map(|rs| rs.identifier.as_str()),
        &config.allowed_audiences,
    )?;
    policy::check_subject_token_type(
        transaction.subject_token_type.as_deref(),
        config.subject_token_type.as_deref(),
    )?;
    if config.profile.scope_check == ScopeCheck::BeforeVerify {
        policy::check_scopes(&transaction.requested_scopes, &config.allowed_scopes)?;
    }

    let issuer = runtime.issuer_for(event)?;
    let options = VerifyOptions::new(&issuer, &config.subject_token_audience);
    let payload = runtime
        .verifier()
        .verify(subject_token, &options, cache)
        .await?;

    policy::check_organization(
        &payload,
        event.organization_id(),
        config.profile.organization_policy,
    )?;
    policy::check_sender_constraint(&payload)?;
    if config.profile.scope_check == ScopeCheck::AfterVerify {
        policy::check_scopes(&transaction.requested_scopes, &config.allowed_scopes)?;
    }

    tracing::info!(
        target: LOG_TARGET,
        client_id = %event.client.client_id,
        sub = %payload.sub,
        "subject token accepted"
    );

    Ok(match &config.profile.provision_connection {
        Some(connection) => EffectDirective::SetUserByConnection {
            connection: connection.clone(),
            profile: provisioning_profile(&payload),
            behavior: UserProvisioning::default(),
        },
        None => EffectDirective::SetUserIdentity {
            subject_id: payload.sub,
        },
    })
}

fn provisioning_profile(payload: &VerifiedTokenPayload) -> Map<String, Value> {
    let mut profile = Map::new();
    profile.insert("user_id".to_string(), Value::String(payload.sub.clone()));
    for claim in PROFILE_CLAIMS {
        if let Some(value) = payload.claim(claim).filter(|v| !v.is_null()) {
            profile.insert((*claim).to_string(), value.clone());
        }
    }
    profile.insert("verify_email".to_string(), Value::Bool(false));
    profile
}
