//! Independent authorization predicates. Each returns `Ok(())` or the
//! violation that ends the invocation; callers chain them with `?` so the
//! first failure wins and later checks never run.

use std::collections::HashSet;
use thiserror::Error;

use crate::config::OrganizationPolicy;
use crate::directive::EffectDirective;
use crate::event::{AuthenticationEvent, RequestedScopes, User};
use crate::verifier::VerifiedTokenPayload;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("client '{client_id}' is not allowed to exchange tokens")]
    UnauthorizedClient { client_id: String },
    #[error("no target audience requested")]
    MissingAudience,
    #[error("audience '{audience}' is not allowed")]
    InvalidTarget { audience: String },
    #[error("scopes not allowed: {}", unauthorized.join(", "))]
    InvalidScope { unauthorized: Vec<String> },
    #[error("subject token type '{declared}' is not accepted")]
    UnsupportedSubjectTokenType { declared: String },
    #[error("subject token is bound to organization '{org_id}'")]
    OrganizationBound { org_id: String },
    #[error("subject token organization '{org_id}' does not match the request")]
    OrganizationMismatch { org_id: String },
    #[error("subject token is sender-constrained")]
    SenderConstrained,
    #[error("second factor not performed in this session")]
    MfaRequired,
    #[error("email address is not verified")]
    EmailUnverified,
}

impl PolicyViolation {
    /// Machine-readable reason plus a message that reveals nothing further.
    pub fn directive(&self) -> EffectDirective {
        match self {
            Self::UnauthorizedClient { .. } => EffectDirective::deny(
                "unauthorized_client",
                "This client is not authorized to perform token exchange",
            ),
            Self::MissingAudience => {
                EffectDirective::deny("invalid_request", "No target audience specified")
            }
            Self::InvalidTarget { .. } => EffectDirective::deny(
                "invalid_target",
                "The requested audience is not permitted",
            ),
            Self::InvalidScope { .. } => EffectDirective::deny(
                "invalid_scope",
                "One or more requested scopes are not permitted",
            ),
            Self::UnsupportedSubjectTokenType { .. } => {
                EffectDirective::deny("invalid_request", "Unsupported subject_token_type")
            }
            Self::OrganizationBound { .. } => EffectDirective::reject_subject_token(
                "Organization-bound token not eligible for exchange",
            ),
            Self::OrganizationMismatch { .. } => EffectDirective::reject_subject_token(
                "Organization-bound token does not match the requested organization",
            ),
            Self::SenderConstrained => EffectDirective::reject_subject_token(
                "Sender-constrained token not eligible for exchange",
            ),
            Self::MfaRequired => {
                EffectDirective::deny_access("You must perform MFA for account linking")
            }
            Self::EmailUnverified => {
                EffectDirective::deny_access("Email Verification is required for account linking")
            }
        }
    }
}

pub fn check_client(
    client_id: &str,
    allowed: &HashSet<String>,
) -> Result<(), PolicyViolation> {
    if allowed.contains(client_id) {
        Ok(())
    } else {
        Err(PolicyViolation::UnauthorizedClient {
            client_id: client_id.to_string(),
        })
    }
}

pub fn check_audience(
    audience: Option<&str>,
    allowed: &HashSet<String>,
) -> Result<(), PolicyViolation> {
    let audience = audience
        .filter(|a| !a.is_empty())
        .ok_or(PolicyViolation::MissingAudience)?;

    if allowed.contains(audience) {
        Ok(())
    } else {
        Err(PolicyViolation::InvalidTarget {
            audience: audience.to_string(),
        })
    }
}

/// All-or-nothing: one unknown scope rejects the whole request.
pub fn check_scopes(
    requested: &RequestedScopes,
    allowed: &HashSet<String>,
) -> Result<(), PolicyViolation> {
    let unauthorized: Vec<String> = requested
        .iter()
        .filter(|scope| !allowed.contains(*scope))
        .map(str::to_string)
        .collect();

    if unauthorized.is_empty() {
        Ok(())
    } else {
        Err(PolicyViolation::InvalidScope { unauthorized })
    }
}

pub fn check_subject_token_type(
    declared: Option<&str>,
    expected: Option<&str>,
) -> Result<(), PolicyViolation> {
    match expected {
        Some(expected) if declared != Some(expected) => {
            Err(PolicyViolation::UnsupportedSubjectTokenType {
                declared: declared.unwrap_or_default().to_string(),
            })
        }
        _ => Ok(()),
    }
}

pub fn check_organization(
    payload: &VerifiedTokenPayload,
    request_org: Option<&str>,
    policy: OrganizationPolicy,
) -> Result<(), PolicyViolation> {
    let Some(org_id) = payload.org_id.as_deref() else {
        return Ok(());
    };

    match policy {
        OrganizationPolicy::Reject => Err(PolicyViolation::OrganizationBound {
            org_id: org_id.to_string(),
        }),
        OrganizationPolicy::MatchRequest if request_org == Some(org_id) => Ok(()),
        OrganizationPolicy::MatchRequest => Err(PolicyViolation::OrganizationMismatch {
            org_id: org_id.to_string(),
        }),
    }
}

/// Proof-of-possession tokens cannot be re-bound without re-proving the key.
pub fn check_sender_constraint(payload: &VerifiedTokenPayload) -> Result<(), PolicyViolation> {
    if payload.is_sender_constrained() {
        Err(PolicyViolation::SenderConstrained)
    } else {
        Ok(())
    }
}

/// Users with enrolled factors must have completed one in this session.
pub fn check_mfa_completed(event: &AuthenticationEvent, user: &User) -> Result<(), PolicyViolation> {
    if user.enrolled_factors.is_empty() {
        return Ok(());
    }

    let performed = event
        .authentication
        .as_ref()
        .is_some_and(|auth| auth.methods.iter().any(|m| m.name == "mfa"));
    if performed {
        Ok(())
    } else {
        Err(PolicyViolation::MfaRequired)
    }
}

/// Only an explicit `false` fails the gate.
pub fn check_email_verified(user: &User) -> Result<(), PolicyViolation> {
    match user.email_verified {
        Some(false) => Err(PolicyViolation::EmailUnverified),
        _ => Ok(()),
    }
}
