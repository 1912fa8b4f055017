use serde::Serialize;
use serde_json::{Map, Value};

/// Reason used for post-login denials, which carry only a user-facing message.
pub const ACCESS_DENIED: &str = "access_denied";

/// The single observable outcome of one handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EffectDirective {
    Continue,
    Deny {
        reason: String,
        message: String,
    },
    RejectSubjectToken {
        message: String,
    },
    Redirect {
        url: String,
    },
    SetUserIdentity {
        subject_id: String,
    },
    SetUserByConnection {
        connection: String,
        profile: Map<String, Value>,
        behavior: UserProvisioning,
    },
    ChallengeWithAny {
        factors: Vec<FactorChallenge>,
    },
}

impl EffectDirective {
    pub fn deny(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn deny_access(message: impl Into<String>) -> Self {
        Self::deny(ACCESS_DENIED, message)
    }

    pub fn reject_subject_token(message: impl Into<String>) -> Self {
        Self::RejectSubjectToken {
            message: message.into(),
        }
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationBehavior {
    CreateIfNotExists,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateBehavior {
    Replace,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserProvisioning {
    pub creation: CreationBehavior,
    pub update: UpdateBehavior,
}

impl Default for UserProvisioning {
    fn default() -> Self {
        Self {
            creation: CreationBehavior::CreateIfNotExists,
            update: UpdateBehavior::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactorChallenge {
    #[serde(rename = "type")]
    pub factor_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_method: Option<String>,
}

impl FactorChallenge {
    /// SMS enrollments are challenged as a phone factor that prefers SMS delivery.
    pub fn for_enrolled_method(method: &str) -> Self {
        if method == "sms" {
            Self {
                factor_type: "phone".to_string(),
                preferred_method: Some("sms".to_string()),
            }
        } else {
            Self {
                factor_type: method.to_string(),
                preferred_method: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn directives_serialize_with_type_tag() {
        let deny = serde_json::to_value(EffectDirective::deny("invalid_scope", "nope")).unwrap();
        assert_eq!(
            deny,
            json!({"type": "deny", "reason": "invalid_scope", "message": "nope"})
        );

        let cont = serde_json::to_value(EffectDirective::Continue).unwrap();
        assert_eq!(cont, json!({"type": "continue"}));
    }

    #[test]
    fn sms_factor_maps_to_phone() {
        let sms = FactorChallenge::for_enrolled_method("sms");
        assert_eq!(sms.factor_type, "phone");
        assert_eq!(sms.preferred_method.as_deref(), Some("sms"));

        let otp = FactorChallenge::for_enrolled_method("otp");
        assert_eq!(
            serde_json::to_value(otp).unwrap(),
            json!({"type": "otp"})
        );
    }
}
