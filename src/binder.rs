//! Stateless transaction binding.
//!
//! The PKCE verifier for a linking round-trip is never stored. Both the
//! initiating and the resuming invocation derive it from the same immutable
//! transaction attributes and a tenant secret, so a resume from a different
//! transaction produces a different verifier and the code exchange fails.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::ActionError;
use crate::event::AuthenticationEvent;

const VERIFIER_KEY_LEN: usize = 64;

/// A PKCE code verifier bound to one authentication transaction.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedVerifier(String);

impl DerivedVerifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// S256 challenge: base64url(SHA-256(verifier)).
    pub fn code_challenge(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Debug for DerivedVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedVerifier(..)")
    }
}

/// JSON array of the attributes identifying the transaction. Absent values
/// serialize as `null` so their position stays fixed.
pub fn canonical_transaction(
    event: &AuthenticationEvent,
    pin_ip: bool,
) -> Result<String, ActionError> {
    let user = event.user().ok_or(ActionError::MissingEventField("user"))?;
    let tx = event
        .transaction
        .as_ref()
        .ok_or(ActionError::MissingEventField("transaction"))?;

    let mut attributes = vec![
        json!(user.user_id),
        json!(tx.protocol),
        json!(tx.requested_scopes.as_slice()),
        json!(tx.response_type),
        json!(tx.redirect_uri),
        json!(tx.state),
        json!(tx.locale),
        json!(event.session_id()),
    ];
    if pin_ip {
        attributes.push(json!(event.request.ip));
    }

    Ok(serde_json::to_string(&Value::Array(attributes))?)
}

/// HKDF-SHA256 with the canonical string's hash as salt, the tenant secret as
/// keying material and the canonical string as info.
pub fn derive_verifier(
    event: &AuthenticationEvent,
    secret: &SecretString,
    pin_ip: bool,
) -> Result<DerivedVerifier, ActionError> {
    let canonical = canonical_transaction(event, pin_ip)?;
    let salt = URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()));

    let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), secret.expose_secret().as_bytes());
    let mut okm = [0u8; VERIFIER_KEY_LEN];
    hk.expand(canonical.as_bytes(), &mut okm)
        .map_err(|_| ActionError::Internal("hkdf output length rejected".to_string()))?;

    Ok(DerivedVerifier(URL_SAFE_NO_PAD.encode(okm)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{RequestedScopes, Session, Transaction, User};

    fn secret() -> SecretString {
        SecretString::from("tenant-action-secret".to_string())
    }

    fn event() -> AuthenticationEvent {
        let mut event = AuthenticationEvent {
            user: Some(User {
                user_id: "auth0|primary".to_string(),
                ..Default::default()
            }),
            session: Some(Session {
                id: Some("session-1".to_string()),
                created_at: None,
            }),
            transaction: Some(Transaction {
                protocol: Some("oidc-basic-profile".to_string()),
                requested_scopes: ["openid", "link_account"].into_iter().collect(),
                response_type: Some(vec!["code".to_string()]),
                redirect_uri: Some("https://app.example.com/callback".to_string()),
                state: Some("xyz".to_string()),
                locale: Some("en".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        event.request.ip = Some("203.0.113.7".to_string());
        event
    }

    #[test]
    fn canonical_form_is_positional() {
        let canonical = canonical_transaction(&event(), false).unwrap();
        assert_eq!(
            canonical,
            r#"["auth0|primary","oidc-basic-profile",["openid","link_account"],["code"],"https://app.example.com/callback","xyz","en","session-1"]"#
        );

        let pinned = canonical_transaction(&event(), true).unwrap();
        assert!(pinned.ends_with(r#""session-1","203.0.113.7"]"#));

        let mut no_session = event();
        no_session.session = None;
        let canonical = canonical_transaction(&no_session, false).unwrap();
        assert!(canonical.ends_with(r#""en",null]"#));
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_verifier(&event(), &secret(), false).unwrap();
        let b = derive_verifier(&event(), &secret(), false).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.code_challenge(), b.code_challenge());
        // 64 bytes, unpadded base64url
        assert_eq!(a.as_str().len(), 86);
    }

    #[test]
    fn any_attribute_change_changes_verifier() {
        let base = derive_verifier(&event(), &secret(), false).unwrap();

        let mut other_session = event();
        other_session.session = Some(Session {
            id: Some("session-2".to_string()),
            created_at: None,
        });
        assert_ne!(base, derive_verifier(&other_session, &secret(), false).unwrap());

        let mut other_user = event();
        if let Some(user) = other_user.user.as_mut() {
            user.user_id = "auth0|other".to_string();
        }
        assert_ne!(base, derive_verifier(&other_user, &secret(), false).unwrap());

        let mut other_scopes = event();
        if let Some(tx) = other_scopes.transaction.as_mut() {
            tx.requested_scopes = RequestedScopes::from_delimited("openid");
        }
        assert_ne!(base, derive_verifier(&other_scopes, &secret(), false).unwrap());

        let other_secret = SecretString::from("rotated".to_string());
        assert_ne!(base, derive_verifier(&event(), &other_secret, false).unwrap());

        assert_ne!(base, derive_verifier(&event(), &secret(), true).unwrap());
    }

    #[test]
    fn challenge_matches_rfc7636_vector() {
        let verifier = DerivedVerifier("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk".to_string());
        assert_eq!(
            verifier.code_challenge(),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn missing_transaction_is_an_error() {
        let mut event = event();
        event.transaction = None;
        let err = derive_verifier(&event, &secret(), false).unwrap_err();
        assert!(matches!(err, ActionError::MissingEventField("transaction")));
    }
}
