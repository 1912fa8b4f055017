use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("token verification failed: {0}")]
    Verification(#[from] VerifyError),
    #[error("jwks error: {0}")]
    Jwks(#[from] JwksError),
    #[error("upstream provider error: {0}")]
    Provider(String),
    #[error("event is missing {0}")]
    MissingEventField(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("setting '{0}' is required")]
    Missing(&'static str),
    #[error("setting '{name}' is not valid JSON: {source}")]
    NotJson {
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("setting '{0}' must be a non-empty JSON array of strings")]
    NotStringArray(&'static str),
    #[error("setting '{name}' has unsupported value '{value}'")]
    Unsupported { name: &'static str, value: String },
}

impl ConfigError {
    pub fn is_json_parse(&self) -> bool {
        matches!(self, Self::NotJson { .. })
    }
}

/// The six verification classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyErrorKind {
    Expired,
    SignatureInvalid,
    ClaimInvalid,
    KeyNotFound,
    KeyAmbiguous,
    Malformed,
}

#[derive(Debug, Clone, Error)]
pub enum VerifyError {
    #[error("token has expired")]
    Expired,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("claim '{claim}' validation failed")]
    ClaimInvalid { claim: String },
    #[error("no matching signing key (kid {kid:?})")]
    KeyNotFound { kid: Option<String> },
    #[error("multiple matching signing keys (kid {kid:?})")]
    KeyAmbiguous { kid: Option<String> },
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("key set unavailable: {0}")]
    KeySource(JwksError),
}

impl VerifyError {
    pub(crate) fn claim(claim: impl Into<String>) -> Self {
        Self::ClaimInvalid {
            claim: claim.into(),
        }
    }

    pub fn kind(&self) -> VerifyErrorKind {
        match self {
            Self::Expired => VerifyErrorKind::Expired,
            Self::SignatureInvalid => VerifyErrorKind::SignatureInvalid,
            Self::ClaimInvalid { .. } => VerifyErrorKind::ClaimInvalid,
            Self::KeyNotFound { .. } | Self::KeySource(_) => VerifyErrorKind::KeyNotFound,
            Self::KeyAmbiguous { .. } => VerifyErrorKind::KeyAmbiguous,
            Self::Malformed(_) => VerifyErrorKind::Malformed,
        }
    }

    /// Only a key lookup miss is worth one forced refresh. A failed fetch is not.
    pub fn triggers_refresh(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. } | Self::KeyAmbiguous { .. })
    }
}

impl From<jsonwebtoken::errors::Error> for VerifyError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::SignatureInvalid,
            ErrorKind::InvalidAudience => Self::claim("aud"),
            ErrorKind::InvalidIssuer => Self::claim("iss"),
            ErrorKind::InvalidSubject => Self::claim("sub"),
            ErrorKind::ImmatureSignature => Self::claim("nbf"),
            ErrorKind::MissingRequiredClaim(claim) => Self::claim(claim.as_str()),
            _ => Self::Malformed(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum JwksError {
    #[error("failed to fetch key set: {0}")]
    Fetch(String),
    #[error("key set endpoint returned status {0}")]
    Status(u16),
    #[error("malformed key set: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache write rejected: {code}")]
    Rejected { code: String },
}
