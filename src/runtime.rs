use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::ActionError;
use crate::event::AuthenticationEvent;
use crate::jwks::JwksCacheManager;
use crate::logging::LogFilter;
use crate::verifier::TokenVerifier;

const DEFAULT_ISSUER_SCHEME: &str = "https";

/// Process-wide state shared by every invocation on a warm instance.
pub struct ActionRuntime {
    http: reqwest::Client,
    verifier: TokenVerifier,
    issuer_scheme: String,
    log_filter: Option<LogFilter>,
}

impl ActionRuntime {
    pub fn new() -> Result<Self, ActionError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self::with_client(http))
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        let jwks = Arc::new(JwksCacheManager::new(http.clone()));
        Self {
            http,
            verifier: TokenVerifier::new(jwks),
            issuer_scheme: DEFAULT_ISSUER_SCHEME.to_string(),
            log_filter: None,
        }
    }

    /// Serves issuers over another scheme, e.g. `http` for a local provider.
    pub fn with_issuer_scheme(mut self, scheme: &str) -> Self {
        self.issuer_scheme = scheme.to_string();
        self
    }

    pub fn with_log_filter(mut self, filter: LogFilter) -> Self {
        self.log_filter = Some(filter);
        self
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// Base URL for a tenant host, with a trailing slash.
    pub fn host_url(&self, host: &str) -> Result<Url, ActionError> {
        Ok(Url::parse(&format!("{}://{}/", self.issuer_scheme, host))?)
    }

    /// The tenant's own issuer, derived from the request hostname.
    pub fn issuer_for(&self, event: &AuthenticationEvent) -> Result<Url, ActionError> {
        let host = event.request.hostname.trim();
        if host.is_empty() {
            return Err(ActionError::MissingEventField("request.hostname"));
        }
        self.host_url(host)
    }

    pub(crate) fn apply_debug(&self, debug: &str) {
        if let Some(filter) = &self.log_filter {
            filter.enable(debug);
        }
    }
}
