//! Hook handlers for an identity platform: account linking on post-login and
//! custom token exchange.
//!
//! Each invocation gets an [`AuthenticationEvent`] and answers with exactly
//! one [`EffectDirective`]. Handlers are stateless. The only thing shared
//! between invocations on a warm instance is the [`ActionRuntime`] with its
//! HTTP client and memoized key sets.

pub mod binder;
pub mod cache;
pub mod config;
pub mod directive;
pub mod error;
pub mod event;
pub mod exchange;
mod helpers;
pub mod jwks;
pub mod linker;
pub mod linking;
pub mod logging;
pub mod oidc;
pub mod policy;
pub mod runtime;
pub mod verifier;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;

pub use cache::{CacheExpiry, CacheRecord, MemoryCache, PlatformCache};
pub use directive::EffectDirective;
pub use error::{ActionError, ConfigError, JwksError, VerifyError, VerifyErrorKind};
pub use event::{AuthenticationEvent, Trigger};
pub use jwks::JwksCacheManager;
pub use runtime::ActionRuntime;
pub use verifier::{TokenVerifier, VerifiedTokenPayload, VerifyOptions};

/// Routes a trigger to its flow. Always yields a directive: a panicking flow
/// is answered with that flow's generic denial.
pub async fn dispatch(
    runtime: &ActionRuntime,
    trigger: Trigger,
    cache: &dyn PlatformCache,
) -> EffectDirective {
    match trigger {
        Trigger::PostLogin(event) => guarded(
            "post_login",
            linking::on_execute_post_login(runtime, &event, cache),
            || EffectDirective::deny_access(linking::START_FAILED),
        )
        .await,
        Trigger::ContinuePostLogin(event) => guarded(
            "continue_post_login",
            linking::on_continue_post_login(runtime, &event, cache),
            || EffectDirective::deny_access(linking::COMPLETE_FAILED),
        )
        .await,
        Trigger::CustomTokenExchange(event) => guarded(
            "custom_token_exchange",
            exchange::on_custom_token_exchange(runtime, &event, cache),
            || EffectDirective::deny("server_error", exchange::EXCHANGE_FAILED),
        )
        .await,
    }
}

async fn guarded<F>(
    trigger: &'static str,
    flow: F,
    fallback: impl FnOnce() -> EffectDirective,
) -> EffectDirective
where
    F: std::future::Future<Output = EffectDirective>,
{
    match AssertUnwindSafe(flow).catch_unwind().await {
        Ok(directive) => directive,
        Err(_) => {
            tracing::error!(trigger, "handler panicked");
            fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn panics_become_the_flow_denial() {
        let directive = guarded(
            "post_login",
            async { Option::<EffectDirective>::None.expect("flow bug") },
            || EffectDirective::deny_access(linking::START_FAILED),
        )
        .await;
        assert_eq!(
            directive,
            EffectDirective::deny_access("Unexpected Error trying to start account linking")
        );
    }

    #[tokio::test]
    async fn dispatch_routes_by_trigger() {
        let runtime = ActionRuntime::with_client(reqwest::Client::new());
        let cache = MemoryCache::new();

        let trigger: Trigger = serde_json::from_value(json!({
            "trigger": "custom_token_exchange",
            "event": {"client": {"client_id": "cli"}, "transaction": {}}
        }))
        .unwrap();
        assert_eq!(
            dispatch(&runtime, trigger, &cache).await,
            EffectDirective::deny("invalid_request", "subject_token is required")
        );

        let trigger: Trigger = serde_json::from_value(json!({
            "trigger": "post_login",
            "event": {"client": {"client_id": "cli"}, "user": {"user_id": "auth0|1"}}
        }))
        .unwrap();
        assert!(dispatch(&runtime, trigger, &cache).await.is_continue());

        let trigger: Trigger = serde_json::from_value(json!({
            "trigger": "continue_post_login",
            "event": {"client": {"client_id": "cli"}}
        }))
        .unwrap();
        assert!(dispatch(&runtime, trigger, &cache).await.is_continue());
    }
}
