//! Maps the `DEBUG` namespace setting onto `tracing` filters.
//!
//! Namespaces look like `account-linking:info,token-exchange:*`. The part
//! before the colon selects a target, the part after it a level.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use crate::error::ActionError;

const KNOWN_NAMESPACES: &[(&str, &str)] = &[
    ("account-linking", "account_linking"),
    ("token-exchange", "token_exchange"),
    ("jwks", "jwks"),
];

const LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

fn level_for(suffix: &str) -> &'static str {
    match suffix {
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "verbose" | "debug" | "*" | "" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}

fn rank(level: &str) -> usize {
    LEVELS.iter().position(|l| *l == level).unwrap_or(0)
}

/// Keeps one entry per target, at the most verbose level asked for.
fn raise(directives: &mut Vec<(&'static str, &'static str)>, target: &'static str, level: &'static str) {
    match directives.iter_mut().find(|(t, _)| *t == target) {
        Some(existing) if rank(level) > rank(existing.1) => existing.1 = level,
        Some(_) => {}
        None => directives.push((target, level)),
    }
}

/// Translates a `DEBUG` value into an `EnvFilter` directive string. Unknown
/// namespaces are dropped; errors always stay visible.
pub fn directives_from_debug(debug: &str) -> String {
    let mut global = "error";
    let mut directives = Vec::new();

    for part in debug.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if part == "*" {
            global = "debug";
            continue;
        }

        let (namespace, suffix) = part.split_once(':').unwrap_or((part, "*"));
        if let Some((_, target)) = KNOWN_NAMESPACES.iter().find(|(ns, _)| *ns == namespace) {
            let level = level_for(suffix);
            raise(&mut directives, *target, level);
            // key resolution logs follow whichever flow asked for detail
            if rank(level) >= rank("debug") {
                raise(&mut directives, "jwks", level);
            }
        }
    }

    std::iter::once(global.to_string())
        .chain(directives.into_iter().map(|(t, l)| format!("{t}={l}")))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn filter_from_debug(debug: &str) -> EnvFilter {
    EnvFilter::try_new(directives_from_debug(debug)).unwrap_or_else(|_| EnvFilter::new("error"))
}

/// Handle onto the process subscriber's filter, adjusted per invocation.
#[derive(Clone)]
pub struct LogFilter {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogFilter {
    pub fn enable(&self, debug: &str) {
        if let Err(err) = self.handle.reload(filter_from_debug(debug)) {
            tracing::warn!(error = %err, "failed to reload log filter");
        }
    }
}

/// Installs a reloadable fmt subscriber as the global default.
pub fn init(initial: &str) -> Result<LogFilter, ActionError> {
    let (filter, handle) = reload::Layer::new(filter_from_debug(initial));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| ActionError::Internal(format!("failed to install subscriber: {e}")))?;

    Ok(LogFilter { handle })
}
