use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

pub(crate) fn now_secs() -> u64 {
    since_epoch().as_secs()
}

pub(crate) fn now_millis() -> u64 {
    u64::try_from(since_epoch().as_millis()).unwrap_or(u64::MAX)
}

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
}

/// `host[:port]` of an issuer, the key every JWKS tier is partitioned by.
pub(crate) fn issuer_host(issuer: &Url) -> String {
    let host = issuer.host_str().unwrap_or_default();
    match issuer.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Splits a comma separated list, dropping blanks.
pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn is_yes(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuer_host_keeps_explicit_port() {
        let plain = Url::parse("https://tenant.example.com/").unwrap();
        assert_eq!(issuer_host(&plain), "tenant.example.com");

        let local = Url::parse("http://127.0.0.1:8123/").unwrap();
        assert_eq!(issuer_host(&local), "127.0.0.1:8123");
    }

    #[test]
    fn list_and_flag_parsing() {
        assert_eq!(split_list(" a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
        assert!(is_yes("YES"));
        assert!(!is_yes("no"));
        assert!(!is_yes("true"));
    }
}
