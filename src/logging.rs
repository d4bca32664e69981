//! Structured logging with credential redaction.
//!
//! Logs go to stderr as JSON so stdout stays free for the load report.
//! Adapters hand their descriptor to [`register_config_for_redaction`] on
//! connect; driver messages are then passed through [`redact`] (or logged
//! with [`safe_log!`]) before they reach a log line or a report.

use aho_corasick::{AhoCorasick, MatchKind};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use secrecy::{ExposeSecret, SecretString};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error};
use tracing_subscriber::filter::EnvFilter;

use crate::database::DatabaseConfig;

const REDACTED: &str = "[REDACTED]";

/// Option keys whose values are credentials rather than settings
const SENSITIVE_OPTION_MARKERS: [&str; 4] = ["password", "secret", "token", "key"];

/// Known secrets plus a matcher over them, rebuilt when a new secret arrives.
struct Redactor {
    secrets: DashMap<String, ()>,
    matcher: RwLock<Option<AhoCorasick>>,
}

static REDACTOR: Lazy<Redactor> = Lazy::new(|| Redactor {
    secrets: DashMap::new(),
    matcher: RwLock::new(None),
});

impl Redactor {
    fn insert(&self, value: &str) {
        if value.is_empty() || self.secrets.insert(value.to_string(), ()).is_some() {
            return;
        }
        let mut matcher = self
            .matcher
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *matcher = self.build();
        debug!(known = self.secrets.len(), "registered value for redaction");
    }

    fn build(&self) -> Option<AhoCorasick> {
        let patterns: Vec<String> = self.secrets.iter().map(|e| e.key().clone()).collect();
        // Longest match wins so a secret containing another is hidden whole
        AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostLongest)
            .build(&patterns)
            .map_err(|e| error!("failed to build redaction matcher: {}", e))
            .ok()
    }

    fn apply(&self, input: &str) -> String {
        let matcher = self.matcher.read().unwrap_or_else(PoisonError::into_inner);
        match matcher.as_ref() {
            Some(ac) => {
                let mut out = String::with_capacity(input.len());
                ac.replace_all_with(input, &mut out, |_, _, dst| {
                    dst.push_str(REDACTED);
                    true
                });
                out
            }
            None => input.to_string(),
        }
    }
}

/// Install the global JSON subscriber.
///
/// Verbosity comes from `RUST_LOG`, falling back to `info`. Calling this
/// twice is harmless; the second call keeps the first subscriber.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .json()
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Registers a value for redaction; empty values are ignored
pub fn register_for_redaction(secret_value: &str) {
    REDACTOR.insert(secret_value);
}

pub fn register_secret_for_redaction(secret: &SecretString) {
    REDACTOR.insert(secret.expose_secret());
}

/// Register every credential a descriptor carries: the password and any
/// driver option whose key names a password, secret, token or key.
///
/// The username is left alone since it routinely appears in ordinary
/// messages such as role names.
pub fn register_config_for_redaction(config: &DatabaseConfig) {
    REDACTOR.insert(config.password().expose_secret());
    for (key, value) in config.options() {
        let key = key.to_ascii_lowercase();
        if SENSITIVE_OPTION_MARKERS.iter().any(|m| key.contains(m)) {
            REDACTOR.insert(value);
        }
    }
}

/// Replace every registered secret in `input` with `[REDACTED]`
pub fn redact(input: &str) -> String {
    REDACTOR.apply(input)
}

#[cfg(test)]
pub(crate) fn is_registered_for_redaction(value: &str) -> bool {
    REDACTOR.secrets.contains_key(value)
}

/// Log a formatted message at the given `tracing` level after redacting
/// registered secrets.
///
/// ```ignore
/// safe_log!(warn, "connect failed: {}", cause);
/// ```
#[macro_export]
macro_rules! safe_log {
    ($level:ident, $($arg:tt)+) => {
        ::tracing::$level!("{}", $crate::logging::redact(&format!($($arg)+)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseType;

    #[test]
    fn test_redact_registered_values() {
        register_for_redaction("hunter2-logging-test");
        assert!(is_registered_for_redaction("hunter2-logging-test"));

        let out = redact("auth failed for password hunter2-logging-test at db:5432");
        assert_eq!(out, "auth failed for password [REDACTED] at db:5432");
    }

    #[test]
    fn test_empty_value_is_not_registered() {
        register_for_redaction("");
        assert!(!is_registered_for_redaction(""));
    }

    #[test]
    fn test_register_secret_string() {
        let secret = SecretString::new("s3cr3t-from-wrapper".to_string());
        register_secret_for_redaction(&secret);
        assert_eq!(redact("x s3cr3t-from-wrapper y"), "x [REDACTED] y");
    }

    #[test]
    fn test_overlapping_secrets_are_hidden_whole() {
        register_for_redaction("pw-overlap");
        register_for_redaction("pw-overlap-longer");
        assert_eq!(
            redact("tried pw-overlap-longer then pw-overlap"),
            "tried [REDACTED] then [REDACTED]"
        );
    }

    #[test]
    fn test_registering_twice_keeps_redacting() {
        register_for_redaction("twice-registered-value");
        register_for_redaction("twice-registered-value");
        assert_eq!(redact("a twice-registered-value b"), "a [REDACTED] b");
    }

    #[test]
    fn test_config_credentials_registered() {
        let config = DatabaseConfig::new(
            DatabaseType::Postgres,
            "db.internal",
            5432,
            "raw",
            "loader-user-kept",
            SecretString::new("config-password-value".to_string()),
        )
        .unwrap()
        .with_options([
            ("sslpassword", "client-key-passphrase"),
            ("application_name", "loader-app-kept"),
        ]);
        register_config_for_redaction(&config);

        let out = redact(
            "loader-user-kept config-password-value client-key-passphrase loader-app-kept",
        );
        assert_eq!(out, "loader-user-kept [REDACTED] [REDACTED] loader-app-kept");
    }

    #[test]
    fn test_safe_log_accepts_format_arguments() {
        register_for_redaction("hunter2-macro-test");
        crate::safe_log!(warn, "connect failed with {}", "hunter2-macro-test");
        crate::safe_log!(debug, "plain message");
        crate::safe_log!(trace, "level {} is forwarded", "trace");
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging();
        init_logging();
    }
}
