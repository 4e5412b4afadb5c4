//! Environment configuration helpers
//!
//! Every binary reads its settings from the process environment (after
//! `dotenvy` has loaded any `.env` file). These helpers keep the parsing rules
//! identical across crates: a missing optional value falls back to its
//! default, a present but unparseable value is an error.

use std::str::FromStr;

/// Configuration loading error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Read a required variable. Empty strings count as missing.
pub fn env_required(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

/// Read an optional string variable with a default.
pub fn env_or(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Read and parse an optional variable, failing on malformed input.
pub fn env_parse<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::Invalid {
                    name,
                    value: raw.clone(),
                    reason: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

/// Read a boolean flag. Accepts `true/false/1/0/yes/no`.
pub fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        },
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_parse_uses_default_when_unset() {
        std::env::remove_var("DOCKET_TEST_NUMBER");
        assert_eq!(env_parse("DOCKET_TEST_NUMBER", 3u32).unwrap(), 3);
    }

    #[test]
    #[serial]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("DOCKET_TEST_NUMBER", "three");
        let err = env_parse("DOCKET_TEST_NUMBER", 3u32).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "DOCKET_TEST_NUMBER", .. }));
        std::env::remove_var("DOCKET_TEST_NUMBER");
    }

    #[test]
    #[serial]
    fn test_env_required_treats_blank_as_missing() {
        std::env::set_var("DOCKET_TEST_SECRET", "   ");
        assert_eq!(
            env_required("DOCKET_TEST_SECRET"),
            Err(ConfigError::Missing("DOCKET_TEST_SECRET"))
        );
        std::env::remove_var("DOCKET_TEST_SECRET");
    }

    #[test]
    #[serial]
    fn test_env_bool_variants() {
        std::env::set_var("DOCKET_TEST_FLAG", "yes");
        assert!(env_bool("DOCKET_TEST_FLAG", false).unwrap());
        std::env::set_var("DOCKET_TEST_FLAG", "0");
        assert!(!env_bool("DOCKET_TEST_FLAG", true).unwrap());
        std::env::set_var("DOCKET_TEST_FLAG", "maybe");
        assert!(env_bool("DOCKET_TEST_FLAG", true).is_err());
        std::env::remove_var("DOCKET_TEST_FLAG");
    }
}
