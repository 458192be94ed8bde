//! Environment variable loading helpers

use crate::error::{ParallelError, Result};
use std::env;
use std::str::FromStr;

/// Load an environment variable as a string
///
/// * `Ok(Some(value))` if the variable exists
/// * `Ok(None)` if it does not
/// * `Err` if it exists but is not valid UTF-8
pub fn get_env(key: &str) -> Result<Option<String>> {
    match env::var(key) {
        Ok(val) => Ok(Some(val)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ParallelError::Configuration(format!(
            "Environment variable {} contains invalid UTF-8",
            key
        ))),
    }
}

/// Load and parse an environment variable
///
/// Surrounding whitespace is ignored. A variable that is present but fails to
/// parse is an error, not a silent fallback.
pub fn get_env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_env(key)? {
        Some(val) => {
            let parsed = val.trim().parse::<T>().map_err(|e| {
                ParallelError::Configuration(format!(
                    "Failed to parse environment variable {}: {}",
                    key, e
                ))
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Build a prefixed environment variable name, e.g. `PARLOOP_CHUNK_SIZE`
pub fn build_env_key(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_missing() {
        let result = get_env("PARLOOP_TEST_MISSING_VAR_12345").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_get_env_parse() {
        env::set_var("PARLOOP_TEST_NUMBER", " 42 ");
        let result: Option<usize> = get_env_parse("PARLOOP_TEST_NUMBER").unwrap();
        assert_eq!(result, Some(42));
        env::remove_var("PARLOOP_TEST_NUMBER");
    }

    #[test]
    fn test_get_env_parse_invalid() {
        env::set_var("PARLOOP_TEST_INVALID_NUMBER", "many");
        let result: Result<Option<usize>> = get_env_parse("PARLOOP_TEST_INVALID_NUMBER");
        assert!(matches!(result, Err(ParallelError::Configuration(_))));
        env::remove_var("PARLOOP_TEST_INVALID_NUMBER");
    }

    #[test]
    fn test_build_env_key() {
        assert_eq!(build_env_key("PARLOOP_", "chunk_size"), "PARLOOP_CHUNK_SIZE");
        assert_eq!(build_env_key("", "max_sequence_chunk"), "MAX_SEQUENCE_CHUNK");
    }
}
