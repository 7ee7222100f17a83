//! Typed configuration readers over a name/value source.
//!
//! Production code reads the process environment through [`EnvSource`]; tests
//! pass a `HashMap<String, String>` so they never mutate global state.
//! Values are trimmed and empty values count as unset.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// A lookup from configuration variable name to raw value.
pub trait ConfigSource {
    /// Returns the raw value for `name`, if set.
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads configuration from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

impl<S: ConfigSource + ?Sized> ConfigSource for &S {
    fn get(&self, name: &str) -> Option<String> {
        (**self).get(name)
    }
}

/// Reads a trimmed, non-empty string.
pub fn read_string(source: &impl ConfigSource, name: &str) -> Option<String> {
    source.get(name).and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_parsed<T>(source: &impl ConfigSource, name: &str, kind: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(v) = read_string(source, name) else {
        return Ok(None);
    };
    v.parse::<T>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a {kind}: {e}")))
}

/// Reads a `u32`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] naming the variable if the value does not parse.
pub fn read_u32(source: &impl ConfigSource, name: &str) -> Result<Option<u32>> {
    read_parsed(source, name, "u32")
}

/// Reads a `u64`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] naming the variable if the value does not parse.
pub fn read_u64(source: &impl ConfigSource, name: &str) -> Result<Option<u64>> {
    read_parsed(source, name, "u64")
}

/// Reads a `usize`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] naming the variable if the value does not parse.
pub fn read_usize(source: &impl ConfigSource, name: &str) -> Result<Option<usize>> {
    read_parsed(source, name, "usize")
}

/// Reads a duration given in milliseconds.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] naming the variable if the value does not parse.
pub fn read_millis(source: &impl ConfigSource, name: &str) -> Result<Option<Duration>> {
    Ok(read_u64(source, name)?.map(Duration::from_millis))
}

/// Reads a duration given in seconds.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] naming the variable if the value does not parse.
pub fn read_secs(source: &impl ConfigSource, name: &str) -> Result<Option<Duration>> {
    Ok(read_u64(source, name)?.map(Duration::from_secs))
}

/// Reads a boolean (`true/false`, `1/0`, `yes/no`, `y/n`).
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] naming the variable if the value is not a boolean.
pub fn read_bool(source: &impl ConfigSource, name: &str) -> Result<Option<bool>> {
    let Some(v) = read_string(source, name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn empty_values_are_unset() {
        let src = source(&[("A", "   ")]);
        assert_eq!(read_string(&src, "A"), None);
        assert_eq!(read_u64(&src, "A").unwrap(), None);
        assert_eq!(read_u64(&src, "MISSING").unwrap(), None);
    }

    #[test]
    fn numbers_and_durations_parse() {
        let src = source(&[("N", " 42 "), ("MS", "250"), ("S", "3")]);
        assert_eq!(read_u32(&src, "N").unwrap(), Some(42));
        assert_eq!(read_usize(&src, "N").unwrap(), Some(42));
        assert_eq!(read_millis(&src, "MS").unwrap(), Some(Duration::from_millis(250)));
        assert_eq!(read_secs(&src, "S").unwrap(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn invalid_number_names_the_variable() {
        let src = source(&[("LAKELOG_X", "ten")]);
        let err = read_u32(&src, "LAKELOG_X").unwrap_err();
        assert!(err.to_string().contains("LAKELOG_X"));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        let src = source(&[("T", "Yes"), ("F", "0"), ("BAD", "maybe")]);
        assert_eq!(read_bool(&src, "T").unwrap(), Some(true));
        assert_eq!(read_bool(&src, "F").unwrap(), Some(false));
        assert!(read_bool(&src, "BAD").is_err());
    }
}
