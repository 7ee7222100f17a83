//! Committer configuration.

use std::time::Duration;

use lakelog_core::config::{ConfigSource, read_millis, read_u32};
use lakelog_core::{Error, RetryPolicy};

/// Backoff while waiting for a job's input references to be assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitterConfig {
    /// Wait before the first retry.
    pub wait_initial: Duration,
    /// Cap on any single wait.
    pub wait_max: Duration,
    /// Commit attempts before giving up.
    pub max_attempts: u32,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            wait_initial: Duration::from_secs(2),
            wait_max: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl CommitterConfig {
    /// Loads settings from `source` (`LAKELOG_COMMIT_WAIT_INITIAL_MS`,
    /// `LAKELOG_COMMIT_WAIT_MAX_MS`, `LAKELOG_COMMIT_MAX_ATTEMPTS`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the variable if a value does not
    /// parse, or if max attempts is zero.
    pub fn from_source(source: &impl ConfigSource) -> Result<Self, Error> {
        let defaults = Self::default();
        let config = Self {
            wait_initial: read_millis(source, "LAKELOG_COMMIT_WAIT_INITIAL_MS")?
                .unwrap_or(defaults.wait_initial),
            wait_max: read_millis(source, "LAKELOG_COMMIT_WAIT_MAX_MS")?
                .unwrap_or(defaults.wait_max),
            max_attempts: read_u32(source, "LAKELOG_COMMIT_MAX_ATTEMPTS")?
                .unwrap_or(defaults.max_attempts),
        };
        if config.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "LAKELOG_COMMIT_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    /// The backoff policy these settings describe.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.wait_initial, self.wait_max, self.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_and_overrides() {
        assert_eq!(
            CommitterConfig::from_source(&HashMap::new()).unwrap(),
            CommitterConfig::default()
        );

        let source: HashMap<String, String> = HashMap::from([
            ("LAKELOG_COMMIT_WAIT_INITIAL_MS".into(), "10".into()),
            ("LAKELOG_COMMIT_MAX_ATTEMPTS".into(), "3".into()),
        ]);
        let config = CommitterConfig::from_source(&source).unwrap();
        assert_eq!(config.wait_initial, Duration::from_millis(10));
        assert_eq!(config.wait_max, Duration::from_secs(60));
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn rejects_bad_values() {
        let zero: HashMap<String, String> =
            HashMap::from([("LAKELOG_COMMIT_MAX_ATTEMPTS".into(), "0".into())]);
        assert!(CommitterConfig::from_source(&zero).is_err());

        let junk: HashMap<String, String> =
            HashMap::from([("LAKELOG_COMMIT_WAIT_MAX_MS".into(), "soon".into())]);
        let err = CommitterConfig::from_source(&junk).unwrap_err();
        assert!(err.to_string().contains("LAKELOG_COMMIT_WAIT_MAX_MS"));
    }
}
