//! Strongly-typed identifiers for lakelog entities.
//!
//! Table IDs become storage path segments, so they are validated at
//! construction. Job IDs come from upstream job creators and are opaque,
//! but locally generated ones are ULIDs so they sort by creation time.
//!
//! # Example
//!
//! ```rust
//! use lakelog_core::id::{JobId, TableId};
//!
//! let table = TableId::new("sales-2024").unwrap();
//! let job = JobId::generate();
//! assert_eq!(table.as_str(), "sales-2024");
//! assert!(!job.as_str().is_empty());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Identifier of a table. Every transaction log, snapshot and property file is
/// scoped under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableId(String);

impl TableId {
    /// Creates a table ID after validating it is safe to use as a path segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the ID is empty, too long, or contains
    /// characters other than ASCII lowercase letters, digits, `-` and `_`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_path_segment(&id, "table_id")?;
        Ok(Self(id))
    }

    /// Generates a fresh table ID from a ULID (lowercased).
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string().to_ascii_lowercase())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TableId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TableId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TableId> for String {
    fn from(value: TableId) -> Self {
        value.0
    }
}

impl AsRef<str> for TableId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a compaction job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wraps an upstream job identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new job ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

const MAX_SEGMENT_LEN: usize = 128;

fn validate_path_segment(id: &str, field: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidId {
            message: format!("{field} cannot be empty"),
        });
    }

    if id.len() > MAX_SEGMENT_LEN {
        return Err(Error::InvalidId {
            message: format!("{field} longer than {MAX_SEGMENT_LEN} characters"),
        });
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(Error::InvalidId {
            message: format!("{field} contains invalid characters (allowed: a-z, 0-9, '-', '_')"),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_id_roundtrip() {
        let id = TableId::generate();
        let parsed: TableId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn table_id_rejects_path_separators() {
        assert!(TableId::new("a/b").is_err());
        assert!(TableId::new("..").is_err());
        assert!(TableId::new("").is_err());
        assert!(TableId::new("Upper").is_err());
    }

    #[test]
    fn table_id_deserialize_validates() {
        let ok: TableId = serde_json::from_str("\"orders\"").unwrap();
        assert_eq!(ok.as_str(), "orders");
        assert!(serde_json::from_str::<TableId>("\"../etc\"").is_err());
    }

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(JobId::generate(), JobId::generate());
        assert_eq!(JobId::from("job-1").as_str(), "job-1");
    }
}
