//! File references and per-file reference aggregates.
//!
//! A physical data file may hold rows for several partitions (after a
//! partition split, before compaction rewrites it). Each partition's claim is
//! a [`FileReference`]; [`AllReferencesToAFile`] gathers all claims on one
//! file and is the unit the garbage collector reasons about.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use lakelog_core::JobId;
use serde::{Deserialize, Serialize};

/// One partition's claim on a physical file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    /// Physical file name (identity of the file).
    pub filename: String,
    /// Partition holding this reference.
    pub partition_id: String,
    /// Number of records for this partition in the file.
    pub number_of_records: u64,
    /// Compaction job this reference is assigned to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// True if `number_of_records` is an estimate.
    #[serde(default)]
    pub count_approximate: bool,
    /// True if the file holds no rows outside this partition.
    #[serde(default = "default_true")]
    pub only_contains_data_for_this_partition: bool,
    /// When the reference last changed. Set by the state store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

const fn default_true() -> bool {
    true
}

impl FileReference {
    /// Creates an exact, unassigned reference that covers the whole file.
    #[must_use]
    pub fn new(
        filename: impl Into<String>,
        partition_id: impl Into<String>,
        number_of_records: u64,
    ) -> Self {
        Self {
            filename: filename.into(),
            partition_id: partition_id.into(),
            number_of_records,
            job_id: None,
            count_approximate: false,
            only_contains_data_for_this_partition: true,
            last_update_time: None,
        }
    }

    /// Returns a copy assigned to `job_id`.
    #[must_use]
    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    /// Returns a copy marked as approximate and shared with other partitions.
    #[must_use]
    pub fn split_into(&self, partition_id: impl Into<String>, number_of_records: u64) -> Self {
        Self {
            filename: self.filename.clone(),
            partition_id: partition_id.into(),
            number_of_records,
            job_id: None,
            count_approximate: true,
            only_contains_data_for_this_partition: false,
            last_update_time: None,
        }
    }

    /// Returns a copy with the update time set.
    #[must_use]
    pub(crate) fn at(mut self, update_time: DateTime<Utc>) -> Self {
        self.last_update_time = Some(update_time);
        self
    }
}

/// Every reference to one physical file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllReferencesToAFile {
    /// Physical file name.
    pub filename: String,
    /// References keyed by partition ID.
    pub references: BTreeMap<String, FileReference>,
    /// Holds on the file from outside the partition tree.
    #[serde(default)]
    pub external_reference_count: u64,
    /// When any reference to the file last changed.
    pub last_update_time: DateTime<Utc>,
}

impl AllReferencesToAFile {
    /// Creates an aggregate with no references.
    #[must_use]
    pub fn unreferenced(filename: impl Into<String>, last_update_time: DateTime<Utc>) -> Self {
        Self {
            filename: filename.into(),
            references: BTreeMap::new(),
            external_reference_count: 0,
            last_update_time,
        }
    }

    /// Internal references plus external holds.
    #[must_use]
    pub fn total_reference_count(&self) -> u64 {
        self.references.len() as u64 + self.external_reference_count
    }

    /// Returns true if nothing references the file.
    #[must_use]
    pub fn is_unreferenced(&self) -> bool {
        self.total_reference_count() == 0
    }

    /// Returns the reference held by `partition_id`.
    #[must_use]
    pub fn reference_in(&self, partition_id: &str) -> Option<&FileReference> {
        self.references.get(partition_id)
    }

    /// Iterates over the references in partition order.
    pub fn iter_references(&self) -> impl Iterator<Item = &FileReference> {
        self.references.values()
    }
}

/// Referenced files plus a bounded sample of unreferenced ones.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllReferencesToAllFiles {
    /// Files, referenced ones first in filename order.
    pub files: Vec<AllReferencesToAFile>,
    /// True if unreferenced files were left out to respect the limit.
    pub more_than_max: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_count_includes_external_holds() {
        let now = Utc::now();
        let mut file = AllReferencesToAFile::unreferenced("f1", now);
        assert!(file.is_unreferenced());

        file.references
            .insert("root".into(), FileReference::new("f1", "root", 10));
        file.external_reference_count = 1;
        assert_eq!(file.total_reference_count(), 2);
        assert!(file.reference_in("root").is_some());
        assert!(file.reference_in("left").is_none());
    }

    #[test]
    fn split_reference_is_approximate() {
        let original = FileReference::new("f1", "root", 100).with_job_id(JobId::new("j1"));
        let child = original.split_into("left", 50);
        assert_eq!(child.filename, "f1");
        assert!(child.count_approximate);
        assert!(!child.only_contains_data_for_this_partition);
        assert!(child.job_id.is_none());
    }

    #[test]
    fn serde_uses_camel_case_and_defaults() {
        let json = r#"{"filename":"f1","partitionId":"root","numberOfRecords":5}"#;
        let reference: FileReference = serde_json::from_str(json).unwrap();
        assert_eq!(reference, FileReference::new("f1", "root", 5));
    }
}
