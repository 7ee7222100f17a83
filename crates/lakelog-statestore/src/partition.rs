//! The partition tree.
//!
//! Partitions divide a table's row-key space into regions. The tree starts as
//! a single root covering everything; splitting a leaf turns it into an
//! internal node with two new leaf children. Only leaves receive new data.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateStoreError};

/// Conventional ID of the root partition.
pub const ROOT_PARTITION_ID: &str = "root";

/// Type of a row key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Signed 64-bit integer.
    Long,
    /// UTF-8 string.
    String,
    /// Raw bytes.
    Bytes,
}

/// A row key value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Key {
    /// Integer key.
    Long(i64),
    /// String key.
    String(String),
    /// Byte key.
    Bytes(Vec<u8>),
}

impl Key {
    /// The smallest key of a type.
    #[must_use]
    pub fn min_of(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Long => Self::Long(i64::MIN),
            KeyType::String => Self::String(String::new()),
            KeyType::Bytes => Self::Bytes(Vec::new()),
        }
    }

    /// Returns the type of this key.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::Long(_) => KeyType::Long,
            Self::String(_) => KeyType::String,
            Self::Bytes(_) => KeyType::Bytes,
        }
    }
}

/// A named row key field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowKeyField {
    /// Field name.
    pub name: String,
    /// Field type.
    pub key_type: KeyType,
}

impl RowKeyField {
    /// Creates a field.
    #[must_use]
    pub fn new(name: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            name: name.into(),
            key_type,
        }
    }
}

/// A half-open range over one row key field: `min` inclusive, `max` exclusive.
///
/// `max == None` means unbounded above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// Field this range constrains.
    pub field: String,
    /// Inclusive lower bound.
    pub min: Key,
    /// Exclusive upper bound, `None` for unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Key>,
}

impl Range {
    /// Returns true if `key` lies in the range.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        key >= &self.min && self.max.as_ref().is_none_or(|max| key < max)
    }
}

/// The part of the key space a partition covers: one range per row key field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Region {
    /// Ranges in row key field order.
    pub ranges: Vec<Range>,
}

impl Region {
    /// The region covering every key of the given fields.
    #[must_use]
    pub fn everything(fields: &[RowKeyField]) -> Self {
        Self {
            ranges: fields
                .iter()
                .map(|f| Range {
                    field: f.name.clone(),
                    min: Key::min_of(f.key_type),
                    max: None,
                })
                .collect(),
        }
    }

    /// Returns true if every component of `keys` lies in the matching range.
    #[must_use]
    pub fn contains(&self, keys: &[Key]) -> bool {
        keys.len() == self.ranges.len()
            && self.ranges.iter().zip(keys).all(|(r, k)| r.contains(k))
    }
}

/// A node in the partition tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    /// Partition ID.
    pub id: String,
    /// Key space covered.
    pub region: Region,
    /// Parent partition, `None` for the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Child partition IDs (empty for leaves).
    #[serde(default)]
    pub child_ids: Vec<String>,
    /// True if the partition has not been split.
    pub is_leaf: bool,
    /// Index of the row key field the partition was split on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
}

impl Partition {
    /// Creates a leaf partition.
    #[must_use]
    pub fn leaf(id: impl Into<String>, region: Region, parent_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            region,
            parent_id,
            child_ids: Vec::new(),
            is_leaf: true,
            dimension: None,
        }
    }

    /// Returns true if this is the root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// The three partitions produced by splitting a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPartitions {
    /// The former leaf, now internal.
    pub parent: Partition,
    /// Left child, keys below the split point.
    pub left: Partition,
    /// Right child, keys at or above the split point.
    pub right: Partition,
}

/// Constructors for consistent partition trees.
pub struct PartitionTree;

impl PartitionTree {
    /// A single root partition covering all keys.
    #[must_use]
    pub fn root(fields: &[RowKeyField]) -> Partition {
        Partition::leaf(ROOT_PARTITION_ID, Region::everything(fields), None)
    }

    /// Splits a leaf on one dimension at `split_key`.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::PartitionNotLeaf`] if `parent` is not a leaf,
    /// or [`StateStoreError::InvalidRequest`] if the dimension is out of range,
    /// the key type does not match, or the key is not strictly inside the range.
    pub fn split(
        parent: &Partition,
        dimension: usize,
        split_key: Key,
        left_id: impl Into<String>,
        right_id: impl Into<String>,
    ) -> Result<SplitPartitions> {
        if !parent.is_leaf {
            return Err(StateStoreError::PartitionNotLeaf {
                partition_id: parent.id.clone(),
            });
        }
        let range = parent.region.ranges.get(dimension).ok_or_else(|| {
            StateStoreError::invalid_request(format!(
                "dimension {dimension} out of range for partition {}",
                parent.id
            ))
        })?;
        if split_key.key_type() != range.min.key_type() {
            return Err(StateStoreError::invalid_request(format!(
                "split key type {:?} does not match field {}",
                split_key.key_type(),
                range.field
            )));
        }
        if split_key <= range.min || range.max.as_ref().is_some_and(|max| &split_key >= max) {
            return Err(StateStoreError::invalid_request(format!(
                "split key must lie strictly inside partition {} on field {}",
                parent.id, range.field
            )));
        }

        let left_id = left_id.into();
        let right_id = right_id.into();

        let mut left_region = parent.region.clone();
        left_region.ranges[dimension].max = Some(split_key.clone());
        let mut right_region = parent.region.clone();
        right_region.ranges[dimension].min = split_key;

        let new_parent = Partition {
            child_ids: vec![left_id.clone(), right_id.clone()],
            is_leaf: false,
            dimension: Some(dimension),
            ..parent.clone()
        };

        Ok(SplitPartitions {
            left: Partition::leaf(left_id, left_region, Some(parent.id.clone())),
            right: Partition::leaf(right_id, right_region, Some(parent.id.clone())),
            parent: new_parent,
        })
    }
}

/// Checks that `partitions` form one connected, consistent tree.
///
/// # Errors
///
/// Returns [`StateStoreError::InvalidPartitionTree`] describing the first
/// problem found.
pub fn validate_tree(partitions: &[Partition]) -> Result<()> {
    if partitions.is_empty() {
        return Err(StateStoreError::invalid_tree("no partitions"));
    }

    let mut by_id: BTreeMap<&str, &Partition> = BTreeMap::new();
    for partition in partitions {
        if by_id.insert(partition.id.as_str(), partition).is_some() {
            return Err(StateStoreError::invalid_tree(format!(
                "duplicate partition id {}",
                partition.id
            )));
        }
    }

    let roots: Vec<&Partition> = partitions.iter().filter(|p| p.is_root()).collect();
    let [root] = roots.as_slice() else {
        return Err(StateStoreError::invalid_tree(format!(
            "expected exactly one root, found {}",
            roots.len()
        )));
    };

    for partition in partitions {
        check_node(partition, &by_id)?;
    }

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut queue: VecDeque<&Partition> = VecDeque::from([*root]);
    while let Some(node) = queue.pop_front() {
        if !seen.insert(node.id.as_str()) {
            return Err(StateStoreError::invalid_tree(format!(
                "cycle through partition {}",
                node.id
            )));
        }
        for child in &node.child_ids {
            if let Some(child) = by_id.get(child.as_str()) {
                queue.push_back(child);
            }
        }
    }
    if seen.len() != partitions.len() {
        return Err(StateStoreError::invalid_tree(format!(
            "{} partitions unreachable from root",
            partitions.len() - seen.len()
        )));
    }

    Ok(())
}

fn check_node(partition: &Partition, by_id: &BTreeMap<&str, &Partition>) -> Result<()> {
    if partition.is_leaf && !partition.child_ids.is_empty() {
        return Err(StateStoreError::invalid_tree(format!(
            "leaf partition {} has children",
            partition.id
        )));
    }
    if !partition.is_leaf && (partition.child_ids.is_empty() || partition.dimension.is_none()) {
        return Err(StateStoreError::invalid_tree(format!(
            "internal partition {} needs children and a split dimension",
            partition.id
        )));
    }
    if let Some(parent_id) = &partition.parent_id {
        let parent = by_id.get(parent_id.as_str()).ok_or_else(|| {
            StateStoreError::invalid_tree(format!(
                "partition {} names missing parent {parent_id}",
                partition.id
            ))
        })?;
        if !parent.child_ids.contains(&partition.id) {
            return Err(StateStoreError::invalid_tree(format!(
                "parent {parent_id} does not list child {}",
                partition.id
            )));
        }
    }
    for child_id in &partition.child_ids {
        let child = by_id.get(child_id.as_str()).ok_or_else(|| {
            StateStoreError::invalid_tree(format!(
                "partition {} names missing child {child_id}",
                partition.id
            ))
        })?;
        if child.parent_id.as_deref() != Some(partition.id.as_str()) {
            return Err(StateStoreError::invalid_tree(format!(
                "child {child_id} does not name parent {}",
                partition.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<RowKeyField> {
        vec![RowKeyField::new("key", KeyType::Long)]
    }

    #[test]
    fn root_covers_everything() {
        let root = PartitionTree::root(&fields());
        assert!(root.is_root());
        assert!(root.is_leaf);
        assert!(root.region.contains(&[Key::Long(i64::MIN)]));
        assert!(root.region.contains(&[Key::Long(i64::MAX)]));
        validate_tree(&[root]).unwrap();
    }

    #[test]
    fn split_produces_a_valid_tree() {
        let root = PartitionTree::root(&fields());
        let split = PartitionTree::split(&root, 0, Key::Long(100), "left", "right").unwrap();

        assert!(split.left.region.contains(&[Key::Long(99)]));
        assert!(!split.left.region.contains(&[Key::Long(100)]));
        assert!(split.right.region.contains(&[Key::Long(100)]));
        assert_eq!(split.parent.child_ids, vec!["left", "right"]);
        assert_eq!(split.parent.dimension, Some(0));

        validate_tree(&[split.parent, split.left, split.right]).unwrap();
    }

    #[test]
    fn split_rejects_keys_outside_range() {
        let root = PartitionTree::root(&fields());
        let split = PartitionTree::split(&root, 0, Key::Long(100), "left", "right").unwrap();

        let err = PartitionTree::split(&split.left, 0, Key::Long(200), "a", "b").unwrap_err();
        assert!(matches!(err, StateStoreError::InvalidRequest { .. }));

        let err =
            PartitionTree::split(&split.left, 0, Key::String("x".into()), "a", "b").unwrap_err();
        assert!(matches!(err, StateStoreError::InvalidRequest { .. }));

        let err = PartitionTree::split(&split.parent, 0, Key::Long(5), "a", "b").unwrap_err();
        assert!(matches!(err, StateStoreError::PartitionNotLeaf { .. }));
    }

    #[test]
    fn validate_rejects_two_roots() {
        let a = Partition::leaf("a", Region::default(), None);
        let b = Partition::leaf("b", Region::default(), None);
        assert!(matches!(
            validate_tree(&[a, b]),
            Err(StateStoreError::InvalidPartitionTree { .. })
        ));
    }

    #[test]
    fn validate_rejects_orphans_and_inconsistent_links() {
        let root = PartitionTree::root(&fields());
        let orphan = Partition::leaf("orphan", Region::default(), Some("nowhere".into()));
        assert!(validate_tree(&[root.clone(), orphan]).is_err());

        let unlisted = Partition::leaf("child", Region::default(), Some(ROOT_PARTITION_ID.into()));
        assert!(validate_tree(&[root, unlisted]).is_err());
    }

    #[test]
    fn key_serde_is_tagged() {
        let json = serde_json::to_string(&Key::Long(5)).unwrap();
        assert_eq!(json, r#"{"type":"long","value":5}"#);
    }
}
