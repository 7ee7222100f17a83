//! Parquet encoding of materialized state.
//!
//! A files snapshot has one row per reference, plus one row with a null
//! partition for each file that has no references. A partitions snapshot has
//! one row per partition. Both carry the entity type and the transaction
//! number they reflect in the Parquet key/value metadata, so an object is
//! self-describing without its metadata row.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array as _, BooleanArray, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lakelog_core::{EntityType, JobId};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use crate::error::Result;
use crate::file_reference::{AllReferencesToAFile, FileReference};
use crate::partition::{Partition, Region};
use crate::state::{StateStoreFiles, StateStorePartitions};

const CREATED_BY: &str = "lakelog-statestore";
const ENTITY_KEY: &str = "lakelog.entity";
const TRANSACTION_NUMBER_KEY: &str = "lakelog.transaction_number";

fn codec_error(context: &str, cause: impl std::fmt::Display) -> crate::error::StateStoreError {
    lakelog_core::Error::serialization(context, cause).into()
}

fn files_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("filename", DataType::Utf8, false),
        Field::new("partition_id", DataType::Utf8, true),
        Field::new("number_of_records", DataType::Int64, true),
        Field::new("job_id", DataType::Utf8, true),
        Field::new("count_approximate", DataType::Boolean, true),
        Field::new("only_contains_data_for_this_partition", DataType::Boolean, true),
        Field::new("reference_update_time_ms", DataType::Int64, true),
        Field::new("external_reference_count", DataType::Int64, false),
        Field::new("file_update_time_ms", DataType::Int64, false),
    ]))
}

fn partitions_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("partition_id", DataType::Utf8, false),
        Field::new("parent_id", DataType::Utf8, true),
        Field::new("child_ids", DataType::Utf8, false),
        Field::new("is_leaf", DataType::Boolean, false),
        Field::new("dimension", DataType::Int64, true),
        Field::new("region", DataType::Utf8, false),
    ]))
}

fn writer_properties(entity: EntityType, transaction_number: u64) -> WriterProperties {
    let kv = |key: &str, value: String| KeyValue {
        key: key.to_string(),
        value: Some(value),
    };
    WriterProperties::builder()
        .set_key_value_metadata(Some(vec![
            kv("created_by", CREATED_BY.to_string()),
            kv(ENTITY_KEY, entity.as_str().to_string()),
            kv(TRANSACTION_NUMBER_KEY, transaction_number.to_string()),
        ]))
        .build()
}

fn write_single_batch(
    schema: Arc<Schema>,
    batch: &RecordBatch,
    props: WriterProperties,
) -> Result<Bytes> {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer = ArrowWriter::try_new(&mut cursor, schema, Some(props))
        .map_err(|e| codec_error("parquet writer init failed", e))?;
    writer
        .write(batch)
        .map_err(|e| codec_error("parquet write failed", e))?;
    writer
        .close()
        .map_err(|e| codec_error("parquet close failed", e))?;
    Ok(Bytes::from(cursor.into_inner()))
}

/// Reads all batches and checks the snapshot header.
fn read_batches(bytes: &Bytes, expected: EntityType) -> Result<(Vec<RecordBatch>, u64)> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes.clone())
        .map_err(|e| codec_error("parquet reader init failed", e))?;

    let metadata: BTreeMap<String, String> = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .map(|kvs| {
            kvs.iter()
                .filter_map(|kv| kv.value.clone().map(|v| (kv.key.clone(), v)))
                .collect()
        })
        .unwrap_or_default();

    let entity = metadata.get(ENTITY_KEY).map(String::as_str);
    if entity != Some(expected.as_str()) {
        return Err(codec_error(
            "snapshot header",
            format!("expected {expected} snapshot, found {entity:?}"),
        ));
    }
    let transaction_number = metadata
        .get(TRANSACTION_NUMBER_KEY)
        .ok_or_else(|| codec_error("snapshot header", "missing transaction number"))?
        .parse::<u64>()
        .map_err(|e| codec_error("snapshot transaction number", e))?;

    let reader = builder
        .build()
        .map_err(|e| codec_error("parquet reader build failed", e))?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| codec_error("parquet read batch failed", e))?);
    }
    Ok((batches, transaction_number))
}

fn col_string<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| codec_error("snapshot schema", format!("column '{name}' is not Utf8")))
}

fn col_i64<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| codec_error("snapshot schema", format!("column '{name}' is not Int64")))
}

fn col_bool<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a BooleanArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<BooleanArray>())
        .ok_or_else(|| codec_error("snapshot schema", format!("column '{name}' is not Boolean")))
}

fn opt_str(array: &StringArray, row: usize) -> Option<&str> {
    (!array.is_null(row)).then(|| array.value(row))
}

fn opt_i64(array: &Int64Array, row: usize) -> Option<i64> {
    (!array.is_null(row)).then(|| array.value(row))
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|e| codec_error(what, e))
}

fn to_u64(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|e| codec_error(what, e))
}

fn millis_to_time(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| codec_error("snapshot timestamp", format!("{ms} out of range")))
}

#[derive(Default)]
struct FileRows<'a> {
    filename: Vec<&'a str>,
    partition_id: Vec<Option<&'a str>>,
    number_of_records: Vec<Option<i64>>,
    job_id: Vec<Option<&'a str>>,
    count_approximate: Vec<Option<bool>>,
    only_this_partition: Vec<Option<bool>>,
    reference_update_ms: Vec<Option<i64>>,
    external_count: Vec<i64>,
    file_update_ms: Vec<i64>,
}

impl<'a> FileRows<'a> {
    fn push_file_columns(&mut self, file: &'a AllReferencesToAFile) -> Result<()> {
        self.filename.push(&file.filename);
        self.external_count
            .push(to_i64(file.external_reference_count, "external reference count")?);
        self.file_update_ms.push(file.last_update_time.timestamp_millis());
        Ok(())
    }

    fn push_reference(&mut self, file: &'a AllReferencesToAFile, r: &'a FileReference) -> Result<()> {
        self.push_file_columns(file)?;
        self.partition_id.push(Some(&r.partition_id));
        self.number_of_records
            .push(Some(to_i64(r.number_of_records, "number of records")?));
        self.job_id.push(r.job_id.as_ref().map(JobId::as_str));
        self.count_approximate.push(Some(r.count_approximate));
        self.only_this_partition
            .push(Some(r.only_contains_data_for_this_partition));
        self.reference_update_ms
            .push(r.last_update_time.map(|t| t.timestamp_millis()));
        Ok(())
    }

    fn push_unreferenced(&mut self, file: &'a AllReferencesToAFile) -> Result<()> {
        self.push_file_columns(file)?;
        self.partition_id.push(None);
        self.number_of_records.push(None);
        self.job_id.push(None);
        self.count_approximate.push(None);
        self.only_this_partition.push(None);
        self.reference_update_ms.push(None);
        Ok(())
    }
}

/// Encodes files state.
///
/// # Errors
///
/// Returns a serialization error if a count overflows or Parquet encoding fails.
pub fn write_files(state: &StateStoreFiles, transaction_number: u64) -> Result<Bytes> {
    let schema = files_schema();
    let mut rows = FileRows::default();
    for file in state.files() {
        if file.references.is_empty() {
            rows.push_unreferenced(file)?;
        }
        for reference in file.iter_references() {
            rows.push_reference(file, reference)?;
        }
    }

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(rows.filename)),
            Arc::new(StringArray::from(rows.partition_id)),
            Arc::new(Int64Array::from(rows.number_of_records)),
            Arc::new(StringArray::from(rows.job_id)),
            Arc::new(BooleanArray::from(rows.count_approximate)),
            Arc::new(BooleanArray::from(rows.only_this_partition)),
            Arc::new(Int64Array::from(rows.reference_update_ms)),
            Arc::new(Int64Array::from(rows.external_count)),
            Arc::new(Int64Array::from(rows.file_update_ms)),
        ],
    )
    .map_err(|e| codec_error("record batch build failed", e))?;

    write_single_batch(
        schema,
        &batch,
        writer_properties(EntityType::Files, transaction_number),
    )
}

/// Decodes files state.
///
/// # Errors
///
/// Returns a serialization error if the object is not a files snapshot.
pub fn read_files(bytes: &Bytes) -> Result<(StateStoreFiles, u64)> {
    let (batches, transaction_number) = read_batches(bytes, EntityType::Files)?;
    let mut files: BTreeMap<String, AllReferencesToAFile> = BTreeMap::new();

    for batch in &batches {
        let filename = col_string(batch, "filename")?;
        let partition_id = col_string(batch, "partition_id")?;
        let number_of_records = col_i64(batch, "number_of_records")?;
        let job_id = col_string(batch, "job_id")?;
        let count_approximate = col_bool(batch, "count_approximate")?;
        let only_this_partition = col_bool(batch, "only_contains_data_for_this_partition")?;
        let reference_update_ms = col_i64(batch, "reference_update_time_ms")?;
        let external_count = col_i64(batch, "external_reference_count")?;
        let file_update_ms = col_i64(batch, "file_update_time_ms")?;

        for row in 0..batch.num_rows() {
            let name = filename.value(row);
            let file = match files.entry(name.to_string()) {
                std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::btree_map::Entry::Vacant(e) => {
                    let mut file = AllReferencesToAFile::unreferenced(
                        name,
                        millis_to_time(file_update_ms.value(row))?,
                    );
                    file.external_reference_count =
                        to_u64(external_count.value(row), "external reference count")?;
                    e.insert(file)
                }
            };

            let Some(partition) = opt_str(partition_id, row) else {
                continue;
            };
            let records = opt_i64(number_of_records, row)
                .ok_or_else(|| codec_error("files snapshot", "reference without record count"))?;
            let reference = FileReference {
                filename: name.to_string(),
                partition_id: partition.to_string(),
                number_of_records: to_u64(records, "number of records")?,
                job_id: opt_str(job_id, row).map(JobId::new),
                count_approximate: !count_approximate.is_null(row)
                    && count_approximate.value(row),
                only_contains_data_for_this_partition: only_this_partition.is_null(row)
                    || only_this_partition.value(row),
                last_update_time: opt_i64(reference_update_ms, row)
                    .map(millis_to_time)
                    .transpose()?,
            };
            file.references.insert(partition.to_string(), reference);
        }
    }

    Ok((StateStoreFiles::from_files(files.into_values()), transaction_number))
}

/// Encodes the partition tree.
///
/// # Errors
///
/// Returns a serialization error if encoding fails.
pub fn write_partitions(state: &StateStorePartitions, transaction_number: u64) -> Result<Bytes> {
    let schema = partitions_schema();
    let partitions: Vec<&Partition> = state.partitions().collect();

    let mut child_ids = Vec::with_capacity(partitions.len());
    let mut regions = Vec::with_capacity(partitions.len());
    let mut dimensions = Vec::with_capacity(partitions.len());
    for p in &partitions {
        child_ids.push(
            serde_json::to_string(&p.child_ids).map_err(|e| codec_error("encode child ids", e))?,
        );
        regions.push(
            serde_json::to_string(&p.region).map_err(|e| codec_error("encode region", e))?,
        );
        dimensions.push(
            p.dimension
                .map(|d| to_i64(d as u64, "split dimension"))
                .transpose()?,
        );
    }

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(
                partitions.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                partitions
                    .iter()
                    .map(|p| p.parent_id.as_deref())
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(child_ids)),
            Arc::new(BooleanArray::from(
                partitions.iter().map(|p| p.is_leaf).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(dimensions)),
            Arc::new(StringArray::from(regions)),
        ],
    )
    .map_err(|e| codec_error("record batch build failed", e))?;

    write_single_batch(
        schema,
        &batch,
        writer_properties(EntityType::Partitions, transaction_number),
    )
}

/// Decodes the partition tree.
///
/// # Errors
///
/// Returns a serialization error if the object is not a partitions snapshot.
pub fn read_partitions(bytes: &Bytes) -> Result<(StateStorePartitions, u64)> {
    let (batches, transaction_number) = read_batches(bytes, EntityType::Partitions)?;
    let mut partitions = Vec::new();

    for batch in &batches {
        let ids = col_string(batch, "partition_id")?;
        let parents = col_string(batch, "parent_id")?;
        let child_ids = col_string(batch, "child_ids")?;
        let is_leaf = col_bool(batch, "is_leaf")?;
        let dimension = col_i64(batch, "dimension")?;
        let region = col_string(batch, "region")?;

        for row in 0..batch.num_rows() {
            let children: Vec<String> = serde_json::from_str(child_ids.value(row))
                .map_err(|e| codec_error("decode child ids", e))?;
            let region: Region = serde_json::from_str(region.value(row))
                .map_err(|e| codec_error("decode region", e))?;
            let dimension = opt_i64(dimension, row)
                .map(|d| {
                    usize::try_from(d).map_err(|e| codec_error("decode split dimension", e))
                })
                .transpose()?;
            partitions.push(Partition {
                id: ids.value(row).to_string(),
                region,
                parent_id: opt_str(parents, row).map(str::to_string),
                child_ids: children,
                is_leaf: is_leaf.value(row),
                dimension,
            });
        }
    }

    Ok((StateStorePartitions::from_partitions(partitions), transaction_number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{Key, KeyType, PartitionTree, RowKeyField};
    use crate::transaction::{FileTransaction, LogTransaction, PartitionTransaction};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn files_snapshot_preserves_unreferenced_files_and_jobs() {
        let mut state = StateStoreFiles::default();
        let add = FileTransaction::AddFiles {
            files: vec![
                FileReference::new("a", "left", 10),
                FileReference::new("a", "right", 20),
                FileReference::new("b", "left", 5),
            ],
        };
        add.apply(&mut state, at(0));
        let mut b = state.file("b").unwrap().clone();
        b.references.clear();
        b.last_update_time = at(3);
        state.insert_file(b);
        if let Some(a) = state.file_mut("a") {
            a.references.get_mut("left").unwrap().job_id = Some(JobId::new("j1"));
        }

        let bytes = write_files(&state, 42).unwrap();
        let (decoded, number) = read_files(&bytes).unwrap();
        assert_eq!(number, 42);
        assert_eq!(decoded, state);
        assert!(decoded.file("b").unwrap().is_unreferenced());
    }

    #[test]
    fn partitions_snapshot_preserves_tree() {
        let fields = vec![
            RowKeyField::new("id", KeyType::String),
            RowKeyField::new("ts", KeyType::Long),
        ];
        let root = PartitionTree::root(&fields);
        let split = PartitionTree::split(&root, 1, Key::Long(0), "neg", "pos").unwrap();
        let mut state = StateStorePartitions::default();
        PartitionTransaction::InitialisePartitions {
            partitions: vec![split.parent, split.left, split.right],
        }
        .apply(&mut state, at(0));

        let bytes = write_partitions(&state, 2).unwrap();
        let (decoded, number) = read_partitions(&bytes).unwrap();
        assert_eq!(number, 2);
        assert_eq!(decoded, state);
    }

    #[test]
    fn empty_states_roundtrip() {
        let (files, n) = read_files(&write_files(&StateStoreFiles::default(), 0).unwrap()).unwrap();
        assert!(files.is_empty());
        assert_eq!(n, 0);
    }

    #[test]
    fn wrong_entity_is_rejected() {
        let bytes = write_partitions(&StateStorePartitions::default(), 1).unwrap();
        assert!(read_files(&bytes).is_err());
    }
}
