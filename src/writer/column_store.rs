use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Int64Array, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch as ArrowRecordBatch;
use async_trait::async_trait;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use super::{unique_filename, RecordBatch, Validation, WriteOutcome, Writer};

/// Writer backend that produces ZSTD-compressed parquet files with an
/// explicit, stable schema. Every field is typed, with JSON payload
/// fields stored as `Utf8` rather than inferred.
pub struct ColumnStoreWriter {
    row_group_size: usize,
}

impl ColumnStoreWriter {
    pub fn new(row_group_size: usize) -> Self {
        Self { row_group_size }
    }

    fn updates_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("update_id", DataType::Utf8, false),
            Field::new("migration_id", DataType::UInt32, false),
            Field::new("synchronizer_id", DataType::Utf8, false),
            Field::new("effective_at", DataType::Int64, false),
            Field::new("update_type", DataType::Utf8, false),
            Field::new("update_data", DataType::Utf8, false),
        ]))
    }

    fn events_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("event_id", DataType::Utf8, false),
            Field::new("update_id", DataType::Utf8, false),
            Field::new("migration_id", DataType::UInt32, false),
            Field::new("effective_at", DataType::Int64, false),
            Field::new("event_type", DataType::Utf8, false),
            Field::new("raw_event", DataType::Utf8, false),
        ]))
    }

    fn to_arrow_batch(batch: &RecordBatch) -> Result<(Arc<Schema>, ArrowRecordBatch)> {
        match batch {
            RecordBatch::Updates(records) => {
                let schema = Self::updates_schema();
                let update_id: ArrayRef = Arc::new(StringArray::from_iter_values(
                    records.iter().map(|r| r.update_id.as_str()),
                ));
                let migration_id: ArrayRef =
                    Arc::new(UInt32Array::from_iter_values(records.iter().map(|r| r.migration_id)));
                let synchronizer_id: ArrayRef = Arc::new(StringArray::from_iter_values(
                    records.iter().map(|r| r.synchronizer_id.as_str()),
                ));
                let effective_at: ArrayRef = Arc::new(Int64Array::from_iter_values(
                    records.iter().map(|r| r.effective_at.timestamp_millis()),
                ));
                let update_type: ArrayRef = Arc::new(StringArray::from_iter_values(
                    records.iter().map(|r| r.update_type.as_str()),
                ));
                let update_data: ArrayRef = Arc::new(StringArray::from_iter_values(
                    records.iter().map(|r| r.update_data.to_string()),
                ));
                let arrow_batch = ArrowRecordBatch::try_new(
                    schema.clone(),
                    vec![update_id, migration_id, synchronizer_id, effective_at, update_type, update_data],
                )?;
                Ok((schema, arrow_batch))
            }
            RecordBatch::Events(records) => {
                let schema = Self::events_schema();
                let event_id: ArrayRef = Arc::new(StringArray::from_iter_values(
                    records.iter().map(|r| r.event_id.as_str()),
                ));
                let update_id: ArrayRef = Arc::new(StringArray::from_iter_values(
                    records.iter().map(|r| r.update_id.as_str()),
                ));
                let migration_id: ArrayRef =
                    Arc::new(UInt32Array::from_iter_values(records.iter().map(|r| r.migration_id)));
                let effective_at: ArrayRef = Arc::new(Int64Array::from_iter_values(
                    records.iter().map(|r| r.effective_at.timestamp_millis()),
                ));
                let event_type: ArrayRef = Arc::new(StringArray::from_iter_values(
                    records.iter().map(|r| r.event_type.as_str()),
                ));
                let raw_event: ArrayRef = Arc::new(StringArray::from_iter_values(
                    records.iter().map(|r| r.raw_event.to_string()),
                ));
                let arrow_batch = ArrowRecordBatch::try_new(
                    schema.clone(),
                    vec![event_id, update_id, migration_id, effective_at, event_type, raw_event],
                )?;
                Ok((schema, arrow_batch))
            }
        }
    }

    fn required_columns(batch: &RecordBatch) -> &'static [&'static str] {
        match batch {
            RecordBatch::Updates(_) => &["update_id", "update_type", "update_data"],
            RecordBatch::Events(_) => &["event_id", "event_type", "raw_event"],
        }
    }
}

#[async_trait]
impl Writer for ColumnStoreWriter {
    fn name(&self) -> &'static str {
        "column_store"
    }

    async fn write_batch(
        &self,
        data_dir: &Path,
        partition: &str,
        batch: &RecordBatch,
    ) -> Result<WriteOutcome> {
        let dir = data_dir.join(partition);
        let row_group_size = self.row_group_size;
        let required = Self::required_columns(batch);
        let (schema, arrow_batch) = Self::to_arrow_batch(batch)?;
        let filename = unique_filename("part", "parquet");
        let path = dir.join(&filename);

        let write_dir = dir.clone();
        let write_path = path.clone();
        let count = arrow_batch.num_rows();

        let (bytes, row_count, validation) = tokio::task::spawn_blocking(move || -> Result<_> {
            std::fs::create_dir_all(&write_dir).context("creating partition directory")?;
            let file = File::create(&write_path).context("creating parquet file")?;
            let props = WriterProperties::builder()
                .set_compression(Compression::ZSTD(Default::default()))
                .set_max_row_group_size(row_group_size)
                .build();
            let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))
                .context("constructing arrow writer")?;
            writer.write(&arrow_batch).context("writing record batch")?;
            writer.close().context("closing parquet writer")?;

            let bytes = std::fs::metadata(&write_path)
                .context("stat-ing written file")?
                .len();
            let validation = validate_file_sync(&write_path, required)?;
            Ok((bytes, validation.row_count, validation))
        })
        .await
        .context("writer worker panicked")??;

        Ok(WriteOutcome {
            file: path,
            count: row_count,
            bytes,
            validation,
        })
    }

    async fn validate(&self, file: &Path) -> Result<Validation> {
        // All of updates' and events' required columns; whichever subset is
        // actually present in the file's schema is what we check against.
        let required = ["update_id", "update_type", "update_data", "event_id", "event_type", "raw_event"];
        let path = file.to_path_buf();
        tokio::task::spawn_blocking(move || validate_file_sync(&path, &required))
            .await
            .context("validator worker panicked")?
    }
}

/// Opens the file, reads row count + schema, confirms required columns are
/// present, and samples up to 100 rows to confirm key columns are
/// non-null.
fn validate_file_sync(path: &Path, required_candidates: &[&str]) -> Result<Validation> {
    let file = File::open(path).context("opening parquet file for validation")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let schema = builder.schema().clone();
    let present: Vec<&str> = required_candidates
        .iter()
        .copied()
        .filter(|name| schema.field_with_name(name).is_ok())
        .collect();

    let mut issues = Vec::new();
    let required_for_kind: &[&str] = if present.contains(&"update_id") {
        &["update_id", "update_type", "update_data"]
    } else {
        &["event_id", "event_type", "raw_event"]
    };
    for col in required_for_kind {
        if schema.field_with_name(col).is_err() {
            issues.push(format!("missing required column: {col}"));
        }
    }

    let mut row_count = 0usize;
    let mut sampled = 0usize;
    let reader = builder.with_batch_size(100).build().context("building row reader")?;
    for batch in reader {
        let batch = batch.context("reading record batch")?;
        row_count += batch.num_rows();
        if sampled < 100 {
            for col in required_for_kind {
                if let Ok(idx) = batch.schema().index_of(col) {
                    let array = batch.column(idx);
                    if array.null_count() > 0 {
                        issues.push(format!("column {col} contains null values in sample"));
                    }
                }
            }
            sampled += batch.num_rows();
        }
    }

    Ok(Validation {
        valid: issues.is_empty(),
        issues,
        row_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, UpdateRecord};
    use chrono::Utc;

    fn sample_update_batch() -> RecordBatch {
        RecordBatch::Updates(vec![UpdateRecord {
            update_id: "u1".to_string(),
            migration_id: 1,
            synchronizer_id: "sync-a".to_string(),
            effective_at: Utc::now(),
            update_type: "transaction".to_string(),
            update_data: serde_json::json!({"a": 1}),
        }])
    }

    #[tokio::test]
    async fn writes_readable_validated_parquet_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ColumnStoreWriter::new(100_000);
        let batch = sample_update_batch();
        let outcome = writer
            .write_batch(dir.path(), "updates/migration=1/year=2024/month=1/day=1", &batch)
            .await
            .unwrap();
        assert_eq!(outcome.count, 1);
        assert!(outcome.validation.valid, "{:?}", outcome.validation.issues);

        let revalidated = writer.validate(&outcome.file).await.unwrap();
        assert_eq!(revalidated.row_count, outcome.validation.row_count);
        assert_eq!(revalidated.valid, outcome.validation.valid);
    }

    #[test]
    fn event_type_unused_import_guard() {
        let _ = EventType::Created;
    }
}
