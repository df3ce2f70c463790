use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use prost::Message;

use super::{unique_filename, RecordBatch, Validation, WriteOutcome, Writer};
use crate::model::{EventRecord, EventType, UpdateRecord};

pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/ledger_scan_ingester.rs"));
}

/// Number of records packed into one protobuf chunk before it's
/// zstd-compressed and framed.
pub const CHUNK_SIZE: usize = 2000;

/// Writer backend producing `.pb.zst` files: a sequence of
/// `u32_be(len) || zstd(protobuf_bytes)` frames, each frame holding up
/// to `CHUNK_SIZE` records. An alternative to the column-store backend.
pub struct ChunkedWriter {
    zstd_level: i32,
}

impl ChunkedWriter {
    pub fn new(zstd_level: i32) -> Self {
        Self { zstd_level }
    }
}

fn updates_to_proto(records: &[UpdateRecord]) -> proto::UpdateBatch {
    proto::UpdateBatch {
        records: records
            .iter()
            .map(|r| proto::UpdateRecord {
                update_id: r.update_id.clone(),
                migration_id: r.migration_id,
                synchronizer_id: r.synchronizer_id.clone(),
                effective_at_millis: r.effective_at.timestamp_millis(),
                update_type: r.update_type.clone(),
                update_data: r.update_data.to_string(),
            })
            .collect(),
    }
}

fn events_to_proto(records: &[EventRecord]) -> proto::EventBatch {
    proto::EventBatch {
        records: records
            .iter()
            .map(|r| proto::EventRecord {
                event_id: r.event_id.clone(),
                update_id: r.update_id.clone(),
                migration_id: r.migration_id,
                effective_at_millis: r.effective_at.timestamp_millis(),
                event_type: r.event_type.as_str().to_string(),
                raw_event: r.raw_event.to_string(),
            })
            .collect(),
    }
}

fn write_frame(out: &mut impl Write, payload: &[u8], level: i32) -> Result<u64> {
    let compressed = zstd::stream::encode_all(payload, level).context("zstd-compressing chunk")?;
    let len = compressed.len() as u32;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(&compressed)?;
    Ok(4 + compressed.len() as u64)
}

fn read_frame(input: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match input.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut compressed = vec![0u8; len];
    input.read_exact(&mut compressed).context("reading chunk frame body")?;
    let decompressed = zstd::stream::decode_all(compressed.as_slice()).context("zstd-decompressing chunk")?;
    Ok(Some(decompressed))
}

#[async_trait]
impl Writer for ChunkedWriter {
    fn name(&self) -> &'static str {
        "chunked"
    }

    async fn write_batch(
        &self,
        data_dir: &Path,
        partition: &str,
        batch: &RecordBatch,
    ) -> Result<WriteOutcome> {
        let dir = data_dir.join(partition);
        let filename = unique_filename("part", "pb.zst");
        let path = dir.join(&filename);
        let level = self.zstd_level;
        let count = batch.len();

        let write_dir = dir.clone();
        let write_path = path.clone();

        let outcome = match batch {
            RecordBatch::Updates(records) => {
                let records = records.clone();
                tokio::task::spawn_blocking(move || -> Result<(u64, Validation)> {
                    std::fs::create_dir_all(&write_dir)?;
                    let mut file = std::fs::File::create(&write_path)?;
                    let mut bytes = 0u64;
                    for chunk in records.chunks(CHUNK_SIZE) {
                        let proto_batch = updates_to_proto(chunk);
                        let payload = proto_batch.encode_to_vec();
                        bytes += write_frame(&mut file, &payload, level)?;
                    }
                    file.sync_all()?;
                    drop(file);
                    let validation = validate_updates_file(&write_path)?;
                    Ok((bytes, validation))
                })
                .await
                .context("chunked writer worker panicked")??
            }
            RecordBatch::Events(records) => {
                let records = records.clone();
                tokio::task::spawn_blocking(move || -> Result<(u64, Validation)> {
                    std::fs::create_dir_all(&write_dir)?;
                    let mut file = std::fs::File::create(&write_path)?;
                    let mut bytes = 0u64;
                    for chunk in records.chunks(CHUNK_SIZE) {
                        let proto_batch = events_to_proto(chunk);
                        let payload = proto_batch.encode_to_vec();
                        bytes += write_frame(&mut file, &payload, level)?;
                    }
                    file.sync_all()?;
                    drop(file);
                    let validation = validate_events_file(&write_path)?;
                    Ok((bytes, validation))
                })
                .await
                .context("chunked writer worker panicked")??
            }
        };

        let (bytes, validation) = outcome;
        Ok(WriteOutcome {
            file: path,
            count,
            bytes,
            validation,
        })
    }

    async fn validate(&self, file: &Path) -> Result<Validation> {
        let path = file.to_path_buf();
        let is_updates = path
            .parent()
            .and_then(|p| p.to_str())
            .map(|s| s.starts_with("updates") || s.contains("/updates"))
            .unwrap_or(true);
        tokio::task::spawn_blocking(move || {
            if is_updates {
                validate_updates_file(&path)
            } else {
                validate_events_file(&path)
            }
        })
        .await
        .context("validator worker panicked")?
    }
}

fn validate_updates_file(path: &PathBuf) -> Result<Validation> {
    let mut file = std::fs::File::open(path).context("opening chunked file")?;
    let mut issues = Vec::new();
    let mut row_count = 0usize;
    let mut sampled = 0usize;

    while let Some(payload) = read_frame(&mut file)? {
        let batch = proto::UpdateBatch::decode(payload.as_slice()).context("decoding update chunk")?;
        row_count += batch.records.len();
        if sampled < 100 {
            for r in &batch.records {
                if r.update_id.is_empty() {
                    issues.push("update_id empty in sample".to_string());
                }
                if r.update_type.is_empty() {
                    issues.push("update_type empty in sample".to_string());
                }
                if r.update_data.is_empty() {
                    issues.push("update_data empty in sample".to_string());
                }
                sampled += 1;
                if sampled >= 100 {
                    break;
                }
            }
        }
    }
    if row_count == 0 {
        bail!("chunked file {} contains no records", path.display());
    }

    Ok(Validation {
        valid: issues.is_empty(),
        issues,
        row_count,
    })
}

fn validate_events_file(path: &PathBuf) -> Result<Validation> {
    let mut file = std::fs::File::open(path).context("opening chunked file")?;
    let mut issues = Vec::new();
    let mut row_count = 0usize;
    let mut sampled = 0usize;

    while let Some(payload) = read_frame(&mut file)? {
        let batch = proto::EventBatch::decode(payload.as_slice()).context("decoding event chunk")?;
        row_count += batch.records.len();
        if sampled < 100 {
            for r in &batch.records {
                if r.event_id.is_empty() {
                    issues.push("event_id empty in sample".to_string());
                }
                if r.event_type.is_empty() {
                    issues.push("event_type empty in sample".to_string());
                }
                if r.raw_event.is_empty() {
                    issues.push("raw_event empty in sample".to_string());
                }
                sampled += 1;
                if sampled >= 100 {
                    break;
                }
            }
        }
    }
    if row_count == 0 {
        bail!("chunked file {} contains no records", path.display());
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
    use chrono::Utc;

    fn sample_events_batch(n: usize) -> RecordBatch {
        RecordBatch::Events(
            (0..n)
                .map(|i| EventRecord {
                    event_id: format!("e{i}"),
                    update_id: "u1".to_string(),
                    migration_id: 1,
                    effective_at: Utc::now(),
                    event_type: EventType::Created,
                    raw_event: serde_json::json!({"i": i}),
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn writes_and_validates_multi_chunk_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ChunkedWriter::new(3);
        let batch = sample_events_batch(CHUNK_SIZE + 5);
        let outcome = writer
            .write_batch(dir.path(), "events/migration=1/year=2024/month=1/day=1", &batch)
            .await
            .unwrap();
        assert_eq!(outcome.count, CHUNK_SIZE + 5);
        assert!(outcome.validation.valid, "{:?}", outcome.validation.issues);
        assert_eq!(outcome.validation.row_count, CHUNK_SIZE + 5);
    }

    #[tokio::test]
    async fn rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ChunkedWriter::new(3);
        let batch = sample_events_batch(5);
        let outcome = writer
            .write_batch(dir.path(), "events/migration=1/year=2024/month=1/day=1", &batch)
            .await
            .unwrap();

        let bytes = std::fs::read(&outcome.file).unwrap();
        let truncated = &bytes[..bytes.len() - 2];
        std::fs::write(&outcome.file, truncated).unwrap();

        let result = validate_events_file(&outcome.file);
        assert!(result.is_err());
    }
}
