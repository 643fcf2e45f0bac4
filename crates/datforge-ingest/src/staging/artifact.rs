//! Parquet encoding of staged rows
//!
//! The schema is the contract between staging, loading, and export. Each
//! file carries the fingerprint it was staged for in its key/value metadata
//! so a file found on disk can be validated without any index.

use crate::error::StagingError;
use crate::row::CandidateRow;
use arrow::array::{Array as _, ArrayRef, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

pub const FINGERPRINT_KEY: &str = "datforge.fingerprint";
const ROW_GROUP_ROWS: usize = 64 * 1024;

pub fn artifact_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("source_id", DataType::Utf8, false),
        Field::new("group_label", DataType::Utf8, false),
        Field::new("platform", DataType::Utf8, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("item_title", DataType::Utf8, false),
        Field::new("base_title", DataType::Utf8, false),
        Field::new("release_year", DataType::Int32, true),
        Field::new("description", DataType::Utf8, false),
        Field::new("item_filename", DataType::Utf8, false),
        Field::new("size", DataType::Int64, false),
        Field::new("crc", DataType::Utf8, true),
        Field::new("md5", DataType::Utf8, true),
        Field::new("sha1", DataType::Utf8, true),
        Field::new("status", DataType::Utf8, false),
    ]))
}

fn writer_properties(fingerprint: Option<&str>) -> WriterProperties {
    let mut metadata = vec![KeyValue {
        key: "created_by".to_string(),
        value: Some("datforge".to_string()),
    }];
    if let Some(fp) = fingerprint {
        metadata.push(KeyValue {
            key: FINGERPRINT_KEY.to_string(),
            value: Some(fp.to_string()),
        });
    }

    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(metadata))
        .build()
}

fn strings<'a>(rows: &'a [CandidateRow], f: impl Fn(&'a CandidateRow) -> &'a str) -> StringArray {
    StringArray::from(rows.iter().map(|r| Some(f(r))).collect::<Vec<_>>())
}

fn optional_strings<'a>(
    rows: &'a [CandidateRow],
    f: impl Fn(&'a CandidateRow) -> Option<&'a str>,
) -> StringArray {
    StringArray::from(rows.iter().map(f).collect::<Vec<_>>())
}

pub fn rows_to_batch(rows: &[CandidateRow]) -> Result<RecordBatch, StagingError> {
    let sizes = rows
        .iter()
        .map(|r| {
            i64::try_from(r.size).map_err(|_| {
                StagingError::invalid(&r.source_id, format!("size {} exceeds i64", r.size))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let columns: Vec<ArrayRef> = vec![
        Arc::new(strings(rows, |r| r.source_id.as_str())),
        Arc::new(strings(rows, |r| r.group_label.as_str())),
        Arc::new(strings(rows, |r| r.platform.as_str())),
        Arc::new(strings(rows, |r| r.category.as_str())),
        Arc::new(strings(rows, |r| r.item_title.as_str())),
        Arc::new(strings(rows, |r| r.base_title.as_str())),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.release_year).collect::<Vec<_>>(),
        )),
        Arc::new(strings(rows, |r| r.description.as_str())),
        Arc::new(strings(rows, |r| r.item_filename.as_str())),
        Arc::new(Int64Array::from(sizes)),
        Arc::new(optional_strings(rows, |r| r.crc.as_deref())),
        Arc::new(optional_strings(rows, |r| r.md5.as_deref())),
        Arc::new(optional_strings(rows, |r| r.sha1.as_deref())),
        Arc::new(strings(rows, |r| r.status.as_str())),
    ];

    Ok(RecordBatch::try_new(artifact_schema(), columns)?)
}

/// Incremental encoder for exports larger than memory
pub struct ArtifactWriter<W: Write + Send> {
    inner: ArrowWriter<W>,
    rows: u64,
}

impl<W: Write + Send> ArtifactWriter<W> {
    pub fn new(sink: W, fingerprint: Option<&str>) -> Result<Self, StagingError> {
        let inner = ArrowWriter::try_new(sink, artifact_schema(), Some(writer_properties(fingerprint)))?;
        Ok(Self { inner, rows: 0 })
    }

    pub fn write(&mut self, rows: &[CandidateRow]) -> Result<(), StagingError> {
        for chunk in rows.chunks(ROW_GROUP_ROWS) {
            self.inner.write(&rows_to_batch(chunk)?)?;
            self.rows += chunk.len() as u64;
        }
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Write the footer and hand back the sink
    pub fn finish(self) -> Result<W, StagingError> {
        Ok(self.inner.into_inner()?)
    }
}

/// Encode `rows` into `sink`, returning the sink once the footer is written
pub fn write_rows<W: Write + Send>(
    sink: W,
    fingerprint: Option<&str>,
    rows: &[CandidateRow],
) -> Result<W, StagingError> {
    let mut writer = ArtifactWriter::new(sink, fingerprint)?;
    writer.write(rows)?;
    writer.finish()
}

/// Footer-only view of an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub fingerprint: Option<String>,
    pub rows: u64,
}

fn open_builder(path: &Path) -> Result<ParquetRecordBatchReaderBuilder<File>, StagingError> {
    let file = File::open(path).map_err(|e| StagingError::io(path, e))?;
    Ok(ParquetRecordBatchReaderBuilder::try_new(file)?)
}

fn info_of(builder: &ParquetRecordBatchReaderBuilder<File>) -> ArtifactInfo {
    let file_metadata = builder.metadata().file_metadata();
    let fingerprint = file_metadata
        .key_value_metadata()
        .and_then(|kv| kv.iter().find(|entry| entry.key == FINGERPRINT_KEY))
        .and_then(|entry| entry.value.clone());

    ArtifactInfo {
        fingerprint,
        rows: u64::try_from(file_metadata.num_rows()).unwrap_or(0),
    }
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, StagingError> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| StagingError::invalid(name, format!("missing column: {e}")))?;

    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| StagingError::invalid(name, "unexpected column type"))
}

fn optional(col: &StringArray, row: usize) -> Option<String> {
    (!col.is_null(row)).then(|| col.value(row).to_string())
}

/// Decode every row, in file order
pub fn read_rows(path: &Path) -> Result<(ArtifactInfo, Vec<CandidateRow>), StagingError> {
    let builder = open_builder(path)?;
    let info = info_of(&builder);
    let reader = builder.build()?;

    let mut out = Vec::with_capacity(usize::try_from(info.rows).unwrap_or(0));
    for batch in reader {
        let batch = batch?;
        let source_id = column::<StringArray>(&batch, "source_id")?;
        let group_label = column::<StringArray>(&batch, "group_label")?;
        let platform = column::<StringArray>(&batch, "platform")?;
        let category = column::<StringArray>(&batch, "category")?;
        let item_title = column::<StringArray>(&batch, "item_title")?;
        let base_title = column::<StringArray>(&batch, "base_title")?;
        let release_year = column::<Int32Array>(&batch, "release_year")?;
        let description = column::<StringArray>(&batch, "description")?;
        let item_filename = column::<StringArray>(&batch, "item_filename")?;
        let size = column::<Int64Array>(&batch, "size")?;
        let crc = column::<StringArray>(&batch, "crc")?;
        let md5 = column::<StringArray>(&batch, "md5")?;
        let sha1 = column::<StringArray>(&batch, "sha1")?;
        let status = column::<StringArray>(&batch, "status")?;

        for row in 0..batch.num_rows() {
            out.push(CandidateRow {
                source_id: source_id.value(row).to_string(),
                group_label: group_label.value(row).to_string(),
                platform: platform.value(row).to_string(),
                category: category.value(row).to_string(),
                item_title: item_title.value(row).to_string(),
                base_title: base_title.value(row).to_string(),
                release_year: (!release_year.is_null(row)).then(|| release_year.value(row)),
                description: description.value(row).to_string(),
                item_filename: item_filename.value(row).to_string(),
                size: u64::try_from(size.value(row))
                    .map_err(|_| StagingError::invalid(path, "negative size"))?,
                crc: optional(crc, row),
                md5: optional(md5, row),
                sha1: optional(sha1, row),
                status: status.value(row).to_string(),
            });
        }
    }

    Ok((info, out))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample_row(name: &str) -> CandidateRow {
        CandidateRow {
            source_id: "Amiga - Games.dat".into(),
            group_label: "Amiga".into(),
            platform: "Amiga".into(),
            category: "Games".into(),
            item_title: "Game A (1990)".into(),
            base_title: "Game A".into(),
            release_year: Some(1990),
            description: "Game A".into(),
            item_filename: name.into(),
            size: 1024,
            crc: Some("1a2b3c4d".into()),
            md5: None,
            sha1: Some("abc123".into()),
            status: "good".into(),
        }
    }

    #[test]
    fn test_rows_survive_staging_with_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.parquet");
        let mut second = sample_row("b.bin");
        second.release_year = None;
        second.sha1 = None;
        let rows = vec![sample_row("a.bin"), second];

        let file = write_rows(File::create(&path).unwrap(), Some("fp"), &rows).unwrap();
        drop(file);

        let (info, back) = read_rows(&path).unwrap();
        assert_eq!(info.fingerprint.as_deref(), Some("fp"));
        assert_eq!(info.rows, 2);
        assert_eq!(back, rows);
    }

    #[test]
    fn test_empty_artifact_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.parquet");
        drop(write_rows(File::create(&path).unwrap(), Some("fp"), &[]).unwrap());

        let (info, rows) = read_rows(&path).unwrap();
        assert_eq!(info.rows, 0);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_incremental_writer_spans_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.parquet");
        let mut writer = ArtifactWriter::new(File::create(&path).unwrap(), None).unwrap();
        writer.write(&[sample_row("a.bin")]).unwrap();
        writer.write(&[sample_row("b.bin"), sample_row("c.bin")]).unwrap();
        assert_eq!(writer.rows_written(), 3);
        drop(writer.finish().unwrap());

        let (info, rows) = read_rows(&path).unwrap();
        assert_eq!(info.fingerprint, None);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].item_filename, "c.bin");
    }

    #[test]
    fn test_garbage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.parquet");
        std::fs::write(&path, b"not parquet").unwrap();
        assert!(read_rows(&path).is_err());
    }
}
