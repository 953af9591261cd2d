//! Append-only columnar metric store.
//!
//! The store is a directory of Parquet segments, one per flush:
//! `part-000000.parquet`, `part-000001.parquet`, ... Each segment is a
//! complete Parquet file written under a `.tmp` name and renamed into place,
//! so flush cost depends only on the batch size and a concurrent reader
//! never observes a torn segment.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::error::{Result, RuntrackError};
use crate::models::MetricRecord;
use crate::storage::staging_path;

const SEGMENT_PREFIX: &str = "part-";
const SEGMENT_SUFFIX: &str = ".parquet";

/// A buffered, not yet persisted metric row.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    /// Arrival order within the run.
    pub seq: u64,
    pub name: String,
    pub value: f64,
    pub step: u64,
    pub wall_time: DateTime<Utc>,
}

/// `{name, value, step, wall_time}`, all non-nullable.
pub fn metrics_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("name", DataType::Utf8, false),
        Field::new("value", DataType::Float64, false),
        Field::new("step", DataType::Int64, false),
        Field::new(
            "wall_time",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
    ]))
}

pub struct ColumnStore {
    dir: PathBuf,
    schema: SchemaRef,
    next_segment: u64,
}

impl ColumnStore {
    /// Open the dataset directory, continuing after any segments already
    /// committed there.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let next_segment = list_segments(&dir)?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(0);
        Ok(Self {
            dir,
            schema: metrics_schema(),
            next_segment,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Segments committed by this store (and any predecessor on disk).
    pub fn segment_count(&self) -> u64 {
        self.next_segment
    }

    /// Persist `rows` as one new segment, ordered by arrival sequence.
    /// On error nothing becomes visible and the segment index is reused by
    /// the next attempt.
    pub fn append(&mut self, rows: &[MetricRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut ordered: Vec<&MetricRow> = rows.iter().collect();
        ordered.sort_by_key(|r| r.seq);
        let batch = self.rows_to_record_batch(&ordered)?;

        let path = self.dir.join(segment_name(self.next_segment));
        let tmp = staging_path(&path, ".tmp");
        write_parquet(&tmp, &batch)?;
        fs::rename(&tmp, &path)?;

        self.next_segment += 1;
        Ok(batch.num_rows())
    }

    fn rows_to_record_batch(&self, rows: &[&MetricRow]) -> Result<RecordBatch> {
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        let values: Vec<f64> = rows.iter().map(|r| r.value).collect();
        let steps = rows
            .iter()
            .map(|r| {
                i64::try_from(r.step)
                    .map_err(|_| RuntrackError::InvalidInput(format!("step {} does not fit in i64", r.step)))
            })
            .collect::<Result<Vec<i64>>>()?;
        let wall_times: Vec<i64> = rows.iter().map(|r| r.wall_time.timestamp_micros()).collect();

        let arrays: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(names)),
            Arc::new(Float64Array::from(values)),
            Arc::new(Int64Array::from(steps)),
            Arc::new(TimestampMicrosecondArray::from(wall_times).with_timezone("UTC")),
        ];
        Ok(RecordBatch::try_new(self.schema.clone(), arrays)?)
    }
}

fn segment_name(index: u64) -> String {
    format!("{SEGMENT_PREFIX}{index:06}{SEGMENT_SUFFIX}")
}

fn parse_segment_index(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Committed segments sorted by index. Staging files are skipped.
fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut segments = vec![];
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if let Some(index) = parse_segment_index(&name) {
            segments.push((index, entry.path()));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = fs::File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    fs::File::open(path)?.sync_all()?;
    Ok(())
}

/// Read every committed segment of a dataset directory.
pub fn read_dataset(dir: &Path) -> Result<Vec<MetricRecord>> {
    let mut records = vec![];
    for (_, path) in list_segments(dir)? {
        let file = fs::File::open(&path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        for batch in reader {
            record_batch_to_records(&batch?, &mut records)?;
        }
    }
    Ok(records)
}

pub fn count_dataset_rows(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    for (_, path) in list_segments(dir)? {
        let file = fs::File::open(&path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        total += builder.metadata().file_metadata().num_rows().max(0) as u64;
    }
    Ok(total)
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<T>())
        .ok_or_else(|| {
            RuntrackError::MetricFlush(format!("metrics segment has no usable `{name}` column"))
        })
}

fn record_batch_to_records(batch: &RecordBatch, out: &mut Vec<MetricRecord>) -> Result<()> {
    let names = column::<StringArray>(batch, "name")?;
    let values = column::<Float64Array>(batch, "value")?;
    let steps = column::<Int64Array>(batch, "step")?;
    let wall_times = column::<TimestampMicrosecondArray>(batch, "wall_time")?;

    out.reserve(batch.num_rows());
    for i in 0..batch.num_rows() {
        out.push(MetricRecord {
            name: names.value(i).to_string(),
            value: values.value(i),
            step: steps.value(i),
            wall_time: DateTime::<Utc>::from_timestamp_micros(wall_times.value(i))
                .unwrap_or_default(),
        });
    }
    Ok(())
}
