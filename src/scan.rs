//! Lazy, projected views over CSV and Parquet buffers.
//!
//! [`open()`] only reads what it needs to resolve column names (the CSV
//! header row or the Parquet footer). Type inference and row parsing wait for
//! the first [`TabularView::slice`]. A slice that finds no rows returns
//! [`Slice::EndOfData`]; a [`Slice::Rows`] batch is never empty.

use std::{collections::HashSet, io::Cursor, str::FromStr, sync::Arc};

use arrow::{
    array::{Array, ArrayRef, AsArray, RecordBatch},
    compute::cast,
    datatypes::{
        DataType, Date32Type, Date64Type, Float32Type, Float64Type, Int8Type, Int16Type,
        Int32Type, Int64Type, TimeUnit, TimestampMicrosecondType, TimestampMillisecondType,
        TimestampNanosecondType, TimestampSecondType, UInt8Type, UInt16Type, UInt32Type,
        UInt64Type,
    },
    error::ArrowError,
    util::display::{ArrayFormatter, FormatOptions},
};
use bytes::Bytes;
use csv::ByteRecord;
use encoding_rs::{Encoding, UTF_8};
use log::debug;
use parquet::arrow::{
    ProjectionMask,
    arrow_reader::{ArrowReaderMetadata, ArrowReaderOptions, ParquetRecordBatchReaderBuilder},
};
use serde::{Deserialize, Serialize};

use crate::{
    batch::{Batch, Row},
    data::{Value, parse_typed_value},
    error::{LoadError, LoadResult},
    io_utils,
    schema::{ColumnMapping, ColumnNaming, ColumnType, TypeInference, TypeOverrides},
};

pub const DEFAULT_INFER_ROWS: usize = 100;
const MAX_PARQUET_BATCH_ROWS: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Csv,
    #[serde(alias = "columnar")]
    Parquet,
}

impl SourceFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "csv" | "tsv" | "txt" => Some(SourceFormat::Csv),
            "parquet" | "pq" => Some(SourceFormat::Parquet),
            _ => None,
        }
    }
}

impl FromStr for SourceFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(SourceFormat::Csv),
            "parquet" | "columnar" => Ok(SourceFormat::Parquet),
            other => Err(format!("Unknown source format '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub format: SourceFormat,
    pub columns: Vec<String>,
    pub rename: ColumnMapping,
    pub naming: ColumnNaming,
    pub type_overrides: TypeOverrides,
    pub delimiter: u8,
    pub encoding: &'static Encoding,
    /// Rows sampled for CSV type inference; 0 samples the whole source.
    pub infer_rows: usize,
}

impl ScanOptions {
    pub fn new(format: SourceFormat) -> Self {
        Self {
            format,
            columns: Vec::new(),
            rename: ColumnMapping::default(),
            naming: ColumnNaming::default(),
            type_overrides: TypeOverrides::new(),
            delimiter: io_utils::DEFAULT_CSV_DELIMITER,
            encoding: UTF_8,
            infer_rows: DEFAULT_INFER_ROWS,
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rename(mut self, rename: ColumnMapping) -> Self {
        self.rename = rename;
        self
    }

    pub fn with_naming(mut self, naming: ColumnNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_type(mut self, column: &str, datatype: ColumnType) -> Self {
        self.type_overrides.insert(column.to_string(), datatype);
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Slice {
    Rows(Batch),
    EndOfData,
}

impl Slice {
    pub fn len(&self) -> usize {
        match self {
            Slice::Rows(batch) => batch.len(),
            Slice::EndOfData => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Slice::EndOfData)
    }

    pub fn into_batch(self) -> Option<Batch> {
        match self {
            Slice::Rows(batch) => Some(batch),
            Slice::EndOfData => None,
        }
    }
}

pub trait TabularView {
    fn name(&self) -> &str;

    /// Output column names in load order.
    fn schema(&self) -> &[String];

    fn slice(&mut self, offset: usize, length: usize) -> LoadResult<Slice>;

    fn collect(&mut self) -> LoadResult<Batch> {
        Ok(match self.slice(0, usize::MAX)? {
            Slice::Rows(batch) => batch,
            Slice::EndOfData => Batch::empty(self.schema().to_vec()),
        })
    }

    fn count(&mut self) -> LoadResult<usize> {
        Ok(self.collect()?.len())
    }
}

pub fn open(name: &str, bytes: Vec<u8>, options: &ScanOptions) -> LoadResult<Box<dyn TabularView>> {
    let view: Box<dyn TabularView> = match options.format {
        SourceFormat::Csv => Box::new(CsvView::open(name, bytes, options)?),
        SourceFormat::Parquet => Box::new(ParquetView::open(name, bytes, options)?),
    };
    debug!(
        "Opened {:?} view over '{}' with columns {:?}",
        options.format,
        name,
        view.schema()
    );
    Ok(view)
}

#[derive(Debug, Clone)]
struct Projection {
    source_indices: Vec<usize>,
    output: Vec<String>,
    overrides: Vec<Option<ColumnType>>,
}

impl Projection {
    fn plan(headers: &[String], options: &ScanOptions) -> LoadResult<Self> {
        let has_header = |name: &str| headers.iter().any(|h| h == name);
        if let Some(missing) = options.rename.sources().find(|source| !has_header(source)) {
            return Err(LoadError::schema_mismatch(missing, headers));
        }
        if let Some(missing) = options
            .type_overrides
            .keys()
            .find(|source| !has_header(source))
        {
            return Err(LoadError::schema_mismatch(missing, headers));
        }

        let source_indices = if options.columns.is_empty() {
            (0..headers.len()).collect::<Vec<_>>()
        } else {
            let mut seen = HashSet::new();
            options
                .columns
                .iter()
                .map(|name| {
                    let idx = headers
                        .iter()
                        .position(|h| h == name)
                        .ok_or_else(|| LoadError::schema_mismatch(name, headers))?;
                    if !seen.insert(idx) {
                        return Err(LoadError::InvalidMapping(format!(
                            "column '{name}' is selected more than once"
                        )));
                    }
                    Ok(idx)
                })
                .collect::<LoadResult<Vec<_>>>()?
        };

        let mut output = Vec::with_capacity(source_indices.len());
        let mut names = HashSet::new();
        for &idx in &source_indices {
            let source = &headers[idx];
            let target = options
                .rename
                .target_for(source)
                .map(str::to_string)
                .unwrap_or_else(|| options.naming.apply(source));
            if !names.insert(target.clone()) {
                return Err(LoadError::InvalidMapping(format!(
                    "output column '{target}' would appear more than once"
                )));
            }
            output.push(target);
        }

        let overrides = source_indices
            .iter()
            .map(|&idx| options.type_overrides.get(&headers[idx]).copied())
            .collect();

        Ok(Self {
            source_indices,
            output,
            overrides,
        })
    }

    fn width(&self) -> usize {
        self.source_indices.len()
    }
}

struct CsvCursor {
    reader: csv::Reader<Cursor<Arc<[u8]>>>,
    record: ByteRecord,
    next_row: usize,
}

impl CsvCursor {
    fn read(&mut self) -> csv::Result<bool> {
        let more = self.reader.read_byte_record(&mut self.record)?;
        if more {
            self.next_row += 1;
        }
        Ok(more)
    }
}

pub struct CsvView {
    name: String,
    data: Arc<[u8]>,
    delimiter: u8,
    encoding: &'static Encoding,
    infer_rows: usize,
    projection: Projection,
    types: Option<Vec<ColumnType>>,
    cursor: Option<CsvCursor>,
}

impl CsvView {
    pub fn open(name: &str, bytes: Vec<u8>, options: &ScanOptions) -> LoadResult<Self> {
        let data: Arc<[u8]> = Arc::from(bytes);
        let mut reader =
            io_utils::open_csv_reader(Cursor::new(Arc::clone(&data)), options.delimiter, true);
        let headers = io_utils::reader_headers(&mut reader, options.encoding)
            .map_err(|err| LoadError::source_unavailable(name, format!("{err:#}")))?;
        let projection = Projection::plan(&headers, options)?;
        Ok(Self {
            name: name.to_string(),
            data,
            delimiter: options.delimiter,
            encoding: options.encoding,
            infer_rows: options.infer_rows,
            projection,
            types: None,
            cursor: None,
        })
    }

    fn new_cursor(&self) -> CsvCursor {
        CsvCursor {
            reader: io_utils::open_csv_reader(
                Cursor::new(Arc::clone(&self.data)),
                self.delimiter,
                true,
            ),
            record: ByteRecord::new(),
            next_row: 0,
        }
    }

    fn read_error(&self, ordinal: usize, err: impl std::fmt::Display) -> LoadError {
        LoadError::source_unavailable(&self.name, format!("row {}: {err}", ordinal + 2))
    }

    fn project_raw(&self, record: &ByteRecord, ordinal: usize) -> LoadResult<Vec<String>> {
        self.projection
            .source_indices
            .iter()
            .map(|&idx| {
                let field = record.get(idx).unwrap_or_default();
                io_utils::decode_bytes(field, self.encoding)
                    .map_err(|err| self.read_error(ordinal, format!("{err:#}")))
            })
            .collect()
    }

    fn parse_row(&self, raw: &[String], types: &[ColumnType], ordinal: usize) -> LoadResult<Row> {
        raw.iter()
            .zip(types)
            .zip(&self.projection.output)
            .map(|((value, ty), column)| {
                parse_typed_value(value, ty).map_err(|err| {
                    self.read_error(ordinal, format!("column '{column}': {err:#}"))
                })
            })
            .collect()
    }

    fn column_types(&mut self) -> LoadResult<Vec<ColumnType>> {
        if let Some(types) = &self.types {
            return Ok(types.clone());
        }
        let mut inference = TypeInference::new(self.projection.width());
        if self.projection.overrides.iter().any(Option::is_none) {
            let mut cursor = self.new_cursor();
            while self.infer_rows == 0 || inference.rows_observed() < self.infer_rows {
                let ordinal = cursor.next_row;
                if !cursor.read().map_err(|err| self.read_error(ordinal, err))? {
                    break;
                }
                let raw = self.project_raw(&cursor.record, ordinal)?;
                inference.observe_row(&raw);
            }
        }
        let types = inference
            .finish()
            .into_iter()
            .zip(&self.projection.overrides)
            .map(|(inferred, forced)| forced.unwrap_or(inferred))
            .collect::<Vec<_>>();
        debug!(
            "Resolved column types for '{}': {}",
            self.name,
            self.projection
                .output
                .iter()
                .zip(&types)
                .map(|(name, ty)| format!("{name}={ty}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.types = Some(types.clone());
        Ok(types)
    }
}

impl TabularView for CsvView {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &[String] {
        &self.projection.output
    }

    fn slice(&mut self, offset: usize, length: usize) -> LoadResult<Slice> {
        if length == 0 {
            return Ok(Slice::EndOfData);
        }
        let types = self.column_types()?;
        let mut cursor = match self.cursor.take() {
            Some(cursor) if cursor.next_row <= offset => cursor,
            _ => self.new_cursor(),
        };

        while cursor.next_row < offset {
            let ordinal = cursor.next_row;
            if !cursor.read().map_err(|err| self.read_error(ordinal, err))? {
                self.cursor = Some(cursor);
                return Ok(Slice::EndOfData);
            }
        }

        let mut rows = Vec::with_capacity(length.min(4096));
        while rows.len() < length {
            let ordinal = cursor.next_row;
            if !cursor.read().map_err(|err| self.read_error(ordinal, err))? {
                break;
            }
            let raw = self.project_raw(&cursor.record, ordinal)?;
            rows.push(self.parse_row(&raw, &types, ordinal)?);
        }
        self.cursor = Some(cursor);

        if rows.is_empty() {
            Ok(Slice::EndOfData)
        } else {
            Ok(Slice::Rows(Batch::new(self.projection.output.clone(), rows)))
        }
    }
}

pub struct ParquetView {
    name: String,
    data: Bytes,
    metadata: ArrowReaderMetadata,
    projection: Projection,
    /// Projected root columns in file order, as the reader returns them.
    roots: Vec<usize>,
    /// Position of each output column within `roots`.
    positions: Vec<usize>,
}

impl ParquetView {
    pub fn open(name: &str, bytes: Vec<u8>, options: &ScanOptions) -> LoadResult<Self> {
        let data = Bytes::from(bytes);
        let metadata = ArrowReaderMetadata::load(&data, ArrowReaderOptions::default())
            .map_err(|err| LoadError::source_unavailable(name, err))?;
        let headers = metadata
            .schema()
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect::<Vec<_>>();
        let projection = Projection::plan(&headers, options)?;

        let mut roots = projection.source_indices.clone();
        roots.sort_unstable();
        let positions = projection
            .source_indices
            .iter()
            .map(|idx| roots.partition_point(|root| root < idx))
            .collect();

        Ok(Self {
            name: name.to_string(),
            data,
            metadata,
            projection,
            roots,
            positions,
        })
    }

    fn total_rows(&self) -> usize {
        usize::try_from(self.metadata.metadata().file_metadata().num_rows()).unwrap_or(0)
    }

    fn append_rows(&self, batch: &RecordBatch, rows: &mut Vec<Row>) -> LoadResult<()> {
        let columns = self
            .positions
            .iter()
            .zip(&self.projection.overrides)
            .map(|(&position, forced)| {
                let column = batch.column(position);
                match forced {
                    Some(ty) => cast(column.as_ref(), &arrow_type(*ty))
                        .map_err(|err| LoadError::source_unavailable(&self.name, err)),
                    None => Ok(Arc::clone(column)),
                }
            })
            .collect::<LoadResult<Vec<ArrayRef>>>()?;

        for row in 0..batch.num_rows() {
            let values = columns
                .iter()
                .map(|column| arrow_value(column.as_ref(), row))
                .collect::<Result<Row, ArrowError>>()
                .map_err(|err| LoadError::source_unavailable(&self.name, err))?;
            rows.push(values);
        }
        Ok(())
    }
}

impl TabularView for ParquetView {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &[String] {
        &self.projection.output
    }

    fn slice(&mut self, offset: usize, length: usize) -> LoadResult<Slice> {
        if length == 0 || offset >= self.total_rows() {
            return Ok(Slice::EndOfData);
        }
        let builder =
            ParquetRecordBatchReaderBuilder::new_with_metadata(self.data.clone(), self.metadata.clone());
        let mask = ProjectionMask::roots(builder.parquet_schema(), self.roots.iter().copied());
        let reader = builder
            .with_projection(mask)
            .with_offset(offset)
            .with_limit(length)
            .with_batch_size(length.clamp(1, MAX_PARQUET_BATCH_ROWS))
            .build()
            .map_err(|err| LoadError::source_unavailable(&self.name, err))?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|err| LoadError::source_unavailable(&self.name, err))?;
            self.append_rows(&batch, &mut rows)?;
        }

        if rows.is_empty() {
            Ok(Slice::EndOfData)
        } else {
            Ok(Slice::Rows(Batch::new(self.projection.output.clone(), rows)))
        }
    }
}

fn arrow_type(ty: ColumnType) -> DataType {
    match ty {
        ColumnType::String => DataType::Utf8,
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Date => DataType::Date32,
        ColumnType::DateTime => DataType::Timestamp(TimeUnit::Microsecond, None),
    }
}

fn arrow_value(array: &dyn Array, row: usize) -> Result<Option<Value>, ArrowError> {
    if array.is_null(row) {
        return Ok(None);
    }
    let value = match array.data_type() {
        DataType::Utf8 => Value::String(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => Value::String(array.as_string::<i64>().value(row).to_string()),
        DataType::Boolean => Value::Boolean(array.as_boolean().value(row)),
        DataType::Int8 => Value::Integer(array.as_primitive::<Int8Type>().value(row).into()),
        DataType::Int16 => Value::Integer(array.as_primitive::<Int16Type>().value(row).into()),
        DataType::Int32 => Value::Integer(array.as_primitive::<Int32Type>().value(row).into()),
        DataType::Int64 => Value::Integer(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => Value::Integer(array.as_primitive::<UInt8Type>().value(row).into()),
        DataType::UInt16 => Value::Integer(array.as_primitive::<UInt16Type>().value(row).into()),
        DataType::UInt32 => Value::Integer(array.as_primitive::<UInt32Type>().value(row).into()),
        DataType::UInt64 => {
            let raw = array.as_primitive::<UInt64Type>().value(row);
            i64::try_from(raw)
                .map(Value::Integer)
                .unwrap_or_else(|_| Value::String(raw.to_string()))
        }
        DataType::Float32 => {
            Value::Float(widen_f32(array.as_primitive::<Float32Type>().value(row)))
        }
        DataType::Float64 => Value::Float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Date32 => match array.as_primitive::<Date32Type>().value_as_date(row) {
            Some(date) => Value::Date(date),
            None => Value::String(formatted(array, row)?),
        },
        DataType::Date64 => match array.as_primitive::<Date64Type>().value_as_date(row) {
            Some(date) => Value::Date(date),
            None => Value::String(formatted(array, row)?),
        },
        DataType::Timestamp(_, Some(_)) => Value::String(formatted(array, row)?),
        DataType::Timestamp(unit, None) => {
            let datetime = match unit {
                TimeUnit::Second => array
                    .as_primitive::<TimestampSecondType>()
                    .value_as_datetime(row),
                TimeUnit::Millisecond => array
                    .as_primitive::<TimestampMillisecondType>()
                    .value_as_datetime(row),
                TimeUnit::Microsecond => array
                    .as_primitive::<TimestampMicrosecondType>()
                    .value_as_datetime(row),
                TimeUnit::Nanosecond => array
                    .as_primitive::<TimestampNanosecondType>()
                    .value_as_datetime(row),
            };
            match datetime {
                Some(datetime) => Value::DateTime(datetime),
                None => Value::String(formatted(array, row)?),
            }
        }
        _ => Value::String(formatted(array, row)?),
    };
    Ok(Some(value))
}

/// Widens through the shortest decimal form so `0.1f32` stays `0.1`.
fn widen_f32(value: f32) -> f64 {
    value.to_string().parse().unwrap_or(f64::from(value))
}

fn formatted(array: &dyn Array, row: usize) -> Result<String, ArrowError> {
    let options = FormatOptions::default()
        .with_timestamp_format(Some("%Y-%m-%d %H:%M:%S%.f"))
        .with_timestamp_tz_format(Some("%Y-%m-%d %H:%M:%S%.f%:z"));
    let formatter = ArrayFormatter::try_new(array, &options)?;
    Ok(formatter.value(row).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv_view(data: &str, options: &ScanOptions) -> Box<dyn TabularView> {
        open("fixture.csv", data.as_bytes().to_vec(), options).unwrap()
    }

    #[test]
    fn format_is_inferred_from_blob_extension() {
        assert_eq!(SourceFormat::from_name("npidata.CSV"), Some(SourceFormat::Csv));
        assert_eq!(
            SourceFormat::from_name("othername.parquet"),
            Some(SourceFormat::Parquet)
        );
        assert_eq!(SourceFormat::from_name("README"), None);
        assert_eq!("columnar".parse::<SourceFormat>(), Ok(SourceFormat::Parquet));
    }

    #[test]
    fn slices_continue_from_the_cached_cursor() {
        let mut view = csv_view("id\n1\n2\n3\n4\n5\n", &ScanOptions::new(SourceFormat::Csv));
        assert_eq!(view.slice(0, 2).unwrap().len(), 2);
        let second = view.slice(2, 2).unwrap().into_batch().unwrap();
        assert_eq!(
            second.text_column("id").unwrap(),
            vec![Some("3".to_string()), Some("4".to_string())]
        );
        // Going backwards re-opens the reader.
        let first = view.slice(0, 1).unwrap().into_batch().unwrap();
        assert_eq!(first.text_column("id").unwrap(), vec![Some("1".to_string())]);
        assert_eq!(view.slice(5, 2).unwrap(), Slice::EndOfData);
        assert_eq!(view.slice(99, 2).unwrap(), Slice::EndOfData);
    }

    #[test]
    fn header_only_source_has_schema_but_no_rows() {
        let mut view = csv_view("a,b\n", &ScanOptions::new(SourceFormat::Csv));
        assert_eq!(view.schema(), ["a", "b"]);
        assert_eq!(view.slice(0, 10).unwrap(), Slice::EndOfData);
        let collected = view.collect().unwrap();
        assert!(collected.is_empty());
        assert_eq!(collected.columns(), ["a", "b"]);
    }

    #[test]
    fn duplicate_output_names_are_rejected() {
        let rename = ColumnMapping::new([("a", "b")]).unwrap();
        let options = ScanOptions::new(SourceFormat::Csv).with_rename(rename);
        let err = open("dup.csv", b"a,b\n1,2\n".to_vec(), &options)
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::InvalidMapping(_)));
    }

    #[test]
    fn type_override_for_unknown_column_is_a_schema_mismatch() {
        let options = ScanOptions::new(SourceFormat::Csv).with_type("zip", ColumnType::String);
        let err = open("codes.csv", b"a\n1\n".to_vec(), &options).err().unwrap();
        assert!(matches!(err, LoadError::SchemaMismatch { ref column, .. } if column == "zip"));
    }

    #[test]
    fn values_outside_the_sample_fail_the_read() {
        let mut options = ScanOptions::new(SourceFormat::Csv);
        options.infer_rows = 1;
        let mut view = csv_view("code\n1\nA1\n", &options);
        let err = view.collect().unwrap_err();
        match err {
            LoadError::SourceUnavailable { reason, .. } => {
                assert!(reason.contains("row 3"), "{reason}");
                assert!(reason.contains("column 'code'"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
