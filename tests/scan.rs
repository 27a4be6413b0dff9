use std::sync::Arc;

use arrow::{
    array::{
        ArrayRef, Float32Array, Int64Array, RecordBatch, StringArray, TimestampMicrosecondArray,
    },
    datatypes::{DataType, Field, Schema, TimeUnit},
};
use nppes_loader::{
    data::Value,
    error::LoadError,
    scan::{self, ScanOptions, Slice, SourceFormat},
    schema::{ColumnMapping, ColumnNaming, ColumnType},
};
use parquet::arrow::ArrowWriter;

fn csv_view(csv: &str, options: &ScanOptions) -> Box<dyn scan::TabularView> {
    scan::open("source.csv", csv.as_bytes().to_vec(), options).expect("open csv view")
}

fn texts(slice: Slice, column: &str) -> Vec<Option<String>> {
    slice
        .into_batch()
        .expect("rows")
        .text_column(column)
        .expect("column present")
}

#[test]
fn renames_every_column_when_nothing_is_selected() {
    let options = ScanOptions::new(SourceFormat::Csv).with_rename(
        ColumnMapping::new([("col1", "column1"), ("col2", "column2")]).unwrap(),
    );
    let mut view = csv_view("col1,col2\n1,a\n2,b\n", &options);
    assert_eq!(view.schema(), ["column1", "column2"]);

    let batch = view.collect().unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.rows()[0], vec![Some(Value::Integer(1)), Some(Value::from("a"))]);
    assert_eq!(view.count().unwrap(), 2);
}

#[test]
fn selected_columns_are_renamed_in_place() {
    let options = ScanOptions::new(SourceFormat::Csv)
        .with_columns(["col1", "col2"])
        .with_rename(ColumnMapping::new([("col1", "column1"), ("col2", "column2")]).unwrap());
    let mut view = csv_view("col1,col2\nval1,val2\nval3,val4\n", &options);
    assert_eq!(view.schema(), ["column1", "column2"]);

    let batch = view.collect().unwrap();
    assert_eq!(
        batch.text_column("column1").unwrap(),
        vec![Some("val1".to_string()), Some("val3".to_string())]
    );
    assert_eq!(
        batch.text_column("column2").unwrap(),
        vec![Some("val2".to_string()), Some("val4".to_string())]
    );
}

#[test]
fn selection_orders_and_restricts_columns() {
    let options = ScanOptions::new(SourceFormat::Csv)
        .with_columns(["C", "A"])
        .with_rename(ColumnMapping::new([("A", "a")]).unwrap());
    let mut view = csv_view("A,B,C\n1,x,true\n2,y,false\n", &options);
    assert_eq!(view.schema(), ["C", "a"]);
    let batch = view.collect().unwrap();
    assert_eq!(
        batch.rows()[1],
        vec![Some(Value::Boolean(false)), Some(Value::Integer(2))]
    );
}

#[test]
fn missing_selected_or_renamed_column_is_a_schema_mismatch() {
    let missing = ScanOptions::new(SourceFormat::Csv).with_columns(["Z"]);
    let err = scan::open("source.csv", b"A,B\n1,2\n".to_vec(), &missing).err().unwrap();
    assert!(matches!(err, LoadError::SchemaMismatch { ref column, .. } if column == "Z"));

    let renamed = ScanOptions::new(SourceFormat::Csv)
        .with_rename(ColumnMapping::new([("Q", "q")]).unwrap());
    assert!(matches!(
        scan::open("source.csv", b"A,B\n1,2\n".to_vec(), &renamed).err().unwrap(),
        LoadError::SchemaMismatch { .. }
    ));
}

#[test]
fn colliding_output_names_are_rejected() {
    let options = ScanOptions::new(SourceFormat::Csv)
        .with_rename(ColumnMapping::new([("A", "B")]).unwrap());
    let err = scan::open("source.csv", b"A,B\n1,2\n".to_vec(), &options).err().unwrap();
    assert!(matches!(err, LoadError::InvalidMapping(_)));
}

#[test]
fn string_override_keeps_leading_zeros() {
    let csv = "state_fips,county_fips\n47,001\n47,157\n";
    let inferred = ScanOptions::new(SourceFormat::Csv);
    let mut view = csv_view(csv, &inferred);
    assert_eq!(
        texts(view.slice(0, 10).unwrap(), "county_fips"),
        vec![Some("1".to_string()), Some("157".to_string())]
    );

    let forced = ScanOptions::new(SourceFormat::Csv).with_type("county_fips", ColumnType::String);
    let mut view = csv_view(csv, &forced);
    assert_eq!(
        texts(view.slice(0, 10).unwrap(), "county_fips"),
        vec![Some("001".to_string()), Some("157".to_string())]
    );
}

#[test]
fn empty_fields_are_null_and_snake_case_naming_applies() {
    let options = ScanOptions::new(SourceFormat::Csv).with_naming(ColumnNaming::SnakeCase);
    let mut view = csv_view(
        "Provider Last Name (Legal Name),Provider Credential Text\nSMITH,MD\nJONES,\n",
        &options,
    );
    assert_eq!(
        view.schema(),
        ["provider_last_name_legal_name", "provider_credential_text"]
    );
    assert_eq!(
        texts(view.slice(0, 2).unwrap(), "provider_credential_text"),
        vec![Some("MD".to_string()), None]
    );
}

#[test]
fn slices_walk_forward_and_can_restart() {
    let csv = "n\n1\n2\n3\n4\n5\n";
    let mut view = csv_view(csv, &ScanOptions::new(SourceFormat::Csv));
    assert_eq!(texts(view.slice(0, 2).unwrap(), "n"), vec![Some("1".into()), Some("2".into())]);
    assert_eq!(texts(view.slice(2, 2).unwrap(), "n"), vec![Some("3".into()), Some("4".into())]);
    assert_eq!(view.slice(4, 2).unwrap().len(), 1);
    assert_eq!(view.slice(5, 2).unwrap(), Slice::EndOfData);
    assert_eq!(texts(view.slice(1, 1).unwrap(), "n"), vec![Some("2".into())]);
    assert_eq!(view.slice(0, 0).unwrap(), Slice::EndOfData);
}

#[test]
fn header_only_source_has_schema_but_no_rows() {
    let mut view = csv_view("NPI,Entity Type Code\n", &ScanOptions::new(SourceFormat::Csv));
    assert_eq!(view.schema(), ["NPI", "Entity Type Code"]);
    assert_eq!(view.slice(0, 100).unwrap(), Slice::EndOfData);
    assert!(view.collect().unwrap().is_empty());
}

#[test]
fn unparsable_value_reports_row_and_column() {
    let options = ScanOptions::new(SourceFormat::Csv).with_type("npi", ColumnType::Integer);
    let mut view = csv_view("npi\n1\nabc\n", &options);
    let err = view.slice(0, 10).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("row 3"), "{message}");
    assert!(message.contains("column 'npi'"), "{message}");
}

#[test]
fn garbage_is_not_a_parquet_file() {
    let err = scan::open(
        "pl.parquet",
        b"not parquet".to_vec(),
        &ScanOptions::new(SourceFormat::Parquet),
    )
    .err()
    .unwrap();
    assert!(matches!(err, LoadError::SourceUnavailable { .. }));
}

fn parquet_fixture() -> Vec<u8> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("npi", DataType::Int64, false),
        Field::new("zip", DataType::Utf8, true),
        Field::new("state", DataType::Utf8, true),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(vec![1003000126, 1003000134, 1003000142, 1003000159])),
        Arc::new(StringArray::from(vec![Some("01234"), None, Some("37203"), Some("40202")])),
        Arc::new(StringArray::from(vec!["TN", "TN", "TN", "KY"])),
    ];
    let batch = RecordBatch::try_new(Arc::clone(&schema), columns).unwrap();
    let mut writer = ArrowWriter::try_new(Vec::new(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.into_inner().unwrap()
}

#[test]
fn parquet_selection_rename_and_slicing() {
    let options = ScanOptions::new(SourceFormat::Parquet)
        .with_columns(["zip", "npi"])
        .with_rename(ColumnMapping::new([("zip", "practice_zip")]).unwrap());
    let mut view = scan::open("pl.parquet", parquet_fixture(), &options).unwrap();
    assert_eq!(view.schema(), ["practice_zip", "npi"]);

    let batch = view.slice(1, 2).unwrap().into_batch().unwrap();
    assert_eq!(
        batch.rows(),
        [
            vec![None, Some(Value::Integer(1003000134))],
            vec![Some(Value::from("37203")), Some(Value::Integer(1003000142))],
        ]
    );
    assert_eq!(view.slice(4, 2).unwrap(), Slice::EndOfData);
    assert_eq!(view.count().unwrap(), 4);
}

#[test]
fn parquet_type_override_casts_through_arrow() {
    let options = ScanOptions::new(SourceFormat::Parquet)
        .with_columns(["npi"])
        .with_type("npi", ColumnType::String);
    let mut view = scan::open("pl.parquet", parquet_fixture(), &options).unwrap();
    let batch = view.slice(0, 1).unwrap().into_batch().unwrap();
    assert_eq!(batch.rows()[0], vec![Some(Value::String("1003000126".to_string()))]);
}

#[test]
fn parquet_timestamps_and_floats_encode_without_loss() {
    let instant = 1_700_000_000_123_456_i64;
    let schema = Arc::new(Schema::new(vec![
        Field::new("updated", DataType::Timestamp(TimeUnit::Microsecond, None), true),
        Field::new(
            "updated_local",
            DataType::Timestamp(TimeUnit::Microsecond, Some("+05:00".into())),
            true,
        ),
        Field::new("score", DataType::Float32, true),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMicrosecondArray::from(vec![instant])),
        Arc::new(TimestampMicrosecondArray::from(vec![instant]).with_timezone("+05:00")),
        Arc::new(Float32Array::from(vec![0.1_f32])),
    ];
    let batch = RecordBatch::try_new(Arc::clone(&schema), columns).unwrap();
    let mut writer = ArrowWriter::try_new(Vec::new(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    let data = writer.into_inner().unwrap();

    let encoded = scan::open("stamps.parquet", data, &ScanOptions::new(SourceFormat::Parquet))
        .unwrap()
        .collect()
        .unwrap()
        .encode_text(b'\t', "");
    assert_eq!(
        String::from_utf8(encoded).unwrap(),
        "2023-11-14 22:13:20.123456\t2023-11-15 03:13:20.123456+05:00\t0.1\n"
    );
}

#[test]
fn csv_datetime_override_accepts_fractional_seconds() {
    let options = ScanOptions::new(SourceFormat::Csv).with_type("updated", ColumnType::DateTime);
    let mut view = csv_view("updated\n2024-05-06T14:30:00.123456\n", &options);
    assert_eq!(
        texts(view.slice(0, 1).unwrap(), "updated"),
        vec![Some("2024-05-06 14:30:00.123456".to_string())]
    );
}
