//! Parquet encoding of table rows and projection of data files.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray, new_null_array,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Date32Type, Float64Type, Int64Type, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::DateTime;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde_json::{Map, Number, Value};

use super::TableRow;
use super::schema::{ColumnType, TableSchema};
use crate::error::Result;

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some(concat!("lakestream ", env!("CARGO_PKG_VERSION")).to_string()),
    };
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

/// Build a record batch of `rows` laid out in `schema`.
pub fn rows_to_batch(schema: &TableSchema, rows: &[&TableRow]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = schema
        .columns
        .iter()
        .map(|column| build_column(&column.name, column.column_type, rows))
        .collect();

    Ok(RecordBatch::try_new(schema.to_arrow(), columns)?)
}

fn build_column(name: &str, column_type: ColumnType, rows: &[&TableRow]) -> ArrayRef {
    match name {
        "event_id" => strings(rows, |r| Some(r.event.event_id.clone())),
        "event_type" => strings(rows, |r| Some(r.event.event_type.clone())),
        "session_id" => strings(rows, |r| Some(r.event.session_id.clone())),
        "user_id" => strings(rows, |r| r.event.user_id.as_ref().map(ToString::to_string)),
        "location" => strings(rows, |r| r.event.location.as_ref().map(|d| d.to_text())),
        "device" => strings(rows, |r| r.event.device.as_ref().map(|d| d.to_text())),
        "timestamp" => Arc::new(
            TimestampMicrosecondArray::from(
                rows.iter()
                    .map(|r| r.event_time.timestamp_micros())
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
        "event_date" => Arc::new(Date32Array::from(
            rows.iter()
                .map(|r| Date32Type::from_naive_date(r.event_date))
                .collect::<Vec<_>>(),
        )),
        _ => extra_column(name, column_type, rows),
    }
}

fn strings(rows: &[&TableRow], f: impl Fn(&TableRow) -> Option<String>) -> ArrayRef {
    Arc::new(StringArray::from(
        rows.iter().map(|r| f(r)).collect::<Vec<_>>(),
    ))
}

fn extra_column(name: &str, column_type: ColumnType, rows: &[&TableRow]) -> ArrayRef {
    let values = rows.iter().map(|r| r.event.extra.get(name));

    match column_type {
        ColumnType::Utf8 => Arc::new(StringArray::from(
            values
                .map(|v| match v {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(other) => Some(other.to_string()),
                })
                .collect::<Vec<_>>(),
        )),
        ColumnType::Int64 => Arc::new(Int64Array::from(
            values.map(|v| v.and_then(Value::as_i64)).collect::<Vec<_>>(),
        )),
        ColumnType::Float64 => Arc::new(Float64Array::from(
            values.map(|v| v.and_then(Value::as_f64)).collect::<Vec<_>>(),
        )),
        ColumnType::Boolean => Arc::new(BooleanArray::from(
            values.map(|v| v.and_then(Value::as_bool)).collect::<Vec<_>>(),
        )),
        ColumnType::TimestampMicros | ColumnType::Date32 => {
            new_null_array(&column_type.to_arrow(), rows.len())
        }
    }
}

/// Encode a record batch as a Parquet file.
pub fn write_parquet(batch: &RecordBatch) -> Result<Bytes> {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer = ArrowWriter::try_new(&mut cursor, batch.schema(), Some(writer_properties()))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(Bytes::from(cursor.into_inner()))
}

/// Decode every record batch of a Parquet file.
pub fn read_parquet(bytes: Bytes) -> Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}

/// Lay a batch out in `target`, null-filling columns the batch lacks.
pub fn project(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    let columns = target
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(field.name()) {
            Some(column) if column.data_type() == field.data_type() => Ok(column.clone()),
            Some(column) => Ok(cast(column, field.data_type())?),
            None => Ok(new_null_array(field.data_type(), batch.num_rows())),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RecordBatch::try_new(target.clone(), columns)?)
}

/// Render a batch as JSON objects, one per row. Nulls are kept as `null`.
pub fn batch_to_json(batch: &RecordBatch) -> Vec<Map<String, Value>> {
    let schema = batch.schema();
    let mut rows = vec![Map::new(); batch.num_rows()];

    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        for (i, row) in rows.iter_mut().enumerate() {
            row.insert(field.name().clone(), cell_to_json(column, i));
        }
    }
    rows
}

fn cell_to_json(column: &ArrayRef, i: usize) -> Value {
    if column.is_null(i) {
        return Value::Null;
    }
    match column.data_type() {
        DataType::Utf8 => Value::String(column.as_string::<i32>().value(i).to_string()),
        DataType::Int64 => Value::from(column.as_primitive::<Int64Type>().value(i)),
        DataType::Float64 => Number::from_f64(column.as_primitive::<Float64Type>().value(i))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        DataType::Boolean => Value::Bool(column.as_boolean().value(i)),
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let micros = column
                .as_primitive::<arrow::datatypes::TimestampMicrosecondType>()
                .value(i);
            DateTime::from_timestamp_micros(micros)
                .map(|ts| Value::String(ts.to_rfc3339()))
                .unwrap_or(Value::Null)
        }
        DataType::Date32 => {
            let days = column.as_primitive::<Date32Type>().value(i);
            Value::String(Date32Type::to_naive_date(days).to_string())
        }
        other => Value::String(format!("<unsupported {other}>")),
    }
}
