//! Parquet encoding of a table partition through polars.

use chrono::NaiveTime;
use polars::prelude::{
    Column as PlColumn, DataFrame, DataType, ParquetWriter, PlSmallStr, PolarsError, TimeUnit,
};

use crate::table::{Column, Table, Value, ValueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParquetKind {
    Int64,
    Float64,
    Date,
    Datetime,
    Utf8,
}

/// Encodes the table as a single parquet file held in memory.
pub fn encode_parquet(table: &Table) -> Result<Vec<u8>, PolarsError> {
    let columns = table
        .columns()
        .iter()
        .map(to_polars_column)
        .collect::<Result<Vec<_>, _>>()?;
    let mut df = DataFrame::new(columns)?;

    let mut buf = Vec::new();
    ParquetWriter::new(&mut buf).finish(&mut df)?;
    Ok(buf)
}

fn infer_kind(values: &[Value]) -> ParquetKind {
    let mut kind: Option<ParquetKind> = None;
    for value in values {
        let next = match value.kind() {
            None => continue,
            Some(ValueKind::Int) => ParquetKind::Int64,
            Some(ValueKind::Float) => ParquetKind::Float64,
            Some(ValueKind::Date) => ParquetKind::Date,
            Some(ValueKind::Timestamp) => ParquetKind::Datetime,
            Some(ValueKind::Text) => return ParquetKind::Utf8,
        };
        kind = Some(match (kind, next) {
            (None, k) => k,
            (Some(a), b) if a == b => a,
            (Some(ParquetKind::Int64), ParquetKind::Float64)
            | (Some(ParquetKind::Float64), ParquetKind::Int64) => ParquetKind::Float64,
            (Some(ParquetKind::Date), ParquetKind::Datetime)
            | (Some(ParquetKind::Datetime), ParquetKind::Date) => ParquetKind::Datetime,
            _ => return ParquetKind::Utf8,
        });
    }
    kind.unwrap_or(ParquetKind::Utf8)
}

fn to_polars_column(column: &Column) -> Result<PlColumn, PolarsError> {
    let name = PlSmallStr::from(column.name.as_str());
    let values = &column.values;

    match infer_kind(values) {
        ParquetKind::Int64 => {
            let data: Vec<Option<i64>> = values
                .iter()
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect();
            Ok(PlColumn::new(name, data))
        }
        ParquetKind::Float64 => {
            let data: Vec<Option<f64>> = values.iter().map(Value::as_f64).collect();
            Ok(PlColumn::new(name, data))
        }
        ParquetKind::Date => {
            let data: Vec<Option<i32>> = values
                .iter()
                .map(|v| v.calendar_date().map(days_since_epoch))
                .collect();
            PlColumn::new(name, data).cast(&DataType::Date)
        }
        ParquetKind::Datetime => {
            let data: Vec<Option<i64>> = values
                .iter()
                .map(|v| match v {
                    Value::Timestamp(ts) => Some(ts.and_utc().timestamp_micros()),
                    Value::Date(d) => Some(d.and_time(NaiveTime::MIN).and_utc().timestamp_micros()),
                    _ => None,
                })
                .collect();
            PlColumn::new(name, data).cast(&DataType::Datetime(TimeUnit::Microseconds, None))
        }
        ParquetKind::Utf8 => {
            let data: Vec<Option<String>> = values.iter().map(render_text).collect();
            Ok(PlColumn::new(name, data))
        }
    }
}

fn days_since_epoch(date: chrono::NaiveDate) -> i32 {
    date.and_time(NaiveTime::MIN)
        .and_utc()
        .timestamp()
        .div_euclid(86_400) as i32
}

fn render_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Float(f) if f.is_nan() => None,
        Value::Text(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
    }
}
