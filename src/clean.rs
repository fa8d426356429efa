//! Raw observations to the typed, deduplicated silver layer.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::table::{Column, Table, TableError, Value};

const DATE_CANDIDATES: [&str; 2] = ["time", "date"];
const PRICE_COLUMNS: [&str; 4] = ["open", "high", "low", "close_price"];
const SILVER_KEY: [&str; 3] = ["symbol", "exchange", "trading_date"];
const MAX_REPORTED_BAD_DATES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanOptions {
    pub exchange: String,
    pub source: String,
    pub ingestion_time: NaiveDateTime,
}

#[derive(Debug, Error)]
pub enum CleanError {
    #[error("neither `time` nor `date` column found in raw data")]
    MissingDateColumn,
    #[error("unparseable trading_date values: {samples:?}")]
    UnparseableTradingDate { samples: Vec<String> },
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Types, stamps and deduplicates raw observations into the silver shape.
///
/// The resulting `trading_date` column holds only `Value::Date`.
pub fn clean_stock_price(raw: &Table, opts: &CleanOptions) -> Result<Table, CleanError> {
    if raw.is_empty() {
        warn!(
            component = "clean",
            event = "clean.input.empty"
        );
        return Ok(Table::empty());
    }

    let mut table = raw.clone();

    let date_col = DATE_CANDIDATES
        .iter()
        .copied()
        .find(|c| table.has_column(c))
        .ok_or(CleanError::MissingDateColumn)?;
    let trading_dates = normalize_trading_dates(table.values(date_col).unwrap_or_default())?;
    for candidate in DATE_CANDIDATES {
        table.drop_column(candidate);
    }
    table.set_column(Column::new("trading_date", trading_dates))?;
    info!(
        component = "clean",
        event = "clean.trading_date.resolved",
        date_column = date_col
    );

    if table.has_column("close") {
        table.drop_column("close_price");
        table.rename_column("close", "close_price")?;
    }

    for name in PRICE_COLUMNS {
        if let Some(values) = table.values(name) {
            let coerced = values.iter().map(|v| v.as_f64().into()).collect();
            table.set_column(Column::new(name, coerced))?;
        }
    }

    let rows = table.num_rows();
    let volumes = match table.values("volume") {
        Some(values) => values.iter().map(clean_volume).collect(),
        None => vec![Value::Int(0); rows],
    };
    table.set_column(Column::new("volume", volumes))?;

    table.set_column(Column::new("exchange", vec![Value::text(&opts.exchange); rows]))?;
    table.set_column(Column::new("source", vec![Value::text(&opts.source); rows]))?;
    table.set_column(Column::new(
        "ingestion_time",
        vec![Value::Timestamp(opts.ingestion_time); rows],
    ))?;

    let keep: Vec<usize> = (0..rows)
        .filter(|&row| {
            ["symbol", "trading_date", "close_price"].iter().all(|name| {
                table
                    .values(name)
                    .is_some_and(|values| !values[row].is_null())
            })
        })
        .collect();
    let dropped_incomplete = rows - keep.len();
    let table = table.take(&keep);

    let (table, duplicates) = dedupe_last_wins(&table);
    if duplicates > 0 {
        warn!(
            component = "clean",
            event = "clean.duplicates.dropped",
            duplicates
        );
    }

    info!(
        component = "clean",
        event = "clean.finish",
        input_rows = rows,
        output_rows = table.num_rows(),
        dropped_incomplete,
        duplicates,
        symbols = distinct_count(&table, "symbol")
    );

    Ok(table)
}

fn normalize_trading_dates(values: &[Value]) -> Result<Vec<Value>, CleanError> {
    let mut out = Vec::with_capacity(values.len());
    let mut bad: Vec<String> = Vec::new();

    for value in values {
        let parsed = match value {
            Value::Date(d) => Some(*d),
            Value::Timestamp(ts) => Some(ts.date()),
            Value::Text(raw) => Value::parse_temporal(raw).and_then(|v| v.calendar_date()),
            _ => None,
        };
        match parsed {
            Some(date) => out.push(Value::Date(date)),
            None => {
                let rendered = match value {
                    Value::Text(raw) => raw.clone(),
                    other => format!("{other:?}"),
                };
                if !bad.contains(&rendered) && bad.len() < MAX_REPORTED_BAD_DATES {
                    bad.push(rendered);
                }
                out.push(Value::Null);
            }
        }
    }

    if !bad.is_empty() {
        error!(
            component = "clean",
            event = "clean.trading_date.invalid",
            samples = ?bad
        );
        return Err(CleanError::UnparseableTradingDate { samples: bad });
    }
    Ok(out)
}

fn clean_volume(value: &Value) -> Value {
    let v = value.as_f64().unwrap_or(0.0).max(0.0);
    if v.fract() == 0.0 && v <= i64::MAX as f64 {
        Value::Int(v as i64)
    } else {
        Value::Float(v)
    }
}

fn dedupe_last_wins(table: &Table) -> (Table, usize) {
    let Some(keys) = table.row_keys(&SILVER_KEY) else {
        return (table.clone(), 0);
    };

    let mut last_for_key = HashMap::with_capacity(keys.len());
    for (row, key) in keys.iter().enumerate() {
        last_for_key.insert(key, row);
    }
    let keep: Vec<usize> = keys
        .iter()
        .enumerate()
        .filter(|(row, key)| last_for_key.get(key) == Some(row))
        .map(|(row, _)| row)
        .collect();
    let duplicates = table.num_rows() - keep.len();
    (table.take(&keep), duplicates)
}

pub(crate) fn distinct_count(table: &Table, name: &str) -> usize {
    table
        .values(name)
        .map(|values| {
            values
                .iter()
                .map(Value::key)
                .collect::<std::collections::HashSet<_>>()
                .len()
        })
        .unwrap_or(0)
}
