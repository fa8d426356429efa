//! Gold-layer feature building: lagged returns and expanding-then-rolling means.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::clean::distinct_count;
use crate::table::{Column, Table, TableError, Value, ValueKey};

pub const REQUIRED_COLUMNS: [&str; 5] = ["symbol", "exchange", "trading_date", "close_price", "volume"];
pub const GOLD_COLUMNS: [&str; 8] = [
    "symbol",
    "exchange",
    "trading_date",
    "close_price",
    "volume",
    "daily_return",
    "ma_5",
    "ma_20",
];
const GROUP_KEY: [&str; 2] = ["symbol", "exchange"];
const ROW_KEY: [&str; 3] = ["symbol", "exchange", "trading_date"];
const SHORT_WINDOW: usize = 5;
const LONG_WINDOW: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureBuildReport {
    pub input_rows: u64,
    pub unparseable_rows_dropped: u64,
    pub duplicate_rows_dropped: u64,
    pub output_rows: u64,
    pub symbols: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBuild {
    pub table: Table,
    pub report: FeatureBuildReport,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("missing required columns for gold build: {0:?}")]
    MissingColumns(Vec<String>),
    #[error("trading_date must hold calendar dates; row {row} has {found:?}")]
    TradingDateNotDate { row: usize, found: Value },
    #[error("volume must be integer-valued; row {row} has {value}")]
    NonIntegerVolume { row: usize, value: f64 },
    #[error("volume does not fit a 64-bit integer; row {row} has {value}")]
    VolumeOutOfRange { row: usize, value: f64 },
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone)]
struct GroupRolling {
    closes: VecDeque<f64>,
    max_window: usize,
}

impl GroupRolling {
    fn new(max_window: usize) -> Self {
        Self {
            closes: VecDeque::with_capacity(max_window),
            max_window,
        }
    }

    /// Return against the previous close, `None` when there is no usable previous close.
    fn push(&mut self, close: f64) -> Option<f64> {
        let ret = self
            .closes
            .back()
            .copied()
            .filter(|prev| *prev != 0.0)
            .map(|prev| (close - prev) / prev);

        self.closes.push_back(close);
        while self.closes.len() > self.max_window {
            self.closes.pop_front();
        }
        ret
    }

    /// Mean of the trailing `w` closes, or of all closes seen so far when fewer exist.
    fn mean_w(&self, w: usize) -> f64 {
        let take = w.min(self.closes.len());
        let start = self.closes.len() - take;
        let sum = self.closes.range(start..).copied().sum::<f64>();
        sum / take as f64
    }
}

#[derive(Debug, Clone)]
struct GoldRow {
    source_row: usize,
    close: f64,
    volume: i64,
}

/// Derives the gold table from a cleaned (silver) table.
///
/// Empty input yields an empty table. Missing required columns, non-date
/// `trading_date` values and fractional volumes are precondition failures.
pub fn build_features(cleaned: &Table) -> Result<FeatureBuild, FeatureError> {
    let mut report = FeatureBuildReport {
        input_rows: cleaned.num_rows() as u64,
        ..FeatureBuildReport::default()
    };

    if cleaned.is_empty() {
        warn!(
            component = "features",
            event = "features.build.empty_input"
        );
        return Ok(FeatureBuild {
            table: Table::empty(),
            report,
        });
    }

    let missing = cleaned.missing_columns(REQUIRED_COLUMNS);
    if !missing.is_empty() {
        warn!(
            component = "features",
            event = "features.build.missing_columns",
            missing = ?missing
        );
        return Err(FeatureError::MissingColumns(missing));
    }

    let dates = cleaned.values("trading_date").unwrap_or_default();
    if let Some((row, found)) = dates
        .iter()
        .enumerate()
        .find(|(_, v)| !matches!(v, Value::Date(_)))
    {
        return Err(FeatureError::TradingDateNotDate {
            row,
            found: found.clone(),
        });
    }

    // Group and row keys compare as text so `1` and `1.0` land in the same group.
    let mut keyed = cleaned.clone();
    for name in GROUP_KEY {
        keyed.set_column(text_column(cleaned, name))?;
    }

    let closes = keyed.values("close_price").unwrap_or_default();
    let volumes = keyed.values("volume").unwrap_or_default();
    let mut parsed: Vec<Option<(f64, f64)>> = Vec::with_capacity(keyed.num_rows());
    for row in 0..keyed.num_rows() {
        parsed.push(closes[row].as_f64().zip(volumes[row].as_f64()));
    }

    let usable: Vec<usize> = (0..parsed.len()).filter(|&i| parsed[i].is_some()).collect();
    report.unparseable_rows_dropped = (parsed.len() - usable.len()) as u64;
    if report.unparseable_rows_dropped > 0 {
        warn!(
            component = "features",
            event = "features.build.unparseable_dropped",
            dropped = report.unparseable_rows_dropped
        );
    }
    let usable_table = keyed.take(&usable);
    let order: Vec<usize> = usable_table
        .sorted_indices(&ROW_KEY)
        .into_iter()
        .map(|i| usable[i])
        .collect();

    let keys = keyed.row_keys(&ROW_KEY).unwrap_or_default();
    let mut deduped: Vec<usize> = Vec::with_capacity(order.len());
    for row in order {
        // Last row in sort order wins.
        if let Some(last) = deduped.last_mut() {
            if keys[*last] == keys[row] {
                *last = row;
                continue;
            }
        }
        deduped.push(row);
    }
    report.duplicate_rows_dropped = (usable.len() - deduped.len()) as u64;
    if report.duplicate_rows_dropped > 0 {
        warn!(
            component = "features",
            event = "features.build.duplicates_dropped",
            dropped = report.duplicate_rows_dropped
        );
    }

    let mut rows = Vec::with_capacity(deduped.len());
    for row in deduped {
        let (close, volume) = parsed[row].unwrap_or_default();
        let volume = match volumes[row] {
            Value::Int(v) => v,
            _ => integral_volume(row, volume)?,
        };
        rows.push(GoldRow {
            source_row: row,
            close,
            volume,
        });
    }

    let group_keys: Vec<&[ValueKey]> = rows
        .iter()
        .map(|r| &keys[r.source_row][..GROUP_KEY.len()])
        .collect();
    let mut states: HashMap<&[ValueKey], GroupRolling> = HashMap::new();
    let mut daily_return = Vec::with_capacity(rows.len());
    let mut ma_5 = Vec::with_capacity(rows.len());
    let mut ma_20 = Vec::with_capacity(rows.len());
    for (row, group) in rows.iter().zip(&group_keys) {
        let state = states
            .entry(*group)
            .or_insert_with(|| GroupRolling::new(LONG_WINDOW));
        daily_return.push(Value::from(state.push(row.close)));
        ma_5.push(Value::Float(state.mean_w(SHORT_WINDOW)));
        ma_20.push(Value::Float(state.mean_w(LONG_WINDOW)));
    }

    let source_rows: Vec<usize> = rows.iter().map(|r| r.source_row).collect();
    let base = keyed.take(&source_rows);
    let table = Table::from_columns(vec![
        Column::new("symbol", base.values("symbol").unwrap_or_default().to_vec()),
        Column::new("exchange", base.values("exchange").unwrap_or_default().to_vec()),
        Column::new("trading_date", base.values("trading_date").unwrap_or_default().to_vec()),
        Column::new(
            "close_price",
            rows.iter().map(|r| Value::Float(r.close)).collect(),
        ),
        Column::new("volume", rows.iter().map(|r| Value::Int(r.volume)).collect()),
        Column::new("daily_return", daily_return),
        Column::new("ma_5", ma_5),
        Column::new("ma_20", ma_20),
    ])?;

    report.output_rows = table.num_rows() as u64;
    report.symbols = distinct_count(&table, "symbol") as u64;

    info!(
        component = "features",
        event = "features.build.finish",
        input_rows = report.input_rows,
        output_rows = report.output_rows,
        symbols = report.symbols,
        unparseable_rows_dropped = report.unparseable_rows_dropped,
        duplicate_rows_dropped = report.duplicate_rows_dropped
    );

    Ok(FeatureBuild { table, report })
}

/// Drops the derived columns so a gold table can be fed back as silver input.
pub fn strip_features(gold: &Table) -> Table {
    gold.select(&REQUIRED_COLUMNS)
}

fn integral_volume(row: usize, value: f64) -> Result<i64, FeatureError> {
    if value.fract() != 0.0 {
        return Err(FeatureError::NonIntegerVolume { row, value });
    }
    // i64::MAX as f64 rounds up to 2^63, which is already out of range.
    if value < i64::MIN as f64 || value >= i64::MAX as f64 {
        return Err(FeatureError::VolumeOutOfRange { row, value });
    }
    Ok(value as i64)
}

fn text_column(table: &Table, name: &str) -> Column {
    let values = table
        .values(name)
        .unwrap_or_default()
        .iter()
        .map(|v| match v {
            Value::Text(_) | Value::Null => v.clone(),
            Value::Int(i) => Value::Text(i.to_string()),
            Value::Float(f) => Value::Text(f.to_string()),
            Value::Date(d) => Value::Text(d.to_string()),
            Value::Timestamp(ts) => Value::Text(ts.to_string()),
        })
        .collect();
    Column::new(name, values)
}
