//! Typed, column-oriented tabular dataset shared by every layer.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Float,
    Text,
    Date,
    Timestamp,
}

/// Hashable projection of a [`Value`] used for key grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Null,
    Int(i64),
    Float(u64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn text(raw: impl Into<String>) -> Self {
        Self::Text(raw.into())
    }

    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Float(v) => v.is_nan(),
            _ => false,
        }
    }

    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Self::Null => None,
            Self::Int(_) => Some(ValueKind::Int),
            Self::Float(v) if v.is_nan() => None,
            Self::Float(_) => Some(ValueKind::Float),
            Self::Text(_) => Some(ValueKind::Text),
            Self::Date(_) => Some(ValueKind::Date),
            Self::Timestamp(_) => Some(ValueKind::Timestamp),
        }
    }

    /// Numeric coercion. Text is parsed; NaN and non-numeric values yield `None`.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            Self::Int(v) => *v as f64,
            Self::Float(v) => *v,
            Self::Text(raw) => raw.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(raw) => Some(raw.as_str()),
            _ => None,
        }
    }

    /// Calendar date of a temporal value, dropping any time-of-day.
    pub fn calendar_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::Timestamp(ts) => Some(ts.date()),
            _ => None,
        }
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, Self::Date(_) | Self::Timestamp(_))
    }

    /// Types a raw text cell at ingestion: empty is null, numbers become Int/Float.
    pub fn from_cell(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Null;
        }
        if let Ok(v) = trimmed.parse::<i64>() {
            return Self::Int(v);
        }
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => Self::Float(v),
            _ => Self::Text(trimmed.to_string()),
        }
    }

    pub fn from_json(raw: &serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Text(b.to_string()),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(v) => Self::Int(v),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            serde_json::Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    /// Parses a temporal value from text. Bare dates become `Date`, anything with a
    /// time component becomes `Timestamp`.
    pub fn parse_temporal(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return Some(Self::Date(d));
        }
        for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, fmt) {
                return Some(Self::Timestamp(ts));
            }
        }
        chrono::DateTime::parse_from_rfc3339(trimmed)
            .ok()
            .map(|dt| Self::Timestamp(dt.naive_utc()))
    }

    pub fn key(&self) -> ValueKey {
        match self {
            Self::Null => ValueKey::Null,
            Self::Int(v) => ValueKey::Int(*v),
            Self::Float(v) if v.is_nan() => ValueKey::Null,
            Self::Float(v) => ValueKey::Float(v.to_bits()),
            Self::Text(s) => ValueKey::Text(s.clone()),
            Self::Date(d) => ValueKey::Date(*d),
            Self::Timestamp(ts) => ValueKey::Timestamp(*ts),
        }
    }

    /// Total order: nulls first, then numbers, text, temporal values.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Float(f) if f.is_nan() => 0,
                Value::Int(_) | Value::Float(_) => 1,
                Value::Text(_) => 2,
                Value::Date(_) | Value::Timestamp(_) => 3,
            }
        }

        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::Date(a), Self::Timestamp(b)) => a.and_time(NaiveTime::MIN).cmp(b),
            (Self::Timestamp(a), Self::Date(b)) => a.cmp(&b.and_time(NaiveTime::MIN)),
            _ => match (rank(self), rank(other)) {
                (1, 1) => {
                    let a = self.as_f64().unwrap_or(f64::NAN);
                    let b = other.as_f64().unwrap_or(f64::NAN);
                    a.total_cmp(&b)
                }
                (ra, rb) => ra.cmp(&rb),
            },
        }
    }

    /// JSON rendering for the raw layer; temporal values are written as `%Y-%m-%d`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Self::Timestamp(ts) => serde_json::Value::String(ts.format("%Y-%m-%d").to_string()),
        }
    }
}

impl From<&str> for Value {
    fn from(raw: &str) -> Self {
        Self::Text(raw.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Self::Date(d)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn has_nulls(&self) -> bool {
        self.values.iter().any(Value::is_null)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("column {column} has {found} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_columns(columns: Vec<Column>) -> Result<Self, TableError> {
        let mut table = Self::empty();
        let mut seen = HashSet::new();
        for column in columns {
            if !seen.insert(column.name.clone()) {
                return Err(TableError::DuplicateColumn(column.name));
            }
            table.check_len(&column)?;
            table.columns.push(column);
        }
        Ok(table)
    }

    /// Builds a table from row records; the column set is the ordered union of
    /// all record keys, absent cells become `Null`.
    pub fn from_records(records: &[Vec<(String, Value)>]) -> Self {
        let mut names: Vec<String> = Vec::new();
        for record in records {
            for (name, _) in record {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }

        let mut columns: Vec<Column> = names
            .iter()
            .map(|name| Column::new(name.clone(), Vec::with_capacity(records.len())))
            .collect();
        for record in records {
            for column in &mut columns {
                let cell = record
                    .iter()
                    .rev()
                    .find(|(name, _)| *name == column.name)
                    .map(|(_, value)| value.clone())
                    .unwrap_or(Value::Null);
                column.values.push(cell);
            }
        }

        Self { columns }
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.values.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn values(&self, name: &str) -> Option<&[Value]> {
        self.column(name).map(|c| c.values.as_slice())
    }

    pub fn missing_columns<'a>(&self, required: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        required
            .into_iter()
            .filter(|name| !self.has_column(name))
            .map(str::to_string)
            .collect()
    }

    /// Replaces a column of the same name in place, or appends it.
    pub fn set_column(&mut self, column: Column) -> Result<(), TableError> {
        let expected = self
            .columns
            .iter()
            .find(|c| c.name != column.name)
            .map(|c| c.values.len());
        if let Some(expected) = expected {
            if expected != column.values.len() {
                return Err(TableError::LengthMismatch {
                    column: column.name,
                    expected,
                    found: column.values.len(),
                });
            }
        }
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        Ok(())
    }

    pub fn drop_column(&mut self, name: &str) -> Option<Column> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        Some(self.columns.remove(idx))
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<(), TableError> {
        if from != to && self.has_column(to) {
            return Err(TableError::DuplicateColumn(to.to_string()));
        }
        if let Some(column) = self.columns.iter_mut().find(|c| c.name == from) {
            column.name = to.to_string();
        }
        Ok(())
    }

    /// New table holding the given rows, in the given order.
    pub fn take(&self, rows: &[usize]) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|c| Column::new(c.name.clone(), rows.iter().map(|&i| c.values[i].clone()).collect()))
            .collect();
        Self { columns }
    }

    /// Restricts the table to the named columns, in that order; unknown names are skipped.
    pub fn select(&self, names: &[&str]) -> Self {
        let columns = names
            .iter()
            .filter_map(|name| self.column(name).cloned())
            .collect();
        Self { columns }
    }

    pub fn row_record(&self, row: usize) -> Vec<(&str, &Value)> {
        self.columns
            .iter()
            .map(|c| (c.name.as_str(), &c.values[row]))
            .collect()
    }

    /// Row keys over the named columns; `None` when a column is absent.
    pub fn row_keys(&self, names: &[&str]) -> Option<Vec<Vec<ValueKey>>> {
        let cols: Vec<&Column> = names.iter().map(|n| self.column(n)).collect::<Option<_>>()?;
        Some(
            (0..self.num_rows())
                .map(|row| cols.iter().map(|c| c.values[row].key()).collect())
                .collect(),
        )
    }

    /// Stable sort permutation by the named columns (absent columns are ignored).
    pub fn sorted_indices(&self, names: &[&str]) -> Vec<usize> {
        let cols: Vec<&Column> = names.iter().filter_map(|n| self.column(n)).collect();
        let mut order: Vec<usize> = (0..self.num_rows()).collect();
        order.sort_by(|&a, &b| {
            for col in &cols {
                let ord = col.values[a].total_cmp(&col.values[b]);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        order
    }

    /// Groups row indices by calendar date of the named column, dates ascending.
    pub fn group_by_date(&self, name: &str) -> BTreeMap<NaiveDate, Vec<usize>> {
        let mut groups: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
        if let Some(column) = self.column(name) {
            for (row, value) in column.values.iter().enumerate() {
                if let Some(date) = value.calendar_date() {
                    groups.entry(date).or_default().push(row);
                }
            }
        }
        groups
    }

    fn check_len(&self, column: &Column) -> Result<(), TableError> {
        match self.columns.first() {
            Some(first) if first.values.len() != column.values.len() => {
                Err(TableError::LengthMismatch {
                    column: column.name.clone(),
                    expected: first.values.len(),
                    found: column.values.len(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn cells_are_typed_once_at_ingestion() {
        assert_eq!(Value::from_cell(""), Value::Null);
        assert_eq!(Value::from_cell(" 42 "), Value::Int(42));
        assert_eq!(Value::from_cell("10.5"), Value::Float(10.5));
        assert_eq!(Value::from_cell("VNM"), Value::text("VNM"));
    }

    #[test]
    fn temporal_parsing_distinguishes_dates_from_timestamps() {
        assert_eq!(
            Value::parse_temporal("2024-01-02"),
            Some(Value::Date(d(2024, 1, 2)))
        );
        let ts = Value::parse_temporal("2024-01-02 09:15:00").unwrap();
        assert!(matches!(ts, Value::Timestamp(_)));
        assert_eq!(ts.calendar_date(), Some(d(2024, 1, 2)));
        assert_eq!(Value::parse_temporal("not a date"), None);
    }

    #[test]
    fn nan_counts_as_null() {
        assert!(Value::Float(f64::NAN).is_null());
        assert_eq!(Value::Float(f64::NAN).as_f64(), None);
        assert_eq!(Value::text("12").as_f64(), Some(12.0));
    }

    #[test]
    fn from_records_unions_columns_and_fills_nulls() {
        let table = Table::from_records(&[
            vec![("symbol".to_string(), Value::text("AAA"))],
            vec![
                ("symbol".to_string(), Value::text("BBB")),
                ("close".to_string(), Value::Float(1.5)),
            ],
        ]);
        assert_eq!(table.column_names(), vec!["symbol", "close"]);
        assert_eq!(table.values("close").unwrap()[0], Value::Null);
        assert_eq!(table.num_rows(), 2);
    }

    #[test]
    fn mismatched_column_lengths_are_rejected() {
        let err = Table::from_columns(vec![
            Column::new("a", vec![Value::Int(1)]),
            Column::new("b", vec![]),
        ])
        .unwrap_err();
        assert!(matches!(err, TableError::LengthMismatch { .. }));
    }

    #[test]
    fn sort_is_stable_over_equal_keys() {
        let table = Table::from_columns(vec![
            Column::new("k", vec![Value::text("b"), Value::text("a"), Value::text("b")]),
            Column::new("v", vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        ])
        .unwrap();
        assert_eq!(table.sorted_indices(&["k"]), vec![1, 0, 2]);
    }
}
