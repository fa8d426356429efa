//! Declarative per-layer schema contracts and the generic validator.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::table::{Column, Table, Value};

const SILVER_CONTRACT_JSON: &str = include_str!("../schemas/stock_price_silver.json");
const GOLD_CONTRACT_JSON: &str = include_str!("../schemas/stock_price_gold.json");

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ColumnType {
    String,
    Float,
    Int,
    BigInt,
    Date,
    Timestamp,
    Unknown(String),
}

impl From<String> for ColumnType {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "string" => Self::String,
            "float" => Self::Float,
            "int" => Self::Int,
            "bigint" => Self::BigInt,
            "date" => Self::Date,
            "timestamp" => Self::Timestamp,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => f.write_str("string"),
            Self::Float => f.write_str("float"),
            Self::Int => f.write_str("int"),
            Self::BigInt => f.write_str("bigint"),
            Self::Date => f.write_str("date"),
            Self::Timestamp => f.write_str("timestamp"),
            Self::Unknown(raw) => f.write_str(raw),
        }
    }
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRule {
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

/// Column rules in the order the contract document declares them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractColumns(Vec<(String, ColumnRule)>);

impl ContractColumns {
    pub fn get(&self, name: &str) -> Option<&ColumnRule> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, rule)| rule)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ColumnRule> {
        self.0
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, rule)| rule)
    }

    /// Replaces the rule for `name` in place, or appends it.
    pub fn insert(&mut self, name: impl Into<String>, rule: ColumnRule) {
        let name = name.into();
        match self.get_mut(&name) {
            Some(existing) => *existing = rule,
            None => self.0.push((name, rule)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnRule)> {
        self.0.iter().map(|(n, rule)| (n.as_str(), rule))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for ContractColumns {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, rule) in &self.0 {
            map.serialize_entry(name, rule)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ContractColumns {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ColumnsVisitor;

        impl<'de> Visitor<'de> for ColumnsVisitor {
            type Value = ContractColumns;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of column name to column rule")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut columns = ContractColumns::default();
                while let Some((name, rule)) = access.next_entry::<String, ColumnRule>()? {
                    columns.insert(name, rule);
                }
                Ok(columns)
            }
        }

        deserializer.deserialize_map(ColumnsVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityChecks {
    #[serde(default)]
    pub not_null: Vec<String>,
    #[serde(default)]
    pub positive_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContract {
    #[serde(default)]
    pub table: Option<String>,
    pub columns: ContractColumns,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub partition_by: Vec<String>,
    #[serde(default)]
    pub quality_checks: QualityChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationMode {
    Strict,
    Permissive,
}

impl ValidationMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "permissive" | "warn" => Some(Self::Permissive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ContractViolation {
    #[error("dataset is empty")]
    EmptyDataset,
    #[error("missing columns: {0:?}")]
    MissingColumns(Vec<String>),
    #[error("missing partition column from schema: {0}")]
    MissingPartitionColumn(String),
    #[error("column {column} contains NULL but nullable=false")]
    NullInNonNullable { column: String },
    #[error("column {column} expected {expected}: {detail}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        detail: String,
    },
    #[error("unknown schema type for column {column}: {declared}")]
    UnknownType { column: String, declared: String },
    #[error("primary key column {column} contains NULL")]
    NullPrimaryKey { column: String },
    #[error("duplicate primary key {columns:?} ({duplicates} duplicate rows)")]
    DuplicatePrimaryKey {
        columns: Vec<String>,
        duplicates: usize,
    },
    #[error("quality check failed: {column} contains NULL")]
    QualityNotNull { column: String },
    #[error("quality check failed: {column} contains {count} negative values")]
    QualityNegative { column: String, count: usize },
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("contract violation in {table}: {violation}")]
    Violation {
        table: String,
        violation: ContractViolation,
    },
    #[error("failed to read contract {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid contract document: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub table: String,
    pub mode: ValidationMode,
    pub rows: usize,
    pub fingerprint: String,
    pub violations: Vec<ContractViolation>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

impl SchemaContract {
    pub fn from_json(raw: &str) -> Result<Self, ContractError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ContractError> {
        let raw = fs::read_to_string(path).map_err(|source| ContractError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn silver_stock_price() -> Self {
        Self::from_json(SILVER_CONTRACT_JSON).expect("embedded silver contract is valid JSON")
    }

    pub fn gold_stock_price_daily() -> Self {
        Self::from_json(GOLD_CONTRACT_JSON).expect("embedded gold contract is valid JSON")
    }

    pub fn name(&self) -> &str {
        self.table.as_deref().unwrap_or("unnamed")
    }

    /// Stable sha256 over the canonical JSON form of the contract.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}

struct Checker<'a> {
    table: &'a str,
    mode: ValidationMode,
    violations: Vec<ContractViolation>,
}

impl Checker<'_> {
    fn handle(&mut self, violation: ContractViolation) -> Result<(), ContractError> {
        match self.mode {
            ValidationMode::Strict => Err(ContractError::Violation {
                table: self.table.to_string(),
                violation,
            }),
            ValidationMode::Permissive => {
                warn!(
                    component = "contract",
                    event = "contract.validate.violation",
                    table = self.table,
                    violation = %violation
                );
                self.violations.push(violation);
                Ok(())
            }
        }
    }
}

/// Checks `table` against `contract`. Strict mode returns the first violation as
/// an error; permissive mode logs every violation and returns them in the report.
pub fn validate(
    table: &Table,
    contract: &SchemaContract,
    mode: ValidationMode,
) -> Result<ValidationReport, ContractError> {
    let fingerprint = contract.fingerprint();
    let mut checker = Checker {
        table: contract.name(),
        mode,
        violations: Vec::new(),
    };

    if table.is_empty() {
        checker.handle(ContractViolation::EmptyDataset)?;
        return Ok(report(contract, mode, table, fingerprint, checker.violations));
    }

    let missing = table.missing_columns(contract.columns.names());
    if !missing.is_empty() {
        checker.handle(ContractViolation::MissingColumns(missing))?;
    }

    for partition_col in &contract.partition_by {
        if !table.has_column(partition_col) {
            checker.handle(ContractViolation::MissingPartitionColumn(
                partition_col.clone(),
            ))?;
        }
    }

    for (name, rule) in contract.columns.iter() {
        let Some(column) = table.column(name) else {
            continue;
        };

        if !rule.nullable && column.has_nulls() {
            checker.handle(ContractViolation::NullInNonNullable {
                column: name.to_string(),
            })?;
        }

        if let Some(violation) = check_column_type(column, &rule.column_type) {
            checker.handle(violation)?;
        }
    }

    check_primary_key(table, contract, &mut checker)?;

    for name in &contract.quality_checks.not_null {
        if table.column(name).is_some_and(Column::has_nulls) {
            checker.handle(ContractViolation::QualityNotNull {
                column: name.clone(),
            })?;
        }
    }

    for name in &contract.quality_checks.positive_values {
        let Some(column) = table.column(name) else {
            continue;
        };
        let count = column
            .values
            .iter()
            .filter_map(Value::as_f64)
            .filter(|v| *v < 0.0)
            .count();
        if count > 0 {
            checker.handle(ContractViolation::QualityNegative {
                column: name.clone(),
                count,
            })?;
        }
    }

    let out = report(contract, mode, table, fingerprint, checker.violations);
    info!(
        component = "contract",
        event = "contract.validate.finish",
        table = %out.table,
        mode = ?mode,
        rows = out.rows,
        violations = out.violations.len(),
        fingerprint = %out.fingerprint
    );
    Ok(out)
}

fn report(
    contract: &SchemaContract,
    mode: ValidationMode,
    table: &Table,
    fingerprint: String,
    violations: Vec<ContractViolation>,
) -> ValidationReport {
    ValidationReport {
        table: contract.name().to_string(),
        mode,
        rows: table.num_rows(),
        fingerprint,
        violations,
    }
}

fn check_primary_key(
    table: &Table,
    contract: &SchemaContract,
    checker: &mut Checker<'_>,
) -> Result<(), ContractError> {
    if contract.primary_key.is_empty() {
        return Ok(());
    }

    for name in &contract.primary_key {
        if table.column(name).is_some_and(Column::has_nulls) {
            checker.handle(ContractViolation::NullPrimaryKey {
                column: name.clone(),
            })?;
        }
    }

    let names: Vec<&str> = contract.primary_key.iter().map(String::as_str).collect();
    let Some(keys) = table.row_keys(&names) else {
        return Ok(());
    };
    let mut seen = HashSet::with_capacity(keys.len());
    let duplicates = keys.into_iter().filter(|key| !seen.insert(key.clone())).count();
    if duplicates > 0 {
        checker.handle(ContractViolation::DuplicatePrimaryKey {
            columns: contract.primary_key.clone(),
            duplicates,
        })?;
    }
    Ok(())
}

fn check_column_type(column: &Column, expected: &ColumnType) -> Option<ContractViolation> {
    let mismatch = |detail: String| ContractViolation::TypeMismatch {
        column: column.name.clone(),
        expected: expected.clone(),
        detail,
    };
    let mut present = column.values.iter().filter(|v| !v.is_null());

    match expected {
        ColumnType::String => present
            .find(|v| !matches!(v, Value::Text(_)))
            .map(|v| mismatch(format!("found non-text value {v:?}"))),
        ColumnType::Float => present
            .find(|v| !matches!(v, Value::Int(_) | Value::Float(_)))
            .map(|v| mismatch(format!("found non-numeric value {v:?}"))),
        ColumnType::Int | ColumnType::BigInt => present
            .find(|v| !is_integer_valued(v))
            .map(|v| mismatch(format!("found non-integer value {v:?}"))),
        ColumnType::Date => present.find_map(|v| match v {
            Value::Date(_) => None,
            Value::Timestamp(ts) if ts.time() == NaiveTime::MIN => None,
            Value::Timestamp(ts) => Some(mismatch(format!(
                "value {ts} must be normalized to midnight (date semantics)"
            ))),
            other => Some(mismatch(format!("found non-date value {other:?}"))),
        }),
        ColumnType::Timestamp => present
            .find(|v| !v.is_temporal())
            .map(|v| mismatch(format!("found non-temporal value {v:?}"))),
        ColumnType::Unknown(declared) => Some(ContractViolation::UnknownType {
            column: column.name.clone(),
            declared: declared.clone(),
        }),
    }
}

fn is_integer_valued(value: &Value) -> bool {
    match value {
        Value::Int(_) => true,
        Value::Float(v) => v.fract() == 0.0,
        Value::Text(_) => value.as_f64().is_some_and(|v| v.fract() == 0.0),
        _ => false,
    }
}
