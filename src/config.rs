//! Pipeline settings read from `EQL_*` environment variables.

use std::env;
use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

use crate::contract::ValidationMode;
use crate::source::HttpSourceConfig;
use crate::storage::RetryPolicy;

pub const DEFAULT_STORAGE_ROOT: &str = "data/lake";
pub const DEFAULT_BUCKET: &str = "equity-lake";
pub const DEFAULT_BRONZE_PATH: &str = "bronze/stock_price";
pub const DEFAULT_SILVER_PATH: &str = "silver/stock_price";
pub const DEFAULT_GOLD_PATH: &str = "gold/stock_price_daily";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be YYYY-MM-DD, got `{value}`")]
    InvalidDate { key: &'static str, value: String },
    #[error("{key} must be an unsigned integer, got `{value}`")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must be `strict` or `permissive`, got `{value}`")]
    InvalidMode { key: &'static str, value: String },
    #[error("unknown source kind `{0}` (expected `csv` or `http`)")]
    UnknownSourceKind(String),
    #[error("{0} is required for the selected source")]
    MissingValue(&'static str),
    #[error("date range end {end} is before start {start}")]
    InvertedRange { start: NaiveDate, end: NaiveDate },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSettings {
    Csv { path: PathBuf },
    Http(HttpSourceConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPaths {
    pub bronze: String,
    pub silver: String,
    pub gold: String,
}

impl Default for LayerPaths {
    fn default() -> Self {
        Self {
            bronze: DEFAULT_BRONZE_PATH.to_string(),
            silver: DEFAULT_SILVER_PATH.to_string(),
            gold: DEFAULT_GOLD_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub storage_root: PathBuf,
    pub bucket: String,
    pub paths: LayerPaths,
    pub exchange: String,
    pub source_name: String,
    pub source: SourceSettings,
    /// Range requested from the source; rows outside it are dropped at fetch.
    pub source_range: DateRange,
    /// Business range, recorded in the run log only.
    pub dataset_range: DateRange,
    pub run_date: Option<NaiveDate>,
    pub retry: RetryPolicy,
    pub validation_mode: ValidationMode,
    pub silver_contract: Option<PathBuf>,
    pub gold_contract: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let source_range = DateRange {
            start: parse_date(
                "EQL_SOURCE_START",
                get("EQL_SOURCE_START"),
                NaiveDate::from_ymd_opt(2024, 1, 1),
            )?,
            end: parse_date(
                "EQL_SOURCE_END",
                get("EQL_SOURCE_END"),
                NaiveDate::from_ymd_opt(2024, 12, 31),
            )?,
        };
        if source_range.end < source_range.start {
            return Err(ConfigError::InvertedRange {
                start: source_range.start,
                end: source_range.end,
            });
        }
        let dataset_range = DateRange {
            start: parse_date(
                "EQL_DATASET_START",
                get("EQL_DATASET_START"),
                Some(source_range.start),
            )?,
            end: parse_date("EQL_DATASET_END", get("EQL_DATASET_END"), Some(source_range.end))?,
        };
        let run_date = match get("EQL_RUN_DATE") {
            Some(raw) => Some(parse_date("EQL_RUN_DATE", Some(raw), None)?),
            None => None,
        };

        let retry = RetryPolicy {
            max_retries: parse_u32("EQL_MAX_RETRIES", get("EQL_MAX_RETRIES"), 3)?,
            retry_sleep_ms: parse_u64("EQL_RETRY_SLEEP_MS", get("EQL_RETRY_SLEEP_MS"), 2_000)?,
        };

        let validation_mode = match get("EQL_VALIDATION_MODE") {
            Some(raw) => ValidationMode::parse(&raw).ok_or(ConfigError::InvalidMode {
                key: "EQL_VALIDATION_MODE",
                value: raw,
            })?,
            None => ValidationMode::Strict,
        };

        let source_kind = get("EQL_SOURCE_KIND").unwrap_or_else(|| "csv".to_string());
        let source = match source_kind.to_ascii_lowercase().as_str() {
            "csv" => SourceSettings::Csv {
                path: get("EQL_SOURCE_CSV")
                    .map(PathBuf::from)
                    .ok_or(ConfigError::MissingValue("EQL_SOURCE_CSV"))?,
            },
            "http" => {
                let defaults = HttpSourceConfig::default();
                SourceSettings::Http(HttpSourceConfig {
                    base_url: get("EQL_SOURCE_URL").ok_or(ConfigError::MissingValue("EQL_SOURCE_URL"))?,
                    symbols: get("EQL_SYMBOLS")
                        .map(|raw| {
                            raw.split(',')
                                .map(|s| s.trim().to_ascii_uppercase())
                                .filter(|s| !s.is_empty())
                                .collect()
                        })
                        .ok_or(ConfigError::MissingValue("EQL_SYMBOLS"))?,
                    rate_limit_sleep_ms: parse_u64(
                        "EQL_RATE_LIMIT_SLEEP_MS",
                        get("EQL_RATE_LIMIT_SLEEP_MS"),
                        defaults.rate_limit_sleep_ms,
                    )?,
                    per_symbol_sleep_ms: parse_u64(
                        "EQL_SYMBOL_SLEEP_MS",
                        get("EQL_SYMBOL_SLEEP_MS"),
                        defaults.per_symbol_sleep_ms,
                    )?,
                    ..defaults
                })
            }
            _ => return Err(ConfigError::UnknownSourceKind(source_kind)),
        };

        Ok(Self {
            storage_root: get("EQL_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
            bucket: get("EQL_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            paths: LayerPaths {
                bronze: get("EQL_BRONZE_PATH").unwrap_or_else(|| DEFAULT_BRONZE_PATH.to_string()),
                silver: get("EQL_SILVER_PATH").unwrap_or_else(|| DEFAULT_SILVER_PATH.to_string()),
                gold: get("EQL_GOLD_PATH").unwrap_or_else(|| DEFAULT_GOLD_PATH.to_string()),
            },
            exchange: get("EQL_EXCHANGE").unwrap_or_else(|| "HOSE".to_string()),
            source_name: get("EQL_SOURCE_NAME").unwrap_or_else(|| "vnstock".to_string()),
            source,
            source_range,
            dataset_range,
            run_date,
            retry,
            validation_mode,
            silver_contract: get("EQL_SILVER_CONTRACT").map(PathBuf::from),
            gold_contract: get("EQL_GOLD_CONTRACT").map(PathBuf::from),
        })
    }
}

fn parse_date(
    key: &'static str,
    raw: Option<String>,
    default: Option<NaiveDate>,
) -> Result<NaiveDate, ConfigError> {
    match raw {
        Some(value) => NaiveDate::parse_from_str(&value, "%Y-%m-%d")
            .map_err(|_| ConfigError::InvalidDate { key, value }),
        None => default.ok_or(ConfigError::MissingValue(key)),
    }
}

fn parse_u64(key: &'static str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match raw {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
        None => Ok(default),
    }
}

fn parse_u32(key: &'static str, raw: Option<String>, default: u32) -> Result<u32, ConfigError> {
    match raw {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
        None => Ok(default),
    }
}
