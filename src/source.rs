//! Market-data fetch boundary: sources producing the raw table.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::table::{Column, Table, TableError, Value};

const TEXT_COLUMNS: [&str; 3] = ["symbol", "exchange", "source"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub run_date: NaiveDate,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid fetch window: {0}")]
    InvalidWindow(String),
    #[error("expected column `time` from source {source_name}")]
    MissingTimeColumn { source_name: String },
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("rate limited by {url}")]
    RateLimited { url: String },
    #[error("invalid JSON payload from {url}: {message}")]
    InvalidPayload { url: String, message: String },
    #[error(transparent)]
    Table(#[from] TableError),
}

pub trait PriceSource {
    fn name(&self) -> &str;

    /// Returns raw observations for the window with a typed `time` column.
    fn fetch(&self, window: &FetchWindow) -> Result<Table, SourceError>;
}

/// Reads observations from a headered CSV file.
#[derive(Debug, Clone)]
pub struct CsvPriceSource {
    path: PathBuf,
    name: String,
}

impl CsvPriceSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: "csv".to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PriceSource for CsvPriceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, window: &FetchWindow) -> Result<Table, SourceError> {
        validate_window(window)?;
        let file = std::fs::File::open(&self.path).map_err(|source| SourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(file);

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut columns: Vec<Column> = headers
            .iter()
            .map(|name| Column::new(name.clone(), Vec::new()))
            .collect();
        for record in reader.records() {
            let record = record?;
            for (idx, column) in columns.iter_mut().enumerate() {
                let raw = record.get(idx).unwrap_or_default();
                column.values.push(type_cell(&column.name, raw));
            }
        }

        info!(
            component = "source",
            event = "source.csv.read",
            path = %self.path.display(),
            rows = columns.first().map(|c| c.values.len()).unwrap_or(0)
        );
        finalize_raw(Table::from_columns(columns)?, window, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub symbols: Vec<String>,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub rate_limit_sleep_ms: u64,
    pub per_symbol_sleep_ms: u64,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/history".to_string(),
            symbols: Vec::new(),
            http_timeout_ms: 15_000,
            max_retries: 3,
            rate_limit_sleep_ms: 60_000,
            per_symbol_sleep_ms: 1_100,
        }
    }
}

trait HttpFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError>;
}

struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    fn new(timeout_ms: u64) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| SourceError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| SourceError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SourceError::RateLimited {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(SourceError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| SourceError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

/// Per-symbol daily history over HTTP; each response is a JSON array of records.
pub struct HttpPriceSource {
    cfg: HttpSourceConfig,
    fetcher: Box<dyn HttpFetcher>,
    name: String,
}

impl HttpPriceSource {
    pub fn new(cfg: HttpSourceConfig) -> Result<Self, SourceError> {
        let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
        Ok(Self {
            cfg,
            fetcher: Box::new(fetcher),
            name: "http".to_string(),
        })
    }

    fn symbol_url(&self, symbol: &str, window: &FetchWindow) -> String {
        format!(
            "{}?symbol={symbol}&start={}&end={}",
            self.cfg.base_url,
            window.start.format("%Y-%m-%d"),
            window.end.format("%Y-%m-%d")
        )
    }

    fn fetch_symbol(
        &self,
        symbol: &str,
        window: &FetchWindow,
    ) -> Result<Vec<Vec<(String, Value)>>, SourceError> {
        let url = self.symbol_url(symbol, window);
        let mut attempt: u32 = 0;
        let body = loop {
            match self.fetcher.get_bytes(&url) {
                Ok(body) => break body,
                Err(err) if is_rate_limit(&err) => {
                    attempt += 1;
                    if attempt >= self.cfg.max_retries.max(1) {
                        return Err(err);
                    }
                    warn!(
                        component = "source",
                        event = "source.http.rate_limited",
                        symbol,
                        attempt,
                        max_retries = self.cfg.max_retries,
                        sleep_ms = self.cfg.rate_limit_sleep_ms
                    );
                    std::thread::sleep(Duration::from_millis(self.cfg.rate_limit_sleep_ms));
                }
                Err(err) => return Err(err),
            }
        };

        let payload: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_slice(&body).map_err(|err| SourceError::InvalidPayload {
                url: url.clone(),
                message: err.to_string(),
            })?;
        Ok(payload
            .iter()
            .map(|record| {
                let mut row: Vec<(String, Value)> = record
                    .iter()
                    .map(|(name, raw)| (name.clone(), Value::from_json(raw)))
                    .collect();
                row.retain(|(name, _)| name != "symbol");
                row.push(("symbol".to_string(), Value::text(symbol)));
                row
            })
            .collect())
    }
}

impl PriceSource for HttpPriceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, window: &FetchWindow) -> Result<Table, SourceError> {
        validate_window(window)?;
        let symbols: Vec<String> = self
            .cfg
            .symbols
            .iter()
            .map(|s| normalize_symbol(s))
            .filter(|s| {
                let ok = is_valid_stock_symbol(s);
                if !ok {
                    info!(
                        component = "source",
                        event = "source.symbol.skipped",
                        symbol = %s
                    );
                }
                ok
            })
            .collect();

        let mut records = Vec::new();
        for (idx, symbol) in symbols.iter().enumerate() {
            debug!(
                component = "source",
                event = "source.http.fetch",
                symbol = %symbol,
                progress = idx + 1,
                total = symbols.len()
            );
            match self.fetch_symbol(symbol, window) {
                Ok(mut rows) => records.append(&mut rows),
                Err(err) => error!(
                    component = "source",
                    event = "source.http.symbol_failed",
                    symbol = %symbol,
                    error = %err
                ),
            }
            std::thread::sleep(Duration::from_millis(self.cfg.per_symbol_sleep_ms));
        }

        if records.is_empty() {
            return Ok(Table::empty());
        }
        let table = Table::from_records(&records);
        let typed = Table::from_columns(
            table
                .columns()
                .iter()
                .map(|c| {
                    let values = c
                        .values
                        .iter()
                        .map(|v| match v {
                            Value::Text(raw) if !TEXT_COLUMNS.contains(&c.name.as_str()) => {
                                type_cell(&c.name, raw)
                            }
                            other => other.clone(),
                        })
                        .collect();
                    Column::new(c.name.clone(), values)
                })
                .collect(),
        )?;
        finalize_raw(typed, window, &self.name)
    }
}

fn is_rate_limit(err: &SourceError) -> bool {
    match err {
        SourceError::RateLimited { .. } => true,
        SourceError::HttpRequest { message, .. } => {
            let lower = message.to_ascii_lowercase();
            lower.contains("rate limit") || lower.contains("429")
        }
        _ => false,
    }
}

fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Exchange stock codes are exactly three ASCII uppercase letters or digits.
pub fn is_valid_stock_symbol(symbol: &str) -> bool {
    let normalized = normalize_symbol(symbol);
    normalized.len() == 3 && normalized.chars().all(|c| c.is_ascii_alphanumeric())
}

fn type_cell(column: &str, raw: &str) -> Value {
    if TEXT_COLUMNS.contains(&column) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Value::Null
        } else {
            Value::text(trimmed)
        }
    } else {
        Value::from_cell(raw)
    }
}

fn validate_window(window: &FetchWindow) -> Result<(), SourceError> {
    if window.end < window.start {
        return Err(SourceError::InvalidWindow(format!(
            "end {} is before start {}",
            window.end, window.start
        )));
    }
    Ok(())
}

/// Types the `time` column, applies the hard date filter and stamps fetch metadata.
pub fn finalize_raw(
    table: Table,
    window: &FetchWindow,
    source_name: &str,
) -> Result<Table, SourceError> {
    if table.is_empty() {
        return Ok(table);
    }
    let times = table
        .values("time")
        .ok_or_else(|| SourceError::MissingTimeColumn {
            source_name: source_name.to_string(),
        })?;

    let typed: Vec<Value> = times
        .iter()
        .map(|v| match v {
            Value::Date(_) | Value::Timestamp(_) => v.clone(),
            Value::Text(raw) => Value::parse_temporal(raw).unwrap_or(Value::Null),
            _ => Value::Null,
        })
        .collect();
    let invalid = typed.iter().filter(|v| v.is_null()).count();
    if invalid > 0 {
        warn!(
            component = "source",
            event = "source.time.invalid_dropped",
            dropped = invalid
        );
    }

    let keep: Vec<usize> = typed
        .iter()
        .enumerate()
        .filter(|(_, v)| {
            v.calendar_date()
                .is_some_and(|d| d >= window.start && d <= window.end)
        })
        .map(|(row, _)| row)
        .collect();
    let before_filter = table.num_rows() - invalid;

    let mut table = table;
    table.set_column(Column::new("time", typed))?;
    let mut table = table.take(&keep);
    info!(
        component = "source",
        event = "source.date_filter",
        start = %window.start,
        end = %window.end,
        kept = table.num_rows(),
        total = before_filter
    );

    let rows = table.num_rows();
    let stamp = |value: String| vec![Value::Text(value); rows];
    table.set_column(Column::new("api_source", stamp(source_name.to_string())))?;
    table.set_column(Column::new("api_start_date", stamp(window.start.to_string())))?;
    table.set_column(Column::new("api_end_date", stamp(window.end.to_string())))?;
    table.set_column(Column::new("api_run_date", stamp(window.run_date.to_string())))?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    struct ScriptedFetcher {
        responses: RefCell<VecDeque<Result<Vec<u8>, SourceError>>>,
        urls: Rc<RefCell<Vec<String>>>,
    }

    impl HttpFetcher for ScriptedFetcher {
        fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError> {
            self.urls.borrow_mut().push(url.to_string());
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(SourceError::HttpRequest {
                        url: url.to_string(),
                        message: "no scripted response".to_string(),
                    })
                })
        }
    }

    fn window() -> FetchWindow {
        FetchWindow {
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            run_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        }
    }

    fn source_with(responses: Vec<Result<Vec<u8>, SourceError>>) -> HttpPriceSource {
        source_for(&["AAA"], responses, Rc::default())
    }

    fn source_for(
        symbols: &[&str],
        responses: Vec<Result<Vec<u8>, SourceError>>,
        urls: Rc<RefCell<Vec<String>>>,
    ) -> HttpPriceSource {
        HttpPriceSource {
            cfg: HttpSourceConfig {
                symbols: symbols.iter().map(|s| s.to_string()).collect(),
                rate_limit_sleep_ms: 0,
                per_symbol_sleep_ms: 0,
                ..HttpSourceConfig::default()
            },
            fetcher: Box::new(ScriptedFetcher {
                responses: RefCell::new(responses.into()),
                urls,
            }),
            name: "http".to_string(),
        }
    }

    #[test]
    fn symbol_filter_matches_three_alphanumerics() {
        assert!(is_valid_stock_symbol("VNM"));
        assert!(is_valid_stock_symbol(" fpt "));
        assert!(!is_valid_stock_symbol("E1VFVN30"));
        assert!(!is_valid_stock_symbol(""));
    }

    #[test]
    fn configured_symbols_are_trimmed_and_uppercased_before_use() {
        let body = br#"[{"time": "2024-01-02", "close": 10.5, "volume": 100, "symbol": "x"}]"#;
        let urls = Rc::new(RefCell::new(Vec::new()));
        let source = source_for(&[" fpt "], vec![Ok(body.to_vec())], Rc::clone(&urls));

        let table = source.fetch(&window()).unwrap();
        assert_eq!(table.values("symbol").unwrap(), &[Value::text("FPT")]);
        let urls = urls.borrow();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].contains("symbol=FPT&"));
    }

    #[test]
    fn rate_limit_is_retried_then_parsed() {
        let body = br#"[{"time": "2024-01-02", "open": 10, "close": 10.5, "volume": 100}]"#;
        let source = source_with(vec![
            Err(SourceError::RateLimited {
                url: "u".to_string(),
            }),
            Ok(body.to_vec()),
        ]);

        let table = source.fetch(&window()).unwrap();
        assert_eq!(table.num_rows(), 1);
        assert_eq!(table.values("symbol").unwrap()[0], Value::text("AAA"));
        assert_eq!(
            table.values("time").unwrap()[0],
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
        );
        assert_eq!(table.values("api_source").unwrap()[0], Value::text("http"));
    }

    #[test]
    fn rows_outside_window_are_filtered() {
        let table = Table::from_columns(vec![
            Column::new(
                "time",
                vec![
                    Value::text("2023-12-31"),
                    Value::text("2024-01-15 00:00:00"),
                    Value::text("garbage"),
                ],
            ),
            Column::new("symbol", vec![Value::text("AAA"); 3]),
        ])
        .unwrap();

        let out = finalize_raw(table, &window(), "csv").unwrap();
        assert_eq!(out.num_rows(), 1);
        assert_eq!(
            out.values("api_run_date").unwrap()[0],
            Value::text("2024-02-01")
        );
    }

    #[test]
    fn missing_time_column_is_fatal() {
        let table =
            Table::from_columns(vec![Column::new("symbol", vec![Value::text("AAA")])]).unwrap();
        assert!(matches!(
            finalize_raw(table, &window(), "csv"),
            Err(SourceError::MissingTimeColumn { .. })
        ));
    }
}
