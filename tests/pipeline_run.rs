use std::io::Write;
use std::sync::Arc;

use chrono::NaiveDate;
use equity_lake::{
    run_daily_pipeline, Column, CsvPriceSource, DateRange, FetchWindow, LayerPaths,
    MemoryObjectStore, PipelineContext, PipelineStage, PriceSource, RetryPolicy, SchemaContract,
    SourceError, StageError, StorageClient, Table, Terminal, ValidationMode, Value,
};
use tempfile::NamedTempFile;

struct FixedSource {
    table: Table,
}

impl PriceSource for FixedSource {
    fn name(&self) -> &str {
        "fixed"
    }

    fn fetch(&self, _window: &FetchWindow) -> Result<Table, SourceError> {
        Ok(self.table.clone())
    }
}

struct BrokenSource;

impl PriceSource for BrokenSource {
    fn name(&self) -> &str {
        "broken"
    }

    fn fetch(&self, _window: &FetchWindow) -> Result<Table, SourceError> {
        Err(SourceError::MissingTimeColumn {
            source_name: "broken".to_string(),
        })
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn context(source: Box<dyn PriceSource>, store: &Arc<MemoryObjectStore>) -> PipelineContext {
    PipelineContext {
        source,
        storage: StorageClient::new(
            Box::new(Arc::clone(store)),
            "lake",
            RetryPolicy {
                max_retries: 3,
                retry_sleep_ms: 0,
            },
        ),
        paths: LayerPaths::default(),
        exchange: "HOSE".to_string(),
        source_name: "vnstock".to_string(),
        source_range: DateRange {
            start: date(2024, 1, 1),
            end: date(2024, 1, 31),
        },
        dataset_range: DateRange {
            start: date(2024, 1, 1),
            end: date(2024, 1, 31),
        },
        validation_mode: ValidationMode::Strict,
        silver_contract: SchemaContract::silver_stock_price(),
        gold_contract: SchemaContract::gold_stock_price_daily(),
        ingestion_time: Some(
            date(2024, 2, 1)
                .and_hms_opt(6, 0, 0)
                .expect("valid time"),
        ),
    }
}

fn raw_rows() -> Table {
    Table::from_columns(vec![
        Column::new(
            "time",
            vec![
                Value::Date(date(2024, 1, 2)),
                Value::Date(date(2024, 1, 3)),
                Value::Date(date(2024, 1, 2)),
                Value::Date(date(2024, 1, 3)),
            ],
        ),
        Column::new(
            "symbol",
            vec![
                Value::text("AAA"),
                Value::text("AAA"),
                Value::text("BBB"),
                Value::text("BBB"),
            ],
        ),
        Column::new("open", vec![Value::Float(9.5); 4]),
        Column::new("high", vec![Value::Float(12.0); 4]),
        Column::new("low", vec![Value::Float(9.0); 4]),
        Column::new(
            "close",
            vec![
                Value::Float(10.0),
                Value::Float(11.0),
                Value::Float(20.0),
                Value::Float(19.0),
            ],
        ),
        Column::new(
            "volume",
            vec![Value::Int(100), Value::Int(200), Value::Null, Value::Int(-3)],
        ),
    ])
    .expect("columns share a length")
}

fn keys_under(store: &MemoryObjectStore, prefix: &str) -> Vec<String> {
    store
        .keys()
        .into_iter()
        .filter(|k| k.starts_with(prefix))
        .collect()
}

#[test]
fn full_run_writes_all_three_layers() {
    let store = Arc::new(MemoryObjectStore::new());
    let ctx = context(Box::new(FixedSource { table: raw_rows() }), &store);

    let outcome = run_daily_pipeline(&ctx, date(2024, 2, 1)).expect("run succeeds");

    assert_eq!(outcome.terminal, Terminal::Completed);
    assert_eq!(
        outcome.stages,
        vec![
            PipelineStage::Fetch,
            PipelineStage::SaveRaw,
            PipelineStage::Clean,
            PipelineStage::ValidateSilver,
            PipelineStage::SaveSilver,
            PipelineStage::BuildGold,
            PipelineStage::ValidateGold,
            PipelineStage::SaveGold,
            PipelineStage::Done,
        ]
    );

    let bronze = keys_under(&store, "bronze/stock_price/");
    assert!(bronze.contains(&"bronze/stock_price/data_date=2024-01-02/stock_price.json".to_string()));
    assert!(bronze.contains(&"bronze/stock_price/run_date=2024-02-01/_SUCCESS".to_string()));

    let silver = keys_under(&store, "silver/stock_price/trading_date=");
    assert_eq!(silver.len(), 2);
    let gold = outcome.gold.expect("gold receipt");
    assert_eq!(gold.data_keys().len(), 2);
    assert_eq!(
        gold.success_marker(),
        Some("gold/stock_price_daily/run_date=2024-02-01/_SUCCESS")
    );

    let features = outcome.feature_report.expect("feature report");
    assert_eq!(features.output_rows, 4);
    assert_eq!(features.symbols, 2);
    assert!(outcome.silver_report.expect("silver report").is_clean());
    assert!(outcome.gold_report.expect("gold report").is_clean());
}

#[test]
fn empty_fetch_is_a_graceful_terminal() {
    let store = Arc::new(MemoryObjectStore::new());
    let ctx = context(Box::new(FixedSource { table: Table::empty() }), &store);

    let outcome = run_daily_pipeline(&ctx, date(2024, 2, 1)).expect("empty fetch is not an error");

    assert_eq!(outcome.terminal, Terminal::NoSourceRows);
    assert_eq!(outcome.stages, vec![PipelineStage::Fetch, PipelineStage::Done]);
    assert!(store.keys().is_empty());
}

#[test]
fn fetch_failure_reports_the_failing_stage() {
    let store = Arc::new(MemoryObjectStore::new());
    let ctx = context(Box::new(BrokenSource), &store);

    let err = run_daily_pipeline(&ctx, date(2024, 2, 1)).expect_err("fetch failure is fatal");

    assert_eq!(err.stage, PipelineStage::Fetch);
    assert!(matches!(err.source, StageError::Source(_)));
    assert!(err.to_string().contains("FETCH"));
}

#[test]
fn strict_silver_violation_stops_after_raw_was_written() {
    let store = Arc::new(MemoryObjectStore::new());
    let mut ctx = context(Box::new(FixedSource { table: raw_rows() }), &store);
    let mut contract = SchemaContract::silver_stock_price();
    contract
        .columns
        .get_mut("open")
        .expect("open declared")
        .column_type = "date".to_string().into();
    ctx.silver_contract = contract;

    let err = run_daily_pipeline(&ctx, date(2024, 2, 1)).expect_err("strict violation is fatal");

    assert_eq!(err.stage, PipelineStage::ValidateSilver);
    assert!(matches!(err.source, StageError::Contract(_)));
    assert!(!keys_under(&store, "bronze/").is_empty());
    assert!(keys_under(&store, "silver/").is_empty());
}

#[test]
fn permissive_mode_logs_and_continues() {
    let store = Arc::new(MemoryObjectStore::new());
    let mut ctx = context(Box::new(FixedSource { table: raw_rows() }), &store);
    let mut contract = SchemaContract::silver_stock_price();
    contract
        .columns
        .get_mut("open")
        .expect("open declared")
        .column_type = "date".to_string().into();
    ctx.silver_contract = contract;
    ctx.validation_mode = ValidationMode::Permissive;

    let outcome = run_daily_pipeline(&ctx, date(2024, 2, 1)).expect("permissive run completes");

    assert_eq!(outcome.terminal, Terminal::Completed);
    assert!(!outcome.silver_report.expect("silver report").is_clean());
}

#[test]
fn rows_without_close_fail_strict_silver_validation() {
    let store = Arc::new(MemoryObjectStore::new());
    let mut raw = raw_rows();
    raw.set_column(Column::new("close", vec![Value::Null; 4]))
        .expect("same length");
    let ctx = context(Box::new(FixedSource { table: raw }), &store);

    let err = run_daily_pipeline(&ctx, date(2024, 2, 1))
        .expect_err("empty silver fails strict validation");
    assert_eq!(err.stage, PipelineStage::ValidateSilver);
}

#[test]
fn empty_silver_in_permissive_mode_ends_at_no_gold_rows() {
    let store = Arc::new(MemoryObjectStore::new());
    let mut raw = raw_rows();
    raw.set_column(Column::new("close", vec![Value::Null; 4]))
        .expect("same length");
    let mut ctx = context(Box::new(FixedSource { table: raw }), &store);
    ctx.validation_mode = ValidationMode::Permissive;

    let outcome = run_daily_pipeline(&ctx, date(2024, 2, 1)).expect("run ends gracefully");

    assert_eq!(outcome.terminal, Terminal::NoGoldRows);
    assert_eq!(outcome.stages.last(), Some(&PipelineStage::Done));
    assert!(outcome.silver.is_none());
    assert!(outcome.raw.is_some());
    assert!(keys_under(&store, "gold/").is_empty());
}

#[test]
fn csv_source_feeds_the_pipeline() {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(file, "time,symbol,open,high,low,close,volume").expect("header");
    writeln!(file, "2023-12-29,AAA,1,1,1,1,1").expect("row");
    writeln!(file, "2024-01-02,AAA,9.5,12,9,10,100").expect("row");
    writeln!(file, "2024-01-03 00:00:00,AAA,10,12,9,11,200").expect("row");
    writeln!(file, "2024-01-04,AAA,,,,12.5,").expect("row");
    file.flush().expect("flush");

    let store = Arc::new(MemoryObjectStore::new());
    let ctx = context(Box::new(CsvPriceSource::new(file.path())), &store);

    let outcome = run_daily_pipeline(&ctx, date(2024, 2, 1)).expect("run succeeds");

    assert_eq!(outcome.terminal, Terminal::Completed);
    assert_eq!(
        outcome.feature_report.expect("feature report").output_rows,
        3
    );
    assert!(keys_under(&store, "bronze/stock_price/data_date=2023-12-29").is_empty());
    assert_eq!(keys_under(&store, "gold/stock_price_daily/trading_date=").len(), 3);
}
