//! Equity price lake core crate.
//!
//! Current implemented scope:
//! - raw capture from CSV or HTTP sources into a typed table
//! - silver cleaning and contract validation (strict / permissive)
//! - gold features: daily return, expanding 5/20-day moving averages
//! - date-partitioned parquet writes with bounded retry and `_SUCCESS` markers
//! - the daily FETCH → SAVE_GOLD orchestrator

mod clean;
mod config;
mod contract;
mod features;
mod observability;
mod parquet;
mod pipeline;
mod source;
mod storage;
mod table;

pub use clean::{clean_stock_price, CleanError, CleanOptions};
pub use config::{
    ConfigError, DateRange, LayerPaths, PipelineConfig, SourceSettings, DEFAULT_BRONZE_PATH,
    DEFAULT_BUCKET, DEFAULT_GOLD_PATH, DEFAULT_SILVER_PATH, DEFAULT_STORAGE_ROOT,
};
pub use contract::{
    validate, ColumnRule, ColumnType, ContractColumns, ContractError, ContractViolation,
    QualityChecks, SchemaContract, ValidationMode, ValidationReport,
};
pub use features::{
    build_features, strip_features, FeatureBuild, FeatureBuildReport, FeatureError, GOLD_COLUMNS,
    REQUIRED_COLUMNS,
};
pub use observability::{
    init_logging, log_run_start, log_stage_failure, log_stage_transition, logging_config_from_env,
    logging_config_from_lookup, LogFormat, LoggingConfig, LoggingInitError,
};
pub use parquet::encode_parquet;
pub use pipeline::{
    run_daily_pipeline, run_from_config, CleanedBatch, GoldBatch, PipelineContext, PipelineError,
    PipelineOutcome, PipelineStage, RawBatch, StageError, Terminal, ValidatedGold,
    ValidatedSilver, GOLD_REQUIRED_COLUMNS, SILVER_REQUIRED_COLUMNS,
};
pub use source::{
    finalize_raw, is_valid_stock_symbol, CsvPriceSource, FetchWindow, HttpPriceSource,
    HttpSourceConfig, PriceSource, SourceError,
};
pub use storage::{
    success_marker_key, write_partitioned, write_raw_json, LocalObjectStore, MemoryObjectStore,
    ObjectStore, PartitionedWrite, RetryPolicy, StorageClient, StorageError, UploadReceipt,
    SUCCESS_MARKER,
};
pub use table::{Column, Table, TableError, Value, ValueKey, ValueKind};
