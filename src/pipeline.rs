//! Daily raw → silver → gold run as a strictly sequential state machine.
//!
//! Each batch type is produced only by the stage before it, so a silver table
//! cannot be saved before it is validated and gold cannot be built from raw rows.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::clean::{clean_stock_price, CleanError, CleanOptions};
use crate::config::{DateRange, LayerPaths, PipelineConfig};
use crate::contract::{validate, ContractError, SchemaContract, ValidationMode, ValidationReport};
use crate::features::{build_features, FeatureBuildReport, FeatureError};
use crate::observability::{log_run_start, log_stage_failure, log_stage_transition};
use crate::source::{FetchWindow, PriceSource, SourceError};
use crate::storage::{
    write_partitioned, write_raw_json, PartitionedWrite, StorageClient, StorageError,
    UploadReceipt,
};
use crate::table::{Table, Value};

pub const RAW_DATASET: &str = "stock_price";
pub const PARTITION_COLUMN: &str = "trading_date";
pub const PARQUET_PREFIX: &str = "part-";
pub const SILVER_REQUIRED_COLUMNS: [&str; 2] = ["trading_date", "symbol"];
pub const GOLD_REQUIRED_COLUMNS: [&str; 4] = ["symbol", "trading_date", "close_price", "volume"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStage {
    Fetch,
    SaveRaw,
    Clean,
    ValidateSilver,
    SaveSilver,
    BuildGold,
    ValidateGold,
    SaveGold,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "FETCH",
            Self::SaveRaw => "SAVE_RAW",
            Self::Clean => "CLEAN",
            Self::ValidateSilver => "VALIDATE_SILVER",
            Self::SaveSilver => "SAVE_SILVER",
            Self::BuildGold => "BUILD_GOLD",
            Self::ValidateGold => "VALIDATE_GOLD",
            Self::SaveGold => "SAVE_GOLD",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Clean(#[from] CleanError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error("precondition failed: {0}")]
    Precondition(String),
}

#[derive(Debug, Error)]
#[error("pipeline failed at {stage}: {source}")]
pub struct PipelineError {
    pub stage: PipelineStage,
    #[source]
    pub source: StageError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminal {
    Completed,
    /// Source returned no rows; nothing was written.
    NoSourceRows,
    /// Gold build produced no rows; raw and silver were written.
    NoGoldRows,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub run_date: NaiveDate,
    pub terminal: Terminal,
    pub stages: Vec<PipelineStage>,
    pub raw: Option<UploadReceipt>,
    pub silver: Option<UploadReceipt>,
    pub gold: Option<UploadReceipt>,
    pub silver_report: Option<ValidationReport>,
    pub gold_report: Option<ValidationReport>,
    pub feature_report: Option<FeatureBuildReport>,
}

/// Everything a run needs, passed explicitly.
pub struct PipelineContext {
    pub source: Box<dyn PriceSource>,
    pub storage: StorageClient,
    pub paths: LayerPaths,
    pub exchange: String,
    pub source_name: String,
    pub source_range: DateRange,
    pub dataset_range: DateRange,
    pub validation_mode: ValidationMode,
    pub silver_contract: SchemaContract,
    pub gold_contract: SchemaContract,
    /// Fixed ingestion timestamp; the wall clock is used when unset.
    pub ingestion_time: Option<NaiveDateTime>,
}

impl PipelineContext {
    pub fn from_config(
        config: &PipelineConfig,
        source: Box<dyn PriceSource>,
        storage: StorageClient,
    ) -> Result<Self, ContractError> {
        let silver_contract = match &config.silver_contract {
            Some(path) => SchemaContract::from_path(path)?,
            None => SchemaContract::silver_stock_price(),
        };
        let gold_contract = match &config.gold_contract {
            Some(path) => SchemaContract::from_path(path)?,
            None => SchemaContract::gold_stock_price_daily(),
        };
        Ok(Self {
            source,
            storage,
            paths: config.paths.clone(),
            exchange: config.exchange.clone(),
            source_name: config.source_name.clone(),
            source_range: config.source_range,
            dataset_range: config.dataset_range,
            validation_mode: config.validation_mode,
            silver_contract,
            gold_contract,
            ingestion_time: None,
        })
    }

    fn fetch_window(&self, run_date: NaiveDate) -> FetchWindow {
        FetchWindow {
            start: self.source_range.start,
            end: self.source_range.end,
            run_date,
        }
    }
}

#[derive(Debug)]
pub struct RawBatch {
    table: Table,
}

#[derive(Debug)]
pub struct CleanedBatch {
    table: Table,
}

#[derive(Debug)]
pub struct ValidatedSilver {
    table: Table,
    report: ValidationReport,
}

#[derive(Debug)]
pub struct GoldBatch {
    table: Table,
    report: FeatureBuildReport,
}

#[derive(Debug)]
pub struct ValidatedGold {
    table: Table,
    report: ValidationReport,
}

impl RawBatch {
    /// `None` when the source has nothing for the window.
    pub fn fetch(source: &dyn PriceSource, window: &FetchWindow) -> Result<Option<Self>, StageError> {
        let table = source.fetch(window)?;
        Ok((!table.is_empty()).then_some(Self { table }))
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn save(
        &self,
        storage: &StorageClient,
        location: &str,
        run_date: NaiveDate,
    ) -> Result<Option<UploadReceipt>, StageError> {
        Ok(write_raw_json(storage, &self.table, location, run_date, RAW_DATASET)?)
    }

    pub fn clean(self, opts: &CleanOptions) -> Result<CleanedBatch, StageError> {
        let table = clean_stock_price(&self.table, opts)?;
        Ok(CleanedBatch { table })
    }
}

impl CleanedBatch {
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Checks the silver contract. `trading_date` must already hold pure dates;
    /// it is never repaired here.
    pub fn validate(
        self,
        contract: &SchemaContract,
        mode: ValidationMode,
    ) -> Result<ValidatedSilver, StageError> {
        require_pure_dates(&self.table, PARTITION_COLUMN)?;
        let report = validate(&self.table, contract, mode)?;
        Ok(ValidatedSilver {
            table: self.table,
            report,
        })
    }
}

impl ValidatedSilver {
    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    pub fn save(
        &self,
        storage: &StorageClient,
        location: &str,
        run_date: NaiveDate,
    ) -> Result<Option<UploadReceipt>, StageError> {
        let req = PartitionedWrite {
            location,
            partition_column: PARTITION_COLUMN,
            required_columns: &SILVER_REQUIRED_COLUMNS,
            run_date,
            filename_prefix: PARQUET_PREFIX,
        };
        Ok(write_partitioned(storage, &self.table, &req)?)
    }

    /// `None` when feature building yields no rows.
    pub fn build_gold(self) -> Result<Option<GoldBatch>, StageError> {
        let build = build_features(&self.table)?;
        if build.table.is_empty() {
            return Ok(None);
        }
        Ok(Some(GoldBatch {
            table: build.table,
            report: build.report,
        }))
    }
}

impl GoldBatch {
    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn report(&self) -> &FeatureBuildReport {
        &self.report
    }

    pub fn validate(
        self,
        contract: &SchemaContract,
        mode: ValidationMode,
    ) -> Result<ValidatedGold, StageError> {
        let report = validate(&self.table, contract, mode)?;
        Ok(ValidatedGold {
            table: self.table,
            report,
        })
    }
}

impl ValidatedGold {
    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    pub fn save(
        &self,
        storage: &StorageClient,
        location: &str,
        run_date: NaiveDate,
    ) -> Result<Option<UploadReceipt>, StageError> {
        let req = PartitionedWrite {
            location,
            partition_column: PARTITION_COLUMN,
            required_columns: &GOLD_REQUIRED_COLUMNS,
            run_date,
            filename_prefix: PARQUET_PREFIX,
        };
        Ok(write_partitioned(storage, &self.table, &req)?)
    }
}

fn require_pure_dates(table: &Table, column: &str) -> Result<(), StageError> {
    let Some(values) = table.values(column) else {
        return Ok(());
    };
    match values.iter().position(|v| !matches!(v, Value::Date(_))) {
        Some(row) => Err(StageError::Precondition(format!(
            "{column} must hold calendar dates produced by clean; row {row} has {:?}",
            values[row]
        ))),
        None => Ok(()),
    }
}

struct StageTracker {
    current: PipelineStage,
    visited: Vec<PipelineStage>,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            current: PipelineStage::Fetch,
            visited: Vec::new(),
        }
    }

    fn run<T>(
        &mut self,
        stage: PipelineStage,
        op: impl FnOnce() -> Result<T, StageError>,
    ) -> Result<T, PipelineError> {
        if let Some(prev) = self.visited.last() {
            log_stage_transition(*prev, stage, None);
        }
        self.current = stage;
        self.visited.push(stage);
        op().map_err(|source| {
            log_stage_failure(stage, &source);
            log_stage_transition(stage, PipelineStage::Failed, None);
            PipelineError { stage, source }
        })
    }

    fn finish(mut self, rows: Option<usize>) -> Vec<PipelineStage> {
        log_stage_transition(self.current, PipelineStage::Done, rows);
        self.visited.push(PipelineStage::Done);
        self.visited
    }
}

/// Runs FETCH through SAVE_GOLD once for `run_date`.
///
/// Empty fetch or empty gold ends the run early at DONE. Any stage error stops
/// the run; objects written by earlier stages stay in storage.
pub fn run_daily_pipeline(
    ctx: &PipelineContext,
    run_date: NaiveDate,
) -> Result<PipelineOutcome, PipelineError> {
    info!(
        component = "pipeline",
        event = "run.dataset_range",
        run_date = %run_date,
        dataset_start = %ctx.dataset_range.start,
        dataset_end = %ctx.dataset_range.end,
        applied = false
    );

    let mut tracker = StageTracker::new();
    let mut outcome = PipelineOutcome {
        run_date,
        terminal: Terminal::Completed,
        stages: Vec::new(),
        raw: None,
        silver: None,
        gold: None,
        silver_report: None,
        gold_report: None,
        feature_report: None,
    };

    let window = ctx.fetch_window(run_date);
    let fetched = tracker.run(PipelineStage::Fetch, || {
        RawBatch::fetch(ctx.source.as_ref(), &window)
    })?;
    let Some(raw) = fetched else {
        warn!(
            component = "pipeline",
            event = "run.no_source_rows",
            run_date = %run_date,
            source = ctx.source.name()
        );
        outcome.terminal = Terminal::NoSourceRows;
        outcome.stages = tracker.finish(Some(0));
        return Ok(outcome);
    };

    outcome.raw = tracker.run(PipelineStage::SaveRaw, || {
        raw.save(&ctx.storage, &ctx.paths.bronze, run_date)
    })?;

    let opts = CleanOptions {
        exchange: ctx.exchange.clone(),
        source: ctx.source_name.clone(),
        ingestion_time: ctx
            .ingestion_time
            .unwrap_or_else(|| Utc::now().naive_utc()),
    };
    let cleaned = tracker.run(PipelineStage::Clean, || raw.clean(&opts))?;
    let silver = tracker.run(PipelineStage::ValidateSilver, || {
        cleaned.validate(&ctx.silver_contract, ctx.validation_mode)
    })?;
    outcome.silver_report = Some(silver.report().clone());

    outcome.silver = tracker.run(PipelineStage::SaveSilver, || {
        silver.save(&ctx.storage, &ctx.paths.silver, run_date)
    })?;

    let gold = tracker.run(PipelineStage::BuildGold, || silver.build_gold())?;
    let Some(gold) = gold else {
        info!(
            component = "pipeline",
            event = "run.no_gold_rows",
            run_date = %run_date
        );
        outcome.terminal = Terminal::NoGoldRows;
        outcome.stages = tracker.finish(Some(0));
        return Ok(outcome);
    };
    outcome.feature_report = Some(gold.report().clone());

    let gold = tracker.run(PipelineStage::ValidateGold, || {
        gold.validate(&ctx.gold_contract, ctx.validation_mode)
    })?;
    outcome.gold_report = Some(gold.report().clone());

    outcome.gold = tracker.run(PipelineStage::SaveGold, || {
        gold.save(&ctx.storage, &ctx.paths.gold, run_date)
    })?;

    let rows = gold.table().num_rows();
    outcome.stages = tracker.finish(Some(rows));
    info!(
        component = "pipeline",
        event = "run.success",
        run_date = %run_date,
        gold_rows = rows
    );
    Ok(outcome)
}

/// Builds the run date from config or today's UTC date, logs the run header and runs.
pub fn run_from_config(
    config: &PipelineConfig,
    ctx: &PipelineContext,
) -> Result<PipelineOutcome, PipelineError> {
    let run_date = config
        .run_date
        .unwrap_or_else(|| Utc::now().date_naive());
    log_run_start(config, run_date);
    run_daily_pipeline(ctx, run_date)
}
