use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use equity_lake::{
    build_features, log_stage_failure, log_stage_transition, run_daily_pipeline, validate, Column,
    DateRange, FetchWindow, LayerPaths, MemoryObjectStore, ObjectStore, PipelineContext,
    PipelineError, PipelineStage, PriceSource, RetryPolicy, SchemaContract, SourceError,
    StageError, StorageClient, StorageError, Table, ValidationMode, Value,
};
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn null_volume_table() -> Table {
    Table::from_columns(vec![
        Column::new("symbol", vec![Value::text("AAA")]),
        Column::new(
            "trading_date",
            vec![Value::Date(
                NaiveDate::from_ymd_opt(2024, 1, 2).expect("valid date"),
            )],
        ),
        Column::new("close_price", vec![Value::Float(10.0)]),
        Column::new("volume", vec![Value::Null]),
    ])
    .expect("columns share a length")
}

struct AlwaysDown;

impl ObjectStore for AlwaysDown {
    fn put_object(&self, key: &str, _body: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::Backend {
            key: key.to_string(),
            message: "simulated outage".to_string(),
        })
    }

    fn describe(&self) -> String {
        "down".to_string()
    }
}

#[test]
fn permissive_validation_logs_each_violation() {
    let contract = SchemaContract::from_json(
        r#"{
          "table": "prices",
          "columns": {
            "symbol": { "type": "string", "nullable": false },
            "trading_date": { "type": "date", "nullable": false },
            "close_price": { "type": "float", "nullable": false },
            "volume": { "type": "int", "nullable": false }
          }
        }"#,
    )
    .expect("contract parses");

    let logs = capture_logs(Level::INFO, || {
        let report = validate(&null_volume_table(), &contract, ValidationMode::Permissive)
            .expect("permissive validation returns normally");
        assert_eq!(report.violations.len(), 1);
    });

    assert!(logs.contains("\"event\":\"contract.validate.violation\""));
    assert!(logs.contains("\"event\":\"contract.validate.finish\""));
    assert!(logs.contains("volume"));
}

#[test]
fn exhausted_upload_logs_every_attempt() {
    let logs = capture_logs(Level::INFO, || {
        let client = StorageClient::new(
            Box::new(AlwaysDown),
            "lake",
            RetryPolicy {
                max_retries: 2,
                retry_sleep_ms: 0,
            },
        );
        let err = client
            .upload_bytes("gold/x.parquet", b"x")
            .expect_err("store is down");
        assert!(matches!(err, StorageError::RetriesExhausted { attempts: 2, .. }));
    });

    assert_eq!(
        logs.matches("\"event\":\"storage.upload.attempt_failed\"").count(),
        2
    );
    assert!(logs.contains("\"event\":\"storage.upload.exhausted\""));
    assert!(logs.contains("\"event\":\"storage.client.acquired\""));
    assert!(logs.contains("\"event\":\"storage.client.released\""));
}

#[test]
fn feature_build_logs_duplicate_drops_at_warn() {
    let mut table = null_volume_table();
    table
        .set_column(Column::new("volume", vec![Value::Int(5)]))
        .expect("same length");
    table
        .set_column(Column::new("exchange", vec![Value::text("HOSE")]))
        .expect("same length");
    let doubled = table.take(&[0, 0]);

    let logs = capture_logs(Level::WARN, || {
        let out = build_features(&doubled).expect("build succeeds");
        assert_eq!(out.report.duplicate_rows_dropped, 1);
    });

    assert!(logs.contains("\"event\":\"features.build.duplicates_dropped\""));
    assert!(!logs.contains("features.build.finish"));
}

#[test]
fn stage_transitions_are_structured() {
    let logs = capture_logs(Level::INFO, || {
        log_stage_transition(PipelineStage::Fetch, PipelineStage::SaveRaw, Some(4));
        log_stage_transition(PipelineStage::SaveGold, PipelineStage::Done, None);
    });

    assert!(logs.contains("\"event\":\"stage.transition\""));
    assert!(logs.contains("\"from\":\"FETCH\""));
    assert!(logs.contains("\"to\":\"DONE\""));
}

#[test]
fn stage_failure_logs_the_cause_chain() {
    let err = PipelineError {
        stage: PipelineStage::SaveSilver,
        source: StageError::Storage(StorageError::RetriesExhausted {
            key: "silver/k".to_string(),
            attempts: 3,
            last_error: Box::new(StorageError::Backend {
                key: "silver/k".to_string(),
                message: "simulated outage".to_string(),
            }),
        }),
    };

    let logs = capture_logs(Level::ERROR, || log_stage_failure(err.stage, &err));

    assert!(logs.contains("\"event\":\"stage.failed\""));
    assert!(logs.contains("\"stage\":\"SAVE_SILVER\""));
    assert!(logs.contains("simulated outage"));
}

struct UnreachableSource;

impl PriceSource for UnreachableSource {
    fn name(&self) -> &str {
        "unreachable"
    }

    fn fetch(&self, _window: &FetchWindow) -> Result<Table, SourceError> {
        Err(SourceError::InvalidWindow("upstream unreachable".to_string()))
    }
}

#[test]
fn failed_run_logs_the_failure_once() {
    let day = |d: u32| NaiveDate::from_ymd_opt(2024, 1, d).expect("valid date");
    let ctx = PipelineContext {
        source: Box::new(UnreachableSource),
        storage: StorageClient::new(
            Box::new(MemoryObjectStore::new()),
            "lake",
            RetryPolicy {
                max_retries: 1,
                retry_sleep_ms: 0,
            },
        ),
        paths: LayerPaths::default(),
        exchange: "HOSE".to_string(),
        source_name: "vnstock".to_string(),
        source_range: DateRange {
            start: day(1),
            end: day(31),
        },
        dataset_range: DateRange {
            start: day(1),
            end: day(31),
        },
        validation_mode: ValidationMode::Strict,
        silver_contract: SchemaContract::silver_stock_price(),
        gold_contract: SchemaContract::gold_stock_price_daily(),
        ingestion_time: None,
    };

    let logs = capture_logs(Level::ERROR, || {
        let err = run_daily_pipeline(&ctx, day(31)).expect_err("fetch fails");
        assert_eq!(err.stage, PipelineStage::Fetch);
    });

    assert_eq!(logs.matches("\"event\":\"stage.failed\"").count(), 1);
    assert!(logs.contains("upstream unreachable"));
}
