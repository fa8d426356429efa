//! Object storage: stores, retrying uploads, partitioned layer writers.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::parquet::encode_parquet;
use crate::table::{Table, Value};

pub const SUCCESS_MARKER: &str = "_SUCCESS";
const RAW_DATE_CANDIDATES: [&str; 3] = ["trading_date", "date", "time"];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("missing required columns: {0:?}")]
    MissingColumns(Vec<String>),
    #[error("partition column '{0}' not found")]
    MissingPartitionColumn(String),
    #[error("no date column (one of {candidates:?}) found for raw write")]
    MissingDateColumn { candidates: Vec<String> },
    #[error("partition column '{column}' must hold calendar dates; row {row} has {found}")]
    PartitionNotDate {
        column: String,
        row: usize,
        found: String,
    },
    #[error("invalid object key '{0}'")]
    InvalidKey(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode partition {partition}: {message}")]
    Encode { partition: String, message: String },
    #[error("failed to serialize raw records: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("object store rejected {key}: {message}")]
    Backend { key: String, message: String },
    #[error("failed to upload {key} after {attempts} attempts")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        #[source]
        last_error: Box<StorageError>,
    },
}

pub trait ObjectStore: Send + Sync {
    fn put_object(&self, key: &str, body: &[u8]) -> Result<(), StorageError>;

    fn describe(&self) -> String;
}

/// Filesystem-backed store; keys map to paths under `root`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for LocalObjectStore {
    fn put_object(&self, key: &str, body: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, body)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

/// In-process store, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(key).cloned())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put_object(&self, key: &str, body: &[u8]) -> Result<(), StorageError> {
        let mut objects = self.objects.lock().map_err(|_| StorageError::Backend {
            key: key.to_string(),
            message: "memory store lock poisoned".to_string(),
        })?;
        objects.insert(key.to_string(), body.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

impl<S: ObjectStore + ?Sized> ObjectStore for std::sync::Arc<S> {
    fn put_object(&self, key: &str, body: &[u8]) -> Result<(), StorageError> {
        (**self).put_object(key, body)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per object, including the first.
    pub max_retries: u32,
    pub retry_sleep_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_sleep_ms: 2_000,
        }
    }
}

/// Explicitly passed storage handle: one store, one bucket, one retry policy.
pub struct StorageClient {
    store: Box<dyn ObjectStore>,
    bucket: String,
    retry: RetryPolicy,
}

impl StorageClient {
    pub fn new(store: Box<dyn ObjectStore>, bucket: impl Into<String>, retry: RetryPolicy) -> Self {
        let client = Self {
            store,
            bucket: bucket.into(),
            retry,
        };
        info!(
            component = "storage",
            event = "storage.client.acquired",
            bucket = %client.bucket,
            store = %client.store.describe(),
            max_retries = retry.max_retries,
            retry_sleep_ms = retry.retry_sleep_ms
        );
        client
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Uploads one object, retrying transient failures with a fixed sleep between
    /// attempts. Fails after exactly `max_retries` attempts.
    pub fn upload_bytes(&self, key: &str, body: &[u8]) -> Result<(), StorageError> {
        let max_attempts = self.retry.max_retries.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.store.put_object(key, body) {
                Ok(()) => {
                    info!(
                        component = "storage",
                        event = "storage.upload.ok",
                        bucket = %self.bucket,
                        key,
                        bytes = body.len(),
                        attempt
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        component = "storage",
                        event = "storage.upload.attempt_failed",
                        bucket = %self.bucket,
                        key,
                        attempt,
                        max_attempts,
                        error = %err
                    );
                    if attempt >= max_attempts {
                        error!(
                            component = "storage",
                            event = "storage.upload.exhausted",
                            bucket = %self.bucket,
                            key,
                            attempts = attempt
                        );
                        return Err(StorageError::RetriesExhausted {
                            key: key.to_string(),
                            attempts: attempt,
                            last_error: Box::new(err),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(self.retry.retry_sleep_ms));
                }
            }
        }
    }
}

impl Drop for StorageClient {
    fn drop(&mut self) {
        info!(
            component = "storage",
            event = "storage.client.released",
            bucket = %self.bucket
        );
    }
}

/// Ordered list of keys written by one layer write, ending with the success marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub keys: Vec<String>,
}

impl UploadReceipt {
    pub fn success_marker(&self) -> Option<&str> {
        self.keys
            .last()
            .map(String::as_str)
            .filter(|key| key.ends_with(SUCCESS_MARKER))
    }

    pub fn data_keys(&self) -> &[String] {
        match self.success_marker() {
            Some(_) => &self.keys[..self.keys.len() - 1],
            None => &self.keys,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionedWrite<'a> {
    pub location: &'a str,
    pub partition_column: &'a str,
    pub required_columns: &'a [&'a str],
    pub run_date: NaiveDate,
    pub filename_prefix: &'a str,
}

pub fn success_marker_key(location: &str, run_date: NaiveDate) -> String {
    format!("{location}/run_date={}/{SUCCESS_MARKER}", run_date.format("%Y-%m-%d"))
}

/// Writes one parquet object per calendar date of `partition_column`, then the
/// run's success marker. Returns `None` without writing when the table is empty.
pub fn write_partitioned(
    client: &StorageClient,
    table: &Table,
    req: &PartitionedWrite<'_>,
) -> Result<Option<UploadReceipt>, StorageError> {
    if table.is_empty() {
        warn!(
            component = "storage",
            event = "storage.partitioned.empty",
            location = req.location
        );
        return Ok(None);
    }

    let missing = table.missing_columns(req.required_columns.iter().copied());
    if !missing.is_empty() {
        return Err(StorageError::MissingColumns(missing));
    }
    if !table.has_column(req.partition_column) {
        return Err(StorageError::MissingPartitionColumn(
            req.partition_column.to_string(),
        ));
    }
    assert_date_column(table, req.partition_column, |v| matches!(v, Value::Date(_)))?;

    info!(
        component = "storage",
        event = "storage.partitioned.start",
        bucket = client.bucket(),
        location = req.location,
        partition_column = req.partition_column,
        rows = table.num_rows()
    );

    let mut receipt = UploadReceipt::default();
    for (date, rows) in table.group_by_date(req.partition_column) {
        let partition = date.format("%Y-%m-%d").to_string();
        let key = format!(
            "{}/{}={partition}/{}{}.parquet",
            req.location,
            req.partition_column,
            req.filename_prefix,
            Uuid::new_v4().simple()
        );
        let body = encode_parquet(&table.take(&rows)).map_err(|err| StorageError::Encode {
            partition: partition.clone(),
            message: err.to_string(),
        })?;
        client.upload_bytes(&key, &body)?;
        receipt.keys.push(key);
    }

    let marker = success_marker_key(req.location, req.run_date);
    client.upload_bytes(&marker, &[])?;
    receipt.keys.push(marker);

    info!(
        component = "storage",
        event = "storage.partitioned.finish",
        location = req.location,
        objects = receipt.keys.len()
    );
    Ok(Some(receipt))
}

/// Raw layer write: one JSON array of records per calendar date at
/// `{location}/data_date={date}/{dataset}.json`, then the success marker.
pub fn write_raw_json(
    client: &StorageClient,
    table: &Table,
    location: &str,
    run_date: NaiveDate,
    dataset: &str,
) -> Result<Option<UploadReceipt>, StorageError> {
    if table.is_empty() {
        warn!(
            component = "storage",
            event = "storage.raw.empty",
            location
        );
        return Ok(None);
    }

    let date_col = RAW_DATE_CANDIDATES
        .iter()
        .copied()
        .find(|c| table.has_column(c))
        .ok_or_else(|| StorageError::MissingDateColumn {
            candidates: RAW_DATE_CANDIDATES.iter().map(|c| c.to_string()).collect(),
        })?;
    assert_date_column(table, date_col, Value::is_temporal)?;

    let mut receipt = UploadReceipt::default();
    for (date, rows) in table.group_by_date(date_col) {
        let records: Vec<serde_json::Map<String, serde_json::Value>> = rows
            .iter()
            .map(|&row| {
                table
                    .row_record(row)
                    .into_iter()
                    .map(|(name, value)| (name.to_string(), value.to_json()))
                    .collect()
            })
            .collect();
        let payload = serde_json::to_vec(&records)?;
        let key = format!(
            "{location}/data_date={}/{dataset}.json",
            date.format("%Y-%m-%d")
        );
        client.upload_bytes(&key, &payload)?;
        receipt.keys.push(key);
    }

    let marker = success_marker_key(location, run_date);
    client.upload_bytes(&marker, &[])?;
    receipt.keys.push(marker);

    info!(
        component = "storage",
        event = "storage.raw.finish",
        location,
        objects = receipt.keys.len()
    );
    Ok(Some(receipt))
}

fn assert_date_column(
    table: &Table,
    column: &str,
    accept: impl Fn(&Value) -> bool,
) -> Result<(), StorageError> {
    let values = table.values(column).unwrap_or_default();
    match values.iter().position(|v| !accept(v)) {
        Some(row) => Err(StorageError::PartitionNotDate {
            column: column.to_string(),
            row,
            found: format!("{:?}", values[row]),
        }),
        None => Ok(()),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| StorageError::InvalidKey(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
