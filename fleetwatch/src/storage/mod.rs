//! File-backed snapshot and append-log storage.
//!
//! [`PersistenceStore`] knows nothing about devices; it only guarantees that
//! mutations of one file are serialized and that snapshot overwrites are
//! atomic for readers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::utils::fs;
use crate::{Error, Result};

pub const DEVICE_COUNT_FILE: &str = "device_count.json";
pub const DEVICE_LIST_FILE: &str = "device_list.csv";
pub const DOWN_DEVICES_JSON: &str = "down_devices.json";
pub const DOWN_DEVICES_CSV: &str = "down_devices.csv";
pub const RAW_DATA_FILE: &str = "raw_data.csv";
pub const PROCESSED_DATA_FILE: &str = "processed_data.csv";
pub const CURRENT_DOWN_INFO_FILE: &str = "current_down_device_info.csv";

#[derive(Debug, Clone)]
pub struct PersistenceStore {
    root: PathBuf,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl PersistenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Overwrite `name` with pretty-printed JSON.
    pub async fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        fs::write_atomic(&self.path(name), &bytes).await?;
        debug!(file = name, bytes = bytes.len(), "snapshot written");
        Ok(())
    }

    /// Read a JSON snapshot; a missing file is [`Error::NotFound`].
    pub async fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.path(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("snapshot", name));
            }
            Err(e) => return Err(fs::io_error("reading snapshot", &path, e)),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Overwrite `name` with a CSV of `rows` under `header`.
    pub async fn write_csv<T: Serialize>(
        &self,
        name: &str,
        header: &[&str],
        rows: &[T],
    ) -> Result<()> {
        let bytes = encode_csv(Some(header), rows)?;
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        fs::write_atomic(&self.path(name), &bytes).await?;
        debug!(file = name, rows = rows.len(), "csv snapshot written");
        Ok(())
    }

    /// Append one row, writing `header` first if the file is new.
    pub async fn append_record<T: Serialize>(
        &self,
        name: &str,
        header: &[&str],
        record: &T,
    ) -> Result<()> {
        self.append_records(name, header, std::slice::from_ref(record))
            .await
    }

    /// Append `records` as one locked write.
    pub async fn append_records<T: Serialize>(
        &self,
        name: &str,
        header: &[&str],
        records: &[T],
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let path = self.path(name);
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        fs::ensure_parent_dir(&path).await?;
        let is_new = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(fs::io_error("inspecting", &path, e)),
        };
        let bytes = encode_csv(is_new.then_some(header), records)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| fs::io_error("opening for append", &path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| fs::io_error("appending to", &path, e))?;
        file.flush()
            .await
            .map_err(|e| fs::io_error("flushing", &path, e))?;

        trace!(file = name, rows = records.len(), "rows appended");
        Ok(())
    }

    /// Read every row of a CSV file; a missing file is [`Error::NotFound`].
    pub async fn read_csv<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path = self.path(name);
        let bytes = {
            let lock = self.lock_for(name);
            let _guard = lock.lock().await;
            match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::not_found("csv", name));
                }
                Err(e) => return Err(fs::io_error("reading csv", &path, e)),
            }
        };
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let rows = reader.deserialize().collect::<std::result::Result<Vec<T>, _>>()?;
        Ok(rows)
    }
}

fn encode_csv<T: Serialize>(header: Option<&[&str]>, rows: &[T]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if let Some(header) = header {
        writer.write_record(header)?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| Error::Other(format!("failed to flush csv buffer: {e}")))
}
