//! Append-only record log
//!
//! A `RecordLog<T>` is a single file of framed records (see [`crate::record`]).
//! Opening a log replays every valid record and truncates whatever follows
//! the last one: a torn write from a crash, or a corrupt tail.
//!
//! The log is not internally synchronized; owners wrap it in a mutex and
//! serialize appends.

use crate::error::LogError;
use crate::mode::DurabilityMode;
use crate::record::{self, Decoded};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Append-only log of `T` records
pub struct RecordLog<T> {
    /// `None` in `Cache` mode
    file: Option<File>,
    path: Option<PathBuf>,
    mode: DurabilityMode,
    unsynced: usize,
    last_sync: Instant,
    appended: u64,
    _record: PhantomData<fn(T)>,
}

impl<T> std::fmt::Debug for RecordLog<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLog")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("appended", &self.appended)
            .finish()
    }
}

impl<T: Serialize + DeserializeOwned> RecordLog<T> {
    /// Log that keeps nothing (`Cache` mode)
    pub fn in_memory() -> Self {
        Self {
            file: None,
            path: None,
            mode: DurabilityMode::Cache,
            unsynced: 0,
            last_sync: Instant::now(),
            appended: 0,
            _record: PhantomData,
        }
    }

    /// Open (or create) the log at `path` and replay its records
    ///
    /// In `Cache` mode no file is touched and nothing is replayed.
    pub fn open(path: &Path, mode: DurabilityMode) -> Result<(Self, Vec<T>), LogError> {
        if !mode.requires_log() {
            return Ok((Self::in_memory(), Vec::new()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let (records, valid_len) = replay::<T>(&data);
        if valid_len < data.len() {
            warn!(
                target: "tessera::durability",
                path = %path.display(),
                valid_bytes = valid_len,
                dropped_bytes = data.len() - valid_len,
                "Truncating torn or corrupt log tail"
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len as u64))?;

        debug!(
            target: "tessera::durability",
            path = %path.display(),
            records = records.len(),
            "Opened record log"
        );

        let log = Self {
            file: Some(file),
            path: Some(path.to_path_buf()),
            mode,
            unsynced: 0,
            last_sync: Instant::now(),
            appended: 0,
            _record: PhantomData,
        };
        Ok((log, records))
    }

    /// Append one record, syncing according to the durability mode
    ///
    /// Under `Always` the record is on disk when this returns.
    pub fn append(&mut self, rec: &T) -> Result<(), LogError> {
        let bytes = record::encode(rec)?;
        self.appended += 1;
        let file = match self.file.as_mut() {
            None => return Ok(()),
            Some(file) => file,
        };
        file.write_all(&bytes)?;
        self.unsynced += 1;

        let sync_now = match self.mode {
            DurabilityMode::Cache => false,
            DurabilityMode::Always => true,
            DurabilityMode::Standard {
                interval_ms,
                batch_size,
            } => {
                self.unsynced >= batch_size
                    || self.last_sync.elapsed() >= Duration::from_millis(interval_ms)
            }
        };
        if sync_now {
            self.sync()?;
        }
        Ok(())
    }

    /// Force buffered appends to disk
    pub fn sync(&mut self) -> Result<(), LogError> {
        if let Some(file) = self.file.as_mut() {
            file.sync_data()?;
        }
        self.unsynced = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Replace the whole log with `records`
    ///
    /// Writes a sibling file, syncs it and renames it over the log, so a
    /// crash leaves either the old or the new contents.
    pub fn rewrite(&mut self, records: &[T]) -> Result<(), LogError> {
        let path = match self.path.clone() {
            None => return Ok(()),
            Some(path) => path,
        };
        let tmp = path.with_extension("rewrite");
        {
            let mut out = File::create(&tmp)?;
            for rec in records {
                out.write_all(&record::encode(rec)?)?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;
        self.file = Some(file);
        self.unsynced = 0;
        self.last_sync = Instant::now();

        debug!(
            target: "tessera::durability",
            path = %path.display(),
            records = records.len(),
            "Rewrote record log"
        );
        Ok(())
    }

    /// Every valid record currently in the log file
    ///
    /// Empty for a log without a file.
    pub fn records(&mut self) -> Result<Vec<T>, LogError> {
        let path = match self.path.as_ref() {
            None => return Ok(Vec::new()),
            Some(path) => path,
        };
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        let data = fs::read(path)?;
        Ok(replay::<T>(&data).0)
    }

    /// Records appended since open
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Durability mode
    pub fn mode(&self) -> DurabilityMode {
        self.mode
    }

    /// File backing the log, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Decode the valid prefix of `data`
///
/// Returns the records and the length of the prefix they occupy.
fn replay<T: DeserializeOwned>(data: &[u8]) -> (Vec<T>, usize) {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        match record::decode::<T>(&data[offset..], offset as u64) {
            Ok(Decoded::Record(rec, used)) => {
                records.push(rec);
                offset += used;
            }
            Ok(Decoded::Incomplete) => break,
            Err(e) => {
                warn!(target: "tessera::durability", error = %e, "Stopping replay at bad record");
                break;
            }
        }
    }
    (records, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Entry {
        Put { key: u64, value: String },
        Remove { key: u64 },
    }

    fn put(key: u64) -> Entry {
        Entry::Put {
            key,
            value: format!("v{}", key),
        }
    }

    #[test]
    fn test_reopen_replays_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        {
            let (mut log, replayed) = RecordLog::<Entry>::open(&path, DurabilityMode::Always).unwrap();
            assert!(replayed.is_empty());
            log.append(&put(1)).unwrap();
            log.append(&Entry::Remove { key: 1 }).unwrap();
            log.append(&put(2)).unwrap();
            assert_eq!(log.appended(), 3);
        }
        let (_log, replayed) = RecordLog::<Entry>::open(&path, DurabilityMode::Always).unwrap();
        assert_eq!(replayed, vec![put(1), Entry::Remove { key: 1 }, put(2)]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        {
            let (mut log, _) = RecordLog::<Entry>::open(&path, DurabilityMode::Always).unwrap();
            log.append(&put(1)).unwrap();
            log.append(&put(2)).unwrap();
        }
        let full = fs::metadata(&path).unwrap().len();
        // Simulate a crash in the middle of the second append
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(full - 3).unwrap();
        drop(f);

        let (mut log, replayed) = RecordLog::<Entry>::open(&path, DurabilityMode::Always).unwrap();
        assert_eq!(replayed, vec![put(1)]);
        log.append(&put(3)).unwrap();
        drop(log);

        let (_log, replayed) = RecordLog::<Entry>::open(&path, DurabilityMode::Always).unwrap();
        assert_eq!(replayed, vec![put(1), put(3)]);
    }

    #[test]
    fn test_corrupt_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        {
            let (mut log, _) = RecordLog::<Entry>::open(&path, DurabilityMode::Always).unwrap();
            log.append(&put(1)).unwrap();
            log.append(&put(2)).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let (_log, replayed) = RecordLog::<Entry>::open(&path, DurabilityMode::Always).unwrap();
        assert_eq!(replayed, vec![put(1)]);
    }

    #[test]
    fn test_cache_mode_touches_no_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let (mut log, _) = RecordLog::<Entry>::open(&path, DurabilityMode::Cache).unwrap();
        log.append(&put(1)).unwrap();
        assert!(!path.exists());
        assert!(log.path().is_none());
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        {
            let (mut log, _) = RecordLog::<Entry>::open(&path, DurabilityMode::Always).unwrap();
            for k in 0..5 {
                log.append(&put(k)).unwrap();
            }
            log.rewrite(&[put(4)]).unwrap();
            log.append(&put(5)).unwrap();
        }
        let (_log, replayed) = RecordLog::<Entry>::open(&path, DurabilityMode::Always).unwrap();
        assert_eq!(replayed, vec![put(4), put(5)]);
    }

    #[test]
    fn test_standard_mode_batches_syncs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mode = DurabilityMode::Standard {
            interval_ms: 60_000,
            batch_size: 3,
        };
        let (mut log, _) = RecordLog::<Entry>::open(&path, mode).unwrap();
        log.append(&put(1)).unwrap();
        log.append(&put(2)).unwrap();
        assert_eq!(log.unsynced, 2);
        log.append(&put(3)).unwrap();
        assert_eq!(log.unsynced, 0);
    }
}
