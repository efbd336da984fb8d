use crate::store::VaultStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use vaultflow_core::error::StorageError;
use vaultflow_core::update::VaultUpdate;

const LEN_PREFIX: u64 = 8;

/// Entries claiming to be larger than this are treated as corruption
pub const MAX_ENTRY_LEN: u64 = 64 * 1024 * 1024;

/// A single record in the vault log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultLogEntry {
    /// Position of this entry in the log, starting at zero
    pub seq: u64,

    /// When the update was recorded
    pub recorded_at: DateTime<Utc>,

    /// The applied update
    pub update: VaultUpdate,
}

/// Append-only file log of vault updates
///
/// Entries are bincode encoded and prefixed with their length as a
/// little-endian u64. An entry is acknowledged only once it is synced.
pub struct FileVaultLog {
    /// Path to the log file
    path: PathBuf,

    /// Log file and the sequence number of the next entry
    writer: Arc<Mutex<(File, u64)>>,
}

impl FileVaultLog {
    /// Open or create the log at `path`
    ///
    /// A damaged tail left by a crash mid-append (a torn length prefix, a
    /// short entry or undecodable bytes) is cut off, so new entries follow
    /// the last complete one.
    ///
    /// # Parameters
    /// * `path` - The file path for the log
    ///
    /// # Returns
    /// The opened log, positioned after the last complete entry
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(|e| StorageError::Log(format!("Failed to open vault log: {}", e)))?;

        let mut entries = VaultLogIterator::open(path)?;
        let mut existing = 0u64;
        let damage = loop {
            match entries.next() {
                Some(Ok(_)) => existing += 1,
                Some(Err(StorageError::Io(e))) => return Err(StorageError::Io(e)),
                Some(Err(e)) => break Some(e),
                None => break None,
            }
        };

        if let Some(e) = damage {
            let valid_len = entries.valid_len();
            log::warn!(
                "Vault log {} is damaged after entry {} ({}); truncating to {} bytes",
                path.display(),
                existing,
                e,
                valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        log::debug!("Opened vault log {} with {} entries", path.display(), existing);

        Ok(Self {
            path: path.to_path_buf(),
            writer: Arc::new(Mutex::new((file, existing))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an update and sync it to disk
    ///
    /// A failed append leaves no partial entry behind.
    pub fn append(&self, update: &VaultUpdate) -> Result<u64, StorageError> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|e| StorageError::Log(format!("Failed to acquire lock: {}", e)))?;
        let (file, next_seq) = &mut *guard;

        let entry = VaultLogEntry {
            seq: *next_seq,
            recorded_at: Utc::now(),
            update: update.clone(),
        };
        let serialized = bincode::serialize(&entry)?;

        let mut frame = Vec::with_capacity(LEN_PREFIX as usize + serialized.len());
        frame.extend_from_slice(&(serialized.len() as u64).to_le_bytes());
        frame.extend_from_slice(&serialized);

        let start = file.metadata()?.len();
        if let Err(e) = file.write_all(&frame).and_then(|_| file.sync_data()) {
            if let Err(rollback) = file.set_len(start) {
                log::error!(
                    "Failed to roll back vault log {} to {} bytes: {}",
                    self.path.display(),
                    start,
                    rollback
                );
            }
            return Err(StorageError::from(e));
        }

        *next_seq += 1;
        Ok(entry.seq)
    }

    /// Iterate over every entry currently in the file
    pub fn entries(&self) -> Result<VaultLogIterator, StorageError> {
        VaultLogIterator::open(&self.path)
    }
}

impl VaultStore for FileVaultLog {
    fn load(&self) -> Result<Vec<VaultUpdate>, StorageError> {
        self.entries()?
            .map(|entry| entry.map(|entry| entry.update))
            .collect()
    }

    fn record(&self, update: &VaultUpdate) -> Result<(), StorageError> {
        self.append(update).map(|_| ())
    }
}

/// Iterator over vault log entries
///
/// Stops after the first error.
pub struct VaultLogIterator {
    reader: BufReader<File>,
    remaining: u64,
    valid_len: u64,
    failed: bool,
}

impl VaultLogIterator {
    fn open(path: &Path) -> Result<Self, StorageError> {
        let file = File::open(path)
            .map_err(|e| StorageError::Log(format!("Failed to read vault log: {}", e)))?;
        let remaining = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            remaining,
            valid_len: 0,
            failed: false,
        })
    }

    /// Bytes covered by the entries read so far
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    fn read_entry(&mut self) -> Result<Option<VaultLogEntry>, StorageError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.remaining < LEN_PREFIX {
            return Err(StorageError::Log(format!(
                "Torn length prefix: {} trailing bytes",
                self.remaining
            )));
        }

        let mut len_buf = [0u8; LEN_PREFIX as usize];
        self.reader.read_exact(&mut len_buf)?;
        self.remaining -= LEN_PREFIX;

        let entry_len = u64::from_le_bytes(len_buf);
        if entry_len > MAX_ENTRY_LEN {
            return Err(StorageError::Log(format!(
                "Entry length {} exceeds the {} byte limit",
                entry_len, MAX_ENTRY_LEN
            )));
        }
        if entry_len > self.remaining {
            return Err(StorageError::Log(format!(
                "Truncated vault log entry: {} bytes promised, {} left",
                entry_len, self.remaining
            )));
        }

        let mut entry_data = Vec::new();
        (&mut self.reader).take(entry_len).read_to_end(&mut entry_data)?;
        if entry_data.len() as u64 != entry_len {
            return Err(StorageError::Log(format!(
                "Truncated vault log entry: read {} of {} bytes",
                entry_data.len(),
                entry_len
            )));
        }
        self.remaining -= entry_len;

        let entry = bincode::deserialize(&entry_data)?;
        self.valid_len += LEN_PREFIX + entry_len;
        Ok(Some(entry))
    }
}

impl Iterator for VaultLogIterator {
    type Item = Result<VaultLogEntry, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read_entry() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
