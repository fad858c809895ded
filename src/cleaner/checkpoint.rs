//! Durable record of how far each partition has been compacted.
//!
//! One checkpoint file lives in every storage directory. A file holds a bincode
//! encoded body followed by a CRC32 of that body; it is rewritten through a
//! temporary file and a rename so a crash leaves either the old or the new
//! contents behind.

use crate::partition::TopicPartition;
use crate::{Error, Result};
use crc32fast::Hasher;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CHECKPOINT_FILE_NAME: &str = "cleaner-offset-checkpoint";
const CHECKPOINT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CheckpointBody {
    version: u32,
    entries: Vec<(TopicPartition, u64)>,
}

pub struct OffsetCheckpointFile {
    pub(crate) file_path: PathBuf,
}

impl OffsetCheckpointFile {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        OffsetCheckpointFile {
            file_path: dir.as_ref().join(CHECKPOINT_FILE_NAME),
        }
    }

    /// Reads the file. A missing file is an empty checkpoint.
    pub fn read(&self) -> Result<BTreeMap<TopicPartition, u64>> {
        let bytes = match fs::read(&self.file_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        if bytes.len() < 4 {
            return Err(Error::CorruptCheckpoint(format!(
                "{:?} is truncated ({} bytes)",
                self.file_path,
                bytes.len()
            )));
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let mut expected = [0u8; 4];
        expected.copy_from_slice(crc_bytes);
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize() != u32::from_be_bytes(expected) {
            return Err(Error::ChecksumMismatch);
        }
        let body: CheckpointBody = bincode::deserialize(body)?;
        if body.version != CHECKPOINT_VERSION {
            return Err(Error::CorruptCheckpoint(format!(
                "{:?} has unsupported version {}",
                self.file_path, body.version
            )));
        }
        Ok(body.entries.into_iter().collect())
    }

    pub fn write(&self, offsets: &BTreeMap<TopicPartition, u64>) -> Result<()> {
        let body = CheckpointBody {
            version: CHECKPOINT_VERSION,
            entries: offsets.iter().map(|(tp, &o)| (tp.clone(), o)).collect(),
        };
        let encoded = bincode::serialize(&body)?;
        let mut hasher = Hasher::new();
        hasher.update(&encoded);
        let checksum = hasher.finalize();

        let tmp_path = self
            .file_path
            .with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        let write_tmp = || -> Result<()> {
            let mut file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp_path)?;
            file.write_all(&encoded)?;
            file.write_all(&checksum.to_be_bytes())?;
            file.sync_all()?;
            Ok(())
        };
        let renamed = write_tmp()
            .and_then(|_| fs::rename(&tmp_path, &self.file_path).map_err(Error::Io));
        if let Err(e) = renamed {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        if let Some(dir) = self.file_path.parent() {
            // Persist the rename itself.
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

struct CheckpointDir {
    file: OffsetCheckpointFile,
    offsets: BTreeMap<TopicPartition, u64>,
}

impl CheckpointDir {
    fn persist(&self) -> Result<()> {
        self.file.write(&self.offsets)
    }
}

/// Cached view of every directory's checkpoint file. Reads never touch disk;
/// each update rewrites the owning directory's file before returning.
#[derive(Default)]
pub struct CheckpointStore {
    dirs: DashMap<PathBuf, Arc<Mutex<CheckpointDir>>>,
}

impl CheckpointStore {
    /// Loads the checkpoint file of every directory. An unreadable file is
    /// treated as empty, which only costs a redundant cleaning pass.
    pub fn open<P: AsRef<Path>>(log_dirs: &[P]) -> Result<Self> {
        let store = CheckpointStore::default();
        for dir in log_dirs {
            let dir = dir.as_ref();
            fs::create_dir_all(dir)?;
            let file = OffsetCheckpointFile::new(dir);
            let offsets = match file.read() {
                Ok(offsets) => offsets,
                Err(Error::Io(e)) => return Err(Error::Io(e)),
                Err(e) => {
                    log::warn!("Discarding unreadable cleaner checkpoint in {:?}: {}", dir, e);
                    BTreeMap::new()
                }
            };
            log::info!("Loaded {} cleaner checkpoint(s) from {:?}", offsets.len(), dir);
            store
                .dirs
                .insert(dir.to_path_buf(), Arc::new(Mutex::new(CheckpointDir { file, offsets })));
        }
        Ok(store)
    }

    fn dir(&self, dir: &Path) -> Result<Arc<Mutex<CheckpointDir>>> {
        self.dirs
            .get(dir)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::LogDirOffline(dir.to_path_buf()))
    }

    pub fn record_cleaned(&self, dir: &Path, tp: &TopicPartition, offset: u64) -> Result<()> {
        let dir = self.dir(dir)?;
        let mut guard = dir.lock();
        guard.offsets.insert(tp.clone(), offset);
        guard.persist()
    }

    pub fn last_cleaned(&self, dir: &Path, tp: &TopicPartition) -> Option<u64> {
        let dir = self.dir(dir).ok()?;
        let offset = dir.lock().offsets.get(tp).copied();
        offset
    }

    pub fn checkpoints_for(&self, dir: &Path) -> BTreeMap<TopicPartition, u64> {
        self.dir(dir)
            .map(|dir| dir.lock().offsets.clone())
            .unwrap_or_default()
    }

    /// Checkpoints of every online directory, merged.
    pub fn all_checkpoints(&self) -> HashMap<TopicPartition, u64> {
        let dirs: Vec<_> = self.dirs.iter().map(|e| Arc::clone(e.value())).collect();
        let mut all = HashMap::new();
        for dir in dirs {
            all.extend(dir.lock().offsets.iter().map(|(tp, &o)| (tp.clone(), o)));
        }
        all
    }

    /// Lowers the checkpoint of `tp` to `offset` if it currently lies above it.
    pub fn truncate(&self, dir: &Path, tp: &TopicPartition, offset: u64) -> Result<()> {
        let dir = self.dir(dir)?;
        let mut guard = dir.lock();
        match guard.offsets.get(tp) {
            Some(&current) if current > offset => {
                guard.offsets.insert(tp.clone(), offset);
                guard.persist()
            }
            _ => Ok(()),
        }
    }

    pub fn remove(&self, dir: &Path, tp: &TopicPartition) -> Result<()> {
        let dir = self.dir(dir)?;
        let mut guard = dir.lock();
        if guard.offsets.remove(tp).is_some() {
            guard.persist()?;
        }
        Ok(())
    }

    /// Moves the checkpoint of `tp` from one directory to another.
    pub fn alter_dir(&self, tp: &TopicPartition, source: &Path, destination: &Path) -> Result<()> {
        let source_dir = self.dir(source)?;
        let destination_dir = self.dir(destination)?;
        let offset = source_dir.lock().offsets.get(tp).copied();
        if let Some(offset) = offset {
            {
                let mut guard = destination_dir.lock();
                guard.offsets.insert(tp.clone(), offset);
                guard.persist()?;
            }
            let mut guard = source_dir.lock();
            guard.offsets.remove(tp);
            guard.persist()?;
        }
        Ok(())
    }

    /// Drops a failed directory; its checkpoints are no longer trusted.
    pub fn handle_dir_failure(&self, dir: &Path) {
        if self.dirs.remove(dir).is_some() {
            log::warn!("Stopped tracking cleaner checkpoints for failed directory {:?}", dir);
        }
    }
}
