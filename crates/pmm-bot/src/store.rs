//! Crash-safe position persistence.
//!
//! Each market's position lives in its own JSON file, `pos_<market>.json`.
//! Writes go to a `.tmp` sibling first and are renamed over the target, so a
//! crash mid-save can never leave a half-written file. The engine saves on
//! every market stop and on shutdown, and loads on market start to restore
//! inventory state across restarts.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

use crate::strategy::Position;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// JSON-file position store. All file operations are serialized behind a
/// mutex to prevent concurrent writes to the same path.
pub struct Store {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl Store {
    /// Open a store backed by the given directory, creating it if needed.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    fn path_for(&self, market_id: &str) -> PathBuf {
        self.dir.join(format!("pos_{market_id}.json"))
    }

    /// Atomically persist the position for a market.
    pub fn save_position(&self, market_id: &str, pos: &Position) -> Result<(), StoreError> {
        let _guard = self.lock.lock();

        let data = serde_json::to_vec(pos)?;
        let path = self.path_for(market_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Restore a market's position. Returns `Ok(None)` when no saved
    /// position exists (fresh market).
    pub fn load_position(&self, market_id: &str) -> Result<Option<Position>, StoreError> {
        let _guard = self.lock.lock();

        let path = self.path_for(market_id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }
}
