//! Durable storage for audit ledgers.

use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::ledger::LedgerSnapshot;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access ledger file: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse ledger: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where an audit breaker keeps its snapshot.
pub trait LedgerStore: Send + Sync + fmt::Debug {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError>;

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError>;
}

/// Pretty-printed JSON file, replaced atomically on each save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    /// Where an unparseable ledger is moved so the next save cannot overwrite it.
    pub fn corrupt_path(&self) -> PathBuf {
        self.sibling(".corrupt")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(suffix);
        PathBuf::from(path)
    }
}

impl LedgerStore for JsonFileStore {
    fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                let aside = self.corrupt_path();
                match fs::rename(&self.path, &aside) {
                    Ok(()) => tracing::warn!(
                        path = %self.path.display(),
                        moved_to = %aside.display(),
                        "Unparseable audit ledger moved aside"
                    ),
                    Err(rename_err) => tracing::warn!(
                        path = %self.path.display(),
                        error = %rename_err,
                        "Could not move unparseable audit ledger aside"
                    ),
                }
                Err(e.into())
            }
        }
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_path();
        fs::write(&tmp, serde_json::to_string_pretty(snapshot)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Keeps the last saved snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    snapshot: Mutex<Option<LedgerSnapshot>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }

    pub fn snapshot(&self) -> Option<LedgerSnapshot> {
        self.snapshot.lock().clone()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }
}

impl<S: LedgerStore + ?Sized> LedgerStore for std::sync::Arc<S> {
    fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        (**self).load()
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        (**self).save(snapshot)
    }
}
