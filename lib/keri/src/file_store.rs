//! File-based KEL storage

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::KeriError;
use crate::kel::{Kel, LogEntry};
use crate::store::KelStore;

/// One append-only JSON-lines file per prefix.
pub struct FileKelStore {
    kel_dir: PathBuf,
}

impl FileKelStore {
    pub fn new(kel_dir: impl Into<PathBuf>) -> Result<Self, KeriError> {
        let kel_dir = kel_dir.into();
        std::fs::create_dir_all(&kel_dir).map_err(|e| KeriError::StorageError(e.to_string()))?;
        Ok(Self { kel_dir })
    }

    fn kel_path(&self, prefix: &str) -> PathBuf {
        self.kel_dir.join(format!("{}.kel.jsonl", prefix))
    }
}

#[async_trait]
impl KelStore for FileKelStore {
    async fn load(&self, prefix: &str) -> Result<Option<Kel>, KeriError> {
        let path = self.kel_path(prefix);
        if !path.exists() {
            return Ok(None);
        }

        let contents =
            std::fs::read_to_string(&path).map_err(|e| KeriError::StorageError(e.to_string()))?;
        let entries = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<LogEntry>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(Kel::from_entries(entries)?))
    }

    async fn append(&self, prefix: &str, entry: &LogEntry) -> Result<(), KeriError> {
        let path = self.kel_path(prefix);
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| KeriError::StorageError(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| KeriError::StorageError(e.to_string()))?;
        file.sync_all()
            .map_err(|e| KeriError::StorageError(e.to_string()))?;

        Ok(())
    }
}
