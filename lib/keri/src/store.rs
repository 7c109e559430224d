//! KEL Storage trait - persisting applied logs

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::KeriError;
use crate::kel::{Kel, LogEntry};

/// Durable, append-only storage of each identifier's log.
#[async_trait]
pub trait KelStore: Send + Sync {
    /// Load a KEL by prefix. Returns None if nothing was ever appended for it.
    async fn load(&self, prefix: &str) -> Result<Option<Kel>, KeriError>;

    /// Append one entry to the prefix's log.
    async fn append(&self, prefix: &str, entry: &LogEntry) -> Result<(), KeriError>;
}

/// In-process store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKelStore {
    logs: RwLock<HashMap<String, Vec<LogEntry>>>,
}

impl MemoryKelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self, prefix: &str) -> Vec<LogEntry> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        logs.get(prefix).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl KelStore for MemoryKelStore {
    async fn load(&self, prefix: &str) -> Result<Option<Kel>, KeriError> {
        let entries = {
            let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
            match logs.get(prefix) {
                Some(entries) => entries.clone(),
                None => return Ok(None),
            }
        };
        Ok(Some(Kel::from_entries(entries)?))
    }

    async fn append(&self, prefix: &str, entry: &LogEntry) -> Result<(), KeriError> {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.entry(prefix.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }
}
