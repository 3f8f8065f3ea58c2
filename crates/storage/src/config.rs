//! Storage configuration

use serde::{Deserialize, Serialize};

/// Where classified records go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
    Sqlite,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// JSON-lines log path (file backend)
    pub path: String,
    /// Connection URL (sqlite backend)
    pub sqlite_url: String,
    /// Retention cap for the memory backend
    pub max_records: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            path: "logs/accidents.jsonl".to_string(),
            sqlite_url: "sqlite://logs/accidents.db".to_string(),
            max_records: 10_000,
        }
    }
}
