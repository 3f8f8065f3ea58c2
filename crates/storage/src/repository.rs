//! Incident Log Implementation

use crate::config::{StorageBackend, StorageConfig};
use crate::record::{ClassifiedRecord, RecordQuery};
use crate::StorageError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS accidents (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    source_id TEXT NOT NULL,
    severity TEXT NOT NULL,
    logged_at TEXT NOT NULL,
    payload TEXT NOT NULL
)";

enum Backend {
    Memory {
        records: Mutex<VecDeque<ClassifiedRecord>>,
        max_records: usize,
    },
    JsonLines {
        path: PathBuf,
        /// Serializes appends and guards the id index
        ids: tokio::sync::Mutex<HashSet<String>>,
    },
    Sqlite(SqlitePool),
}

/// Append-only incident log
pub struct IncidentLog {
    backend: Backend,
}

impl IncidentLog {
    /// Create an in-memory log keeping at most `max_records` (at least one)
    pub fn in_memory(max_records: usize) -> Self {
        info!("Creating in-memory incident log");
        let max_records = max_records.max(1);
        Self {
            backend: Backend::Memory {
                records: Mutex::new(VecDeque::with_capacity(max_records.min(1000))),
                max_records,
            },
        }
    }

    /// Open (or create) a JSON-lines log file
    pub async fn json_lines(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut ids = HashSet::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for record in parse_lines(&contents) {
                    ids.insert(record.id);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::File::create(&path).await?;
            }
            Err(e) => return Err(e.into()),
        }

        info!("Opened incident log {} ({} records)", path.display(), ids.len());
        Ok(Self {
            backend: Backend::JsonLines {
                path,
                ids: tokio::sync::Mutex::new(ids),
            },
        })
    }

    /// Connect to a SQLite database and ensure the table exists
    pub async fn sqlite(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        info!("Connected incident log to {}", url);

        Ok(Self {
            backend: Backend::Sqlite(pool),
        })
    }

    /// Build the log described by configuration
    pub async fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::in_memory(config.max_records)),
            StorageBackend::File => Self::json_lines(&config.path).await,
            StorageBackend::Sqlite => {
                if let Some(path) = config.sqlite_url.strip_prefix("sqlite://") {
                    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                Self::sqlite(&config.sqlite_url).await
            }
        }
    }

    /// Append a record. Ids are unique; an existing id is rejected.
    pub async fn append(&self, record: &ClassifiedRecord) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Memory {
                records,
                max_records,
            } => {
                let mut records = records
                    .lock()
                    .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))?;

                if records.iter().any(|r| r.id == record.id) {
                    return Err(StorageError::Duplicate(record.id.clone()));
                }

                // Enforce retention
                while records.len() >= *max_records {
                    records.pop_front();
                }
                records.push_back(record.clone());
            }
            Backend::JsonLines { path, ids } => {
                let mut ids = ids.lock().await;
                if ids.contains(&record.id) {
                    return Err(StorageError::Duplicate(record.id.clone()));
                }

                let mut line = serde_json::to_vec(record)?;
                line.push(b'\n');

                let mut file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .await?;
                file.write_all(&line).await?;
                file.flush().await?;

                ids.insert(record.id.clone());
            }
            Backend::Sqlite(pool) => {
                let payload = serde_json::to_string(record)?;
                let result = sqlx::query(
                    "INSERT INTO accidents (id, source_id, severity, logged_at, payload) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&record.id)
                .bind(&record.source_id)
                .bind(record.severity.as_str())
                .bind(record.logged_at.to_rfc3339())
                .bind(payload)
                .execute(pool)
                .await;

                if let Err(e) = result {
                    if let sqlx::Error::Database(db) = &e {
                        if db.is_unique_violation() {
                            return Err(StorageError::Duplicate(record.id.clone()));
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        debug!("Logged incident {} ({})", record.id, record.severity.as_str());
        Ok(())
    }

    /// Matching records, newest first
    pub async fn recent(&self, query: &RecordQuery) -> Result<Vec<ClassifiedRecord>, StorageError> {
        match &self.backend {
            Backend::Memory { records, .. } => {
                let records = records
                    .lock()
                    .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))?;

                Ok(records
                    .iter()
                    .rev()
                    .filter(|r| query.matches(r))
                    .take(query.limit)
                    .cloned()
                    .collect())
            }
            Backend::JsonLines { path, ids } => {
                let _guard = ids.lock().await;
                let contents = tokio::fs::read_to_string(path).await?;
                let mut records = parse_lines(&contents);
                records.reverse();
                Ok(records
                    .into_iter()
                    .filter(|r| query.matches(r))
                    .take(query.limit)
                    .collect())
            }
            Backend::Sqlite(pool) => {
                let severity = query.severity.map(|s| s.as_str().to_string());
                let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
                let payloads: Vec<String> = sqlx::query_scalar(
                    "SELECT payload FROM accidents
                     WHERE (? IS NULL OR severity = ?) AND (? IS NULL OR source_id = ?)
                     ORDER BY seq DESC LIMIT ?",
                )
                .bind(severity.clone())
                .bind(severity)
                .bind(query.source_id.clone())
                .bind(query.source_id.clone())
                .bind(limit)
                .fetch_all(pool)
                .await?;

                payloads
                    .iter()
                    .map(|p| serde_json::from_str(p).map_err(StorageError::from))
                    .collect()
            }
        }
    }

    /// Look up a record by incident id
    pub async fn get(&self, id: &str) -> Result<ClassifiedRecord, StorageError> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let payload: Option<String> =
                    sqlx::query_scalar("SELECT payload FROM accidents WHERE id = ?")
                        .bind(id)
                        .fetch_optional(pool)
                        .await?;
                let payload = payload.ok_or(StorageError::NotFound)?;
                Ok(serde_json::from_str(&payload)?)
            }
            _ => {
                let all = self
                    .recent(&RecordQuery {
                        limit: usize::MAX,
                        ..Default::default()
                    })
                    .await?;
                all.into_iter()
                    .find(|r| r.id == id)
                    .ok_or(StorageError::NotFound)
            }
        }
    }

    /// Total records held
    pub async fn count(&self) -> Result<usize, StorageError> {
        match &self.backend {
            Backend::Memory { records, .. } => records
                .lock()
                .map(|r| r.len())
                .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e))),
            Backend::JsonLines { ids, .. } => Ok(ids.lock().await.len()),
            Backend::Sqlite(pool) => {
                let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accidents")
                    .fetch_one(pool)
                    .await?;
                Ok(usize::try_from(count).unwrap_or(0))
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            Backend::Memory { .. } => "memory",
            Backend::JsonLines { .. } => "file",
            Backend::Sqlite(_) => "sqlite",
        }
    }
}

impl Default for IncidentLog {
    fn default() -> Self {
        Self::in_memory(10_000)
    }
}

/// Parse a JSON-lines log, skipping lines that do not decode
fn parse_lines(contents: &str) -> Vec<ClassifiedRecord> {
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Skipping unreadable log line: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Channel, EscalationStatus, Severity, UserResponse};
    use chrono::Utc;

    fn record(source: &str, severity: Severity) -> ClassifiedRecord {
        let now = Utc::now();
        ClassifiedRecord {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source.to_string(),
            severity,
            status: "test".to_string(),
            g_force: 10.0,
            tilt: 12.0,
            location: None,
            detected_at: now,
            resolved_at: now,
            user_response: if severity == Severity::High {
                UserResponse::NoResponse
            } else {
                UserResponse::Cancelled
            },
            source: Channel::Mobile,
            confidence: 1.0,
            escalation: EscalationStatus::NotRequired,
            escalation_error: None,
            logged_at: now,
        }
    }

    async fn exercise(log: IncidentLog) {
        let first = record("H001", Severity::High);
        let second = record("H002", Severity::Low);
        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();

        assert_eq!(log.count().await.unwrap(), 2);

        let all = log.recent(&RecordQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id, "newest first");

        let high = log
            .recent(&RecordQuery {
                severity: Some(Severity::High),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].source_id, "H001");

        let by_source = log
            .recent(&RecordQuery {
                source_id: Some("H002".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_source.len(), 1);

        assert_eq!(log.get(&first.id).await.unwrap(), first);
        assert!(matches!(log.get("missing").await, Err(StorageError::NotFound)));

        assert!(matches!(
            log.append(&first).await,
            Err(StorageError::Duplicate(_))
        ));
        assert_eq!(log.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_memory_backend() {
        exercise(IncidentLog::in_memory(100)).await;
    }

    #[tokio::test]
    async fn test_json_lines_backend() {
        let path = std::env::temp_dir()
            .join(format!("helmet-relay-{}", uuid::Uuid::new_v4()))
            .join("accidents.jsonl");
        exercise(IncidentLog::json_lines(&path).await.unwrap()).await;

        // reopening picks up existing ids
        let reopened = IncidentLog::json_lines(&path).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 2);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_backend() {
        exercise(IncidentLog::sqlite("sqlite::memory:").await.unwrap()).await;
    }

    #[tokio::test]
    async fn test_memory_retention() {
        let log = IncidentLog::in_memory(5);
        for _ in 0..10 {
            log.append(&record("H001", Severity::Low)).await.unwrap();
        }
        assert_eq!(log.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_memory_zero_retention_keeps_latest() {
        let log = IncidentLog::in_memory(0);
        log.append(&record("H001", Severity::Low)).await.unwrap();
        let last = record("H002", Severity::High);
        log.append(&last).await.unwrap();

        assert_eq!(log.count().await.unwrap(), 1);
        assert_eq!(log.get(&last.id).await.unwrap(), last);
    }
}
