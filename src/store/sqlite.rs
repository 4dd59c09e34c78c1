//! SQLite Store
//!
//! The embedded single-writer database, opened only by the process that
//! currently owns it.

use std::sync::Arc;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tokio::sync::Mutex;

use super::{classify, StatementKind, Store};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::protocol::{QueryResult, Value};

/// SQLite-backed store
pub struct SqliteStore {
    /// Open connection (None until opened or after close)
    conn: Arc<Mutex<Option<Connection>>>,
    /// Store configuration
    config: StoreConfig,
}

impl SqliteStore {
    /// Create a store for the configured path; nothing is opened yet
    pub fn new(config: StoreConfig) -> Self {
        Self {
            conn: Arc::new(Mutex::new(None)),
            config,
        }
    }

    fn query_rows(conn: &Connection, statement: &str) -> rusqlite::Result<QueryResult> {
        let mut stmt = conn.prepare(statement)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(to_value(row.get_ref(i)?));
            }
            rows.push(values);
        }

        Ok(QueryResult::Rows { columns, rows })
    }

    fn run_batch(conn: &Connection, statement: &str) -> rusqlite::Result<QueryResult> {
        conn.execute_batch(statement)?;
        Ok(QueryResult::Done {
            changes: conn.changes() as u64,
        })
    }
}

fn is_memory(config: &StoreConfig) -> bool {
    config.path.as_os_str() == ":memory:"
}

fn open_connection(config: &StoreConfig) -> Result<Connection> {
    let conn = if is_memory(config) {
        Connection::open_in_memory()?
    } else {
        Connection::open(&config.path)?
    };

    conn.busy_timeout(config.busy_timeout())?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    if !is_memory(config) {
        if config.exclusive_locking {
            let mode: String =
                conn.pragma_update_and_check(None, "locking_mode", "EXCLUSIVE", |row| row.get(0))?;
            tracing::debug!("Store locking mode: {}", mode);
        }
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("Store journal mode: {}", journal);
    }

    Ok(conn)
}

/// Run rusqlite work on the blocking pool so a slow statement or a busy
/// wait never stalls the runtime threads
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("store task failed: {}", e)))?
}

fn to_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(r) => Value::Real(r),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn open(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut delay = self.config.open_backoff();
        let mut last_error = String::new();

        for attempt in 1..=self.config.open_attempts {
            let config = self.config.clone();
            match blocking(move || open_connection(&config)).await {
                Ok(conn) => {
                    *guard = Some(conn);
                    tracing::info!("Store opened: {}", self.config.path.display());
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "Store open attempt {}/{} failed: {}",
                        attempt,
                        self.config.open_attempts,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < self.config.open_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(Error::StoreOpenFailed {
            attempts: self.config.open_attempts,
            reason: last_error,
        })
    }

    async fn execute(&self, statement: &str) -> Result<QueryResult> {
        let guard = self.conn.clone().lock_owned().await;
        if guard.is_none() {
            return Err(Error::StoreNotOpen);
        }

        let preview: String = statement.chars().take(100).collect();
        tracing::debug!("Executing: {}", preview);

        let statement = statement.to_string();
        blocking(move || {
            let conn = guard.as_ref().ok_or(Error::StoreNotOpen)?;
            let outcome = match classify(&statement) {
                StatementKind::Read => Self::query_rows(conn, &statement),
                StatementKind::Effect => Self::run_batch(conn, &statement),
            };
            outcome.map_err(|e| Error::Execution(e.to_string()))
        })
        .await
    }

    async fn close(&self) {
        let Some(conn) = self.conn.lock().await.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || conn.close()).await {
            Ok(Ok(())) => tracing::info!("Store closed: {}", self.config.path.display()),
            Ok(Err((_, e))) => tracing::warn!("Store close failed: {}", e),
            Err(e) => tracing::warn!("Store close task failed: {}", e),
        }
    }

    async fn is_open(&self) -> bool {
        self.conn.lock().await.is_some()
    }
}
