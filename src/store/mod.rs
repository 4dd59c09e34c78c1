//! Store Module
//!
//! The embedded database as seen by the owner role: something that can be
//! opened, asked to execute a statement, and closed again.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::protocol::QueryResult;

/// Database contract consumed by the owner process
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Open the store. Idempotent; retries transient failures internally.
    async fn open(&self) -> Result<()>;

    /// Execute one statement (or a batch of effect-only statements)
    async fn execute(&self, statement: &str) -> Result<QueryResult>;

    /// Close the store, releasing any file locks
    async fn close(&self);

    /// Whether `open` has completed
    async fn is_open(&self) -> bool;
}

/// Statement shape, decided by its leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Returns rows
    Read,
    /// Returns only a change count
    Effect,
}

const READ_KEYWORDS: &[&str] = &["SELECT", "PRAGMA", "WITH", "EXPLAIN", "VALUES"];

/// Classify a statement by inspecting its leading keyword
pub fn classify(statement: &str) -> StatementKind {
    let keyword: String = statement
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();

    if READ_KEYWORDS.iter().any(|k| keyword.eq_ignore_ascii_case(k)) {
        StatementKind::Read
    } else {
        StatementKind::Effect
    }
}
