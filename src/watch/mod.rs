//! Database change detection
//!
//! Watches one designated table for row-level mutations and emits a
//! [`ChangeEvent`] per detected change. Two interchangeable strategies share
//! the contract "best-effort low latency, no indefinite silent failure":
//!
//! - [`listen`] tails the database's notification channel through a row-level
//!   trigger, emitting one event per committed change. Needs trigger-install
//!   privileges on the target table.
//! - [`poll`] queries for rows newer than a timestamp cursor on a fixed
//!   interval, coalescing everything that happened in one tick into a single
//!   event carrying only the newest row.
//!
//! Exactly one strategy runs per deployment, selected by configuration. Both
//! verify the target table exists before starting and retry setup on a fixed
//! backoff instead of terminating the process.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod listen;
pub mod poll;

pub use listen::{ListenWatcher, LogTail, LogTailConn, PgLogTail};
pub use poll::{ChangeFeed, ChangeRow, PgChangeFeed, PollWatcher};

/// What kind of mutation a change event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    /// Parse a database operation name; unresolvable operations map to Update
    pub fn from_op(op: &str) -> Self {
        match op.to_ascii_lowercase().as_str() {
            "insert" => Self::Insert,
            "delete" => Self::Delete,
            _ => Self::Update,
        }
    }
}

/// One detected table mutation
///
/// Transient, never persisted. Ordering is relative to detection time, which
/// for the polling strategy may trail true commit order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Name of the table the change was observed on
    pub entity: String,

    /// Mutation class
    pub action: ChangeAction,

    /// When the change was detected (or the row's own modification timestamp)
    pub timestamp: DateTime<Utc>,

    /// The affected row as JSON, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Change-detection failures
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Target table is absent; setup is retried until it appears
    #[error("target table {schema}.{table} does not exist")]
    MissingTable { schema: String, table: String },

    /// The database account lacks a privilege setup needs
    #[error("insufficient privilege: {detail}")]
    PrivilegeDenied { detail: String },

    /// Setup failed for a reason other than the above
    #[error("change watcher setup failed: {0}")]
    Setup(String),

    /// A query or connection operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Which change-detection strategy to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStrategy {
    /// Trigger + notification channel tailing
    Listen,
    /// Timestamp-cursor polling
    Poll,
}

impl FromStr for WatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "listen" => Ok(Self::Listen),
            "poll" => Ok(Self::Poll),
            other => Err(format!("unknown watch strategy '{}'", other)),
        }
    }
}

/// Settings shared by both strategies
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Schema holding the watched table
    pub schema: String,

    /// Table to watch
    pub table: String,

    /// Modification-timestamp column used by the polling cursor
    pub cursor_column: String,

    /// Polling tick interval
    pub poll_interval: Duration,

    /// Backoff between failed setup attempts
    pub retry_backoff: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            table: "production_data".to_string(),
            cursor_column: "updated_at".to_string(),
            poll_interval: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl WatchConfig {
    /// Set the schema name
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the watched table name
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the cursor column name
    pub fn cursor_column(mut self, column: impl Into<String>) -> Self {
        self.cursor_column = column.into();
        self
    }

    /// Set the polling interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the setup retry backoff
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Reject identifiers that cannot be safely interpolated into SQL
    ///
    /// Schema, table and column names come from operator configuration, not
    /// request input, but they still end up inside query text.
    pub fn validate(&self) -> Result<(), WatchError> {
        for (what, ident) in [
            ("schema", &self.schema),
            ("table", &self.table),
            ("cursor column", &self.cursor_column),
        ] {
            if !is_safe_identifier(ident) {
                return Err(WatchError::Setup(format!(
                    "invalid {} name '{}'",
                    what, ident
                )));
            }
        }
        Ok(())
    }
}

fn is_safe_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
