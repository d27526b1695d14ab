//! Polling change detection
//!
//! Approximates log tailing without elevated privileges: on every tick, ask
//! for the single newest row whose modification timestamp is past the cursor.
//! Multiple changes inside one tick collapse into one event carrying only the
//! newest row. That lost-update coalescing is the documented contract of this
//! strategy, not an accident; consumers treat the event as "something changed,
//! here is the latest state".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::{ChangeAction, ChangeEvent, WatchConfig, WatchError};

/// The newest row found past the cursor in one poll cycle
#[derive(Debug, Clone)]
pub struct ChangeRow {
    /// The row's modification timestamp; becomes the new cursor
    pub timestamp: DateTime<Utc>,

    /// The full row as JSON
    pub payload: serde_json::Value,
}

/// Data-store read surface the polling watcher needs
///
/// Production uses [`PgChangeFeed`]; tests script responses.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Whether the watched table exists
    async fn table_exists(&self) -> Result<bool, WatchError>;

    /// The single newest row modified strictly after `newer_than`, if any
    async fn latest_change(
        &self,
        newer_than: DateTime<Utc>,
    ) -> Result<Option<ChangeRow>, WatchError>;
}

/// Whether `schema.table` exists, per the information schema
pub(crate) async fn table_exists(
    pool: &PgPool,
    schema: &str,
    table: &str,
) -> Result<bool, WatchError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM information_schema.tables \
         WHERE table_schema = $1 AND table_name = $2",
    )
    .bind(schema)
    .bind(table)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Postgres-backed change feed
///
/// Identifier names are operator configuration validated up front; the cursor
/// value itself is always bound, never interpolated.
pub struct PgChangeFeed {
    pool: PgPool,
    config: WatchConfig,
}

impl PgChangeFeed {
    /// Create a feed over the shared pool
    pub fn new(pool: PgPool, config: WatchConfig) -> Result<Self, WatchError> {
        config.validate()?;
        Ok(Self { pool, config })
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn table_exists(&self) -> Result<bool, WatchError> {
        table_exists(&self.pool, &self.config.schema, &self.config.table).await
    }

    async fn latest_change(
        &self,
        newer_than: DateTime<Utc>,
    ) -> Result<Option<ChangeRow>, WatchError> {
        let sql = format!(
            "SELECT {col} AS changed_at, row_to_json(t) AS row \
             FROM {schema}.{table} AS t \
             WHERE {col} > $1 ORDER BY {col} DESC LIMIT 1",
            col = self.config.cursor_column,
            schema = self.config.schema,
            table = self.config.table,
        );

        let row = sqlx::query(&sql)
            .bind(newer_than)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(ChangeRow {
                timestamp: row.try_get("changed_at")?,
                payload: row.try_get("row")?,
            })),
            None => Ok(None),
        }
    }
}

/// Cursor-driven polling watcher
///
/// Runs until the event receiver is dropped. The cursor starts at watcher
/// start time (changes before startup are not replayed), only ever advances,
/// and stays put across failed ticks.
pub struct PollWatcher {
    feed: Box<dyn ChangeFeed>,
    config: WatchConfig,
    events: mpsc::UnboundedSender<ChangeEvent>,
}

impl PollWatcher {
    pub fn new(
        feed: Box<dyn ChangeFeed>,
        config: WatchConfig,
        events: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Self {
        Self {
            feed,
            config,
            events,
        }
    }

    /// Run the watcher to completion
    pub async fn run(self) {
        // Setup phase: the table must exist before polling starts. Absence or
        // a dead database is retried forever, never escalated.
        loop {
            match self.feed.table_exists().await {
                Ok(true) => break,
                Ok(false) => {
                    tracing::warn!(
                        schema = %self.config.schema,
                        table = %self.config.table,
                        backoff = ?self.config.retry_backoff,
                        "Watched table missing, retrying"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        backoff = ?self.config.retry_backoff,
                        "Change watcher setup failed, retrying"
                    );
                }
            }
            tokio::time::sleep(self.config.retry_backoff).await;
            if self.events.is_closed() {
                return;
            }
        }

        tracing::info!(
            table = %self.config.table,
            interval = ?self.config.poll_interval,
            "Polling change watcher started"
        );

        let mut cursor = Utc::now();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.feed.latest_change(cursor).await {
                Ok(Some(row)) => {
                    cursor = row.timestamp;
                    let event = ChangeEvent {
                        entity: self.config.table.clone(),
                        action: ChangeAction::Update,
                        timestamp: row.timestamp,
                        payload: Some(row.payload),
                    };
                    tracing::debug!(
                        table = %self.config.table,
                        cursor = %cursor,
                        "Change detected by poll"
                    );
                    if self.events.send(event).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // Single-tick failure: log, leave the cursor, try again
                    // next tick.
                    tracing::warn!(error = %e, "Poll query failed, skipping tick");
                }
            }

            if self.events.is_closed() {
                return;
            }
        }
    }
}
