//! Log-tailing change detection
//!
//! The preferred strategy when the database account has enough privilege:
//! a row-level trigger on the watched table publishes every committed
//! insert/update/delete to a notification channel, and the watcher tails that
//! channel for the life of the process. One event per change, no polling lag.
//!
//! Setup (trigger install, channel subscription) can fail at several points,
//! insufficient privilege being the common one in locked-down deployments.
//! Every failure is logged and the full setup retried after a fixed backoff,
//! forever; the watcher never takes the host process down.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::mpsc;

use super::poll::table_exists;
use super::{ChangeAction, ChangeEvent, WatchConfig, WatchError};

/// Notification channel the trigger publishes to
const NOTIFY_CHANNEL: &str = "floorcast_changes";

/// A connectable change tail
///
/// Production is [`PgLogTail`]; tests script connection outcomes.
#[async_trait]
pub trait LogTail: Send + Sync {
    /// Perform the full setup and return a live tail connection
    async fn connect(&self) -> Result<Box<dyn LogTailConn>, WatchError>;
}

/// An established tail delivering change events until it breaks
#[async_trait]
pub trait LogTailConn: Send {
    /// Wait for the next change; an error means the tail is dead
    async fn next_event(&mut self) -> Result<ChangeEvent, WatchError>;
}

/// Shape of the JSON the trigger publishes
#[derive(Debug, Deserialize)]
struct NotifyPayload {
    action: String,
    row: serde_json::Value,
}

/// Postgres change tail: trigger install plus channel listener
pub struct PgLogTail {
    pool: PgPool,
    config: WatchConfig,
}

impl PgLogTail {
    /// Create a tail over the shared pool
    pub fn new(pool: PgPool, config: WatchConfig) -> Result<Self, WatchError> {
        config.validate()?;
        Ok(Self { pool, config })
    }

    /// Install the notify function and the per-row trigger on the target table
    ///
    /// Idempotent: the function is replaced and the trigger recreated, so a
    /// reconnect after a dropped channel does not double-install anything.
    async fn install_trigger(&self) -> Result<(), WatchError> {
        let function = format!(
            "CREATE OR REPLACE FUNCTION floorcast_notify_change() RETURNS trigger AS $fn$ \
             DECLARE rec record; \
             BEGIN \
               IF TG_OP = 'DELETE' THEN rec := OLD; ELSE rec := NEW; END IF; \
               PERFORM pg_notify('{channel}', json_build_object( \
                 'action', lower(TG_OP), 'row', row_to_json(rec))::text); \
               RETURN rec; \
             END \
             $fn$ LANGUAGE plpgsql",
            channel = NOTIFY_CHANNEL,
        );
        sqlx::query(&function)
            .execute(&self.pool)
            .await
            .map_err(map_privilege)?;

        let drop_trigger = format!(
            "DROP TRIGGER IF EXISTS floorcast_change_tap ON {schema}.{table}",
            schema = self.config.schema,
            table = self.config.table,
        );
        sqlx::query(&drop_trigger)
            .execute(&self.pool)
            .await
            .map_err(map_privilege)?;

        let create_trigger = format!(
            "CREATE TRIGGER floorcast_change_tap \
             AFTER INSERT OR UPDATE OR DELETE ON {schema}.{table} \
             FOR EACH ROW EXECUTE FUNCTION floorcast_notify_change()",
            schema = self.config.schema,
            table = self.config.table,
        );
        sqlx::query(&create_trigger)
            .execute(&self.pool)
            .await
            .map_err(map_privilege)?;

        Ok(())
    }
}

#[async_trait]
impl LogTail for PgLogTail {
    async fn connect(&self) -> Result<Box<dyn LogTailConn>, WatchError> {
        if !table_exists(&self.pool, &self.config.schema, &self.config.table).await? {
            return Err(WatchError::MissingTable {
                schema: self.config.schema.clone(),
                table: self.config.table.clone(),
            });
        }

        self.install_trigger().await?;

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;

        Ok(Box::new(PgTailConn {
            listener,
            entity: self.config.table.clone(),
        }))
    }
}

/// Surface privilege failures distinctly so the watcher can log a usable hint
fn map_privilege(e: sqlx::Error) -> WatchError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("42501") {
            return WatchError::PrivilegeDenied {
                detail: db.message().to_string(),
            };
        }
    }
    WatchError::Database(e)
}

struct PgTailConn {
    listener: PgListener,
    entity: String,
}

#[async_trait]
impl LogTailConn for PgTailConn {
    async fn next_event(&mut self) -> Result<ChangeEvent, WatchError> {
        loop {
            let notification = self.listener.recv().await?;
            match serde_json::from_str::<NotifyPayload>(notification.payload()) {
                Ok(parsed) => {
                    return Ok(ChangeEvent {
                        entity: self.entity.clone(),
                        action: ChangeAction::from_op(&parsed.action),
                        timestamp: Utc::now(),
                        payload: Some(parsed.row),
                    });
                }
                Err(e) => {
                    // A garbled notification is not a dead tail
                    tracing::warn!(error = %e, "Malformed change notification skipped");
                }
            }
        }
    }
}

/// Tail-driven watcher with indefinite setup retry
///
/// State machine per connection attempt: disconnected, handshaking,
/// listening, back to disconnected on any error. Runs until the event
/// receiver is dropped.
pub struct ListenWatcher {
    tail: Box<dyn LogTail>,
    config: WatchConfig,
    events: mpsc::UnboundedSender<ChangeEvent>,
}

impl ListenWatcher {
    pub fn new(
        tail: Box<dyn LogTail>,
        config: WatchConfig,
        events: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Self {
        Self {
            tail,
            config,
            events,
        }
    }

    /// Run the watcher to completion
    pub async fn run(self) {
        loop {
            tracing::info!(
                table = %self.config.table,
                state = "handshaking",
                "Connecting change tail"
            );

            match self.tail.connect().await {
                Ok(mut conn) => {
                    tracing::info!(
                        table = %self.config.table,
                        state = "listening",
                        "Change tail established"
                    );

                    loop {
                        match conn.next_event().await {
                            Ok(event) => {
                                tracing::debug!(
                                    entity = %event.entity,
                                    action = ?event.action,
                                    "Change detected by tail"
                                );
                                if self.events.send(event).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    state = "disconnected",
                                    "Change tail lost"
                                );
                                break;
                            }
                        }
                    }
                }
                Err(e @ WatchError::PrivilegeDenied { .. }) => {
                    tracing::error!(
                        error = %e,
                        "Change tail setup denied; the database account needs \
                         TRIGGER privilege on the watched table (or switch to \
                         the polling strategy)"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Change tail setup failed");
                }
            }

            tokio::time::sleep(self.config.retry_backoff).await;
            if self.events.is_closed() {
                return;
            }
        }
    }
}
