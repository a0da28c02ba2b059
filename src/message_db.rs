//! MessageDB client over `sqlx`.
//!
//! Every operation goes through MessageDB's `message_store` stored functions:
//! `write_message`, `get_stream_messages`, `get_last_stream_message`, and
//! `get_category_messages`. Reads may be routed to a follower (read replica)
//! pool; writes and leader-required reads always use the leader pool.
//!
//! MessageDB stores payloads as `jsonb`. Bytes that are valid JSON text are
//! written as-is; anything else (e.g. compressed payloads) is wrapped as
//! `{"__bytes": "<base64>"}` and unwrapped again on read.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{EventData, StreamName, TimelineEvent};
use crate::message_store::{CategoryRead, ExpectedVersion, MessageStore, WriteResult};

/// Connection string used when none is configured: MessageDB's default
/// database and role on localhost.
pub const DEFAULT_CONNECTION_STRING: &str = "postgres://message_store@localhost/message_store";

/// Key wrapping non-JSON payloads inside a `jsonb` column.
const BYTES_KEY: &str = "__bytes";

/// Selected columns, with `time` converted to Unix epoch milliseconds.
const MESSAGE_COLUMNS: &str = "id, stream_name, type, position, global_position, data, metadata, \
     (extract(epoch from time) * 1000)::bigint AS recorded_at";

/// Connection settings for [`MessageDbStore`].
///
/// # Examples
///
/// ```
/// use eventfold_decider::MessageDbConfig;
///
/// let config = MessageDbConfig {
///     connection_string: "postgres://message_store@db/message_store".to_string(),
///     sql_condition: true,
///     ..MessageDbConfig::default()
/// };
/// assert_eq!(config.max_connections, 10);
/// assert!(config.follower_connection_string.is_none());
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct MessageDbConfig {
    /// Leader (primary) connection string.
    ///
    /// Default: `postgres://message_store@localhost/message_store`.
    pub connection_string: String,

    /// Optional read-replica connection string. Reads that do not require
    /// the leader go here when set.
    ///
    /// Default: `None`.
    pub follower_connection_string: Option<String>,

    /// Maximum connections per pool.
    ///
    /// Default: 10.
    pub max_connections: u32,

    /// Enable `message_store.sql_condition` on every connection so category
    /// reads may carry a condition.
    ///
    /// Default: `false`.
    pub sql_condition: bool,
}

impl Default for MessageDbConfig {
    fn default() -> Self {
        Self {
            connection_string: DEFAULT_CONNECTION_STRING.to_string(),
            follower_connection_string: None,
            max_connections: 10,
            sql_condition: false,
        }
    }
}

// Connection strings carry credentials; keep them out of logs.
impl fmt::Debug for MessageDbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDbConfig")
            .field("has_follower", &self.follower_connection_string.is_some())
            .field("max_connections", &self.max_connections)
            .field("sql_condition", &self.sql_condition)
            .finish()
    }
}

impl MessageDbConfig {
    /// Build a config from the environment, falling back to defaults.
    ///
    /// Reads `MESSAGE_DB_CONNECTION_STRING`,
    /// `MESSAGE_DB_FOLLOWER_CONNECTION_STRING`, `MESSAGE_DB_MAX_CONNECTIONS`,
    /// and `MESSAGE_DB_SQL_CONDITION` (`true`/`1`/`on` enable it).
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup("MESSAGE_DB_CONNECTION_STRING") {
            config.connection_string = url;
        }
        config.follower_connection_string = lookup("MESSAGE_DB_FOLLOWER_CONNECTION_STRING");
        if let Some(raw) = lookup("MESSAGE_DB_MAX_CONNECTIONS") {
            match u32::from_str(raw.trim()) {
                Ok(n) if n > 0 => config.max_connections = n,
                _ => tracing::warn!(value = %raw, "ignoring invalid MESSAGE_DB_MAX_CONNECTIONS"),
            }
        }
        if let Some(raw) = lookup("MESSAGE_DB_SQL_CONDITION") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => config.sql_condition = true,
                "0" | "false" | "off" | "no" | "" => config.sql_condition = false,
                _ => tracing::warn!(value = %raw, "ignoring invalid MESSAGE_DB_SQL_CONDITION"),
            }
        }
        config
    }
}

/// A [`MessageStore`] backed by MessageDB.
///
/// `Clone` is cheap: pools are reference counted.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> Result<(), eventfold_decider::StoreError> {
/// use eventfold_decider::{MessageDbConfig, MessageDbStore};
///
/// let store = MessageDbStore::connect(&MessageDbConfig::from_env()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MessageDbStore {
    leader: PgPool,
    follower: Option<PgPool>,
    sql_condition: bool,
}

impl fmt::Debug for MessageDbStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDbStore")
            .field("has_follower", &self.follower.is_some())
            .field("sql_condition", &self.sql_condition)
            .finish()
    }
}

impl MessageDbStore {
    /// Wrap existing pools.
    ///
    /// `sql_condition` must reflect whether the pools' connections have
    /// `message_store.sql_condition` enabled.
    pub fn new(leader: PgPool, follower: Option<PgPool>, sql_condition: bool) -> Self {
        Self {
            leader,
            follower,
            sql_condition,
        }
    }

    /// Open leader (and follower, if configured) pools.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a pool cannot connect.
    pub async fn connect(config: &MessageDbConfig) -> Result<Self, StoreError> {
        let leader = open_pool(&config.connection_string, config).await?;
        let follower = match config.follower_connection_string {
            Some(ref url) => Some(open_pool(url, config).await?),
            None => None,
        };
        tracing::info!(
            has_follower = follower.is_some(),
            sql_condition = config.sql_condition,
            "connected to message store"
        );
        Ok(Self::new(leader, follower, config.sql_condition))
    }

    /// The leader pool, e.g. for a [`PgCheckpointStore`](crate::PgCheckpointStore)
    /// kept in the same database.
    pub fn pool(&self) -> &PgPool {
        &self.leader
    }

    fn reader(&self, require_leader: bool) -> &PgPool {
        match self.follower {
            Some(ref follower) if !require_leader => follower,
            _ => &self.leader,
        }
    }
}

async fn open_pool(url: &str, config: &MessageDbConfig) -> Result<PgPool, StoreError> {
    let sql_condition = config.sql_condition;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if sql_condition {
                    conn.execute("SET message_store.sql_condition TO on").await?;
                }
                Ok(())
            })
        })
        .connect(url)
        .await?;
    Ok(pool)
}

#[async_trait]
impl MessageStore for MessageDbStore {
    async fn write_messages(
        &self,
        stream: &StreamName,
        messages: Vec<EventData>,
        expected: ExpectedVersion,
    ) -> Result<WriteResult, StoreError> {
        let stream_name = stream.to_string();
        if messages.is_empty() {
            let current = sqlx::query_scalar::<_, Option<i64>>(
                "SELECT message_store.stream_version($1)",
            )
            .bind(&stream_name)
            .fetch_one(&self.leader)
            .await?
            .unwrap_or(-1);
            if !expected.matches(current) {
                return Ok(WriteResult::Conflict);
            }
            return Ok(WriteResult::Written(current));
        }

        let base = expected.as_version();
        let mut version = base.unwrap_or(-1);
        let mut tx = self.leader.begin().await?;

        for (i, message) in messages.into_iter().enumerate() {
            let expected_version = base.map(|v| v + i as i64);
            let result = sqlx::query_scalar::<_, i64>(
                "SELECT message_store.write_message($1, $2, $3, $4::jsonb, $5::jsonb, $6)",
            )
            .bind(message.id.unwrap_or_else(|| Uuid::new_v4().to_string()))
            .bind(&stream_name)
            .bind(&message.event_type)
            .bind(message.data.as_deref().map(to_jsonb_text))
            .bind(message.meta.as_deref().map(to_jsonb_text))
            .bind(expected_version)
            .fetch_one(&mut *tx)
            .await;

            match result {
                Ok(position) => version = position,
                Err(e) if is_version_conflict(&e) => {
                    tx.rollback().await?;
                    return Ok(WriteResult::Conflict);
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(WriteResult::Written(version))
    }

    async fn read_stream(
        &self,
        stream: &StreamName,
        from_version: i64,
        batch_size: usize,
        require_leader: bool,
    ) -> Result<Vec<TimelineEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message_store.get_stream_messages($1, $2, $3)"
        ))
        .bind(stream.to_string())
        .bind(from_version.max(0))
        .bind(batch_size as i64)
        .fetch_all(self.reader(require_leader))
        .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn read_last_event(
        &self,
        stream: &StreamName,
        require_leader: bool,
    ) -> Result<Option<TimelineEvent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message_store.get_last_stream_message($1)"
        ))
        .bind(stream.to_string())
        .fetch_optional(self.reader(require_leader))
        .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn read_category(&self, read: &CategoryRead) -> Result<Vec<TimelineEvent>, StoreError> {
        if let Some(group) = read.consumer_group {
            group.validate()?;
        }
        if read.condition.is_some() && !self.sql_condition {
            return Err(StoreError::ConditionNotSupported {
                category: read.category.clone(),
            });
        }

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message_store.get_category_messages(\
             $1, $2, $3, NULL::varchar, $4, $5, $6)"
        ))
        .bind(&read.category)
        .bind(read.from_position.max(1))
        .bind(read.batch_size as i64)
        .bind(read.consumer_group.map(|g| g.member as i64))
        .bind(read.consumer_group.map(|g| g.size as i64))
        .bind(read.condition.as_ref().map(|c| c.to_sql()))
        .fetch_all(&self.leader)
        .await
        .map_err(|e| {
            if is_condition_not_activated(&e) {
                StoreError::ConditionNotSupported {
                    category: read.category.clone(),
                }
            } else {
                StoreError::Database(e)
            }
        })?;

        tracing::debug!(
            category = %read.category,
            from = read.from_position,
            count = rows.len(),
            "read category"
        );
        rows.iter().map(decode_row).collect()
    }
}

fn database_message(err: &sqlx::Error) -> Option<&str> {
    err.as_database_error().map(|db| db.message())
}

fn is_version_conflict(err: &sqlx::Error) -> bool {
    database_message(err).is_some_and(|m| m.starts_with("Wrong expected version"))
}

fn is_condition_not_activated(err: &sqlx::Error) -> bool {
    database_message(err).is_some_and(|m| m.contains("SQL condition is not activated"))
}

fn decode_row(row: &PgRow) -> Result<TimelineEvent, StoreError> {
    let stream_name: String = row.try_get("stream_name")?;
    let recorded_at: Option<i64> = row.try_get("recorded_at")?;
    Ok(TimelineEvent {
        id: row.try_get("id")?,
        stream_name: StreamName::parse(&stream_name)?,
        event_type: row.try_get("type")?,
        position: row.try_get("position")?,
        global_position: row.try_get("global_position")?,
        data: row
            .try_get::<Option<String>, _>("data")?
            .map(from_jsonb_text),
        meta: row
            .try_get::<Option<String>, _>("metadata")?
            .map(from_jsonb_text),
        recorded_at: recorded_at.map_or(0, |ms| ms.max(0) as u64),
    })
}

/// Render payload bytes as `jsonb` input text.
fn to_jsonb_text(bytes: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes)
        && serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok()
    {
        return text.to_string();
    }
    serde_json::json!({ BYTES_KEY: STANDARD.encode(bytes) }).to_string()
}

/// Recover payload bytes from `jsonb` output text.
fn from_jsonb_text(text: String) -> Vec<u8> {
    if text.starts_with("{\"__bytes\"")
        && let Ok(serde_json::Value::Object(map)) = serde_json::from_str(&text)
        && map.len() == 1
        && let Some(serde_json::Value::String(encoded)) = map.get(BYTES_KEY)
        && let Ok(bytes) = STANDARD.decode(encoded)
    {
        return bytes;
    }
    text.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn default_config_values() {
        let config = MessageDbConfig::default();
        assert_eq!(config.connection_string, DEFAULT_CONNECTION_STRING);
        assert_eq!(config.max_connections, 10);
        assert!(!config.sql_condition);
    }

    #[test]
    fn config_reads_all_variables() {
        let config = MessageDbConfig::from_lookup(lookup(&[
            ("MESSAGE_DB_CONNECTION_STRING", "postgres://a/b"),
            ("MESSAGE_DB_FOLLOWER_CONNECTION_STRING", "postgres://c/d"),
            ("MESSAGE_DB_MAX_CONNECTIONS", "4"),
            ("MESSAGE_DB_SQL_CONDITION", "on"),
        ]));
        assert_eq!(config.connection_string, "postgres://a/b");
        assert_eq!(
            config.follower_connection_string.as_deref(),
            Some("postgres://c/d")
        );
        assert_eq!(config.max_connections, 4);
        assert!(config.sql_condition);
    }

    #[test]
    fn config_ignores_invalid_values() {
        let config = MessageDbConfig::from_lookup(lookup(&[
            ("MESSAGE_DB_MAX_CONNECTIONS", "lots"),
            ("MESSAGE_DB_SQL_CONDITION", "maybe"),
        ]));
        assert_eq!(config, MessageDbConfig::default());
    }

    #[test]
    fn debug_output_hides_connection_strings() {
        let config = MessageDbConfig {
            connection_string: "postgres://user:secret@db/ms".to_string(),
            ..MessageDbConfig::default()
        };
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn json_payloads_are_stored_verbatim() {
        assert_eq!(to_jsonb_text(br#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(from_jsonb_text(r#"{"a": 1}"#.to_string()), br#"{"a": 1}"#);
    }

    #[test]
    fn binary_payloads_are_wrapped() {
        let bytes = vec![1u8, 0xff, 0x00, 0x10];
        let text = to_jsonb_text(&bytes);
        assert!(text.starts_with("{\"__bytes\""));
        assert_eq!(from_jsonb_text(text), bytes);
    }

    #[test]
    fn wrapped_payload_survives_jsonb_formatting() {
        let bytes = vec![0u8, 1, 2, 3];
        let reformatted = format!(r#"{{"__bytes": "{}"}}"#, STANDARD.encode(&bytes));
        assert_eq!(from_jsonb_text(reformatted), bytes);
    }
}
