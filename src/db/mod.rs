use chrono::Utc;
use rusqlite::types::{Type, Value};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::models::{AuditCategory, AuditEvent, AuditFilter, NewAuditEvent, SettingRecord};

pub mod schema;

/// Fixed-width UTC timestamps so text order matches time order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub fn now_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> StoreResult<Self> {
        Self::open(
            &config.database_url,
            Duration::from_secs(config.db_busy_timeout_secs),
        )
    }

    pub fn open(path: &str, busy_timeout: Duration) -> StoreResult<Self> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
        debug!("Database: opened {} (journal_mode={})", path, journal_mode);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(":memory:", Duration::from_secs(5))
    }

    /// All statements go through this lock, so writers in one process are serialized.
    pub(crate) fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Runs a blocking database closure on tokio's blocking pool.
    pub async fn run_blocking<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    pub fn ensure_schema(&self) -> StoreResult<Vec<&'static str>> {
        info!("Database: Ensuring schema...");
        let mut conn = self.lock()?;
        let applied = schema::ensure_schema(&mut conn)?;
        debug!("Database: Schema ready ({} steps applied)", applied.len());
        Ok(applied)
    }

    // --- Settings ---

    pub fn get_setting(&self, guild_id: u64, key: &str) -> StoreResult<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE guild_id = ?1 AND key = ?2",
                params![guild_id.to_string(), key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Insert-or-replace on (guild_id, key). The unique index makes this atomic
    /// across connections, so concurrent first writes never collide.
    pub fn upsert_setting(&self, guild_id: u64, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (guild_id, key, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(guild_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![guild_id.to_string(), key, value, now_timestamp()],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, guild_id: u64, key: &str) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count = conn.execute(
            "DELETE FROM settings WHERE guild_id = ?1 AND key = ?2",
            params![guild_id.to_string(), key],
        )?;
        Ok(count)
    }

    pub fn list_settings(&self, guild_id: u64) -> StoreResult<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM settings WHERE guild_id = ?1 ORDER BY key")?;
        let rows = stmt.query_map([guild_id.to_string()], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn setting_row_count(&self, guild_id: u64, key: &str) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM settings WHERE guild_id = ?1 AND key = ?2",
            params![guild_id.to_string(), key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Full rows for every setting whose key is in `keys`, oldest row first.
    pub fn settings_with_keys(&self, keys: &[String]) -> StoreResult<Vec<SettingRecord>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let sql = format!(
            "SELECT id, guild_id, key, value, created_at, updated_at
             FROM settings WHERE key IN ({}) ORDER BY id",
            vec!["?"; keys.len()].join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(keys.iter()), |row| {
            Ok(SettingRecord {
                id: row.get(0)?,
                guild_id: id_column(row, 1)?,
                key: row.get(2)?,
                value: row.get(3)?,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Deletes a row only if it still holds exactly the value that was inspected.
    pub fn delete_setting_exact(&self, record: &SettingRecord) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count = conn.execute(
            "DELETE FROM settings WHERE id = ?1 AND guild_id = ?2 AND key = ?3 AND value = ?4",
            params![
                record.id,
                record.guild_id.to_string(),
                record.key,
                record.value
            ],
        )?;
        Ok(count)
    }

    // --- Audit Log ---

    /// Appends one event. The timestamp is taken while holding the write lock
    /// and never goes below the newest stored one, so `created_at` order agrees
    /// with `id` order even across processes sharing the file.
    pub fn insert_audit_event(&self, event: &NewAuditEvent) -> StoreResult<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO audit_log
                (category, action, user_id, target_id, channel_id, details, guild_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
                     MAX(?8, COALESCE((SELECT MAX(created_at) FROM audit_log), '')))",
            params![
                event.category.as_str(),
                event.action,
                event.actor_id.map(|id| id.to_string()),
                event.target_id.map(|id| id.to_string()),
                event.channel_id.map(|id| id.to_string()),
                event.details,
                event.guild_id.map(|id| id.to_string()),
                now_timestamp(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Newest first. `limit` is applied as given; callers clamp it.
    pub fn query_audit_events(
        &self,
        guild_id: u64,
        filter: &AuditFilter,
        limit: usize,
    ) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.lock()?;

        let mut sql = String::from(
            "SELECT id, category, action, user_id, target_id, channel_id, details, guild_id, created_at
             FROM audit_log WHERE guild_id = ?",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(guild_id.to_string())];

        if let Some(category) = filter.category {
            sql.push_str(" AND category = ?");
            params.push(Box::new(category.as_str()));
        }
        if let Some(actor_id) = filter.actor_id {
            sql.push_str(" AND user_id = ?");
            params.push(Box::new(actor_id.to_string()));
        }
        if let Some(target_id) = filter.target_id {
            sql.push_str(" AND target_id = ?");
            params.push(Box::new(target_id.to_string()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND created_at >= ?");
            params.push(Box::new(since.format(TIMESTAMP_FORMAT).to_string()));
        }

        sql.push_str(" ORDER BY id DESC LIMIT ?");
        params.push(Box::new(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let params_slice: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(&params_slice[..], |row| {
            let category: String = row.get(1)?;
            Ok(AuditEvent {
                id: row.get(0)?,
                category: category.parse::<AuditCategory>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
                })?,
                action: row.get(2)?,
                actor_id: optional_id_column(row, 3)?,
                target_id: optional_id_column(row, 4)?,
                channel_id: optional_id_column(row, 5)?,
                details: row.get(6)?,
                guild_id: optional_id_column(row, 7)?,
                created_at: row.get(8)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        debug!("Database: Audit query returned {} events", results.len());
        Ok(results)
    }
}

/// Identifiers are written as decimal text; older rows may hold integers.
fn optional_id_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    match row.get::<_, Value>(idx)? {
        Value::Null => Ok(None),
        Value::Integer(i) => u64::try_from(i).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e))
        }),
        Value::Text(s) => s.trim().parse().map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        }),
        other => Err(rusqlite::Error::InvalidColumnType(
            idx,
            "identifier".to_string(),
            other.data_type(),
        )),
    }
}

fn id_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    optional_id_column(row, idx)?.ok_or(rusqlite::Error::InvalidColumnType(
        idx,
        "identifier".to_string(),
        Type::Null,
    ))
}
