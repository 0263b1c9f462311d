//! Ordered, idempotent schema migrations.
//!
//! Every step checks for its target structure before acting, so a database
//! that stopped halfway through an older upgrade is brought forward without
//! relying on `schema_migrations`, which is informational only.

use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{info, warn};

use super::now_timestamp;
use crate::error::{StoreError, StoreResult};

pub struct Migration {
    pub name: &'static str,
    /// Returns whether the step changed anything.
    apply: fn(&Connection) -> rusqlite::Result<bool>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "split_legacy_wide_settings",
        apply: split_legacy_wide_settings,
    },
    Migration {
        name: "create_settings",
        apply: create_settings,
    },
    Migration {
        name: "rename_settings_name_to_key",
        apply: rename_settings_name_to_key,
    },
    Migration {
        name: "add_settings_timestamps",
        apply: add_settings_timestamps,
    },
    Migration {
        name: "dedupe_settings_and_enforce_unique",
        apply: dedupe_settings_and_enforce_unique,
    },
    Migration {
        name: "create_audit_log",
        apply: create_audit_log,
    },
    Migration {
        name: "rename_audit_actor_to_user_id",
        apply: rename_audit_actor_to_user_id,
    },
];

const CREATE_SCHEMA_MIGRATIONS: &str = "
    CREATE TABLE IF NOT EXISTS schema_migrations (
        name TEXT PRIMARY KEY,
        applied_at TEXT NOT NULL
    );
";

const CREATE_SETTINGS: &str = "
    CREATE TABLE IF NOT EXISTS settings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        guild_id TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        created_at TEXT,
        updated_at TEXT NOT NULL
    );
";

const SETTINGS_UNIQUE_INDEX: &str = "idx_settings_guild_key";

const CREATE_SETTINGS_UNIQUE_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_settings_guild_key ON settings (guild_id, key);";

const CREATE_AUDIT_LOG: &str = "
    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        category TEXT NOT NULL,
        action TEXT NOT NULL,
        user_id TEXT,
        target_id TEXT,
        channel_id TEXT,
        details TEXT,
        guild_id TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_audit_log_guild ON audit_log (guild_id, id);
";

/// One column per option, keyed by guild. Each column becomes a key.
const LEGACY_WIDE_COLUMNS: &[&str] = &["context_limit", "context_retention"];

/// Applies every step in order. Returns the names of the steps that changed something.
pub fn ensure_schema(conn: &mut Connection) -> StoreResult<Vec<&'static str>> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS)
        .map_err(|source| StoreError::SchemaMismatch {
            step: "schema_migrations",
            source,
        })?;

    let mut applied = Vec::new();
    for migration in MIGRATIONS {
        let changed = run_step(conn, migration).map_err(|source| StoreError::SchemaMismatch {
            step: migration.name,
            source,
        })?;
        if changed {
            info!("Schema: applied migration {}", migration.name);
            applied.push(migration.name);
        }
    }
    Ok(applied)
}

fn run_step(conn: &mut Connection, migration: &Migration) -> rusqlite::Result<bool> {
    // IMMEDIATE takes the write lock up front so two processes booting
    // together cannot both pass the same existence check.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let changed = (migration.apply)(&tx)?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
        params![migration.name, now_timestamp()],
    )?;
    tx.commit()?;
    Ok(changed)
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [table],
        |row| row.get(0),
    )
}

fn index_exists(conn: &Connection, index: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1)",
        [index],
        |row| row.get(0),
    )
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2)",
        [table, column],
        |row| row.get(0),
    )
}

fn split_legacy_wide_settings(conn: &Connection) -> rusqlite::Result<bool> {
    let mut changed = false;

    if table_has_column(conn, "settings", "context_limit")?
        && !table_has_column(conn, "settings", "key")?
    {
        conn.execute("ALTER TABLE settings RENAME TO settings_wide_legacy", [])?;
        changed = true;
    }

    // Also finishes a split that stopped after the rename.
    if !table_exists(conn, "settings_wide_legacy")? {
        return Ok(changed);
    }

    conn.execute_batch(CREATE_SETTINGS)?;
    conn.execute_batch(CREATE_SETTINGS_UNIQUE_INDEX)?;

    let now = now_timestamp();
    let mut copied = 0usize;
    for column in LEGACY_WIDE_COLUMNS {
        if !table_has_column(conn, "settings_wide_legacy", column)? {
            continue;
        }
        copied += conn.execute(
            &format!(
                "INSERT OR IGNORE INTO settings (guild_id, key, value, created_at, updated_at)
                 SELECT CAST(guild_id AS TEXT), '{column}', CAST({column} AS TEXT), ?1, ?1
                 FROM settings_wide_legacy WHERE {column} IS NOT NULL"
            ),
            [&now],
        )?;
    }

    conn.execute("DROP TABLE settings_wide_legacy", [])?;
    info!("Schema: split legacy settings into {} key/value rows", copied);
    Ok(true)
}

fn create_settings(conn: &Connection) -> rusqlite::Result<bool> {
    if table_exists(conn, "settings")? {
        return Ok(false);
    }
    conn.execute_batch(CREATE_SETTINGS)?;
    Ok(true)
}

fn rename_settings_name_to_key(conn: &Connection) -> rusqlite::Result<bool> {
    if !table_has_column(conn, "settings", "name")? || table_has_column(conn, "settings", "key")?
    {
        return Ok(false);
    }
    conn.execute("ALTER TABLE settings RENAME COLUMN name TO key", [])?;
    Ok(true)
}

fn add_settings_timestamps(conn: &Connection) -> rusqlite::Result<bool> {
    let mut changed = false;

    if !table_has_column(conn, "settings", "updated_at")? {
        conn.execute("ALTER TABLE settings ADD COLUMN updated_at TEXT", [])?;
        conn.execute(
            "UPDATE settings SET updated_at = ?1 WHERE updated_at IS NULL",
            [now_timestamp()],
        )?;
        changed = true;
    }

    if !table_has_column(conn, "settings", "created_at")? {
        conn.execute("ALTER TABLE settings ADD COLUMN created_at TEXT", [])?;
        conn.execute(
            "UPDATE settings SET created_at = updated_at WHERE created_at IS NULL",
            [],
        )?;
        changed = true;
    }

    Ok(changed)
}

fn dedupe_settings_and_enforce_unique(conn: &Connection) -> rusqlite::Result<bool> {
    if index_exists(conn, SETTINGS_UNIQUE_INDEX)? {
        return Ok(false);
    }

    // The newest row per (guild_id, key) is the one the old code would read last.
    let removed = conn.execute(
        "DELETE FROM settings WHERE rowid NOT IN (
            SELECT MAX(rowid) FROM settings GROUP BY guild_id, key
        )",
        [],
    )?;
    if removed > 0 {
        warn!("Schema: removed {} duplicate setting rows", removed);
    }

    conn.execute_batch(CREATE_SETTINGS_UNIQUE_INDEX)?;
    Ok(true)
}

fn create_audit_log(conn: &Connection) -> rusqlite::Result<bool> {
    let existed = table_exists(conn, "audit_log")?;
    conn.execute_batch(CREATE_AUDIT_LOG)?;
    Ok(!existed)
}

fn rename_audit_actor_to_user_id(conn: &Connection) -> rusqlite::Result<bool> {
    if !table_has_column(conn, "audit_log", "actor_id")?
        || table_has_column(conn, "audit_log", "user_id")?
    {
        return Ok(false);
    }
    conn.execute("ALTER TABLE audit_log RENAME COLUMN actor_id TO user_id", [])?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_snapshot(conn: &Connection) -> Vec<(String, String, Option<String>)> {
        let mut stmt = conn
            .prepare("SELECT type, name, sql FROM sqlite_master ORDER BY type, name")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    fn columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
            .unwrap();
        stmt.query_map([table], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_fresh_database_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();

        let first = ensure_schema(&mut conn).unwrap();
        assert!(first.contains(&"create_settings"));
        assert!(first.contains(&"create_audit_log"));
        let snapshot = schema_snapshot(&conn);

        let second = ensure_schema(&mut conn).unwrap();
        assert!(second.is_empty());
        assert_eq!(schema_snapshot(&conn), snapshot);

        assert_eq!(
            columns(&conn, "settings"),
            vec!["id", "guild_id", "key", "value", "created_at", "updated_at"]
        );
        assert!(index_exists(&conn, SETTINGS_UNIQUE_INDEX).unwrap());

        let recorded: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(recorded as usize, MIGRATIONS.len());
    }

    #[test]
    fn test_legacy_wide_settings_are_split() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE settings (
                guild_id TEXT PRIMARY KEY,
                context_limit INTEGER,
                context_retention INTEGER
            );
            INSERT INTO settings VALUES ('123', 100, 48);
            INSERT INTO settings VALUES ('456', NULL, 72);",
        )
        .unwrap();

        let applied = ensure_schema(&mut conn).unwrap();
        assert!(applied.contains(&"split_legacy_wide_settings"));
        assert!(!table_exists(&conn, "settings_wide_legacy").unwrap());

        let rows: Vec<(String, String, String)> = {
            let mut stmt = conn
                .prepare("SELECT guild_id, key, value FROM settings ORDER BY guild_id, key")
                .unwrap();
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .unwrap()
                .map(|r| r.unwrap())
                .collect();
            rows
        };
        assert_eq!(
            rows,
            vec![
                ("123".into(), "context_limit".into(), "100".into()),
                ("123".into(), "context_retention".into(), "48".into()),
                ("456".into(), "context_retention".into(), "72".into()),
            ]
        );

        let snapshot = schema_snapshot(&conn);
        assert!(ensure_schema(&mut conn).unwrap().is_empty());
        assert_eq!(schema_snapshot(&conn), snapshot);
    }

    #[test]
    fn test_half_finished_split_is_completed() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE settings_wide_legacy (
                guild_id TEXT PRIMARY KEY,
                context_limit INTEGER
            );
            INSERT INTO settings_wide_legacy VALUES ('1', 10);
            INSERT INTO settings_wide_legacy VALUES ('2', 20);",
        )
        .unwrap();
        conn.execute_batch(CREATE_SETTINGS).unwrap();
        conn.execute_batch(CREATE_SETTINGS_UNIQUE_INDEX).unwrap();
        conn.execute(
            "INSERT INTO settings (guild_id, key, value, created_at, updated_at)
             VALUES ('1', 'context_limit', '10', 'x', 'x')",
            [],
        )
        .unwrap();

        ensure_schema(&mut conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM settings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
        assert!(!table_exists(&conn, "settings_wide_legacy").unwrap());
    }

    #[test]
    fn test_name_column_renamed_and_duplicates_removed() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE settings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                guild_id TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            INSERT INTO settings (guild_id, name, value, updated_at) VALUES ('9', 'verify_channel', '1', 'a');
            INSERT INTO settings (guild_id, name, value, updated_at) VALUES ('9', 'verify_channel', '2', 'b');
            INSERT INTO settings (guild_id, name, value, updated_at) VALUES ('9', 'welcome', 'hi', 'c');",
        )
        .unwrap();

        let applied = ensure_schema(&mut conn).unwrap();
        assert!(applied.contains(&"rename_settings_name_to_key"));
        assert!(applied.contains(&"add_settings_timestamps"));
        assert!(applied.contains(&"dedupe_settings_and_enforce_unique"));
        assert!(!applied.contains(&"create_settings"));

        let value: String = conn
            .query_row(
                "SELECT value FROM settings WHERE guild_id = '9' AND key = 'verify_channel'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, "2");

        let created_at: String = conn
            .query_row(
                "SELECT created_at FROM settings WHERE key = 'welcome'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(created_at, "c");

        let duplicate = conn.execute(
            "INSERT INTO settings (guild_id, key, value, updated_at) VALUES ('9', 'welcome', 'x', 'd')",
            [],
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn test_audit_actor_column_renamed() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category TEXT NOT NULL,
                action TEXT NOT NULL,
                actor_id TEXT,
                target_id TEXT,
                channel_id TEXT,
                details TEXT,
                guild_id TEXT,
                created_at TEXT NOT NULL
            );",
        )
        .unwrap();

        let applied = ensure_schema(&mut conn).unwrap();
        assert!(applied.contains(&"rename_audit_actor_to_user_id"));
        assert!(!applied.contains(&"create_audit_log"));
        assert!(table_has_column(&conn, "audit_log", "user_id").unwrap());
        assert!(!table_has_column(&conn, "audit_log", "actor_id").unwrap());
    }

    #[test]
    fn test_failed_step_aborts_with_step_name() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE settings (
                id INTEGER PRIMARY KEY,
                payload TEXT,
                created_at TEXT,
                updated_at TEXT
            );",
        )
        .unwrap();

        let err = ensure_schema(&mut conn).unwrap_err();
        assert!(err.is_fatal_at_boot());
        match err {
            StoreError::SchemaMismatch { step, .. } => {
                assert_eq!(step, "dedupe_settings_and_enforce_unique")
            }
            other => panic!("unexpected error: {other}"),
        }
        // Later steps never ran.
        assert!(!table_exists(&conn, "audit_log").unwrap());
    }
}
