//! SQLite schema DDL and migration framework.

use rusqlite::Connection;

use crate::errors::RecyclerResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 1;

/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables ──────────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS projects (
        name TEXT PRIMARY KEY,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS transactions (
        id INTEGER PRIMARY KEY,
        project TEXT REFERENCES projects(name) ON DELETE CASCADE,
        label TEXT,
        base_dir TEXT,
        rwd TEXT,
        host_json TEXT NOT NULL,
        read_only INTEGER NOT NULL DEFAULT 0,
        client_start_nanos INTEGER,
        start_nanos INTEGER NOT NULL,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        uploaded_count INTEGER NOT NULL DEFAULT 0,
        downloaded_count INTEGER NOT NULL DEFAULT 0,
        data_code_width INTEGER NOT NULL,
        result TEXT NOT NULL DEFAULT '*'
    );",
    "CREATE TABLE IF NOT EXISTS audit_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tx_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        record_csv TEXT NOT NULL,
        aggregated INTEGER NOT NULL DEFAULT 0,
        UNIQUE(tx_id, position)
    );",
    "CREATE TABLE IF NOT EXISTS path_touches (
        record_id INTEGER NOT NULL REFERENCES audit_records(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        op TEXT NOT NULL,
        call TEXT,
        state_csv TEXT NOT NULL,
        path TEXT NOT NULL,
        PRIMARY KEY(record_id, position)
    );",
    // ── indexes ─────────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_transactions_project ON transactions(project, id);",
    "CREATE INDEX IF NOT EXISTS idx_path_touches_path ON path_touches(path);",
];

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending migrations from the current stored version up to
/// [`SCHEMA_VERSION`]. Each step is wrapped in a SAVEPOINT so a failure
/// rolls back only that single step.
pub fn migrate_schema(conn: &Connection) -> RecyclerResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT recycler_migrate_step;")?;

        let step_result = (|| -> RecyclerResult<()> {
            match next_version {
                1 => migrate_to_v1(conn)?,
                _ => {}
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT recycler_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                current_version = next_version;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT recycler_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT recycler_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Returns 0 when the key is absent or unparseable.
pub(crate) fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> RecyclerResult<()> {
    conn.execute(
        "INSERT INTO meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> RecyclerResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

// ─── Individual migration steps ─────────────────────────────────────────────

/// v0 -> v1: baseline. The tables come from [`SCHEMA_STATEMENTS`]; this
/// step only stamps the version.
fn migrate_to_v1(_conn: &Connection) -> RecyclerResult<()> {
    Ok(())
}
