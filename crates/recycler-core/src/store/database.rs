//! SQLite storage for projects and build transactions.
//!
//! Each public method opens its own connection so that the caller never has
//! to manage connection lifetime. Audit records and their touches are kept
//! as the CSV text they arrived in and re-parsed on load.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::errors::{RecyclerError, RecyclerResult};
use crate::models::action::{AuditRecord, Op, PathTouch};
use crate::models::moment::{Elapsed, Moment};
use crate::models::path::PathState;
use crate::models::project::Project;
use crate::models::transaction::{BuildTransaction, HostInfo, TxId, TxResult};
use crate::models::wire::FS1;
use crate::store::repository::{Change, Repository};
use crate::store::schema;

// ---------------------------------------------------------------------------
// Helper: path resolution
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            let mut expanded = home;
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

fn resolve(path: &Path) -> RecyclerResult<PathBuf> {
    let expanded = expand_tilde(&path.to_string_lossy());
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

// ---------------------------------------------------------------------------
// Row shapes
// ---------------------------------------------------------------------------

struct TransactionRow {
    id: i64,
    project: Option<String>,
    label: Option<String>,
    base_dir: Option<String>,
    rwd: Option<String>,
    host_json: String,
    read_only: bool,
    client_start_nanos: Option<i64>,
    start_nanos: i64,
    duration_ms: i64,
    uploaded_count: u32,
    downloaded_count: u32,
    data_code_width: i64,
    result: String,
}

const TRANSACTION_COLUMNS: &str = "id, project, label, base_dir, rwd, host_json, read_only, \
     client_start_nanos, start_nanos, duration_ms, uploaded_count, downloaded_count, \
     data_code_width, result";

fn read_transaction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionRow> {
    Ok(TransactionRow {
        id: row.get(0)?,
        project: row.get(1)?,
        label: row.get(2)?,
        base_dir: row.get(3)?,
        rwd: row.get(4)?,
        host_json: row.get(5)?,
        read_only: row.get(6)?,
        client_start_nanos: row.get(7)?,
        start_nanos: row.get(8)?,
        duration_ms: row.get(9)?,
        uploaded_count: row.get(10)?,
        downloaded_count: row.get(11)?,
        data_code_width: row.get(12)?,
        result: row.get(13)?,
    })
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// The path is expanded and parent directories are created if they do
    /// not already exist.
    pub fn new(db_path: &Path) -> RecyclerResult<Self> {
        let resolved = resolve(db_path)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { db_path: resolved })
    }

    /// Create and initialise in one step.
    pub fn open(db_path: &Path) -> RecyclerResult<Self> {
        let db = Self::new(db_path)?;
        db.init_schema()?;
        Ok(db)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> RecyclerResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    // -----------------------------------------------------------------------
    // Schema / meta
    // -----------------------------------------------------------------------

    /// Set WAL mode, create all tables and indexes, then run pending
    /// migrations.
    pub fn init_schema(&self) -> RecyclerResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        Ok(())
    }

    pub fn schema_version(&self) -> RecyclerResult<i32> {
        let conn = self.connect()?;
        Ok(schema::get_schema_version(&conn))
    }

    // -----------------------------------------------------------------------
    // Backup
    // -----------------------------------------------------------------------

    /// Copy the database to `destination` with the SQLite backup API.
    pub fn backup_to(&self, destination: &Path) -> RecyclerResult<PathBuf> {
        let resolved = resolve(destination)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let src_conn = self.connect()?;
        let mut dst_conn = Connection::open(&resolved)?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        Ok(resolved)
    }

    pub fn restore_from(&self, source: &Path) -> RecyclerResult<()> {
        let resolved = resolve(source)?;
        if !resolved.exists() {
            return Err(RecyclerError::NotFound(format!(
                "backup file {}",
                resolved.display()
            )));
        }
        let src_conn = Connection::open(&resolved)?;
        let mut dst_conn = self.connect()?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    fn load_transaction(conn: &Connection, id: i64) -> RecyclerResult<Option<BuildTransaction>> {
        let row = conn
            .query_row(
                &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1;"),
                params![id],
                read_transaction_row,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };

        let millis = u64::try_from(row.id)
            .map_err(|_| RecyclerError::Malformed(format!("transaction id {}", row.id)))?;
        let mut tx = BuildTransaction::new(TxId::from_millis(millis), Moment::from_nanos(row.start_nanos));
        tx.project = row.project;
        tx.label = row.label;
        tx.base_dir = row.base_dir;
        tx.rwd = row.rwd;
        tx.host = serde_json::from_str::<HostInfo>(&row.host_json)?;
        tx.read_only = row.read_only;
        tx.client_start_time = row.client_start_nanos.map(Moment::from_nanos);
        tx.duration = Elapsed::from_millis(row.duration_ms);
        tx.uploaded_count = row.uploaded_count;
        tx.downloaded_count = row.downloaded_count;
        tx.data_code_width = usize::try_from(row.data_code_width).unwrap_or(0);
        tx.result = row
            .result
            .chars()
            .next()
            .and_then(TxResult::from_char)
            .ok_or_else(|| RecyclerError::malformed("transaction result", &row.result))?;
        tx.restore_records(Self::load_records(conn, row.id)?);
        Ok(Some(tx))
    }

    fn load_records(conn: &Connection, tx_id: i64) -> RecyclerResult<Vec<AuditRecord>> {
        let mut stmt = conn.prepare(
            "SELECT id, record_csv, aggregated FROM audit_records \
             WHERE tx_id = ?1 ORDER BY position;",
        )?;
        let rows = stmt
            .query_map(params![tx_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut touch_stmt = conn.prepare(
            "SELECT op, call, state_csv, path FROM path_touches \
             WHERE record_id = ?1 ORDER BY position;",
        )?;
        let mut records = Vec::with_capacity(rows.len());
        for (record_id, csv, aggregated) in rows {
            let mut record = AuditRecord::parse(&csv)?;
            if aggregated {
                record.command_mut().mark_aggregated();
            }
            let touches = touch_stmt
                .query_map(params![record_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for (op, call, state_csv, path) in touches {
                let op = op
                    .chars()
                    .next()
                    .map(Op::from_char)
                    .ok_or_else(|| RecyclerError::malformed("stored touch without op", &state_csv))?;
                let state = PathState::parse(&format!("{state_csv}{FS1}{path}"))?;
                record.add_path_touch(PathTouch::new(op, state).with_call(call));
            }
            records.push(record);
        }
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    fn write_transaction(conn: &Connection, tx: &BuildTransaction) -> RecyclerResult<()> {
        let id = tx.id().millis() as i64;
        conn.execute(
            &format!(
                "INSERT INTO transactions({TRANSACTION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                 ON CONFLICT(id) DO UPDATE SET \
                     project = excluded.project, label = excluded.label, \
                     base_dir = excluded.base_dir, rwd = excluded.rwd, \
                     host_json = excluded.host_json, read_only = excluded.read_only, \
                     client_start_nanos = excluded.client_start_nanos, \
                     start_nanos = excluded.start_nanos, duration_ms = excluded.duration_ms, \
                     uploaded_count = excluded.uploaded_count, \
                     downloaded_count = excluded.downloaded_count, \
                     data_code_width = excluded.data_code_width, result = excluded.result;"
            ),
            params![
                id,
                tx.project(),
                tx.label(),
                tx.base_dir,
                tx.rwd,
                serde_json::to_string(&tx.host)?,
                tx.read_only,
                tx.client_start_time.map(|m| m.as_nanos()),
                tx.start_time().as_nanos(),
                tx.duration().millis(),
                tx.uploaded_count(),
                tx.downloaded_count(),
                tx.data_code_width() as i64,
                tx.result_char().to_string(),
            ],
        )?;

        conn.execute("DELETE FROM audit_records WHERE tx_id = ?1;", params![id])?;
        let mut record_stmt = conn.prepare(
            "INSERT INTO audit_records(tx_id, position, record_csv, aggregated) \
             VALUES (?1, ?2, ?3, ?4);",
        )?;
        let mut touch_stmt = conn.prepare(
            "INSERT INTO path_touches(record_id, position, op, call, state_csv, path) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
        )?;
        for (position, record) in tx.audit_records().iter().enumerate() {
            let record_id = record_stmt.insert(params![
                id,
                position as i64,
                record.to_csv_string(),
                record.command().is_aggregated(),
            ])?;
            for (t, touch) in record.touches().iter().enumerate() {
                touch_stmt.execute(params![
                    record_id,
                    t as i64,
                    touch.op().as_char().to_string(),
                    touch.call(),
                    touch.state().to_csv_string(),
                    touch.state().path_str(),
                ])?;
            }
        }
        Ok(())
    }

    fn apply_change(conn: &Connection, change: &Change) -> RecyclerResult<()> {
        match change {
            Change::PersistProject(project) => {
                conn.execute(
                    "INSERT INTO projects(name) VALUES (?1) ON CONFLICT(name) DO NOTHING;",
                    params![project.name()],
                )?;
            }
            Change::RemoveProject(name) => {
                conn.execute("DELETE FROM projects WHERE name = ?1;", params![name])?;
            }
            Change::PersistTransaction(tx) => Self::write_transaction(conn, tx)?,
            Change::RemoveTransaction(id) => {
                conn.execute(
                    "DELETE FROM transactions WHERE id = ?1;",
                    params![id.millis() as i64],
                )?;
            }
        }
        Ok(())
    }
}

impl Repository for Database {
    fn find_project(&self, name: &str) -> RecyclerResult<Option<Project>> {
        let conn = self.connect()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM projects WHERE name = ?1;",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(found) = found else {
            return Ok(None);
        };

        let mut project = Project::new(found);
        let mut stmt =
            conn.prepare("SELECT id FROM transactions WHERE project = ?1 ORDER BY id;")?;
        let ids = stmt.query_map(params![name], |row| row.get::<_, i64>(0))?;
        for id in ids {
            project.add_transaction(TxId::from_millis(id? as u64));
        }
        Ok(Some(project))
    }

    fn find_transaction(&self, id: TxId) -> RecyclerResult<Option<BuildTransaction>> {
        let conn = self.connect()?;
        Self::load_transaction(&conn, id.millis() as i64)
    }

    fn query_transactions(
        &self,
        filter: &dyn Fn(&BuildTransaction) -> bool,
    ) -> RecyclerResult<Vec<BuildTransaction>> {
        let conn = self.connect()?;
        let ids = conn
            .prepare("SELECT id FROM transactions ORDER BY id;")?
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::new();
        for id in ids {
            if let Some(tx) = Self::load_transaction(&conn, id)? {
                if filter(&tx) {
                    out.push(tx);
                }
            }
        }
        Ok(out)
    }

    fn list_projects(&self) -> RecyclerResult<Vec<String>> {
        let conn = self.connect()?;
        let names = conn
            .prepare("SELECT name FROM projects ORDER BY name;")?
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn apply(&self, changes: &[Change]) -> RecyclerResult<()> {
        let mut conn = self.connect()?;
        let txn = conn.transaction()?;
        for change in changes {
            Self::apply_change(&txn, change)?;
        }
        txn.commit()?;
        debug!("Applied {} staged changes", changes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::audit::parse_audit_str;

    const BLOCK: &str = "\
100,0,1,l0ruel.16mv8g,250,host,,cc,src,p1,c1,k1-2,cc -c a.c -o a.o
R,open,l0ruel.16mv8g,100,0,1,1,p1,c1,f,?,l0ruel.16mv8g,40,plw,y1,,a.c
C,open,l0ruel.16mv8g,100,0,1,1,p1,c1,f,?,l0ruel.16mv8g,120,plw,x1,,obj/a.o
101,1,100,l0ruel.16mv8g,5,host,,as,src,c1,c2,-,as a.s
";

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("nested").join("recycler.db")).unwrap();
        (dir, db)
    }

    fn sample() -> BuildTransaction {
        let mut tx = BuildTransaction::new(TxId::from_millis(1_271_088_813_000), Moment::from_millis(5));
        tx.set_project("widgets");
        tx.set_label("nightly");
        tx.base_dir = Some("/home/ann/widgets".to_string());
        tx.host.log_name = Some("ann".to_string());
        tx.host.host_name = Some("build01.example.com".to_string());
        tx.client_start_time = Some(Moment::from_parts(100, 7));
        tx.add_audit_record(parse_audit_str(BLOCK).unwrap().record);
        tx.bump_uploaded_count();
        tx.set_result(true);
        tx
    }

    fn seed(db: &Database) -> BuildTransaction {
        let tx = sample();
        let mut project = Project::new("widgets");
        project.add_transaction(tx.id());
        db.apply(&[Change::PersistProject(project), Change::PersistTransaction(tx.clone())])
            .unwrap();
        tx
    }

    #[test]
    fn test_schema_is_current() {
        let (_dir, db) = open();
        assert_eq!(db.schema_version().unwrap(), schema::SCHEMA_VERSION);
        db.init_schema().unwrap();
        assert_eq!(db.schema_version().unwrap(), schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_transaction_round_trip() {
        let (_dir, db) = open();
        let tx = seed(&db);

        let loaded = db.find_transaction(tx.id()).unwrap().unwrap();
        assert_eq!(loaded.id(), tx.id());
        assert_eq!(loaded.project(), Some("widgets"));
        assert_eq!(loaded.label(), Some("nightly"));
        assert_eq!(loaded.host, tx.host);
        assert_eq!(loaded.client_start_time, tx.client_start_time);
        assert_eq!(loaded.start_time(), tx.start_time());
        assert_eq!(loaded.uploaded_count(), 1);
        assert_eq!(loaded.result(), TxResult::Succeeded);

        let record = &loaded.audit_records()[0];
        assert!(record.command().is_aggregated());
        assert_eq!(record.command().line(), "cc -c a.c -o a.o");
        assert_eq!(record.transaction(), Some(tx.id()));
        assert_eq!(record.touches().len(), 2);
        assert_eq!(record.touches()[0].call(), Some("open"));
        assert_eq!(record.touches()[1].state().path_str(), "obj/a.o");
        assert_eq!(record.touches()[1].state().content_code(), Some("x1"));
    }

    #[test]
    fn test_project_lists_transactions() {
        let (_dir, db) = open();
        let tx = seed(&db);
        let project = db.find_project("widgets").unwrap().unwrap();
        assert_eq!(project.transactions(), &[tx.id()]);
        assert!(db.find_project("gadgets").unwrap().is_none());
        assert_eq!(db.list_projects().unwrap(), vec!["widgets".to_string()]);
    }

    #[test]
    fn test_persist_replaces_records() {
        let (_dir, db) = open();
        let mut tx = seed(&db);
        tx.set_downloaded_count(4);
        db.apply(&[Change::PersistTransaction(tx.clone())]).unwrap();
        let loaded = db.find_transaction(tx.id()).unwrap().unwrap();
        assert_eq!(loaded.downloaded_count(), 4);
        assert_eq!(loaded.audit_records().len(), 1);
    }

    #[test]
    fn test_failed_batch_is_rolled_back() {
        let (_dir, db) = open();
        let mut orphan = sample();
        orphan.set_project("gadgets");
        let result = db.apply(&[
            Change::PersistProject(Project::new("widgets")),
            Change::PersistTransaction(orphan),
        ]);
        assert!(result.is_err());
        assert!(db.find_project("widgets").unwrap().is_none());
    }

    #[test]
    fn test_remove_project_cascades() {
        let (_dir, db) = open();
        let tx = seed(&db);
        db.apply(&[Change::RemoveProject("widgets".to_string())]).unwrap();
        assert!(db.find_transaction(tx.id()).unwrap().is_none());
        assert!(db.query_transactions(&|_| true).unwrap().is_empty());
    }

    #[test]
    fn test_backup_and_restore() {
        let (dir, db) = open();
        let tx = seed(&db);
        let backup = db.backup_to(&dir.path().join("backup.db")).unwrap();
        assert!(backup.exists());

        db.apply(&[Change::RemoveTransaction(tx.id())]).unwrap();
        assert!(db.find_transaction(tx.id()).unwrap().is_none());
        db.restore_from(&backup).unwrap();
        assert!(db.find_transaction(tx.id()).unwrap().is_some());

        assert!(db.restore_from(&dir.path().join("missing.db")).is_err());
    }
}
