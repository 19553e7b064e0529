use func_lib::{FnError, FnResult};
use log::{debug, error};
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared SQLite handle for every control plane component.
///
/// Reads go through [`MetaDb::with_conn`]; every mutation goes through
/// [`MetaDb::with_txn`], which takes the database write lock up front
/// (`BEGIN IMMEDIATE`) so checks done inside the closure still hold at commit.
pub struct MetaDb {
    db_path: String,
    conn: Arc<Mutex<Connection>>,
}

impl MetaDb {
    pub fn open(db_path: impl AsRef<Path>) -> FnResult<Self> {
        let db_path = db_path.as_ref().to_string_lossy().to_string();
        if let Some(parent) = Path::new(&db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    FnError::IoError(format!("create dir {} failed: {}", parent.display(), e))
                })?;
            }
        }
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|e| FnError::DbError(format!("open db {} failed: {}", db_path, e)))?;
        Self::init_connection(&conn)?;
        Self::create_schema(&conn)?;
        debug!("meta db opened at {}", db_path);
        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn init_connection(conn: &Connection) -> FnResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|e| FnError::DbError(format!("pragma failed: {}", e)))?;
        Ok(())
    }

    fn create_schema(conn: &Connection) -> FnResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tree_nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind INTEGER NOT NULL,
                parent_id INTEGER REFERENCES tree_nodes(id),
                parent_key INTEGER NOT NULL,
                level INTEGER NOT NULL,
                id_path TEXT NOT NULL,
                name_path TEXT NOT NULL,
                name TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                sort INTEGER NOT NULL DEFAULT 0,
                owner TEXT NOT NULL,
                runner_ref INTEGER,
                ref_id INTEGER,
                children_count INTEGER NOT NULL DEFAULT 0,
                fork_from_id INTEGER,
                create_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL,
                CHECK (children_count >= 0),
                CHECK (level >= 0)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS uniq_tree_sibling_name
                ON tree_nodes(owner, parent_key, name);
            CREATE UNIQUE INDEX IF NOT EXISTS uniq_tree_id_path ON tree_nodes(id_path);
            CREATE INDEX IF NOT EXISTS idx_tree_owner_name_path ON tree_nodes(owner, name_path);
            CREATE INDEX IF NOT EXISTS idx_tree_parent ON tree_nodes(parent_id);

            CREATE TABLE IF NOT EXISTS runners (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                current_version TEXT NOT NULL,
                tree_id INTEGER NOT NULL,
                fork_from_id INTEGER,
                create_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL,
                UNIQUE (owner, name)
            );

            CREATE TABLE IF NOT EXISTS functions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                runner_id INTEGER NOT NULL,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                method TEXT NOT NULL,
                route TEXT NOT NULL,
                request_schema TEXT NOT NULL DEFAULT '',
                response_schema TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL DEFAULT '',
                current_version TEXT NOT NULL,
                fork_from_id INTEGER,
                create_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_functions_runner ON functions(runner_id);

            CREATE TABLE IF NOT EXISTS runner_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                runner_id INTEGER NOT NULL,
                version TEXT NOT NULL,
                comment TEXT NOT NULL DEFAULT '',
                change_log TEXT NOT NULL DEFAULT '',
                content_hash TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                create_time INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runner_versions_owner ON runner_versions(runner_id, id);

            CREATE TABLE IF NOT EXISTS function_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                function_id INTEGER NOT NULL,
                version TEXT NOT NULL,
                comment TEXT NOT NULL DEFAULT '',
                change_log TEXT NOT NULL DEFAULT '',
                content_hash TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                create_time INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_function_versions_owner
                ON function_versions(function_id, id);

            CREATE TABLE IF NOT EXISTS run_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                function_id INTEGER,
                runner_id INTEGER NOT NULL,
                trace_id TEXT NOT NULL,
                request BLOB,
                response BLOB,
                status TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                start_ts INTEGER NOT NULL,
                end_ts INTEGER NOT NULL,
                cost_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_run_records_function ON run_records(function_id, id);",
        )
        .map_err(|e| FnError::DbError(format!("create schema failed: {}", e)))?;
        Ok(())
    }

    /// Runs `f` on the shared connection on the blocking pool.
    pub async fn with_conn<T, F>(&self, f: F) -> FnResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> FnResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn_guard = conn
                .lock()
                .map_err(|e| FnError::Internal(format!("conn lock poisoned: {}", e)))?;
            f(&conn_guard)
        })
        .await
        .map_err(|e| FnError::Internal(format!("db task join failed: {}", e)))?
    }

    /// Runs `f` inside one `BEGIN IMMEDIATE` transaction. Any error rolls
    /// the whole transaction back.
    pub async fn with_txn<T, F>(&self, f: F) -> FnResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> FnResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn_guard = conn
                .lock()
                .map_err(|e| FnError::Internal(format!("conn lock poisoned: {}", e)))?;
            let txn = conn_guard
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| FnError::DbError(format!("begin txn failed: {}", e)))?;
            match f(&txn) {
                Ok(value) => {
                    txn.commit()
                        .map_err(|e| FnError::DbError(format!("commit failed: {}", e)))?;
                    Ok(value)
                }
                Err(err) => {
                    if let Err(rollback_err) = txn.rollback() {
                        error!("rollback failed after {}: {}", err, rollback_err);
                    } else {
                        debug!("txn rolled back: {}", err);
                    }
                    Err(err)
                }
            }
        })
        .await
        .map_err(|e| FnError::Internal(format!("db task join failed: {}", e)))?
    }
}

pub(crate) fn map_db_err(err: rusqlite::Error) -> FnError {
    if let rusqlite::Error::SqliteFailure(ref e, ref msg) = err {
        if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE {
            return FnError::Conflict(msg.clone().unwrap_or_else(|| e.to_string()));
        }
    }
    FnError::DbError(err.to_string())
}
