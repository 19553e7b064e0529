use func_lib::{
    clamp_page, unix_timestamp, validate_subject_token, FnError, FnResult, FunctionId,
    HistoryPage, RunnerId, VersionBump, VersionOwner, VersionRecord,
    DEFAULT_HISTORY_PAGE_SIZE_LIMIT,
};
use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

use crate::meta_db::{map_db_err, MetaDb};

/// Current version pointers plus their append-only history. History rows
/// are only ever inserted.
pub struct VersionLedger {
    db: Arc<MetaDb>,
    page_size_limit: u32,
}

impl VersionLedger {
    pub fn new(db: Arc<MetaDb>) -> Self {
        Self {
            db,
            page_size_limit: DEFAULT_HISTORY_PAGE_SIZE_LIMIT,
        }
    }

    pub fn with_page_size_limit(mut self, limit: u32) -> Self {
        self.page_size_limit = limit.max(1);
        self
    }

    pub async fn current_version(&self, runner_id: RunnerId) -> FnResult<String> {
        self.db
            .with_conn(move |conn| current_pointer(conn, VersionOwner::Runner(runner_id)))
            .await
    }

    pub async fn current_function_version(&self, function_id: FunctionId) -> FnResult<String> {
        self.db
            .with_conn(move |conn| current_pointer(conn, VersionOwner::Function(function_id)))
            .await
    }

    /// Moves the runner's current version and appends a history row, atomically.
    pub async fn bump(&self, runner_id: RunnerId, bump: VersionBump) -> FnResult<VersionRecord> {
        let record = self
            .db
            .with_txn(move |conn| tx_bump(conn, VersionOwner::Runner(runner_id), &bump))
            .await?;
        info!("runner {} now at {}", runner_id, record.version);
        Ok(record)
    }

    pub async fn bump_function(
        &self,
        function_id: FunctionId,
        bump: VersionBump,
    ) -> FnResult<VersionRecord> {
        let record = self
            .db
            .with_txn(move |conn| tx_bump(conn, VersionOwner::Function(function_id), &bump))
            .await?;
        info!("function {} now at {}", function_id, record.version);
        Ok(record)
    }

    /// Newest first. `page` is 1-based.
    pub async fn history(
        &self,
        runner_id: RunnerId,
        page: u32,
        page_size: u32,
    ) -> FnResult<HistoryPage<VersionRecord>> {
        let limit = self.page_size_limit;
        self.db
            .with_conn(move |conn| {
                history_page(conn, VersionOwner::Runner(runner_id), page, page_size, limit)
            })
            .await
    }

    pub async fn function_history(
        &self,
        function_id: FunctionId,
        page: u32,
        page_size: u32,
    ) -> FnResult<HistoryPage<VersionRecord>> {
        let limit = self.page_size_limit;
        self.db
            .with_conn(move |conn| {
                history_page(conn, VersionOwner::Function(function_id), page, page_size, limit)
            })
            .await
    }
}

fn tables(owner: VersionOwner) -> (&'static str, &'static str, &'static str, i64) {
    match owner {
        VersionOwner::Runner(id) => ("runners", "runner_versions", "runner_id", id),
        VersionOwner::Function(id) => ("functions", "function_versions", "function_id", id),
    }
}

fn current_pointer(conn: &Connection, owner: VersionOwner) -> FnResult<String> {
    let (pointer_table, _, _, id) = tables(owner);
    conn.query_row(
        &format!("SELECT current_version FROM {} WHERE id = ?1", pointer_table),
        params![id],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(map_db_err)?
    .ok_or_else(|| FnError::NotFound(format!("{} {}", pointer_table, id)))
}

/// Appends one history row. Never touches existing rows.
pub(crate) fn append_version(
    conn: &Connection,
    owner: VersionOwner,
    bump: &VersionBump,
    now: u64,
) -> FnResult<VersionRecord> {
    bump.validate()?;
    let (_, history_table, owner_column, id) = tables(owner);
    conn.execute(
        &format!(
            "INSERT INTO {} ({}, version, comment, change_log, content_hash, author, create_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            history_table, owner_column
        ),
        params![
            id,
            bump.version,
            bump.comment,
            bump.change_log,
            bump.content_hash,
            bump.author,
            now as i64
        ],
    )
    .map_err(map_db_err)?;
    Ok(VersionRecord {
        id: conn.last_insert_rowid(),
        owner,
        version: bump.version.clone(),
        comment: bump.comment.clone(),
        change_log: bump.change_log.clone(),
        content_hash: bump.content_hash.clone(),
        author: bump.author.clone(),
        create_time: now,
    })
}

/// Points the owner at the new version and records it.
pub(crate) fn tx_bump(conn: &Connection, owner: VersionOwner, bump: &VersionBump) -> FnResult<VersionRecord> {
    bump.validate()?;
    if let VersionOwner::Runner(_) = owner {
        validate_subject_token(&bump.version)?;
    }
    let now = unix_timestamp();
    let (pointer_table, _, _, id) = tables(owner);
    let changed = conn
        .execute(
            &format!(
                "UPDATE {} SET current_version = ?1, update_time = ?2 WHERE id = ?3",
                pointer_table
            ),
            params![bump.version, now as i64, id],
        )
        .map_err(map_db_err)?;
    if changed == 0 {
        return Err(FnError::NotFound(format!("{} {}", pointer_table, id)));
    }
    append_version(conn, owner, bump, now)
}

fn history_page(
    conn: &Connection,
    owner: VersionOwner,
    page: u32,
    page_size: u32,
    limit: u32,
) -> FnResult<HistoryPage<VersionRecord>> {
    let (page, page_size) = clamp_page(page, page_size, limit);
    let (_, history_table, owner_column, id) = tables(owner);

    let total: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE {} = ?1",
                history_table, owner_column
            ),
            params![id],
            |row| row.get(0),
        )
        .map_err(map_db_err)?;

    let offset = (page as i64 - 1) * page_size as i64;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT id, version, comment, change_log, content_hash, author, create_time
             FROM {} WHERE {} = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
            history_table, owner_column
        ))
        .map_err(map_db_err)?;
    let rows = stmt
        .query_map(params![id, page_size as i64, offset], |row| {
            Ok(VersionRecord {
                id: row.get(0)?,
                owner,
                version: row.get(1)?,
                comment: row.get(2)?,
                change_log: row.get(3)?,
                content_hash: row.get(4)?,
                author: row.get(5)?,
                create_time: row.get::<_, i64>(6)? as u64,
            })
        })
        .map_err(map_db_err)?;
    let mut items = Vec::new();
    for row in rows {
        items.push(row.map_err(map_db_err)?);
    }

    Ok(HistoryPage {
        items,
        total: total as u64,
        page,
        page_size,
    })
}
