use func_lib::{
    unix_timestamp, validate_subject_token, FnError, FnResult, NodeId, RunnerId, RunnerRecord,
    VersionBump, VersionOwner, ROOT_PARENT_ID,
};
use log::info;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;

use crate::meta_db::{map_db_err, MetaDb};
use crate::namespace_tree::{tx_create_node, NodeSpec};
use crate::version_ledger::append_version;

pub const INITIAL_VERSION: &str = "v1";

const RUNNER_COLUMNS: &str =
    "id, owner, name, title, current_version, tree_id, fork_from_id, create_time, update_time";

/// Runners are the deployable roots of the namespace: one root Package node
/// plus one `runners` row holding the current version pointer.
pub struct RunnerRegistry {
    db: Arc<MetaDb>,
}

impl RunnerRegistry {
    pub fn new(db: Arc<MetaDb>) -> Self {
        Self { db }
    }

    /// Creates the root node, the runner row and the first history row in
    /// one transaction.
    pub async fn create_runner(
        &self,
        owner: &str,
        name: &str,
        title: &str,
        initial_version: Option<&str>,
        author: &str,
    ) -> FnResult<RunnerRecord> {
        let owner = owner.to_string();
        let name = name.to_string();
        let title = title.to_string();
        let version = initial_version.unwrap_or(INITIAL_VERSION).to_string();
        let author = author.to_string();

        let runner = self
            .db
            .with_txn(move |conn| {
                validate_subject_token(&owner)?;
                validate_subject_token(&name)?;
                validate_subject_token(&version)?;
                let now = unix_timestamp();

                let root = tx_create_node(conn, &owner, ROOT_PARENT_ID, &NodeSpec::package(&name, &title))?;
                let runner = insert_runner(conn, &owner, &name, &title, &version, root.id, None, now)?;
                conn.execute(
                    "UPDATE tree_nodes SET runner_ref = ?1 WHERE id = ?2",
                    params![runner.id, root.id],
                )
                .map_err(map_db_err)?;
                append_version(
                    conn,
                    VersionOwner::Runner(runner.id),
                    &VersionBump::new(version.clone(), "initial version").with_author(author),
                    now,
                )?;
                Ok(runner)
            })
            .await?;
        info!(
            "runner created: {} {}/{} at node {}",
            runner.id, runner.owner, runner.name, runner.tree_id
        );
        Ok(runner)
    }

    pub async fn get_runner(&self, runner_id: RunnerId) -> FnResult<RunnerRecord> {
        self.db
            .with_conn(move |conn| {
                load_runner(conn, runner_id)?
                    .ok_or_else(|| FnError::NotFound(format!("runner {}", runner_id)))
            })
            .await
    }

    pub async fn get_runner_by_name(&self, owner: &str, name: &str) -> FnResult<RunnerRecord> {
        let owner = owner.to_string();
        let name = name.to_string();
        self.db
            .with_conn(move |conn| {
                load_runner_by_name(conn, &owner, &name)?
                    .ok_or_else(|| FnError::NotFound(format!("runner {}/{}", owner, name)))
            })
            .await
    }

    pub async fn list_runners(&self, owner: &str) -> FnResult<Vec<RunnerRecord>> {
        let owner = owner.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM runners WHERE owner = ?1 ORDER BY name",
                        RUNNER_COLUMNS
                    ))
                    .map_err(map_db_err)?;
                let rows = stmt
                    .query_map(params![owner], row_to_runner)
                    .map_err(map_db_err)?;
                let mut runners = Vec::new();
                for row in rows {
                    runners.push(row.map_err(map_db_err)?);
                }
                Ok(runners)
            })
            .await
    }
}

fn row_to_runner(row: &Row<'_>) -> rusqlite::Result<RunnerRecord> {
    Ok(RunnerRecord {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        title: row.get(3)?,
        current_version: row.get(4)?,
        tree_id: row.get(5)?,
        fork_from_id: row.get(6)?,
        create_time: row.get::<_, i64>(7)? as u64,
        update_time: row.get::<_, i64>(8)? as u64,
    })
}

pub(crate) fn load_runner(conn: &Connection, runner_id: RunnerId) -> FnResult<Option<RunnerRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM runners WHERE id = ?1", RUNNER_COLUMNS),
        params![runner_id],
        row_to_runner,
    )
    .optional()
    .map_err(map_db_err)
}

pub(crate) fn load_runner_by_name(
    conn: &Connection,
    owner: &str,
    name: &str,
) -> FnResult<Option<RunnerRecord>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM runners WHERE owner = ?1 AND name = ?2",
            RUNNER_COLUMNS
        ),
        params![owner, name],
        row_to_runner,
    )
    .optional()
    .map_err(map_db_err)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn insert_runner(
    conn: &Connection,
    owner: &str,
    name: &str,
    title: &str,
    version: &str,
    tree_id: NodeId,
    fork_from_id: Option<RunnerId>,
    now: u64,
) -> FnResult<RunnerRecord> {
    conn.execute(
        "INSERT INTO runners
            (owner, name, title, current_version, tree_id, fork_from_id, create_time, update_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![owner, name, title, version, tree_id, fork_from_id, now as i64],
    )
    .map_err(map_db_err)?;
    let id = conn.last_insert_rowid();
    load_runner(conn, id)?.ok_or_else(|| FnError::Internal(format!("runner {} vanished", id)))
}

/// History rows of the runner are left in place.
pub(crate) fn delete_runner_row(conn: &Connection, runner_id: RunnerId) -> FnResult<()> {
    conn.execute("DELETE FROM runners WHERE id = ?1", params![runner_id])
        .map_err(map_db_err)?;
    Ok(())
}
