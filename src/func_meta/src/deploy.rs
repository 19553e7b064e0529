use func_lib::{
    hash_content, normalize_method, runner_sub_path, unix_timestamp, validate_name, FnError, FnResult,
    FunctionId, FunctionRecord, NodeId, NodeKind, TreeNode, VersionBump, VersionOwner,
    VersionRecord,
};
use log::info;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::meta_db::{map_db_err, MetaDb};
use crate::namespace_tree::{
    load_node_by_name_path, require_node, require_owned_node, tx_create_node, tx_delete_node,
    NodeSpec,
};
use crate::version_ledger::{append_version, tx_bump};

const FUNCTION_COLUMNS: &str = "id, runner_id, owner, name, title, description, method, route, \
     request_schema, response_schema, source, current_version, fork_from_id, create_time";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub method: String,
    /// Defaults to the node's path below the runner root.
    #[serde(default)]
    pub route: String,
    #[serde(default)]
    pub request_schema: String,
    #[serde(default)]
    pub response_schema: String,
    #[serde(default)]
    pub source: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployRequest {
    pub owner: String,
    pub package_id: NodeId,
    pub functions: Vec<FunctionSpec>,
    /// Result of the build collaborator. An empty `content_hash` is filled
    /// with the sha256 of all sources.
    pub bump: VersionBump,
}

#[derive(Clone, Debug)]
pub struct DeployedFunction {
    pub function: FunctionRecord,
    pub node: TreeNode,
    pub version: VersionRecord,
}

#[derive(Clone, Debug)]
pub struct DeployResult {
    pub functions: Vec<DeployedFunction>,
    pub runner_version: VersionRecord,
}

/// Saves generated or uploaded function sources: records, tree leaves and
/// version rows land in a single transaction.
pub struct FunctionDeployer {
    db: Arc<MetaDb>,
}

impl FunctionDeployer {
    pub fn new(db: Arc<MetaDb>) -> Self {
        Self { db }
    }

    pub async fn deploy(&self, req: DeployRequest) -> FnResult<DeployResult> {
        let package_id = req.package_id;
        let result = self.db.with_txn(move |conn| tx_deploy(conn, &req)).await?;
        info!(
            "deployed {} functions under package {} at {}",
            result.functions.len(),
            package_id,
            result.runner_version.version
        );
        Ok(result)
    }

    /// Deletes the function record, then its tree leaf.
    pub async fn remove_function(&self, owner: &str, node_id: NodeId) -> FnResult<()> {
        let owner = owner.to_string();
        self.db
            .with_txn(move |conn| {
                let node = require_owned_node(conn, &owner, node_id)?;
                if node.kind != NodeKind::Function {
                    return Err(FnError::InvalidKind(format!(
                        "node {} is a {}",
                        node.id,
                        node.kind.as_str()
                    )));
                }
                if let Some(function_id) = node.ref_id {
                    conn.execute("DELETE FROM functions WHERE id = ?1", params![function_id])
                        .map_err(map_db_err)?;
                }
                tx_delete_node(conn, &owner, node_id)
            })
            .await?;
        info!("function node {} removed", node_id);
        Ok(())
    }

    pub async fn get_function(&self, function_id: FunctionId) -> FnResult<FunctionRecord> {
        self.db
            .with_conn(move |conn| {
                load_function(conn, function_id)?
                    .ok_or_else(|| FnError::NotFound(format!("function {}", function_id)))
            })
            .await
    }

    pub async fn get_function_by_node(&self, node_id: NodeId) -> FnResult<FunctionRecord> {
        self.db
            .with_conn(move |conn| {
                let node = require_node(conn, node_id)?;
                let function_id = node
                    .ref_id
                    .ok_or_else(|| FnError::NotFound(format!("node {} has no function", node_id)))?;
                load_function(conn, function_id)?
                    .ok_or_else(|| FnError::NotFound(format!("function {}", function_id)))
            })
            .await
    }
}

fn tx_deploy(conn: &Connection, req: &DeployRequest) -> FnResult<DeployResult> {
    req.bump.validate()?;
    if req.functions.is_empty() {
        return Err(FnError::InvalidParam("nothing to deploy".to_string()));
    }
    let package = require_owned_node(conn, &req.owner, req.package_id)?;
    if package.kind != NodeKind::Package {
        return Err(FnError::InvalidKind(format!(
            "deploy target {} is a {}",
            package.id,
            package.kind.as_str()
        )));
    }
    let runner_id = package.runner_ref.ok_or_else(|| {
        FnError::NotFound(format!("package {} is not under a runner", package.id))
    })?;

    let mut bump = req.bump.clone();
    if bump.content_hash.is_empty() {
        bump.content_hash = hash_content(req.functions.iter().map(|f| f.source.as_bytes()));
    }

    let now = unix_timestamp();
    let mut functions = Vec::with_capacity(req.functions.len());
    for spec in req.functions.iter() {
        validate_name(&spec.name)?;
        let method = normalize_method(&spec.method)?;
        let leaf_path = format!("{}/{}", package.name_path, spec.name);
        let route = if spec.route.is_empty() {
            default_route(&leaf_path)
        } else {
            spec.route.clone()
        };

        let mut record = FunctionRecord {
            id: 0,
            runner_id,
            owner: req.owner.clone(),
            name: spec.name.clone(),
            title: spec.title.clone(),
            description: spec.description.clone(),
            method,
            route,
            request_schema: spec.request_schema.clone(),
            response_schema: spec.response_schema.clone(),
            source: spec.source.clone(),
            current_version: bump.version.clone(),
            fork_from_id: None,
            create_time: now,
        };
        let existing = load_node_by_name_path(conn, &req.owner, &leaf_path)?;
        let node = match existing {
            // Redeploy of a known function: new content, same record and leaf.
            Some(node) => {
                let function_id = match (node.kind, node.ref_id) {
                    (NodeKind::Function, Some(id)) => id,
                    _ => {
                        return Err(FnError::Conflict(format!(
                            "{} already exists and is not a function",
                            node.qualified_path()
                        )))
                    }
                };
                record.id = function_id;
                update_function(conn, &record, now)?;
                node
            }
            None => {
                record.id = insert_function(conn, &record, now)?;
                tx_create_node(
                    conn,
                    &req.owner,
                    package.id,
                    &NodeSpec::function(&spec.name, &spec.title, record.id)
                        .with_description(&spec.description),
                )?
            }
        };
        let version = append_version(
            conn,
            VersionOwner::Function(record.id),
            &VersionBump {
                content_hash: hash_content([spec.source.as_bytes()]),
                ..bump.clone()
            },
            now,
        )?;
        functions.push(DeployedFunction {
            function: record,
            node,
            version,
        });
    }

    let runner_version = tx_bump(conn, VersionOwner::Runner(runner_id), &bump)?;
    Ok(DeployResult {
        functions,
        runner_version,
    })
}

/// The route a function gets when deployed without one: its leaf path below
/// the runner root.
pub(crate) fn default_route(leaf_name_path: &str) -> String {
    runner_sub_path(leaf_name_path)
}

/// Follows a leaf rename or move, but only while the route is still the
/// derived default. Explicit routes stay as they are.
pub(crate) fn sync_default_route(
    conn: &Connection,
    function_id: FunctionId,
    old_leaf_path: &str,
    new_leaf_path: &str,
    now: u64,
) -> FnResult<bool> {
    let old_route = default_route(old_leaf_path);
    let new_route = default_route(new_leaf_path);
    if old_route == new_route {
        return Ok(false);
    }
    let changed = conn
        .execute(
            "UPDATE functions SET route = ?1, update_time = ?2 WHERE id = ?3 AND route = ?4",
            params![new_route, now as i64, function_id, old_route],
        )
        .map_err(map_db_err)?;
    Ok(changed == 1)
}

fn row_to_function(row: &Row<'_>) -> rusqlite::Result<FunctionRecord> {
    Ok(FunctionRecord {
        id: row.get(0)?,
        runner_id: row.get(1)?,
        owner: row.get(2)?,
        name: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        method: row.get(6)?,
        route: row.get(7)?,
        request_schema: row.get(8)?,
        response_schema: row.get(9)?,
        source: row.get(10)?,
        current_version: row.get(11)?,
        fork_from_id: row.get(12)?,
        create_time: row.get::<_, i64>(13)? as u64,
    })
}

pub(crate) fn load_function(conn: &Connection, function_id: FunctionId) -> FnResult<Option<FunctionRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM functions WHERE id = ?1", FUNCTION_COLUMNS),
        params![function_id],
        row_to_function,
    )
    .optional()
    .map_err(map_db_err)
}

fn update_function(conn: &Connection, record: &FunctionRecord, now: u64) -> FnResult<()> {
    let changed = conn
        .execute(
            "UPDATE functions SET title = ?1, description = ?2, method = ?3, route = ?4,
                request_schema = ?5, response_schema = ?6, source = ?7, current_version = ?8,
                update_time = ?9
             WHERE id = ?10",
            params![
                record.title,
                record.description,
                record.method,
                record.route,
                record.request_schema,
                record.response_schema,
                record.source,
                record.current_version,
                now as i64,
                record.id
            ],
        )
        .map_err(map_db_err)?;
    if changed == 0 {
        return Err(FnError::NotFound(format!("function {}", record.id)));
    }
    Ok(())
}

/// Inserts `record` ignoring its id and returns the new id.
pub(crate) fn insert_function(conn: &Connection, record: &FunctionRecord, now: u64) -> FnResult<FunctionId> {
    conn.execute(
        "INSERT INTO functions
            (runner_id, owner, name, title, description, method, route, request_schema,
             response_schema, source, current_version, fork_from_id, create_time, update_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
        params![
            record.runner_id,
            record.owner,
            record.name,
            record.title,
            record.description,
            record.method,
            record.route,
            record.request_schema,
            record.response_schema,
            record.source,
            record.current_version,
            record.fork_from_id,
            now as i64
        ],
    )
    .map_err(map_db_err)?;
    Ok(conn.last_insert_rowid())
}
