use func_lib::{
    check_paths, compute_child_paths, id_path_segments, is_proper_descendant_path,
    prefix_range_end, replace_last_segment, rewrite_prefix, unix_timestamp, validate_name,
    validate_subject_token, hash_content, FnError, FnResult, FunctionId, FunctionRecord, NodeId,
    NodeKind, NodePaths, RunnerId, TreeNode, VersionBump, VersionOwner, ROOT_PARENT_ID,
};
use log::{debug, error, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::deploy::{insert_function, load_function, sync_default_route};
use crate::meta_db::{map_db_err, MetaDb};
use crate::runner_registry::{delete_runner_row, insert_runner, load_runner, INITIAL_VERSION};
use crate::tree_view::SubtreeView;
use crate::version_ledger::append_version;

pub(crate) const NODE_COLUMNS: &str = "id, kind, parent_id, level, id_path, name_path, name, \
     title, owner, runner_ref, ref_id, children_count, fork_from_id, create_time, update_time, \
     description, sort";

const MAX_FORK_NAME_ATTEMPTS: u32 = 1000;

/// What a caller asks the tree to create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSpec {
    pub kind: NodeKind,
    pub name: String,
    pub title: String,
    pub description: String,
    pub ref_id: Option<FunctionId>,
}

impl NodeSpec {
    pub fn package(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Package,
            name: name.into(),
            title: title.into(),
            description: String::new(),
            ref_id: None,
        }
    }

    pub fn function(name: impl Into<String>, title: impl Into<String>, ref_id: FunctionId) -> Self {
        Self {
            kind: NodeKind::Function,
            name: name.into(),
            title: title.into(),
            description: String::new(),
            ref_id: Some(ref_id),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Filters for [`NamespaceTree::search`]. A `.` in the keyword matches a
/// path separator, so `mathlib.sum` finds `/mathlib/sum`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub keyword: String,
    pub kind: Option<NodeKind>,
    /// Only root packages, i.e. the owner's workspaces.
    pub workspace: bool,
    pub limit: Option<u32>,
}

const DEFAULT_SEARCH_LIMIT: u32 = 200;

/// The namespace forest. Every mutation runs in one transaction and either
/// leaves all path invariants intact or writes nothing.
pub struct NamespaceTree {
    db: Arc<MetaDb>,
}

impl NamespaceTree {
    pub fn new(db: Arc<MetaDb>) -> Self {
        Self { db }
    }

    pub async fn create(&self, owner: &str, parent_id: NodeId, spec: NodeSpec) -> FnResult<TreeNode> {
        let owner = owner.to_string();
        let node = self
            .db
            .with_txn(move |conn| tx_create_node(conn, &owner, parent_id, &spec))
            .await?;
        info!("tree node created: {} {}", node.id, node.qualified_path());
        Ok(node)
    }

    pub async fn rename(&self, owner: &str, node_id: NodeId, new_name: &str) -> FnResult<TreeNode> {
        let owner = owner.to_string();
        let new_name = new_name.to_string();
        let node = self
            .db
            .with_txn(move |conn| tx_rename_node(conn, &owner, node_id, &new_name))
            .await?;
        info!("tree node renamed: {} -> {}", node.id, node.qualified_path());
        Ok(node)
    }

    pub async fn move_node(
        &self,
        owner: &str,
        node_id: NodeId,
        new_parent_id: NodeId,
    ) -> FnResult<TreeNode> {
        let owner = owner.to_string();
        let node = self
            .db
            .with_txn(move |conn| tx_move_node(conn, &owner, node_id, new_parent_id))
            .await?;
        info!("tree node moved: {} -> {}", node.id, node.qualified_path());
        Ok(node)
    }

    /// Deep-copies the subtree at `node_id` under `target_parent_id` (0 for a
    /// new root) for `new_owner`. Without `new_name` the source name is kept
    /// when free, otherwise `<name>_fork`, `<name>_fork2`, ... is used.
    pub async fn fork(
        &self,
        node_id: NodeId,
        target_parent_id: NodeId,
        new_name: Option<&str>,
        new_owner: &str,
    ) -> FnResult<TreeNode> {
        let new_owner = new_owner.to_string();
        let new_name = new_name.map(|v| v.to_string());
        let node = self
            .db
            .with_txn(move |conn| {
                tx_fork_subtree(conn, node_id, target_parent_id, new_name.as_deref(), &new_owner)
            })
            .await?;
        info!(
            "tree node forked: {} -> {} {}",
            node_id,
            node.id,
            node.qualified_path()
        );
        Ok(node)
    }

    pub async fn delete(&self, owner: &str, node_id: NodeId) -> FnResult<()> {
        let owner = owner.to_string();
        self.db
            .with_txn(move |conn| tx_delete_node(conn, &owner, node_id))
            .await?;
        info!("tree node deleted: {}", node_id);
        Ok(())
    }

    pub async fn set_title(&self, owner: &str, node_id: NodeId, title: &str) -> FnResult<TreeNode> {
        let owner = owner.to_string();
        let title = title.to_string();
        self.db
            .with_txn(move |conn| {
                let node = require_owned_node(conn, &owner, node_id)?;
                conn.execute(
                    "UPDATE tree_nodes SET title = ?1, update_time = ?2 WHERE id = ?3",
                    params![title, unix_timestamp() as i64, node.id],
                )
                .map_err(map_db_err)?;
                require_node(conn, node_id)
            })
            .await
    }

    pub async fn set_description(
        &self,
        owner: &str,
        node_id: NodeId,
        description: &str,
    ) -> FnResult<TreeNode> {
        let owner = owner.to_string();
        let description = description.to_string();
        self.db
            .with_txn(move |conn| {
                let node = require_owned_node(conn, &owner, node_id)?;
                conn.execute(
                    "UPDATE tree_nodes SET description = ?1, update_time = ?2 WHERE id = ?3",
                    params![description, unix_timestamp() as i64, node.id],
                )
                .map_err(map_db_err)?;
                require_node(conn, node_id)
            })
            .await
    }

    /// Sibling position; children are listed by `sort`, then by name.
    pub async fn set_sort(&self, owner: &str, node_id: NodeId, sort: i64) -> FnResult<TreeNode> {
        let owner = owner.to_string();
        let node = self
            .db
            .with_txn(move |conn| {
                let node = require_owned_node(conn, &owner, node_id)?;
                conn.execute(
                    "UPDATE tree_nodes SET sort = ?1, update_time = ?2 WHERE id = ?3",
                    params![sort, unix_timestamp() as i64, node.id],
                )
                .map_err(map_db_err)?;
                require_node(conn, node_id)
            })
            .await?;
        debug!("node {} sort -> {}", node.id, node.sort);
        Ok(node)
    }

    /// Case-insensitive keyword match over name, name path, title and
    /// description of the owner's nodes. Shallow nodes come first.
    pub async fn search(&self, owner: &str, query: &SearchQuery) -> FnResult<Vec<TreeNode>> {
        let owner = owner.to_string();
        let query = query.clone();
        self.db
            .with_conn(move |conn| search_nodes(conn, &owner, &query))
            .await
    }

    pub async fn get(&self, node_id: NodeId) -> FnResult<TreeNode> {
        self.db.with_conn(move |conn| require_node(conn, node_id)).await
    }

    /// `name_path` is the stored form without the owner, e.g. `/mathlib/sum`.
    pub async fn get_by_name_path(&self, owner: &str, name_path: &str) -> FnResult<Option<TreeNode>> {
        let owner = owner.to_string();
        let name_path = name_path.to_string();
        self.db
            .with_conn(move |conn| load_node_by_name_path(conn, &owner, &name_path))
            .await
    }

    pub async fn get_by_id_path(&self, id_path: &str) -> FnResult<Option<TreeNode>> {
        let id_path = id_path.to_string();
        self.db
            .with_conn(move |conn| {
                query_node(
                    conn,
                    &format!("SELECT {} FROM tree_nodes WHERE id_path = ?1", NODE_COLUMNS),
                    params![id_path],
                )
            })
            .await
    }

    pub async fn get_children(&self, parent_id: NodeId) -> FnResult<Vec<TreeNode>> {
        self.db
            .with_conn(move |conn| load_children(conn, parent_id))
            .await
    }

    pub async fn list_roots(&self, owner: &str) -> FnResult<Vec<TreeNode>> {
        let owner = owner.to_string();
        self.db
            .with_conn(move |conn| {
                query_nodes(
                    conn,
                    &format!(
                        "SELECT {} FROM tree_nodes WHERE owner = ?1 AND parent_id IS NULL \
                         ORDER BY sort, name",
                        NODE_COLUMNS
                    ),
                    params![owner],
                )
            })
            .await
    }

    /// Root first, `node_id` last.
    pub async fn get_ancestor_chain(&self, node_id: NodeId) -> FnResult<Vec<TreeNode>> {
        self.db
            .with_conn(move |conn| {
                let node = require_node(conn, node_id)?;
                let ids = id_path_segments(&node.id_path)?;
                let mut chain = Vec::with_capacity(ids.len());
                for id in ids.iter() {
                    match load_node(conn, *id)? {
                        Some(n) => chain.push(n),
                        None => {
                            return Err(invariant(format!(
                                "ancestor {} of node {} is missing",
                                id, node_id
                            )))
                        }
                    }
                }
                for (level, n) in chain.iter().enumerate() {
                    if n.level as usize != level {
                        return Err(invariant(format!(
                            "ancestor {} of node {} sits at level {} instead of {}",
                            n.id, node_id, n.level, level
                        )));
                    }
                }
                Ok(chain)
            })
            .await
    }

    pub async fn build_subtree(&self, owner: &str, root_id: NodeId) -> FnResult<SubtreeView> {
        let owner = owner.to_string();
        let (root, rows) = self
            .db
            .with_conn(move |conn| {
                let root = require_owned_node(conn, &owner, root_id)?;
                let rows = load_descendants(conn, &root.id_path)?;
                Ok((root, rows))
            })
            .await?;
        let view = SubtreeView::build(root, rows);
        if !view.orphans.is_empty() {
            warn!(
                "subtree {} has {} orphaned rows: {:?}",
                root_id,
                view.orphans.len(),
                view.orphans.iter().map(|n| n.id).collect::<Vec<_>>()
            );
        }
        Ok(view)
    }
}

fn invariant(msg: String) -> FnError {
    error!("tree invariant violated: {}", msg);
    FnError::InvariantViolation(msg)
}

// ==================== Row helpers ====================

pub(crate) fn row_to_node(row: &Row<'_>) -> rusqlite::Result<TreeNode> {
    let kind: i64 = row.get(1)?;
    let kind = NodeKind::from_int(kind).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Integer, Box::new(e))
    })?;
    Ok(TreeNode {
        id: row.get(0)?,
        kind,
        parent_id: row.get(2)?,
        level: row.get::<_, i64>(3)? as u32,
        id_path: row.get(4)?,
        name_path: row.get(5)?,
        name: row.get(6)?,
        title: row.get(7)?,
        owner: row.get(8)?,
        runner_ref: row.get(9)?,
        ref_id: row.get(10)?,
        children_count: row.get::<_, i64>(11)? as u32,
        fork_from_id: row.get(12)?,
        create_time: row.get::<_, i64>(13)? as u64,
        update_time: row.get::<_, i64>(14)? as u64,
        description: row.get(15)?,
        sort: row.get(16)?,
    })
}

fn query_node<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> FnResult<Option<TreeNode>> {
    conn.query_row(sql, params, row_to_node)
        .optional()
        .map_err(map_db_err)
}

fn query_nodes<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> FnResult<Vec<TreeNode>> {
    let mut stmt = conn.prepare(sql).map_err(map_db_err)?;
    let rows = stmt.query_map(params, row_to_node).map_err(map_db_err)?;
    let mut nodes = Vec::new();
    for row in rows {
        nodes.push(row.map_err(map_db_err)?);
    }
    Ok(nodes)
}

pub(crate) fn load_node(conn: &Connection, node_id: NodeId) -> FnResult<Option<TreeNode>> {
    query_node(
        conn,
        &format!("SELECT {} FROM tree_nodes WHERE id = ?1", NODE_COLUMNS),
        params![node_id],
    )
}

pub(crate) fn require_node(conn: &Connection, node_id: NodeId) -> FnResult<TreeNode> {
    load_node(conn, node_id)?.ok_or_else(|| FnError::NotFound(format!("node {}", node_id)))
}

/// Nodes of another owner are reported as missing.
pub(crate) fn require_owned_node(conn: &Connection, owner: &str, node_id: NodeId) -> FnResult<TreeNode> {
    let node = require_node(conn, node_id)?;
    if node.owner != owner {
        return Err(FnError::NotFound(format!("node {} of {}", node_id, owner)));
    }
    Ok(node)
}

pub(crate) fn load_node_by_name_path(
    conn: &Connection,
    owner: &str,
    name_path: &str,
) -> FnResult<Option<TreeNode>> {
    query_node(
        conn,
        &format!(
            "SELECT {} FROM tree_nodes WHERE owner = ?1 AND name_path = ?2",
            NODE_COLUMNS
        ),
        params![owner, name_path],
    )
}

pub(crate) fn load_root_by_name(conn: &Connection, owner: &str, name: &str) -> FnResult<Option<TreeNode>> {
    query_node(
        conn,
        &format!(
            "SELECT {} FROM tree_nodes WHERE owner = ?1 AND parent_key = 0 AND name = ?2",
            NODE_COLUMNS
        ),
        params![owner, name],
    )
}

fn load_children(conn: &Connection, parent_id: NodeId) -> FnResult<Vec<TreeNode>> {
    query_nodes(
        conn,
        &format!(
            "SELECT {} FROM tree_nodes WHERE parent_id = ?1 ORDER BY sort, name",
            NODE_COLUMNS
        ),
        params![parent_id],
    )
}

fn search_nodes(conn: &Connection, owner: &str, query: &SearchQuery) -> FnResult<Vec<TreeNode>> {
    let keyword = query.keyword.trim().replace('.', "/");
    let mut sql = format!("SELECT {} FROM tree_nodes WHERE owner = ?1", NODE_COLUMNS);
    if !keyword.is_empty() {
        sql.push_str(
            " AND (instr(lower(name), lower(?2)) > 0 OR instr(lower(name_path), lower(?2)) > 0 \
             OR instr(lower(title), lower(?2)) > 0 OR instr(lower(description), lower(?2)) > 0)",
        );
    } else {
        sql.push_str(" AND ?2 = ''");
    }
    if query.workspace {
        sql.push_str(&format!(
            " AND parent_id IS NULL AND kind = {}",
            NodeKind::Package.to_int()
        ));
    } else if let Some(kind) = query.kind {
        sql.push_str(&format!(" AND kind = {}", kind.to_int()));
    }
    sql.push_str(" ORDER BY level, sort, name LIMIT ?3");

    let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).max(1);
    query_nodes(conn, &sql, params![owner, keyword, limit as i64])
}

fn count_children(conn: &Connection, parent_id: NodeId) -> FnResult<u32> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM tree_nodes WHERE parent_id = ?1",
            params![parent_id],
            |row| row.get(0),
        )
        .map_err(map_db_err)?;
    Ok(count as u32)
}

/// Every proper descendant of the node at `id_path`, parents before children.
pub(crate) fn load_descendants(conn: &Connection, id_path: &str) -> FnResult<Vec<TreeNode>> {
    let prefix = format!("{}/", id_path);
    let end = prefix_range_end(&prefix);
    query_nodes(
        conn,
        &format!(
            "SELECT {} FROM tree_nodes WHERE id_path >= ?1 AND id_path < ?2 ORDER BY level, id",
            NODE_COLUMNS
        ),
        params![prefix, end],
    )
}

/// Re-reads the given nodes in ascending id order. Together with the
/// `BEGIN IMMEDIATE` write lock this gives every mutation the same lock order.
pub(crate) fn lock_nodes(conn: &Connection, ids: &[NodeId]) -> FnResult<HashMap<NodeId, TreeNode>> {
    let mut ordered = ids
        .iter()
        .copied()
        .filter(|id| *id != ROOT_PARENT_ID)
        .collect::<Vec<_>>();
    ordered.sort_unstable();
    ordered.dedup();

    let mut locked = HashMap::new();
    for id in ordered {
        if let Some(node) = load_node(conn, id)? {
            locked.insert(id, node);
        }
    }
    Ok(locked)
}

fn name_taken(
    conn: &Connection,
    owner: &str,
    parent_key: NodeId,
    name: &str,
    except: Option<NodeId>,
) -> FnResult<bool> {
    let found: Option<NodeId> = conn
        .query_row(
            "SELECT id FROM tree_nodes WHERE owner = ?1 AND parent_key = ?2 AND name = ?3",
            params![owner, parent_key, name],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_db_err)?;
    Ok(match (found, except) {
        (Some(id), Some(except)) => id != except,
        (Some(_), None) => true,
        (None, _) => false,
    })
}

fn ensure_name_free(
    conn: &Connection,
    owner: &str,
    parent_key: NodeId,
    name: &str,
    except: Option<NodeId>,
) -> FnResult<()> {
    if name_taken(conn, owner, parent_key, name, except)? {
        return Err(FnError::Conflict(format!(
            "name {} already exists under {}",
            name,
            if parent_key == ROOT_PARENT_ID {
                format!("root of {}", owner)
            } else {
                format!("node {}", parent_key)
            }
        )));
    }
    Ok(())
}

fn adjust_children_count(conn: &Connection, node_id: NodeId, delta: i64, now: u64) -> FnResult<()> {
    let changed = conn
        .execute(
            "UPDATE tree_nodes SET children_count = children_count + ?1, update_time = ?2 WHERE id = ?3",
            params![delta, now as i64, node_id],
        )
        .map_err(map_db_err)?;
    if changed != 1 {
        return Err(invariant(format!("counter update missed node {}", node_id)));
    }
    Ok(())
}

struct NewNodeRow<'a> {
    kind: NodeKind,
    parent: Option<&'a NodePaths>,
    parent_id: Option<NodeId>,
    name: &'a str,
    title: &'a str,
    description: &'a str,
    sort: i64,
    owner: &'a str,
    runner_ref: Option<RunnerId>,
    ref_id: Option<FunctionId>,
    fork_from_id: Option<NodeId>,
}

/// Inserts a node and fills in its paths from the id SQLite allocated. The
/// parent's counter is not touched here.
fn insert_node_row(conn: &Connection, row: NewNodeRow<'_>, now: u64) -> FnResult<TreeNode> {
    conn.execute(
        "INSERT INTO tree_nodes
            (kind, parent_id, parent_key, level, id_path, name_path, name, title, owner,
             runner_ref, ref_id, children_count, fork_from_id, create_time, update_time,
             description, sort)
         VALUES (?1, ?2, ?3, 0, '', '', ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?10, ?11, ?12)",
        params![
            row.kind.to_int(),
            row.parent_id,
            row.parent_id.unwrap_or(ROOT_PARENT_ID),
            row.name,
            row.title,
            row.owner,
            row.runner_ref,
            row.ref_id,
            row.fork_from_id,
            now as i64,
            row.description,
            row.sort
        ],
    )
    .map_err(map_db_err)?;
    let id = conn.last_insert_rowid();

    let paths = compute_child_paths(row.parent, row.name, id);
    check_paths(&paths, id, row.name).map_err(|e| invariant(e.to_string()))?;
    conn.execute(
        "UPDATE tree_nodes SET id_path = ?1, name_path = ?2, level = ?3 WHERE id = ?4",
        params![paths.id_path, paths.name_path, paths.level as i64, id],
    )
    .map_err(map_db_err)?;

    require_node(conn, id)
}

// ==================== Create ====================

pub(crate) fn tx_create_node(
    conn: &Connection,
    owner: &str,
    parent_id: NodeId,
    spec: &NodeSpec,
) -> FnResult<TreeNode> {
    validate_name(&spec.name)?;
    if owner.is_empty() {
        return Err(FnError::InvalidParam("owner is empty".to_string()));
    }
    let now = unix_timestamp();

    let parent = if parent_id == ROOT_PARENT_ID {
        if spec.kind != NodeKind::Package {
            return Err(FnError::InvalidKind("a root must be a package".to_string()));
        }
        None
    } else {
        let mut locked = lock_nodes(conn, &[parent_id])?;
        let parent = locked
            .remove(&parent_id)
            .filter(|p| p.owner == owner)
            .ok_or_else(|| FnError::NotFound(format!("parent node {}", parent_id)))?;
        if parent.kind != NodeKind::Package {
            return Err(FnError::InvalidKind(format!(
                "parent {} is a {}, only packages have children",
                parent.id,
                parent.kind.as_str()
            )));
        }
        Some(parent)
    };
    if spec.kind == NodeKind::Function && spec.ref_id.is_none() {
        return Err(FnError::InvalidKind(format!(
            "function node {} has no function record",
            spec.name
        )));
    }

    ensure_name_free(conn, owner, parent_id, &spec.name, None)?;

    let parent_paths = parent.as_ref().map(|p| p.paths());
    let node = insert_node_row(
        conn,
        NewNodeRow {
            kind: spec.kind,
            parent: parent_paths.as_ref(),
            parent_id: parent.as_ref().map(|p| p.id),
            name: &spec.name,
            title: &spec.title,
            description: &spec.description,
            sort: 0,
            owner,
            runner_ref: parent.as_ref().and_then(|p| p.runner_ref),
            ref_id: spec.ref_id,
            fork_from_id: None,
        },
        now,
    )?;
    if let Some(parent) = parent.as_ref() {
        adjust_children_count(conn, parent.id, 1, now)?;
    }
    debug!("insert node {} at {}", node.id, node.id_path);
    Ok(node)
}

// ==================== Rename ====================

pub(crate) fn tx_rename_node(
    conn: &Connection,
    owner: &str,
    node_id: NodeId,
    new_name: &str,
) -> FnResult<TreeNode> {
    validate_name(new_name)?;
    let mut locked = lock_nodes(conn, &[node_id])?;
    let node = locked
        .remove(&node_id)
        .filter(|n| n.owner == owner)
        .ok_or_else(|| FnError::NotFound(format!("node {}", node_id)))?;
    if node.name == new_name {
        return Ok(node);
    }
    if node.is_root() && node.runner_ref.is_some() {
        validate_subject_token(new_name)?;
    }
    ensure_name_free(
        conn,
        owner,
        node.parent_id.unwrap_or(ROOT_PARENT_ID),
        new_name,
        Some(node.id),
    )?;

    let now = unix_timestamp();
    let old_name_path = node.name_path.clone();
    let new_name_path = replace_last_segment(&old_name_path, new_name)?;
    conn.execute(
        "UPDATE tree_nodes SET name = ?1, name_path = ?2, update_time = ?3 WHERE id = ?4",
        params![new_name, new_name_path, now as i64, node.id],
    )
    .map_err(map_db_err)?;

    let descendants = load_descendants(conn, &node.id_path)?;
    let mut moved_leaves = node
        .ref_id
        .map(|id| (id, old_name_path.clone(), new_name_path.clone()))
        .into_iter()
        .collect::<Vec<_>>();
    for d in descendants.iter() {
        let name_path = rewrite_prefix(&d.name_path, &old_name_path, &new_name_path)
            .map_err(|e| invariant(e.to_string()))?;
        conn.execute(
            "UPDATE tree_nodes SET name_path = ?1, update_time = ?2 WHERE id = ?3",
            params![name_path, now as i64, d.id],
        )
        .map_err(map_db_err)?;
        if let Some(function_id) = d.ref_id {
            moved_leaves.push((function_id, d.name_path.clone(), name_path));
        }
    }
    for (function_id, old_path, new_path) in moved_leaves.iter() {
        sync_default_route(conn, *function_id, old_path, new_path, now)?;
    }

    if node.kind == NodeKind::Function {
        if let Some(function_id) = node.ref_id {
            conn.execute(
                "UPDATE functions SET name = ?1, update_time = ?2 WHERE id = ?3",
                params![new_name, now as i64, function_id],
            )
            .map_err(map_db_err)?;
        }
    }
    if node.is_root() {
        if let Some(runner_id) = node.runner_ref {
            conn.execute(
                "UPDATE runners SET name = ?1, update_time = ?2 WHERE id = ?3",
                params![new_name, now as i64, runner_id],
            )
            .map_err(map_db_err)?;
        }
    }
    debug!(
        "renamed {} and {} descendants: {} -> {}",
        node.id,
        descendants.len(),
        old_name_path,
        new_name_path
    );
    require_node(conn, node.id)
}

// ==================== Move ====================

pub(crate) fn tx_move_node(
    conn: &Connection,
    owner: &str,
    node_id: NodeId,
    new_parent_id: NodeId,
) -> FnResult<TreeNode> {
    if new_parent_id == ROOT_PARENT_ID {
        return Err(FnError::InvalidParam(
            "a node cannot be moved to the root level".to_string(),
        ));
    }
    let old_parent_id = require_owned_node(conn, owner, node_id)?
        .parent_id
        .unwrap_or(ROOT_PARENT_ID);
    let mut locked = lock_nodes(conn, &[node_id, new_parent_id, old_parent_id])?;

    let node = locked
        .get(&node_id)
        .cloned()
        .filter(|n| n.owner == owner)
        .ok_or_else(|| FnError::NotFound(format!("node {}", node_id)))?;
    let new_parent = locked
        .remove(&new_parent_id)
        .ok_or_else(|| FnError::NotFound(format!("target parent {}", new_parent_id)))?;

    if new_parent.id == node.id || is_proper_descendant_path(&node.id_path, &new_parent.id_path) {
        return Err(FnError::CycleDetected(format!(
            "node {} cannot move under {}",
            node.id, new_parent.id
        )));
    }
    if node.is_root() {
        return Err(FnError::InvalidParam(format!(
            "root node {} cannot be moved",
            node.id
        )));
    }
    if new_parent.owner != node.owner {
        return Err(FnError::InvalidParam(format!(
            "node {} of {} cannot move into the tree of {}",
            node.id, node.owner, new_parent.owner
        )));
    }
    if new_parent.kind != NodeKind::Package {
        return Err(FnError::InvalidKind(format!(
            "target {} is a {}, only packages have children",
            new_parent.id,
            new_parent.kind.as_str()
        )));
    }
    if node.parent_id == Some(new_parent.id) {
        return Ok(node);
    }
    ensure_name_free(conn, owner, new_parent.id, &node.name, None)?;

    let now = unix_timestamp();
    let old_paths = node.paths();
    let new_paths = compute_child_paths(Some(&new_parent.paths()), &node.name, node.id);
    let runner_ref = new_parent.runner_ref;

    let descendants = load_descendants(conn, &old_paths.id_path)?;
    let carries_functions =
        node.ref_id.is_some() || descendants.iter().any(|d| d.ref_id.is_some());
    if carries_functions && runner_ref.is_none() {
        return Err(FnError::InvalidParam(format!(
            "node {} carries functions and cannot move outside a runner",
            node.id
        )));
    }

    conn.execute(
        "UPDATE tree_nodes SET parent_id = ?1, parent_key = ?1, id_path = ?2, name_path = ?3,
            level = ?4, runner_ref = ?5, update_time = ?6 WHERE id = ?7",
        params![
            new_parent.id,
            new_paths.id_path,
            new_paths.name_path,
            new_paths.level as i64,
            runner_ref,
            now as i64,
            node.id
        ],
    )
    .map_err(map_db_err)?;

    let mut moved_leaves = node
        .ref_id
        .map(|id| (id, old_paths.name_path.clone(), new_paths.name_path.clone()))
        .into_iter()
        .collect::<Vec<_>>();
    for d in descendants.iter() {
        let id_path = rewrite_prefix(&d.id_path, &old_paths.id_path, &new_paths.id_path)
            .map_err(|e| invariant(e.to_string()))?;
        let name_path = rewrite_prefix(&d.name_path, &old_paths.name_path, &new_paths.name_path)
            .map_err(|e| invariant(e.to_string()))?;
        if d.level <= old_paths.level {
            return Err(invariant(format!(
                "descendant {} of {} has level {} <= {}",
                d.id, node.id, d.level, old_paths.level
            )));
        }
        let level = new_paths.level + (d.level - old_paths.level);
        conn.execute(
            "UPDATE tree_nodes SET id_path = ?1, name_path = ?2, level = ?3, runner_ref = ?4,
                update_time = ?5 WHERE id = ?6",
            params![id_path, name_path, level as i64, runner_ref, now as i64, d.id],
        )
        .map_err(map_db_err)?;
        if let Some(function_id) = d.ref_id {
            moved_leaves.push((function_id, d.name_path.clone(), name_path));
        }
    }

    for (function_id, old_path, new_path) in moved_leaves.iter() {
        sync_default_route(conn, *function_id, old_path, new_path, now)?;
        if node.runner_ref != runner_ref {
            if let Some(runner_id) = runner_ref {
                conn.execute(
                    "UPDATE functions SET runner_id = ?1, update_time = ?2 WHERE id = ?3",
                    params![runner_id, now as i64, function_id],
                )
                .map_err(map_db_err)?;
            }
        }
    }

    if old_parent_id != ROOT_PARENT_ID {
        adjust_children_count(conn, old_parent_id, -1, now)?;
    }
    adjust_children_count(conn, new_parent.id, 1, now)?;

    debug!(
        "moved {} with {} descendants: {} -> {}",
        node.id,
        descendants.len(),
        old_paths.id_path,
        new_paths.id_path
    );
    require_node(conn, node.id)
}

// ==================== Fork ====================

fn pick_fork_name(
    conn: &Connection,
    owner: &str,
    parent_key: NodeId,
    source_name: &str,
    requested: Option<&str>,
) -> FnResult<String> {
    if let Some(name) = requested {
        validate_name(name)?;
        ensure_name_free(conn, owner, parent_key, name, None)?;
        return Ok(name.to_string());
    }
    if !name_taken(conn, owner, parent_key, source_name, None)? {
        return Ok(source_name.to_string());
    }
    for attempt in 1..=MAX_FORK_NAME_ATTEMPTS {
        let candidate = if attempt == 1 {
            format!("{}_fork", source_name)
        } else {
            format!("{}_fork{}", source_name, attempt)
        };
        if !name_taken(conn, owner, parent_key, &candidate, None)? {
            return Ok(candidate);
        }
    }
    Err(FnError::Conflict(format!(
        "no free fork name for {} under {}",
        source_name, parent_key
    )))
}

pub(crate) fn tx_fork_subtree(
    conn: &Connection,
    node_id: NodeId,
    target_parent_id: NodeId,
    new_name: Option<&str>,
    new_owner: &str,
) -> FnResult<TreeNode> {
    if new_owner.is_empty() {
        return Err(FnError::InvalidParam("new owner is empty".to_string()));
    }
    let mut locked = lock_nodes(conn, &[node_id, target_parent_id])?;
    let source = locked
        .get(&node_id)
        .cloned()
        .ok_or_else(|| FnError::NotFound(format!("node {}", node_id)))?;

    let target = if target_parent_id == ROOT_PARENT_ID {
        if source.kind != NodeKind::Package {
            return Err(FnError::InvalidKind(
                "only a package can be forked into a new root".to_string(),
            ));
        }
        None
    } else {
        let target = locked
            .remove(&target_parent_id)
            .filter(|t| t.owner == new_owner)
            .ok_or_else(|| FnError::NotFound(format!("target parent {}", target_parent_id)))?;
        if target.kind != NodeKind::Package {
            return Err(FnError::InvalidKind(format!(
                "target {} is a {}, only packages have children",
                target.id,
                target.kind.as_str()
            )));
        }
        Some(target)
    };

    // Snapshot first, so forking into the source's own subtree terminates.
    let mut snapshot = vec![source.clone()];
    snapshot.extend(load_descendants(conn, &source.id_path)?);

    let top_name = pick_fork_name(conn, new_owner, target_parent_id, &source.name, new_name)?;
    let now = unix_timestamp();

    let source_runner = match source.runner_ref {
        Some(runner_id) => load_runner(conn, runner_id)?,
        None => None,
    };
    let source_version = source_runner
        .as_ref()
        .map(|r| r.current_version.clone())
        .unwrap_or_else(|| INITIAL_VERSION.to_string());

    let new_root = target.is_none();
    if new_root {
        validate_subject_token(new_owner)?;
        validate_subject_token(&top_name)?;
    }
    let mut runner_ref = target.as_ref().and_then(|t| t.runner_ref);

    let mut copies: HashMap<NodeId, TreeNode> = HashMap::new();
    let mut children_added: BTreeMap<NodeId, i64> = BTreeMap::new();
    let mut top: Option<TreeNode> = None;

    for s in snapshot.iter() {
        let is_top = s.id == source.id;
        let (parent_paths, parent_id) = if is_top {
            (target.as_ref().map(|t| t.paths()), target.as_ref().map(|t| t.id))
        } else {
            let parent_src = s
                .parent_id
                .ok_or_else(|| invariant(format!("descendant {} has no parent", s.id)))?;
            let parent_copy = copies.get(&parent_src).ok_or_else(|| {
                invariant(format!("parent {} of {} was not copied first", parent_src, s.id))
            })?;
            (Some(parent_copy.paths()), Some(parent_copy.id))
        };

        let ref_id = match (s.kind, s.ref_id) {
            (NodeKind::Function, Some(function_id)) => {
                let function = load_function(conn, function_id)?.ok_or_else(|| {
                    FnError::NotFound(format!("function {} of node {}", function_id, s.id))
                })?;
                Some(function)
            }
            _ => None,
        };

        let name = if is_top { top_name.as_str() } else { s.name.as_str() };
        let mut copy = insert_node_row(
            conn,
            NewNodeRow {
                kind: s.kind,
                parent: parent_paths.as_ref(),
                parent_id,
                name,
                title: &s.title,
                description: &s.description,
                sort: s.sort,
                owner: new_owner,
                runner_ref,
                ref_id: None,
                fork_from_id: Some(s.id),
            },
            now,
        )?;

        if is_top && new_root {
            let title = format!("{} (Fork)", s.title);
            let runner = insert_runner(
                conn,
                new_owner,
                &copy.name,
                &title,
                &source_version,
                copy.id,
                source_runner.as_ref().map(|r| r.id),
                now,
            )?;
            let comment = format!("forked from {}{}@{}", source.owner, source.name_path, source_version);
            append_version(
                conn,
                VersionOwner::Runner(runner.id),
                &VersionBump::new(source_version.clone(), comment),
                now,
            )?;
            conn.execute(
                "UPDATE tree_nodes SET runner_ref = ?1, title = ?2 WHERE id = ?3",
                params![runner.id, title, copy.id],
            )
            .map_err(map_db_err)?;
            runner_ref = Some(runner.id);
            copy.runner_ref = runner_ref;
            copy.title = title;
        }

        if let Some(function) = ref_id {
            let runner_id = runner_ref.ok_or_else(|| {
                FnError::InvalidParam(format!(
                    "function {} cannot be forked outside a runner",
                    function.id
                ))
            })?;
            let function_id = insert_function(
                conn,
                &FunctionRecord {
                    runner_id,
                    owner: new_owner.to_string(),
                    name: copy.name.clone(),
                    fork_from_id: Some(function.id),
                    ..function.clone()
                },
                now,
            )?;
            let comment = format!(
                "forked from {}{}@{}",
                s.owner, s.name_path, function.current_version
            );
            append_version(
                conn,
                VersionOwner::Function(function_id),
                &VersionBump::new(function.current_version.clone(), comment)
                    .with_content_hash(hash_content([function.source.as_bytes()])),
                now,
            )?;
            conn.execute(
                "UPDATE tree_nodes SET ref_id = ?1 WHERE id = ?2",
                params![function_id, copy.id],
            )
            .map_err(map_db_err)?;
            copy.ref_id = Some(function_id);
        }

        if let Some(parent_id) = parent_id {
            *children_added.entry(parent_id).or_insert(0) += 1;
        }
        if is_top {
            top = Some(copy.clone());
        }
        copies.insert(s.id, copy);
    }

    for (parent_id, added) in children_added {
        adjust_children_count(conn, parent_id, added, now)?;
    }

    let top = top.ok_or_else(|| invariant(format!("fork of {} produced no root", node_id)))?;
    debug!(
        "forked {} nodes from {} into {}",
        copies.len(),
        source.id_path,
        top.id_path
    );
    require_node(conn, top.id)
}

// ==================== Delete ====================

pub(crate) fn tx_delete_node(conn: &Connection, owner: &str, node_id: NodeId) -> FnResult<()> {
    let parent_id = require_owned_node(conn, owner, node_id)?
        .parent_id
        .unwrap_or(ROOT_PARENT_ID);
    let mut locked = lock_nodes(conn, &[node_id, parent_id])?;
    let node = locked
        .remove(&node_id)
        .ok_or_else(|| FnError::NotFound(format!("node {}", node_id)))?;

    if node.children_count != 0 {
        return Err(FnError::NotEmpty(format!(
            "node {} still has {} children",
            node.id, node.children_count
        )));
    }
    let actual = count_children(conn, node.id)?;
    if actual != 0 {
        return Err(invariant(format!(
            "node {} records 0 children but has {}",
            node.id, actual
        )));
    }
    if node.kind == NodeKind::Function {
        if let Some(function_id) = node.ref_id {
            if load_function(conn, function_id)?.is_some() {
                return Err(FnError::NotEmpty(format!(
                    "function record {} of node {} must be removed first",
                    function_id, node.id
                )));
            }
        }
    }

    conn.execute("DELETE FROM tree_nodes WHERE id = ?1", params![node.id])
        .map_err(map_db_err)?;
    let now = unix_timestamp();
    if let Some(parent_id) = node.parent_id {
        adjust_children_count(conn, parent_id, -1, now)?;
    } else if let Some(runner_id) = node.runner_ref {
        delete_runner_row(conn, runner_id)?;
    }
    Ok(())
}
