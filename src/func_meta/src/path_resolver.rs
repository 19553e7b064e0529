use func_lib::{
    normalize_name_path, FnError, FnResult, FunctionId, NodeId, NodeKind, RunnerId,
};
use log::debug;
use serde::Serialize;
use std::sync::Arc;

use crate::deploy::load_function;
use crate::meta_db::MetaDb;
use crate::namespace_tree::{load_node_by_name_path, load_root_by_name};
use crate::runner_registry::load_runner;

/// Dispatch coordinates of one function leaf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedFunction {
    pub runner_id: RunnerId,
    pub function_id: FunctionId,
    pub node_id: NodeId,
    pub version: String,
    pub owner: String,
    pub runner_name: String,
    pub method: String,
    /// Path below the runner root, e.g. `/sum`.
    pub sub_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedRunner {
    pub runner_id: RunnerId,
    pub version: String,
    pub owner: String,
    pub runner_name: String,
}

pub struct PathResolver {
    db: Arc<MetaDb>,
}

impl PathResolver {
    pub fn new(db: Arc<MetaDb>) -> Self {
        Self { db }
    }

    /// `name_path` is relative to the runner root (`/sum`).
    pub async fn resolve_function(
        &self,
        owner: &str,
        runner_name: &str,
        name_path: &str,
        http_method: &str,
    ) -> FnResult<ResolvedFunction> {
        let owner = owner.to_string();
        let runner_name = runner_name.to_string();
        let sub_path = normalize_name_path(name_path)?;
        let http_method = http_method.trim().to_string();

        self.db
            .with_conn(move |conn| {
                let runner = resolve_runner_in(conn, &owner, &runner_name)?;
                if sub_path == "/" {
                    return Err(FnError::NotFound(format!(
                        "no function at the root of {}/{}",
                        owner, runner_name
                    )));
                }

                let full_path = format!("/{}{}", runner_name, sub_path);
                let leaf = load_node_by_name_path(conn, &owner, &full_path)?
                    .ok_or_else(|| FnError::NotFound(format!("/{}{}", owner, full_path)))?;
                let function_id = match (leaf.kind, leaf.ref_id) {
                    (NodeKind::Function, Some(id)) => id,
                    _ => {
                        return Err(FnError::NotFound(format!(
                            "/{}{} is not a function",
                            owner, full_path
                        )))
                    }
                };
                let function = load_function(conn, function_id)?
                    .ok_or_else(|| FnError::NotFound(format!("function {}", function_id)))?;

                if !function.method.eq_ignore_ascii_case(&http_method) {
                    return Err(FnError::MethodMismatch(format!(
                        "/{}{} accepts {}, got {}",
                        owner, full_path, function.method, http_method
                    )));
                }

                debug!(
                    "resolved /{}{} to runner {} function {} at {}",
                    owner, full_path, runner.runner_id, function.id, runner.version
                );
                Ok(ResolvedFunction {
                    runner_id: runner.runner_id,
                    function_id: function.id,
                    node_id: leaf.id,
                    version: runner.version,
                    owner: runner.owner,
                    runner_name: runner.runner_name,
                    method: function.method,
                    sub_path,
                })
            })
            .await
    }

    /// For sub-routes served inside the runner itself.
    pub async fn resolve_runner(&self, owner: &str, runner_name: &str) -> FnResult<ResolvedRunner> {
        let owner = owner.to_string();
        let runner_name = runner_name.to_string();
        self.db
            .with_conn(move |conn| resolve_runner_in(conn, &owner, &runner_name))
            .await
    }
}

fn resolve_runner_in(
    conn: &rusqlite::Connection,
    owner: &str,
    runner_name: &str,
) -> FnResult<ResolvedRunner> {
    let root = load_root_by_name(conn, owner, runner_name)?
        .ok_or_else(|| FnError::NotFound(format!("runner {}/{}", owner, runner_name)))?;
    let runner_id = root.runner_ref.ok_or_else(|| {
        FnError::NotFound(format!("{}/{} is not a deployed runner", owner, runner_name))
    })?;
    let runner = load_runner(conn, runner_id)?
        .ok_or_else(|| FnError::NotFound(format!("runner {}", runner_id)))?;
    Ok(ResolvedRunner {
        runner_id: runner.id,
        version: runner.current_version,
        owner: runner.owner,
        runner_name: runner.name,
    })
}
