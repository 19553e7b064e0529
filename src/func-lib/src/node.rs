use crate::{FnError, FnResult, NodePaths};
use serde::{Deserialize, Serialize};

pub type NodeId = i64;
pub type RunnerId = i64;
pub type FunctionId = i64;

/// Parent id used by callers to ask for a new root.
pub const ROOT_PARENT_ID: NodeId = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Package,
    Function,
}

impl NodeKind {
    pub fn to_int(self) -> i64 {
        match self {
            NodeKind::Package => 1,
            NodeKind::Function => 2,
        }
    }

    pub fn from_int(value: i64) -> FnResult<Self> {
        match value {
            1 => Ok(NodeKind::Package),
            2 => Ok(NodeKind::Function),
            _ => Err(FnError::DecodeError(format!("invalid node kind {}", value))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Package => "package",
            NodeKind::Function => "function",
        }
    }

    pub fn parse(value: &str) -> FnResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "package" => Ok(NodeKind::Package),
            "function" => Ok(NodeKind::Function),
            other => Err(FnError::InvalidParam(format!("unknown node kind {}", other))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    pub level: u32,
    pub id_path: String,
    pub name_path: String,
    pub name: String,
    pub title: String,
    pub description: String,
    /// Sibling order, ascending. Ties fall back to the name.
    pub sort: i64,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_ref: Option<RunnerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<FunctionId>,
    pub children_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_from_id: Option<NodeId>,
    pub create_time: u64,
    pub update_time: u64,
}

impl TreeNode {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn paths(&self) -> NodePaths {
        NodePaths {
            id_path: self.id_path.clone(),
            name_path: self.name_path.clone(),
            level: self.level,
        }
    }

    pub fn is_leaf_kind(&self) -> bool {
        self.kind == NodeKind::Function
    }

    /// User facing path, e.g. `/alice/mathlib/sum`.
    pub fn qualified_path(&self) -> String {
        format!("/{}{}", self.owner, self.name_path)
    }

    /// Name path below the runner root, e.g. `/sum` for `/mathlib/sum`.
    /// A root yields `/`.
    pub fn sub_path(&self) -> String {
        runner_sub_path(&self.name_path)
    }
}

/// Drops the root segment of a stored name path: `/mathlib/ops/sum` gives
/// `/ops/sum`, `/mathlib` gives `/`.
pub fn runner_sub_path(name_path: &str) -> String {
    let trimmed = name_path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(pos) => trimmed[pos..].to_string(),
        None => "/".to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerRecord {
    pub id: RunnerId,
    pub owner: String,
    pub name: String,
    pub title: String,
    pub current_version: String,
    pub tree_id: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_from_id: Option<RunnerId>,
    pub create_time: u64,
    pub update_time: u64,
}

/// The executable record a Function node points at through `ref_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub id: FunctionId,
    pub runner_id: RunnerId,
    pub owner: String,
    pub name: String,
    pub title: String,
    pub description: String,
    /// Always stored upper-case.
    pub method: String,
    pub route: String,
    pub request_schema: String,
    pub response_schema: String,
    #[serde(skip_serializing)]
    pub source: String,
    pub current_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_from_id: Option<FunctionId>,
    pub create_time: u64,
}

/// Upper-cases and validates an HTTP method token.
pub fn normalize_method(method: &str) -> FnResult<String> {
    let method = method.trim();
    if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(FnError::InvalidParam(format!("invalid http method: {:?}", method)));
    }
    Ok(method.to_ascii_uppercase())
}
