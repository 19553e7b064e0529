use crate::{FnError, FnResult, FunctionId, RunnerId};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HISTORY_PAGE_SIZE: u32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "owner_type", content = "owner_id", rename_all = "lowercase")]
pub enum VersionOwner {
    Runner(RunnerId),
    Function(FunctionId),
}

/// One immutable row of deploy history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: i64,
    #[serde(flatten)]
    pub owner: VersionOwner,
    pub version: String,
    pub comment: String,
    pub change_log: String,
    pub content_hash: String,
    pub author: String,
    pub create_time: u64,
}

/// What a successful build hands to the ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionBump {
    pub version: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub change_log: String,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub author: String,
}

impl VersionBump {
    pub fn new(version: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            comment: comment.into(),
            ..Default::default()
        }
    }

    pub fn with_change_log(mut self, change_log: impl Into<String>) -> Self {
        self.change_log = change_log.into();
        self
    }

    pub fn with_content_hash(mut self, content_hash: impl Into<String>) -> Self {
        self.content_hash = content_hash.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn validate(&self) -> FnResult<()> {
        if self.version.trim().is_empty() {
            return Err(FnError::InvalidParam("version is empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Clamps a 1-based page request. Page 0 is read as page 1, a zero page
/// size takes the default, and sizes above `limit` are cut to `limit`.
pub fn clamp_page(page: u32, page_size: u32, limit: u32) -> (u32, u32) {
    let limit = limit.max(1);
    let page = page.max(1);
    let page_size = if page_size == 0 {
        DEFAULT_HISTORY_PAGE_SIZE.min(limit)
    } else {
        page_size.min(limit)
    };
    (page, page_size)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Fail,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Fail => "fail",
        }
    }

    pub fn parse(value: &str) -> FnResult<Self> {
        match value {
            "success" => Ok(RunStatus::Success),
            "fail" => Ok(RunStatus::Fail),
            _ => Err(FnError::DecodeError(format!("invalid run status {}", value))),
        }
    }
}

/// One invocation outcome. `function_id` is None for calls routed to a
/// runner sub-route that has no tree leaf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub function_id: Option<FunctionId>,
    pub runner_id: RunnerId,
    pub trace_id: String,
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    pub status: RunStatus,
    pub message: String,
    pub start_ts: u64,
    pub end_ts: u64,
    pub cost_ms: u64,
}
