// func_meta keeps the namespace tree, runners, function records and their
// version history in one SQLite database, and resolves paths into dispatch
// coordinates.

mod deploy;
mod meta_db;
mod namespace_tree;
mod path_resolver;
mod run_recorder;
mod runner_registry;
mod tree_view;
mod version_ledger;

pub use deploy::{DeployRequest, DeployResult, DeployedFunction, FunctionDeployer, FunctionSpec};
pub use meta_db::MetaDb;
pub use namespace_tree::{NamespaceTree, NodeSpec, SearchQuery};
pub use path_resolver::{PathResolver, ResolvedFunction, ResolvedRunner};
pub use run_recorder::{DbRunRecordSink, RunRecordSink, RunRecorder, RunRecorderStats};
pub use runner_registry::{RunnerRegistry, INITIAL_VERSION};
pub use tree_view::{SubtreeNode, SubtreeView};
pub use version_ledger::VersionLedger;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod namespace_tree_tests;
