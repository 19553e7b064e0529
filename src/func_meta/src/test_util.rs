use std::sync::Arc;
use tempfile::TempDir;

use crate::{
    FunctionDeployer, FunctionSpec, MetaDb, NamespaceTree, PathResolver, RunnerRegistry,
    VersionLedger,
};

pub(crate) struct TestPlatform {
    pub db: Arc<MetaDb>,
    pub tree: NamespaceTree,
    pub registry: RunnerRegistry,
    pub ledger: VersionLedger,
    pub deployer: FunctionDeployer,
    pub resolver: PathResolver,
    _tmp: TempDir,
}

pub(crate) fn create_test_platform() -> TestPlatform {
    let tmp = TempDir::new().unwrap();
    let db = Arc::new(MetaDb::open(tmp.path().join("test.db")).unwrap());
    TestPlatform {
        tree: NamespaceTree::new(db.clone()),
        registry: RunnerRegistry::new(db.clone()),
        ledger: VersionLedger::new(db.clone()),
        deployer: FunctionDeployer::new(db.clone()),
        resolver: PathResolver::new(db.clone()),
        db,
        _tmp: tmp,
    }
}

pub(crate) fn function_spec(name: &str, method: &str) -> FunctionSpec {
    FunctionSpec {
        name: name.to_string(),
        title: format!("{} title", name),
        method: method.to_string(),
        source: format!("func {}() {{}}", name),
        ..Default::default()
    }
}
