#[cfg(test)]
mod tests {
    use crate::test_util::{create_test_platform, function_spec, TestPlatform};
    use crate::{DeployRequest, FunctionSpec, NodeSpec, SearchQuery, SubtreeNode};
    use func_lib::{
        segment_count, FnError, NodeId, NodeKind, TreeNode, VersionBump, ROOT_PARENT_ID,
    };

    async fn mkdir(p: &TestPlatform, owner: &str, parent: NodeId, name: &str) -> TreeNode {
        p.tree
            .create(owner, parent, NodeSpec::package(name, name))
            .await
            .unwrap()
    }

    async fn deploy_fn(
        p: &TestPlatform,
        owner: &str,
        package_id: NodeId,
        name: &str,
        version: &str,
    ) -> TreeNode {
        let result = p
            .deployer
            .deploy(DeployRequest {
                owner: owner.to_string(),
                package_id,
                functions: vec![function_spec(name, "POST")],
                bump: VersionBump::new(version, format!("deploy {}", name)),
            })
            .await
            .unwrap();
        result.functions[0].node.clone()
    }

    fn check_node(node: &SubtreeNode, parent: Option<&TreeNode>) {
        let n = &node.node;
        assert_eq!(segment_count(&n.id_path), n.level as usize + 1, "{:?}", n);
        assert_eq!(segment_count(&n.name_path), n.level as usize + 1, "{:?}", n);
        match parent {
            Some(parent) => {
                assert_eq!(n.name_path, format!("{}/{}", parent.name_path, n.name));
                assert_eq!(n.id_path, format!("{}/{}", parent.id_path, n.id));
                assert_eq!(n.owner, parent.owner);
                assert_eq!(n.level, parent.level + 1);
            }
            None => {}
        }
        assert_eq!(n.children_count as usize, node.children.len(), "{:?}", n);
        if n.kind == NodeKind::Function {
            assert_eq!(n.children_count, 0);
        }
        for child in node.children.iter() {
            check_node(child, Some(n));
        }
    }

    /// Path and counter invariants over a whole subtree.
    async fn assert_consistent(p: &TestPlatform, owner: &str, root_id: NodeId) {
        let view = p.tree.build_subtree(owner, root_id).await.unwrap();
        assert!(view.orphans.is_empty(), "orphans: {:?}", view.orphans);
        let root = &view.root.node;
        if root.is_root() {
            assert_eq!(root.name_path, format!("/{}", root.name));
            assert_eq!(root.id_path, format!("/{}", root.id));
            assert_eq!(root.level, 0);
        }
        check_node(&view.root, None);
    }

    // ==================== Create Tests ====================

    #[tokio::test]
    async fn test_create_root_and_children_paths() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "mathlib").await;
        assert!(root.is_root());
        assert_eq!(root.id_path, format!("/{}", root.id));
        assert_eq!(root.name_path, "/mathlib");
        assert_eq!(root.qualified_path(), "/alice/mathlib");

        let ops = mkdir(&p, "alice", root.id, "ops").await;
        assert_eq!(ops.level, 1);
        assert_eq!(ops.id_path, format!("/{}/{}", root.id, ops.id));
        assert_eq!(ops.name_path, "/mathlib/ops");

        let root = p.tree.get(root.id).await.unwrap();
        assert_eq!(root.children_count, 1);
        assert_consistent(&p, "alice", root.id).await;
    }

    #[tokio::test]
    async fn test_create_failures() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "mathlib").await;

        let err = p
            .tree
            .create("alice", ROOT_PARENT_ID, NodeSpec::function("f", "f", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, FnError::InvalidKind(_)));

        let err = p
            .tree
            .create(
                "alice",
                root.id,
                NodeSpec {
                    kind: NodeKind::Function,
                    name: "f".to_string(),
                    title: String::new(),
                    description: String::new(),
                    ref_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FnError::InvalidKind(_)));

        let err = p
            .tree
            .create("alice", 999, NodeSpec::package("x", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FnError::NotFound(_)));

        // Someone else's parent is invisible.
        let err = p
            .tree
            .create("bob", root.id, NodeSpec::package("x", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FnError::NotFound(_)));

        mkdir(&p, "alice", root.id, "ops").await;
        let err = p
            .tree
            .create("alice", root.id, NodeSpec::package("ops", "again"))
            .await
            .unwrap_err();
        assert!(matches!(err, FnError::Conflict(_)));

        let err = p
            .tree
            .create("alice", ROOT_PARENT_ID, NodeSpec::package("mathlib", "dup root"))
            .await
            .unwrap_err();
        assert!(matches!(err, FnError::Conflict(_)));

        // Root names are scoped per owner.
        mkdir(&p, "bob", ROOT_PARENT_ID, "mathlib").await;

        let err = p
            .tree
            .create("alice", root.id, NodeSpec::package("a/b", "bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, FnError::InvalidParam(_)));

        let root = p.tree.get(root.id).await.unwrap();
        assert_eq!(root.children_count, 1);
    }

    #[tokio::test]
    async fn test_function_node_cannot_have_children() {
        let p = create_test_platform();
        let runner = p
            .registry
            .create_runner("alice", "mathlib", "Math", None, "alice")
            .await
            .unwrap();
        let sum = deploy_fn(&p, "alice", runner.tree_id, "sum", "v2").await;
        let err = p
            .tree
            .create("alice", sum.id, NodeSpec::package("inner", "inner"))
            .await
            .unwrap_err();
        assert!(matches!(err, FnError::InvalidKind(_)));
    }

    // ==================== Scenario ====================

    #[tokio::test]
    async fn test_move_root_under_child_then_rename() {
        let p = create_test_platform();
        let runner = p
            .registry
            .create_runner("alice", "mathlib", "Math", None, "alice")
            .await
            .unwrap();
        assert_eq!(runner.tree_id, 1);
        let sum = deploy_fn(&p, "alice", 1, "sum", "v2").await;
        assert_eq!(sum.id, 2);
        assert_eq!(sum.qualified_path(), "/alice/mathlib/sum");

        let err = p.tree.move_node("alice", 1, 2).await.unwrap_err();
        assert!(matches!(err, FnError::CycleDetected(_)));

        p.tree.rename("alice", 1, "mathlib2").await.unwrap();
        let sum = p.tree.get(2).await.unwrap();
        assert_eq!(sum.qualified_path(), "/alice/mathlib2/sum");
        assert_eq!(sum.id_path, "/1/2");

        let runner = p.registry.get_runner(runner.id).await.unwrap();
        assert_eq!(runner.name, "mathlib2");
        assert_consistent(&p, "alice", 1).await;
    }

    // ==================== Rename Tests ====================

    #[tokio::test]
    async fn test_rename_propagates_to_descendants() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "lib").await;
        let a = mkdir(&p, "alice", root.id, "a").await;
        let b = mkdir(&p, "alice", a.id, "b").await;
        let c = mkdir(&p, "alice", b.id, "c").await;
        let a2 = mkdir(&p, "alice", root.id, "a2").await;
        let a2_child = mkdir(&p, "alice", a2.id, "keep").await;

        let renamed = p.tree.rename("alice", a.id, "x").await.unwrap();
        assert_eq!(renamed.name_path, "/lib/x");
        assert_eq!(renamed.id_path, a.id_path);

        let b_after = p.tree.get(b.id).await.unwrap();
        let c_after = p.tree.get(c.id).await.unwrap();
        assert_eq!(b_after.name_path, "/lib/x/b");
        assert_eq!(c_after.name_path, "/lib/x/b/c");
        assert_eq!(b_after.id_path, b.id_path);
        assert_eq!(c_after.id_path, c.id_path);

        // A sibling sharing the string prefix is untouched.
        let a2_child_after = p.tree.get(a2_child.id).await.unwrap();
        assert_eq!(a2_child_after.name_path, "/lib/a2/keep");

        assert!(p.tree.get_by_name_path("alice", "/lib/a/b").await.unwrap().is_none());
        assert_eq!(
            p.tree.get_by_name_path("alice", "/lib/x/b/c").await.unwrap().unwrap().id,
            c.id
        );
        assert_consistent(&p, "alice", root.id).await;
    }

    #[tokio::test]
    async fn test_rename_conflict_leaves_tree_unchanged() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "lib").await;
        let a = mkdir(&p, "alice", root.id, "a").await;
        mkdir(&p, "alice", root.id, "b").await;
        let inner = mkdir(&p, "alice", a.id, "inner").await;

        let err = p.tree.rename("alice", a.id, "b").await.unwrap_err();
        assert!(matches!(err, FnError::Conflict(_)));
        assert_eq!(p.tree.get(inner.id).await.unwrap().name_path, "/lib/a/inner");

        // Same name is a no-op.
        let same = p.tree.rename("alice", a.id, "a").await.unwrap();
        assert_eq!(same.name_path, "/lib/a");

        let err = p.tree.rename("bob", a.id, "z").await.unwrap_err();
        assert!(matches!(err, FnError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rename_follows_default_route_only() {
        let p = create_test_platform();
        let runner = p
            .registry
            .create_runner("alice", "mathlib", "Math", None, "alice")
            .await
            .unwrap();
        let ops = mkdir(&p, "alice", runner.tree_id, "ops").await;
        let sum = deploy_fn(&p, "alice", ops.id, "sum", "v2").await;
        let pinned = p
            .deployer
            .deploy(DeployRequest {
                owner: "alice".to_string(),
                package_id: ops.id,
                functions: vec![FunctionSpec {
                    route: "/custom/avg".to_string(),
                    ..function_spec("avg", "GET")
                }],
                bump: VersionBump::new("v3", "deploy avg"),
            })
            .await
            .unwrap()
            .functions[0]
            .node
            .clone();
        assert_eq!(p.deployer.get_function_by_node(sum.id).await.unwrap().route, "/ops/sum");

        p.tree.rename("alice", ops.id, "ops2").await.unwrap();
        assert_eq!(p.deployer.get_function_by_node(sum.id).await.unwrap().route, "/ops2/sum");
        assert_eq!(
            p.deployer.get_function_by_node(pinned.id).await.unwrap().route,
            "/custom/avg"
        );

        let renamed = p.tree.rename("alice", sum.id, "total").await.unwrap();
        let record = p.deployer.get_function_by_node(renamed.id).await.unwrap();
        assert_eq!(record.name, "total");
        assert_eq!(record.route, "/ops2/total");

        // The root name is not part of the route.
        p.tree.rename("alice", runner.tree_id, "calc").await.unwrap();
        assert_eq!(p.deployer.get_function_by_node(sum.id).await.unwrap().route, "/ops2/total");
    }

    // ==================== Move Tests ====================

    #[tokio::test]
    async fn test_move_cycle_detection() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "lib").await;
        let a = mkdir(&p, "alice", root.id, "a").await;
        let b = mkdir(&p, "alice", a.id, "b").await;
        let c = mkdir(&p, "alice", b.id, "c").await;

        let before = p.tree.build_subtree("alice", root.id).await.unwrap();

        let err = p.tree.move_node("alice", a.id, a.id).await.unwrap_err();
        assert!(matches!(err, FnError::CycleDetected(_)));
        let err = p.tree.move_node("alice", a.id, b.id).await.unwrap_err();
        assert!(matches!(err, FnError::CycleDetected(_)));
        let err = p.tree.move_node("alice", a.id, c.id).await.unwrap_err();
        assert!(matches!(err, FnError::CycleDetected(_)));

        let after = p.tree.build_subtree("alice", root.id).await.unwrap();
        assert_eq!(before.render_text(), after.render_text());
        assert_eq!(
            p.tree.get(root.id).await.unwrap().children_count,
            before.root.node.children_count
        );
    }

    #[tokio::test]
    async fn test_move_rewrites_subtree_and_counters() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "lib").await;
        let a = mkdir(&p, "alice", root.id, "a").await;
        let b = mkdir(&p, "alice", a.id, "b").await;
        let c = mkdir(&p, "alice", b.id, "c").await;
        let d = mkdir(&p, "alice", root.id, "d").await;
        let e = mkdir(&p, "alice", d.id, "e").await;

        let moved = p.tree.move_node("alice", b.id, e.id).await.unwrap();
        assert_eq!(moved.parent_id, Some(e.id));
        assert_eq!(moved.level, 3);
        assert_eq!(moved.name_path, "/lib/d/e/b");
        assert_eq!(moved.id_path, format!("{}/{}", e.id_path, b.id));

        let c_after = p.tree.get(c.id).await.unwrap();
        assert_eq!(c_after.level, 4);
        assert_eq!(c_after.name_path, "/lib/d/e/b/c");
        assert_eq!(c_after.id_path, format!("{}/{}/{}", e.id_path, b.id, c.id));

        assert_eq!(p.tree.get(a.id).await.unwrap().children_count, 0);
        assert_eq!(p.tree.get(e.id).await.unwrap().children_count, 1);

        // Moving back up shortens levels again.
        let back = p.tree.move_node("alice", c.id, root.id).await.unwrap();
        assert_eq!(back.level, 1);
        assert_eq!(back.name_path, "/lib/c");
        assert_consistent(&p, "alice", root.id).await;

        // Same parent is a no-op.
        let same = p.tree.move_node("alice", back.id, root.id).await.unwrap();
        assert_eq!(same.id_path, back.id_path);
        assert_consistent(&p, "alice", root.id).await;
    }

    #[tokio::test]
    async fn test_move_rejections() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "lib").await;
        let other_root = mkdir(&p, "alice", ROOT_PARENT_ID, "other").await;
        let a = mkdir(&p, "alice", root.id, "a").await;
        mkdir(&p, "alice", other_root.id, "a").await;
        let bob_root = mkdir(&p, "bob", ROOT_PARENT_ID, "lib").await;

        let err = p.tree.move_node("alice", root.id, other_root.id).await.unwrap_err();
        assert!(matches!(err, FnError::InvalidParam(_)));

        let err = p.tree.move_node("alice", a.id, bob_root.id).await.unwrap_err();
        assert!(matches!(err, FnError::InvalidParam(_)));

        let err = p.tree.move_node("alice", a.id, other_root.id).await.unwrap_err();
        assert!(matches!(err, FnError::Conflict(_)));

        let err = p.tree.move_node("alice", a.id, 999).await.unwrap_err();
        assert!(matches!(err, FnError::NotFound(_)));

        let err = p.tree.move_node("alice", a.id, ROOT_PARENT_ID).await.unwrap_err();
        assert!(matches!(err, FnError::InvalidParam(_)));

        assert_eq!(p.tree.get(a.id).await.unwrap().parent_id, Some(root.id));
    }

    #[tokio::test]
    async fn test_move_into_other_runner_rebinds_functions() {
        let p = create_test_platform();
        let math = p
            .registry
            .create_runner("alice", "mathlib", "Math", None, "alice")
            .await
            .unwrap();
        let text = p
            .registry
            .create_runner("alice", "textlib", "Text", None, "alice")
            .await
            .unwrap();
        let ops = mkdir(&p, "alice", math.tree_id, "ops").await;
        let sum = deploy_fn(&p, "alice", ops.id, "sum", "v2").await;

        p.tree.move_node("alice", ops.id, text.tree_id).await.unwrap();
        let sum_after = p.tree.get(sum.id).await.unwrap();
        assert_eq!(sum_after.runner_ref, Some(text.id));
        assert_eq!(sum_after.qualified_path(), "/alice/textlib/ops/sum");
        let record = p.deployer.get_function_by_node(sum.id).await.unwrap();
        assert_eq!(record.runner_id, text.id);
        assert_eq!(record.route, "/ops/sum");

        let deep = mkdir(&p, "alice", text.tree_id, "deep").await;
        p.tree.move_node("alice", ops.id, deep.id).await.unwrap();
        let record = p.deployer.get_function_by_node(sum.id).await.unwrap();
        assert_eq!(record.route, "/deep/ops/sum");
        assert_consistent(&p, "alice", text.tree_id).await;
    }

    #[tokio::test]
    async fn test_move_functions_outside_runner_is_rejected() {
        let p = create_test_platform();
        let math = p
            .registry
            .create_runner("alice", "mathlib", "Math", None, "alice")
            .await
            .unwrap();
        let plain = mkdir(&p, "alice", ROOT_PARENT_ID, "notes").await;
        let ops = mkdir(&p, "alice", math.tree_id, "ops").await;
        let sum = deploy_fn(&p, "alice", ops.id, "sum", "v2").await;

        let err = p.tree.move_node("alice", ops.id, plain.id).await.unwrap_err();
        assert!(matches!(err, FnError::InvalidParam(_)));
        let err = p.tree.move_node("alice", sum.id, plain.id).await.unwrap_err();
        assert!(matches!(err, FnError::InvalidParam(_)));

        let sum_after = p.tree.get(sum.id).await.unwrap();
        assert_eq!(sum_after.qualified_path(), "/alice/mathlib/ops/sum");
        assert_eq!(sum_after.runner_ref, Some(math.id));
        let record = p.deployer.get_function_by_node(sum.id).await.unwrap();
        assert_eq!(record.runner_id, math.id);
        assert_eq!(p.tree.get(plain.id).await.unwrap().children_count, 0);
        assert_consistent(&p, "alice", math.tree_id).await;

        // Packages without functions still move freely.
        let empty = mkdir(&p, "alice", math.tree_id, "empty").await;
        let moved = p.tree.move_node("alice", empty.id, plain.id).await.unwrap();
        assert_eq!(moved.runner_ref, None);
    }

    #[tokio::test]
    async fn test_concurrent_crossing_moves() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "lib").await;
        let a = mkdir(&p, "alice", root.id, "a").await;
        let b = mkdir(&p, "alice", root.id, "b").await;

        let (r1, r2) = tokio::join!(
            p.tree.move_node("alice", a.id, b.id),
            p.tree.move_node("alice", b.id, a.id)
        );
        let failures = [r1.is_err(), r2.is_err()].iter().filter(|v| **v).count();
        assert_eq!(failures, 1);
        let err = r1.err().or(r2.err()).unwrap();
        assert!(matches!(err, FnError::CycleDetected(_)));
        assert_consistent(&p, "alice", root.id).await;
    }

    // ==================== Counter / Delete Tests ====================

    #[tokio::test]
    async fn test_counter_integrity_after_create_delete() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "lib").await;
        let mut created = Vec::new();
        for i in 0..5 {
            let dir = mkdir(&p, "alice", root.id, &format!("d{}", i)).await;
            for j in 0..3 {
                created.push(mkdir(&p, "alice", dir.id, &format!("s{}", j)).await);
            }
        }
        for node in created.iter().step_by(2) {
            p.tree.delete("alice", node.id).await.unwrap();
        }
        let d0 = p.tree.get_by_name_path("alice", "/lib/d0").await.unwrap().unwrap();
        let children = p.tree.get_children(d0.id).await.unwrap();
        assert_eq!(d0.children_count as usize, children.len());
        assert_consistent(&p, "alice", root.id).await;
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let p = create_test_platform();
        let runner = p
            .registry
            .create_runner("alice", "mathlib", "Math", None, "alice")
            .await
            .unwrap();
        let ops = mkdir(&p, "alice", runner.tree_id, "ops").await;
        let sum = deploy_fn(&p, "alice", ops.id, "sum", "v2").await;

        let err = p.tree.delete("alice", ops.id).await.unwrap_err();
        assert!(matches!(err, FnError::NotEmpty(_)));

        let err = p.tree.delete("alice", sum.id).await.unwrap_err();
        assert!(matches!(err, FnError::NotEmpty(_)));

        p.deployer.remove_function("alice", sum.id).await.unwrap();
        assert!(p.tree.get(sum.id).await.unwrap_err().is_not_found());
        assert_eq!(p.tree.get(ops.id).await.unwrap().children_count, 0);

        p.tree.delete("alice", ops.id).await.unwrap();
        p.tree.delete("alice", runner.tree_id).await.unwrap();

        assert!(p.registry.get_runner(runner.id).await.unwrap_err().is_not_found());
        let history = p.ledger.history(runner.id, 1, 10).await.unwrap();
        assert_eq!(history.total, 2);
    }

    // ==================== Fork Tests ====================

    #[tokio::test]
    async fn test_fork_to_new_owner_is_independent() {
        let p = create_test_platform();
        let runner = p
            .registry
            .create_runner("alice", "mathlib", "Math", None, "alice")
            .await
            .unwrap();
        let ops = mkdir(&p, "alice", runner.tree_id, "ops").await;
        let sum = deploy_fn(&p, "alice", ops.id, "sum", "v2").await;

        let fork = p
            .tree
            .fork(runner.tree_id, ROOT_PARENT_ID, None, "bob")
            .await
            .unwrap();
        assert_eq!(fork.owner, "bob");
        assert_eq!(fork.name, "mathlib");
        assert_eq!(fork.fork_from_id, Some(runner.tree_id));
        assert!(fork.is_root());
        assert_ne!(fork.id, runner.tree_id);

        let source_view = p.tree.build_subtree("alice", runner.tree_id).await.unwrap();
        let fork_view = p.tree.build_subtree("bob", fork.id).await.unwrap();
        assert_eq!(source_view.node_count(), fork_view.node_count());
        assert_consistent(&p, "bob", fork.id).await;

        let fork_ops = &fork_view.root.children[0];
        let fork_sum = &fork_ops.children[0];
        assert_eq!(fork_ops.node.fork_from_id, Some(ops.id));
        assert_eq!(fork_sum.node.fork_from_id, Some(sum.id));
        assert_eq!(fork_sum.node.qualified_path(), "/bob/mathlib/ops/sum");
        assert_ne!(fork_sum.node.ref_id, sum.ref_id);
        assert_eq!(fork_sum.node.id_path, format!("/{}/{}/{}", fork.id, fork_ops.node.id, fork_sum.node.id));

        let bob_runner = p.registry.get_runner_by_name("bob", "mathlib").await.unwrap();
        assert_eq!(fork.runner_ref, Some(bob_runner.id));
        assert_eq!(bob_runner.current_version, "v2");
        assert_eq!(bob_runner.fork_from_id, Some(runner.id));

        // Mutating the fork leaves the source alone and vice versa.
        p.tree.rename("bob", fork_ops.node.id, "ops2").await.unwrap();
        p.deployer.remove_function("bob", fork_sum.node.id).await.unwrap();
        assert_eq!(p.tree.get(sum.id).await.unwrap().qualified_path(), "/alice/mathlib/ops/sum");
        assert!(p.deployer.get_function_by_node(sum.id).await.is_ok());

        p.tree.rename("alice", ops.id, "renamed").await.unwrap();
        let fork_ops_after = p.tree.get(fork_ops.node.id).await.unwrap();
        assert_eq!(fork_ops_after.name_path, "/mathlib/ops2");
        assert_consistent(&p, "alice", runner.tree_id).await;
        assert_consistent(&p, "bob", fork.id).await;
    }

    #[tokio::test]
    async fn test_fork_name_policy() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "lib").await;
        let ops = mkdir(&p, "alice", root.id, "ops").await;

        let f1 = p.tree.fork(ops.id, root.id, None, "alice").await.unwrap();
        assert_eq!(f1.name, "ops_fork");
        let f2 = p.tree.fork(ops.id, root.id, None, "alice").await.unwrap();
        assert_eq!(f2.name, "ops_fork2");
        let f3 = p.tree.fork(ops.id, root.id, Some("copy"), "alice").await.unwrap();
        assert_eq!(f3.name, "copy");

        let err = p.tree.fork(ops.id, root.id, Some("copy"), "alice").await.unwrap_err();
        assert!(matches!(err, FnError::Conflict(_)));

        let err = p.tree.fork(ops.id, root.id, None, "bob").await.unwrap_err();
        assert!(matches!(err, FnError::NotFound(_)));

        assert_eq!(p.tree.get(root.id).await.unwrap().children_count, 4);
        assert_consistent(&p, "alice", root.id).await;
    }

    #[tokio::test]
    async fn test_fork_into_own_subtree_terminates() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "lib").await;
        let a = mkdir(&p, "alice", root.id, "a").await;
        mkdir(&p, "alice", a.id, "b").await;

        let copy = p.tree.fork(a.id, a.id, None, "alice").await.unwrap();
        assert_eq!(copy.name_path, "/lib/a/a");
        let view = p.tree.build_subtree("alice", a.id).await.unwrap();
        assert_eq!(view.node_count(), 4);
        assert_consistent(&p, "alice", root.id).await;
    }

    #[tokio::test]
    async fn test_fork_writes_function_history() {
        let p = create_test_platform();
        let runner = p
            .registry
            .create_runner("alice", "mathlib", "Math", None, "alice")
            .await
            .unwrap();
        deploy_fn(&p, "alice", runner.tree_id, "sum", "v2").await;

        let fork = p
            .tree
            .fork(runner.tree_id, ROOT_PARENT_ID, Some("mymath"), "bob")
            .await
            .unwrap();
        let children = p.tree.get_children(fork.id).await.unwrap();
        let function_id = children[0].ref_id.unwrap();
        let history = p.ledger.function_history(function_id, 1, 10).await.unwrap();
        assert_eq!(history.total, 1);
        assert_eq!(history.items[0].version, "v2");
        assert_eq!(history.items[0].comment, "forked from alice/mathlib/sum@v2");

        let bob_runner = p.registry.get_runner_by_name("bob", "mymath").await.unwrap();
        let runner_history = p.ledger.history(bob_runner.id, 1, 10).await.unwrap();
        assert_eq!(runner_history.items[0].comment, "forked from alice/mathlib@v2");
    }

    // ==================== Query Tests ====================

    #[tokio::test]
    async fn test_queries() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "lib").await;
        let a = mkdir(&p, "alice", root.id, "a").await;
        let b = mkdir(&p, "alice", a.id, "b").await;
        mkdir(&p, "alice", ROOT_PARENT_ID, "zlib").await;

        let chain = p.tree.get_ancestor_chain(b.id).await.unwrap();
        assert_eq!(
            chain.iter().map(|n| n.id).collect::<Vec<_>>(),
            vec![root.id, a.id, b.id]
        );

        let by_id_path = p.tree.get_by_id_path(&b.id_path).await.unwrap().unwrap();
        assert_eq!(by_id_path.id, b.id);
        assert!(p.tree.get_by_id_path("/999").await.unwrap().is_none());

        let roots = p.tree.list_roots("alice").await.unwrap();
        assert_eq!(roots.len(), 2);
        assert!(p.tree.list_roots("carol").await.unwrap().is_empty());

        let titled = p.tree.set_title("alice", a.id, "Alpha").await.unwrap();
        assert_eq!(titled.title, "Alpha");
        assert_eq!(titled.name_path, a.name_path);

        let err = p.tree.build_subtree("bob", root.id).await.unwrap_err();
        assert!(matches!(err, FnError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_children_follow_sort_then_name() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "lib").await;
        let c = mkdir(&p, "alice", root.id, "c").await;
        let a = mkdir(&p, "alice", root.id, "a").await;
        let b = mkdir(&p, "alice", root.id, "b").await;

        let names = |nodes: Vec<TreeNode>| nodes.into_iter().map(|n| n.name).collect::<Vec<_>>();
        assert_eq!(names(p.tree.get_children(root.id).await.unwrap()), vec!["a", "b", "c"]);

        let c = p.tree.set_sort("alice", c.id, -1).await.unwrap();
        assert_eq!(c.sort, -1);
        p.tree.set_sort("alice", a.id, 5).await.unwrap();
        assert_eq!(names(p.tree.get_children(root.id).await.unwrap()), vec!["c", "b", "a"]);

        let err = p.tree.set_sort("bob", b.id, 1).await.unwrap_err();
        assert!(matches!(err, FnError::NotFound(_)));
        let err = p.tree.set_sort("alice", 999, 1).await.unwrap_err();
        assert!(matches!(err, FnError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_search() {
        let p = create_test_platform();
        let runner = p
            .registry
            .create_runner("alice", "mathlib", "Math", None, "alice")
            .await
            .unwrap();
        let ops = mkdir(&p, "alice", runner.tree_id, "ops").await;
        p.tree
            .set_description("alice", ops.id, "Arithmetic helpers")
            .await
            .unwrap();
        let sum = deploy_fn(&p, "alice", ops.id, "sum", "v2").await;
        mkdir(&p, "alice", ROOT_PARENT_ID, "notes").await;
        mkdir(&p, "bob", ROOT_PARENT_ID, "mathlib").await;

        let search = |keyword: &str| SearchQuery {
            keyword: keyword.to_string(),
            ..Default::default()
        };

        let found = p.tree.search("alice", &search("ARITH")).await.unwrap();
        assert_eq!(found.iter().map(|n| n.id).collect::<Vec<_>>(), vec![ops.id]);
        assert_eq!(found[0].description, "Arithmetic helpers");

        // Dots stand for path separators.
        let found = p.tree.search("alice", &search("mathlib.ops.sum")).await.unwrap();
        assert_eq!(found.iter().map(|n| n.id).collect::<Vec<_>>(), vec![sum.id]);

        // Title match, shallow nodes first, other owners never show up.
        let found = p.tree.search("alice", &search("math")).await.unwrap();
        assert_eq!(found[0].id, runner.tree_id);
        assert!(found.iter().all(|n| n.owner == "alice"));
        assert_eq!(found.len(), 3);

        let functions = p
            .tree
            .search(
                "alice",
                &SearchQuery {
                    kind: Some(NodeKind::Function),
                    ..search("mathlib")
                },
            )
            .await
            .unwrap();
        assert_eq!(functions.iter().map(|n| n.id).collect::<Vec<_>>(), vec![sum.id]);

        let workspaces = p
            .tree
            .search(
                "alice",
                &SearchQuery {
                    workspace: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            workspaces.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
            vec!["mathlib", "notes"]
        );

        let limited = p
            .tree
            .search(
                "alice",
                &SearchQuery {
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert!(p.tree.search("alice", &search("nothing")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_description_survives_fork() {
        let p = create_test_platform();
        let root = mkdir(&p, "alice", ROOT_PARENT_ID, "lib").await;
        let a = mkdir(&p, "alice", root.id, "a").await;
        p.tree.set_description("alice", a.id, "first").await.unwrap();
        p.tree.set_sort("alice", a.id, 3).await.unwrap();

        let forked = p.tree.fork(a.id, root.id, Some("a_copy"), "alice").await.unwrap();
        assert_eq!(forked.description, "first");
        assert_eq!(forked.sort, 3);
        assert_eq!(forked.fork_from_id, Some(a.id));
    }
}
