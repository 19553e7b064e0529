use func_lib::{NodeId, TreeNode};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug, Serialize)]
pub struct SubtreeNode {
    #[serde(flatten)]
    pub node: TreeNode,
    pub children: Vec<SubtreeNode>,
}

/// In-memory rendering of one subtree. Rows whose parent is not part of the
/// subtree are kept in `orphans` instead of being dropped.
#[derive(Clone, Debug, Serialize)]
pub struct SubtreeView {
    pub root: SubtreeNode,
    pub orphans: Vec<TreeNode>,
}

impl SubtreeView {
    /// `rows` are the descendants of `root`, in any order.
    pub fn build(root: TreeNode, rows: Vec<TreeNode>) -> Self {
        let mut known: HashSet<NodeId> = rows.iter().map(|n| n.id).collect();
        known.insert(root.id);

        let mut by_parent: HashMap<NodeId, Vec<TreeNode>> = HashMap::new();
        let mut orphans = Vec::new();
        for row in rows {
            match row.parent_id {
                Some(parent_id) if known.contains(&parent_id) && row.id != root.id => {
                    by_parent.entry(parent_id).or_default().push(row)
                }
                _ => orphans.push(row),
            }
        }
        for children in by_parent.values_mut() {
            children.sort_by(|a, b| a.sort.cmp(&b.sort).then_with(|| a.name.cmp(&b.name)));
        }

        let root = Self::attach(root, &mut by_parent);

        // Whatever is left hangs below an orphan.
        let mut leftovers = by_parent.into_values().flatten().collect::<Vec<_>>();
        leftovers.sort_by_key(|n| n.id);
        orphans.extend(leftovers);
        orphans.sort_by_key(|n| n.id);

        Self { root, orphans }
    }

    fn attach(node: TreeNode, by_parent: &mut HashMap<NodeId, Vec<TreeNode>>) -> SubtreeNode {
        let children = by_parent
            .remove(&node.id)
            .unwrap_or_default()
            .into_iter()
            .map(|child| Self::attach(child, by_parent))
            .collect();
        SubtreeNode { node, children }
    }

    pub fn node_count(&self) -> usize {
        fn count(node: &SubtreeNode) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        count(&self.root)
    }

    pub fn find(&self, node_id: NodeId) -> Option<&SubtreeNode> {
        fn walk(node: &SubtreeNode, node_id: NodeId) -> Option<&SubtreeNode> {
            if node.node.id == node_id {
                return Some(node);
            }
            node.children.iter().find_map(|c| walk(c, node_id))
        }
        walk(&self.root, node_id)
    }

    /// Indented text listing, one node per line.
    pub fn render_text(&self) -> String {
        fn render(node: &SubtreeNode, depth: usize, out: &mut String) {
            out.push_str(&"  ".repeat(depth));
            out.push_str(&format!(
                "{} [{}] #{} {}\n",
                node.node.name,
                node.node.kind.as_str(),
                node.node.id,
                node.node.id_path
            ));
            for child in node.children.iter() {
                render(child, depth + 1, out);
            }
        }
        let mut out = String::new();
        render(&self.root, 0, &mut out);
        for orphan in self.orphans.iter() {
            out.push_str(&format!(
                "! orphan {} #{} parent={:?}\n",
                orphan.name, orphan.id, orphan.parent_id
            ));
        }
        out
    }
}
