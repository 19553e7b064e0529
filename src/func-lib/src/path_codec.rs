// Materialized path helpers. Every function here is pure; the tree calls them
// inside its transactions and treats any error as a broken invariant.

use crate::{FnError, FnResult, NodeId};

pub const PATH_SEP: char = '/';

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePaths {
    pub id_path: String,
    pub name_path: String,
    pub level: u32,
}

/// Paths of a node placed under `parent`, or of a root when `parent` is None.
pub fn compute_child_paths(parent: Option<&NodePaths>, child_name: &str, child_id: NodeId) -> NodePaths {
    match parent {
        Some(parent) => NodePaths {
            id_path: format!("{}/{}", parent.id_path, child_id),
            name_path: format!("{}/{}", parent.name_path, child_name),
            level: parent.level + 1,
        },
        None => NodePaths {
            id_path: format!("/{}", child_id),
            name_path: format!("/{}", child_name),
            level: 0,
        },
    }
}

/// Replaces the leading `old_prefix` of `old_full_path` with `new_prefix`.
/// The prefix must end on a segment boundary, otherwise the tree is corrupt.
pub fn rewrite_prefix(old_full_path: &str, old_prefix: &str, new_prefix: &str) -> FnResult<String> {
    let rest = old_full_path.strip_prefix(old_prefix).ok_or_else(|| {
        FnError::InvariantViolation(format!(
            "path {} does not start with {}",
            old_full_path, old_prefix
        ))
    })?;
    if !rest.is_empty() && !rest.starts_with(PATH_SEP) {
        return Err(FnError::InvariantViolation(format!(
            "prefix {} splits a segment of {}",
            old_prefix, old_full_path
        )));
    }
    Ok(format!("{}{}", new_prefix, rest))
}

pub fn is_proper_descendant_path(ancestor_id_path: &str, node_id_path: &str) -> bool {
    if ancestor_id_path.is_empty() {
        return false;
    }
    node_id_path.len() > ancestor_id_path.len() + 1
        && node_id_path.starts_with(ancestor_id_path)
        && node_id_path.as_bytes()[ancestor_id_path.len()] == b'/'
}

/// Swaps the trailing segment of a path, keeping its parent part verbatim.
pub fn replace_last_segment(path: &str, new_segment: &str) -> FnResult<String> {
    let pos = path
        .rfind(PATH_SEP)
        .ok_or_else(|| FnError::InvariantViolation(format!("malformed path {}", path)))?;
    Ok(format!("{}/{}", &path[..pos], new_segment))
}

pub fn segment_count(path: &str) -> usize {
    path.split(PATH_SEP).filter(|s| !s.is_empty()).count()
}

pub fn id_path_segments(id_path: &str) -> FnResult<Vec<NodeId>> {
    id_path
        .split(PATH_SEP)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<NodeId>().map_err(|_| {
                FnError::InvariantViolation(format!("bad id segment {:?} in {}", s, id_path))
            })
        })
        .collect()
}

/// Exclusive upper bound for a range scan over every path that starts
/// with `prefix`. `"/7/"` yields `"/70"`, so `[prefix, end)` matches
/// exactly the descendants of node 7.
pub fn prefix_range_end(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < u8::MAX {
            bytes.push(last + 1);
            return String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    String::new()
}

/// Checks the segment counts of a node's two paths against its level and
/// that both paths end with the node's own id and name.
pub fn check_paths(paths: &NodePaths, id: NodeId, name: &str) -> FnResult<()> {
    let id_segments = segment_count(&paths.id_path);
    let name_segments = segment_count(&paths.name_path);
    let expected = paths.level as usize + 1;
    if id_segments != expected || name_segments != expected {
        return Err(FnError::InvariantViolation(format!(
            "node {} has {} id segments and {} name segments at level {}",
            id, id_segments, name_segments, paths.level
        )));
    }
    if !paths.id_path.ends_with(&format!("/{}", id)) {
        return Err(FnError::InvariantViolation(format!(
            "id path {} does not end with node {}",
            paths.id_path, id
        )));
    }
    if !paths.name_path.ends_with(&format!("/{}", name)) {
        return Err(FnError::InvariantViolation(format!(
            "name path {} does not end with {}",
            paths.name_path, name
        )));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> FnResult<()> {
    if name.is_empty() {
        return Err(FnError::InvalidParam("name is empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(FnError::InvalidParam(format!("reserved name {:?}", name)));
    }
    if name.contains(PATH_SEP) || name.chars().any(|c| c.is_control()) {
        return Err(FnError::InvalidParam(format!("invalid name {:?}", name)));
    }
    Ok(())
}

/// Subject tokens are dot separated, so they must not carry dots,
/// whitespace or wildcards.
pub fn validate_subject_token(token: &str) -> FnResult<()> {
    if token.is_empty()
        || token
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
    {
        return Err(FnError::InvalidParam(format!("invalid subject token {:?}", token)));
    }
    Ok(())
}

/// Turns `sum`, `/sum/` or `//a//b` into `/sum` and `/a/b`. An empty path is `/`.
pub fn normalize_name_path(path: &str) -> FnResult<String> {
    let mut out = String::new();
    for segment in path.trim().split(PATH_SEP).filter(|s| !s.is_empty()) {
        validate_name(segment)?;
        out.push(PATH_SEP);
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push(PATH_SEP);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_child_paths() {
        let root = compute_child_paths(None, "mathlib", 1);
        assert_eq!(root.id_path, "/1");
        assert_eq!(root.name_path, "/mathlib");
        assert_eq!(root.level, 0);

        let child = compute_child_paths(Some(&root), "sum", 2);
        assert_eq!(child.id_path, "/1/2");
        assert_eq!(child.name_path, "/mathlib/sum");
        assert_eq!(child.level, 1);
        check_paths(&child, 2, "sum").unwrap();
    }

    #[test]
    fn test_rewrite_prefix() {
        assert_eq!(
            rewrite_prefix("/mathlib/ops/sum", "/mathlib", "/mathlib2").unwrap(),
            "/mathlib2/ops/sum"
        );
        assert_eq!(rewrite_prefix("/1/2", "/1/2", "/5/2").unwrap(), "/5/2");

        // Not a prefix at all.
        let err = rewrite_prefix("/other/sum", "/mathlib", "/x").unwrap_err();
        assert!(matches!(err, FnError::InvariantViolation(_)));

        // String prefix but not a segment prefix.
        let err = rewrite_prefix("/mathlib2/sum", "/mathlib", "/x").unwrap_err();
        assert!(matches!(err, FnError::InvariantViolation(_)));
    }

    #[test]
    fn test_is_proper_descendant_path() {
        assert!(is_proper_descendant_path("/1", "/1/2"));
        assert!(is_proper_descendant_path("/1", "/1/2/3"));
        assert!(!is_proper_descendant_path("/1", "/1"));
        assert!(!is_proper_descendant_path("/1", "/12"));
        assert!(!is_proper_descendant_path("/1/2", "/1"));
        assert!(!is_proper_descendant_path("", "/1"));
    }

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end("/7/"), "/70");
        assert_eq!(prefix_range_end("/1/23/"), "/1/230");
        let end = prefix_range_end("/7/");
        assert!("/7/8".to_string() < end);
        assert!("/70".to_string() >= end);
        assert!("/7".to_string() < "/7/".to_string());
    }

    #[test]
    fn test_replace_last_segment_and_segments() {
        assert_eq!(replace_last_segment("/mathlib/sum", "add").unwrap(), "/mathlib/add");
        assert_eq!(replace_last_segment("/mathlib", "m2").unwrap(), "/m2");
        assert_eq!(segment_count("/1/2/3"), 3);
        assert_eq!(id_path_segments("/1/22/3").unwrap(), vec![1, 22, 3]);
        assert!(id_path_segments("/1/x").is_err());
    }

    #[test]
    fn test_check_paths_detects_mismatch() {
        let bad = NodePaths {
            id_path: "/1/2".to_string(),
            name_path: "/mathlib".to_string(),
            level: 1,
        };
        assert!(matches!(
            check_paths(&bad, 2, "mathlib"),
            Err(FnError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("sum").is_ok());
        assert!(validate_name("with space").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());

        assert!(validate_subject_token("alice").is_ok());
        assert!(validate_subject_token("v1.2").is_err());
        assert!(validate_subject_token("a b").is_err());
        assert!(validate_subject_token("*").is_err());
    }

    #[test]
    fn test_normalize_name_path() {
        assert_eq!(normalize_name_path("sum").unwrap(), "/sum");
        assert_eq!(normalize_name_path("/ops//sum/").unwrap(), "/ops/sum");
        assert_eq!(normalize_name_path("").unwrap(), "/");
        assert!(normalize_name_path("/a/../b").is_err());
    }
}
