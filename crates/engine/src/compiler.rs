//! Graph validation and compilation. Run this before persisting or
//! executing a workflow.
//!
//! Checks, in order, all accumulated:
//! 1. The document carries a `uid` and a `version`; every node carries a uid.
//! 2. Node uids are unique, and `trigger` is reserved for the implicit root.
//! 3. Every edge endpoint names a node or `trigger`.
//! 4. The graph is acyclic (first cycle found is reported).
//! 5. Every node is reachable from `trigger` (orphans only warn).
//!
//! followed by advisory checks on node types and their config.
//!
//! [`compile`] turns a graph without blocking issues into a depth-grouped
//! [`ExecutionPlan`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::Utc;
use tracing::debug;

use crate::error::CompilationError;
use crate::graph::{
    ExecutionGroup, ExecutionPlan, GraphDocument, IssueCode, TRIGGER_UID, ValidationIssue,
    ValidationResult,
};
use crate::models::StepType;

pub const COMPILER_VERSION: &str = "1.0.0";

/// Validate a graph document. Pure and total: malformed input produces
/// blocking issues, never a panic.
pub fn validate(doc: &GraphDocument) -> ValidationResult {
    let mut issues = Vec::new();

    // -----------------------------------------------------------------------
    // 1. Required fields
    // -----------------------------------------------------------------------
    if doc.uid.as_deref().map_or(true, str::is_empty) {
        issues.push(ValidationIssue::new(
            IssueCode::MissingUid,
            "Workflow missing required 'uid' field",
        ));
    }
    if doc.version.is_none() {
        issues.push(ValidationIssue::new(
            IssueCode::MissingVersion,
            "Workflow missing required 'version' field",
        ));
    }

    // -----------------------------------------------------------------------
    // 2. Unique node uids
    // -----------------------------------------------------------------------
    let mut known: HashSet<&str> = HashSet::from([TRIGGER_UID]);
    for (index, node) in doc.nodes.iter().enumerate() {
        if node.uid.is_empty() {
            issues.push(
                ValidationIssue::new(
                    IssueCode::MissingUid,
                    format!("Node at index {index} missing required 'uid' field"),
                )
                .with_nodes([format!("#{index}")]),
            );
            continue;
        }
        if !known.insert(node.uid.as_str()) {
            let message = if node.uid == TRIGGER_UID {
                format!("Node uid '{TRIGGER_UID}' is reserved for the workflow root")
            } else {
                format!("Duplicate node uid: {}", node.uid)
            };
            issues.push(
                ValidationIssue::new(IssueCode::DuplicateUid, message).with_nodes([&node.uid]),
            );
        }
    }

    // -----------------------------------------------------------------------
    // 3. Edge endpoints
    // -----------------------------------------------------------------------
    for edge in &doc.edges {
        for (side, endpoint) in [("source", &edge.source), ("target", &edge.target)] {
            if !known.contains(endpoint.as_str()) {
                issues.push(
                    ValidationIssue::new(
                        IssueCode::MissingRef,
                        format!(
                            "Edge {} references non-existent {side} node: {endpoint}",
                            edge.uid
                        ),
                    )
                    .with_edge(&edge.uid),
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // 4. Cycles
    // -----------------------------------------------------------------------
    if let Some(cycle) = find_cycle(doc) {
        let mut path = cycle.join(" -> ");
        if let Some(first) = cycle.first() {
            path.push_str(" -> ");
            path.push_str(first);
        }
        issues.push(
            ValidationIssue::new(IssueCode::Cycle, format!("Cycle detected: {path}"))
                .with_nodes(cycle),
        );
    }

    // -----------------------------------------------------------------------
    // 5. Reachability
    // -----------------------------------------------------------------------
    let reachable = reachable_from_trigger(doc);
    let mut reported: HashSet<&str> = HashSet::new();
    for node in &doc.nodes {
        let uid = node.uid.as_str();
        if uid.is_empty() || uid == TRIGGER_UID || !reported.insert(uid) {
            continue;
        }
        if !reachable.contains(uid) {
            issues.push(
                ValidationIssue::new(
                    IssueCode::Orphan,
                    format!("Node {uid} is not reachable from trigger"),
                )
                .with_nodes([uid]),
            );
        }
    }

    // -----------------------------------------------------------------------
    // Advisory: node types and required config
    // -----------------------------------------------------------------------
    for node in doc.nodes.iter().filter(|n| !n.uid.is_empty()) {
        match node.node_type.parse::<StepType>() {
            Ok(kind) => {
                let missing: Vec<&str> = kind
                    .required_config()
                    .iter()
                    .copied()
                    .filter(|key| node.config.get(key).is_none())
                    .collect();
                if !missing.is_empty() {
                    issues.push(
                        ValidationIssue::new(
                            IssueCode::MissingConfig,
                            format!(
                                "Node {} ({kind}) missing config: {}",
                                node.uid,
                                missing.join(", ")
                            ),
                        )
                        .with_nodes([&node.uid]),
                    );
                }
            }
            Err(_) => issues.push(
                ValidationIssue::new(
                    IssueCode::UnknownType,
                    format!("Node {} has unknown type '{}'", node.uid, node.node_type),
                )
                .with_nodes([&node.uid]),
            ),
        }
    }

    ValidationResult::from_issues(issues)
}

/// Validate, then derive the depth-grouped plan.
///
/// # Errors
/// Fails fast with the first blocking issue.
pub fn compile(doc: &GraphDocument) -> Result<ExecutionPlan, CompilationError> {
    let validation = validate(doc);
    if let Some(issue) = validation.first_blocking() {
        return Err(issue.into());
    }

    // Adjacency list and in-degree, root included.
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    in_degree.insert(TRIGGER_UID, 0);
    for node in &doc.nodes {
        in_degree.entry(node.uid.as_str()).or_insert(0);
    }
    for edge in &doc.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
        *in_degree.entry(edge.target.as_str()).or_insert(0) += 1;
    }

    // Kahn's algorithm, one whole ready set at a time, lexicographic within it.
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut frontier: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&uid, _)| uid)
        .collect();
    for &uid in &frontier {
        depth.insert(uid, 0);
    }

    while !frontier.is_empty() {
        let mut next = BTreeSet::new();
        for node in frontier {
            let parent_depth = depth.get(node).copied().unwrap_or(0);
            for &child in adjacency.get(node).map(Vec::as_slice).unwrap_or_default() {
                let entry = depth.entry(child).or_insert(0);
                *entry = (*entry).max(parent_depth + 1);

                if let Some(deg) = in_degree.get_mut(child) {
                    *deg -= 1;
                    if *deg == 0 {
                        next.insert(child);
                    }
                }
            }
        }
        frontier = next;
    }

    let mut by_depth: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (uid, d) in depth {
        by_depth.entry(d).or_default().push(uid.to_owned());
    }
    let groups: Vec<ExecutionGroup> = by_depth
        .into_iter()
        .map(|(depth, mut node_uids)| {
            node_uids.sort();
            ExecutionGroup { depth, node_uids }
        })
        .collect();

    debug!(groups = groups.len(), nodes = doc.nodes.len(), "graph compiled");

    Ok(ExecutionPlan {
        workflow_uid: doc.uid.clone().unwrap_or_default(),
        version: doc.version.unwrap_or_default(),
        groups,
        variable_bindings: doc.variables.clone(),
        validation,
        compiled_at: Utc::now(),
        compiler_version: COMPILER_VERSION.to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Graph walks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-colour DFS with an explicit stack, visiting `trigger` first and
/// then nodes in document order. Edges with a dangling endpoint are ignored.
///
/// Returns the first cycle found, in path order starting at the node the
/// back-edge points to.
fn find_cycle(doc: &GraphDocument) -> Option<Vec<String>> {
    let mut order: Vec<&str> = vec![TRIGGER_UID];
    let mut index: HashMap<&str, usize> = HashMap::from([(TRIGGER_UID, 0)]);
    for node in &doc.nodes {
        if !node.uid.is_empty() && !index.contains_key(node.uid.as_str()) {
            index.insert(node.uid.as_str(), order.len());
            order.push(node.uid.as_str());
        }
    }

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); order.len()];
    for edge in &doc.edges {
        let source = index.get(edge.source.as_str());
        let target = index.get(edge.target.as_str());
        if let (Some(&s), Some(&t)) = (source, target) {
            adjacency[s].push(t);
        }
    }

    let mut color = vec![Color::White; order.len()];
    let mut parent: Vec<Option<usize>> = vec![None; order.len()];

    for root in 0..order.len() {
        if color[root] != Color::White {
            continue;
        }
        color[root] = Color::Gray;
        // (node, index of the next child to visit)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];

        while let Some(&(node, next)) = stack.last() {
            let Some(&child) = adjacency[node].get(next) else {
                color[node] = Color::Black;
                stack.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            match color[child] {
                Color::Gray => {
                    let mut path = vec![node];
                    let mut current = node;
                    while current != child {
                        match parent[current] {
                            Some(p) => {
                                path.push(p);
                                current = p;
                            }
                            None => break,
                        }
                    }
                    path.reverse();
                    return Some(path.into_iter().map(|i| order[i].to_owned()).collect());
                }
                Color::White => {
                    parent[child] = Some(node);
                    color[child] = Color::Gray;
                    stack.push((child, 0));
                }
                Color::Black => {}
            }
        }
    }

    None
}

fn reachable_from_trigger(doc: &GraphDocument) -> HashSet<&str> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &doc.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut seen: HashSet<&str> = HashSet::from([TRIGGER_UID]);
    let mut queue: VecDeque<&str> = VecDeque::from([TRIGGER_UID]);
    while let Some(node) = queue.pop_front() {
        for &next in adjacency.get(node).map(Vec::as_slice).unwrap_or_default() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    seen
}
