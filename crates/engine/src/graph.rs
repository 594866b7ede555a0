//! Compiled-graph document and the artefacts the compiler derives from it.
//!
//! The document shape is `{uid, version, nodes: [{uid, type, config}],
//! edges: [{uid, source, target}], variables}`. Every field is optional on
//! the way in so that malformed documents still deserialize and surface as
//! validation issues rather than parse errors.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::Workflow;

/// Implicit root of every graph. Always present, never declared in `nodes`.
pub const TRIGGER_UID: &str = "trigger";

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    #[serde(default)]
    pub uid: String,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub config: Value,
}

/// Directed edge; `source` must complete before `target` may start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
}

impl GraphNode {
    pub fn new(uid: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        Self {
            uid: uid.into(),
            node_type: node_type.into(),
            config,
        }
    }
}

impl GraphEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            uid: format!("edge_{source}_{target}"),
            source,
            target,
        }
    }
}

impl Workflow {
    /// The graph document the compiler checks for this workflow.
    ///
    /// Each `depends_on` entry becomes an edge from the dependency to the
    /// step. Steps without dependencies hang off [`TRIGGER_UID`].
    pub fn to_graph(&self) -> GraphDocument {
        let nodes = self
            .steps
            .iter()
            .map(|step| {
                GraphNode::new(
                    step.uid.clone(),
                    step.step_type.as_str(),
                    Value::Object(step.params.clone()),
                )
            })
            .collect();

        let mut edges = Vec::new();
        for step in &self.steps {
            if step.depends_on.is_empty() {
                edges.push(GraphEdge::new(TRIGGER_UID, step.uid.clone()));
            }
            for dep in &step.depends_on {
                edges.push(GraphEdge::new(dep.clone(), step.uid.clone()));
            }
        }

        GraphDocument {
            uid: Some(self.uid.clone()),
            version: Some(self.version),
            nodes,
            edges,
            variables: self.variables.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Blocking,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocking => "BLOCKING",
            Self::Warning => "WARNING",
            Self::Info => "INFO",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueCode {
    #[serde(rename = "E_MISSING_UID")]
    MissingUid,
    #[serde(rename = "E_MISSING_VERSION")]
    MissingVersion,
    #[serde(rename = "E_DUPLICATE_UID")]
    DuplicateUid,
    #[serde(rename = "E_MISSING_REF")]
    MissingRef,
    #[serde(rename = "E_CYCLE")]
    Cycle,
    #[serde(rename = "W_ORPHAN")]
    Orphan,
    #[serde(rename = "W_MISSING_CONFIG")]
    MissingConfig,
    #[serde(rename = "I_UNKNOWN_TYPE")]
    UnknownType,
}

impl IssueCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingUid => "E_MISSING_UID",
            Self::MissingVersion => "E_MISSING_VERSION",
            Self::DuplicateUid => "E_DUPLICATE_UID",
            Self::MissingRef => "E_MISSING_REF",
            Self::Cycle => "E_CYCLE",
            Self::Orphan => "W_ORPHAN",
            Self::MissingConfig => "W_MISSING_CONFIG",
            Self::UnknownType => "I_UNKNOWN_TYPE",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::Orphan | Self::MissingConfig => Severity::Warning,
            Self::UnknownType => Severity::Info,
            _ => Severity::Blocking,
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<String>,
}

impl ValidationIssue {
    /// Issue with the code's default severity and no references.
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: code.severity(),
            message: message.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes.extend(nodes.into_iter().map(Into::into));
        self
    }

    pub fn with_edge(mut self, edge: impl Into<String>) -> Self {
        self.edges.push(edge.into());
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// `true` iff no issue is blocking.
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        Self {
            valid: !issues.iter().any(ValidationIssue::is_blocking),
            issues,
        }
    }

    pub fn has_blocking(&self) -> bool {
        !self.valid
    }

    pub fn first_blocking(&self) -> Option<&ValidationIssue> {
        self.issues.iter().find(|i| i.is_blocking())
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Blocking)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn with_code(&self, code: IssueCode) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(move |i| i.code == code)
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Nodes that share a depth and could run side by side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionGroup {
    pub depth: usize,
    /// Sorted lexicographically.
    pub node_uids: Vec<String>,
}

/// Static, depth-grouped topological order of a valid graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub workflow_uid: String,
    pub version: u32,
    pub groups: Vec<ExecutionGroup>,
    pub variable_bindings: Map<String, Value>,
    pub validation: ValidationResult,
    pub compiled_at: DateTime<Utc>,
    pub compiler_version: String,
}

impl ExecutionPlan {
    /// Planned nodes excluding the trigger root.
    pub fn total_steps(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|g| &g.node_uids)
            .filter(|uid| uid.as_str() != TRIGGER_UID)
            .count()
    }

    /// Size of the widest group.
    pub fn max_parallelism(&self) -> usize {
        self.groups.iter().map(|g| g.node_uids.len()).max().unwrap_or(0)
    }

    pub fn depth_of(&self, uid: &str) -> Option<usize> {
        self.groups
            .iter()
            .find(|g| g.node_uids.iter().any(|n| n == uid))
            .map(|g| g.depth)
    }
}
