//! The workflow node model.
//!
//! A node's type and configuration live together in the tagged
//! [`NodeParams`] union, so dispatch in the executor is an exhaustive
//! match: adding a node type is a compiler-checked exercise.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::selector::NodeSelectorSpec;

/// Per-node execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Where an extraction node's output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtractOutput {
    /// Plain value, stored per the node's store policy.
    #[default]
    Value,
    /// Each element of an array result becomes a new record, fields
    /// namespaced under this node's alias.
    CreateRecords,
}

/// Source collection for a loop node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterateSource {
    /// Records whose ids match a wildcard pattern, in creation order.
    Records { pattern: String },
    /// An explicit array of values.
    Items { items: Vec<Value> },
    /// A template expression expected to resolve to an array.
    Expression { expr: String },
}

/// Per-element result accumulation for a loop node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateTarget {
    /// Evaluated against the per-element context after the body runs.
    pub expr: String,
    /// Global-bucket key receiving the accumulated list.
    pub into: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterateParams {
    pub source: IterateSource,
    /// Body selection, resolved once per entry into the loop.
    pub body: NodeSelectorSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteBranch {
    pub name: String,
    /// Boolean condition over the current context.
    pub condition: String,
    /// Body selection; unused in collection mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<NodeSelectorSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteParams {
    /// Evaluated in order; the first satisfied branch wins.
    pub branches: Vec<RouteBranch>,
    /// Collection mode: evaluate conditions once per record matching this
    /// pattern and partition record ids by branch, instead of running
    /// bodies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over_records: Option<String>,
}

/// Node type plus its variant-specific configuration. String-valued fields
/// may contain `{{...}}` template expressions, resolved at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeParams {
    Navigate {
        url: String,
    },
    Click {
        target: String,
    },
    TypeText {
        target: String,
        text: String,
    },
    /// Delegates an ambiguous instruction to the AI-driven action chooser
    /// behind the automation boundary.
    Act {
        instruction: String,
    },
    Extract {
        instruction: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
        #[serde(default)]
        output: ExtractOutput,
    },
    Screenshot,
    Iterate(IterateParams),
    Route(RouteParams),
}

impl NodeParams {
    /// The type tag, as used by query and recency filters.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeParams::Navigate { .. } => "navigate",
            NodeParams::Click { .. } => "click",
            NodeParams::TypeText { .. } => "type_text",
            NodeParams::Act { .. } => "act",
            NodeParams::Extract { .. } => "extract",
            NodeParams::Screenshot => "screenshot",
            NodeParams::Iterate(_) => "iterate",
            NodeParams::Route(_) => "route",
        }
    }
}

/// Execution options shared by every node type, kept at the step level the
/// way sequence steps carry them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeOptions {
    /// Explicit store policy: result sub-path -> global-bucket key. There
    /// is no implicit whole-result storage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub store: BTreeMap<String, String>,
    /// Inside an iteration, also write this result sub-path onto the
    /// current record as a field under this node's own alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_field: Option<String>,
    /// Condition gating execution; false resolves to `Skipped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_if: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Post-action settle delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Tab this node acts on; defaults to the run's main tab.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<String>,
}

/// One step in a workflow.
///
/// `position` is unique per workflow and is the sole execution order;
/// aliases, when present, are unique per workflow. Nodes are never
/// silently renumbered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub workflow_id: String,
    pub position: u32,
    pub params: NodeParams,
    #[serde(default)]
    pub options: NodeOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: NodeStatus,
    pub created_at: DateTime<Utc>,
    /// Back-reference to the logical parent container for nodes created
    /// inline by the selector resolver (the loop or branch that owns them).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl WorkflowNode {
    pub fn new(workflow_id: impl Into<String>, position: u32, params: NodeParams) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            position,
            params,
            options: NodeOptions::default(),
            alias: None,
            tags: Vec::new(),
            description: None,
            status: NodeStatus::Pending,
            created_at: Utc::now(),
            parent_id: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_options(mut self, options: NodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
