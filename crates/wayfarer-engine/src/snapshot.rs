//! The in-memory view of one workflow's ordered node list.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::node::WorkflowNode;
use crate::store::NodeStore;

/// Ordered node list plus the two lookup indices resolution works from:
/// by integer position and by human alias.
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    workflow_id: String,
    nodes: Vec<WorkflowNode>,
    by_position: HashMap<u32, usize>,
    by_alias: HashMap<String, usize>,
}

impl WorkflowSnapshot {
    /// Load and index a workflow from the datastore.
    pub async fn load(
        store: &dyn NodeStore,
        workflow_id: &str,
    ) -> Result<Self, EngineError> {
        let nodes = store.list_nodes(workflow_id).await?;
        Self::from_nodes(workflow_id, nodes)
    }

    /// Build a snapshot from an already-fetched node list. Duplicate
    /// positions or aliases violate the workflow invariants and are
    /// rejected here rather than silently shadowed.
    pub fn from_nodes(
        workflow_id: &str,
        mut nodes: Vec<WorkflowNode>,
    ) -> Result<Self, EngineError> {
        nodes.sort_by_key(|n| n.position);

        let mut by_position = HashMap::new();
        let mut by_alias = HashMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            if by_position.insert(node.position, idx).is_some() {
                return Err(EngineError::InvalidWorkflow(format!(
                    "duplicate position {} in workflow '{}'",
                    node.position, workflow_id
                )));
            }
            if let Some(alias) = &node.alias {
                if by_alias.insert(alias.clone(), idx).is_some() {
                    return Err(EngineError::InvalidWorkflow(format!(
                        "duplicate alias '{}' in workflow '{}'",
                        alias, workflow_id
                    )));
                }
            }
        }

        Ok(Self {
            workflow_id: workflow_id.to_string(),
            nodes,
            by_position,
            by_alias,
        })
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn nodes(&self) -> &[WorkflowNode] {
        &self.nodes
    }

    pub fn node_at(&self, position: u32) -> Option<&WorkflowNode> {
        self.by_position.get(&position).map(|&idx| &self.nodes[idx])
    }

    pub fn node_by_alias(&self, alias: &str) -> Option<&WorkflowNode> {
        self.by_alias.get(alias).map(|&idx| &self.nodes[idx])
    }

    pub fn alias_position(&self, alias: &str) -> Option<u32> {
        self.node_by_alias(alias).map(|n| n.position)
    }

    pub fn positions(&self) -> Vec<u32> {
        self.nodes.iter().map(|n| n.position).collect()
    }

    /// The position an inline node would be appended at.
    pub fn next_free_position(&self) -> u32 {
        self.nodes.last().map(|n| n.position + 1).unwrap_or(1)
    }

    /// Append a node created during resolution, keeping the indices
    /// consistent. The caller has already checked the invariants.
    pub(crate) fn append(&mut self, node: WorkflowNode) {
        let idx = self.nodes.len();
        self.by_position.insert(node.position, idx);
        if let Some(alias) = &node.alias {
            self.by_alias.insert(alias.clone(), idx);
        }
        self.nodes.push(node);
    }

    pub(crate) fn set_status(&mut self, position: u32, status: crate::node::NodeStatus) {
        if let Some(&idx) = self.by_position.get(&position) {
            self.nodes[idx].status = status;
        }
    }
}
