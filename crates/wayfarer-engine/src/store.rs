//! Persistence boundaries: the node datastore and named-group storage.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::node::{NodeParams, NodeStatus, WorkflowNode};

/// Generic ordered-record datastore holding workflow nodes.
///
/// The resolver and executor depend only on this shape. Mutations are
/// explicit patch operations; nothing here renumbers positions.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn list_nodes(&self, workflow_id: &str) -> Result<Vec<WorkflowNode>, EngineError>;

    async fn insert_node(&self, node: WorkflowNode) -> Result<(), EngineError>;

    async fn set_status(
        &self,
        workflow_id: &str,
        node_id: &str,
        status: NodeStatus,
    ) -> Result<(), EngineError>;

    async fn patch_params(
        &self,
        workflow_id: &str,
        node_id: &str,
        params: NodeParams,
    ) -> Result<(), EngineError>;
}

/// In-memory node store backing tests and embedders without a database.
#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: Mutex<HashMap<String, Vec<WorkflowNode>>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn list_nodes(&self, workflow_id: &str) -> Result<Vec<WorkflowNode>, EngineError> {
        let nodes = self.nodes.lock().expect("node store poisoned");
        Ok(nodes.get(workflow_id).cloned().unwrap_or_default())
    }

    async fn insert_node(&self, node: WorkflowNode) -> Result<(), EngineError> {
        let mut nodes = self.nodes.lock().expect("node store poisoned");
        let workflow = nodes.entry(node.workflow_id.clone()).or_default();

        if workflow.iter().any(|n| n.position == node.position) {
            return Err(EngineError::InvalidWorkflow(format!(
                "position {} already taken in workflow '{}'",
                node.position, node.workflow_id
            )));
        }
        if let Some(alias) = &node.alias {
            if workflow.iter().any(|n| n.alias.as_deref() == Some(alias)) {
                return Err(EngineError::InvalidWorkflow(format!(
                    "alias '{}' already taken in workflow '{}'",
                    alias, node.workflow_id
                )));
            }
        }

        workflow.push(node);
        Ok(())
    }

    async fn set_status(
        &self,
        workflow_id: &str,
        node_id: &str,
        status: NodeStatus,
    ) -> Result<(), EngineError> {
        let mut nodes = self.nodes.lock().expect("node store poisoned");
        let node = nodes
            .get_mut(workflow_id)
            .and_then(|w| w.iter_mut().find(|n| n.id == node_id))
            .ok_or_else(|| EngineError::Store(format!("node '{node_id}' not found")))?;
        node.status = status;
        Ok(())
    }

    async fn patch_params(
        &self,
        workflow_id: &str,
        node_id: &str,
        params: NodeParams,
    ) -> Result<(), EngineError> {
        let mut nodes = self.nodes.lock().expect("node store poisoned");
        let node = nodes
            .get_mut(workflow_id)
            .and_then(|w| w.iter_mut().find(|n| n.id == node_id))
            .ok_or_else(|| EngineError::Store(format!("node '{node_id}' not found")))?;
        node.params = params;
        Ok(())
    }
}

/// Members of a named group: either concrete positions or aliases resolved
/// at use time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMembers {
    Positions(Vec<u32>),
    Aliases(Vec<String>),
}

/// Workflow-scoped named-group storage.
///
/// Read-mostly shared state; the explicit define/remove operations are the
/// only mutation path.
#[derive(Default)]
pub struct GroupStore {
    groups: Mutex<HashMap<(String, String), GroupMembers>>,
}

impl GroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_group(
        &self,
        workflow_id: impl Into<String>,
        name: impl Into<String>,
        members: GroupMembers,
    ) {
        let key = (workflow_id.into(), name.into());
        debug!("defining group '{}' for workflow '{}'", key.1, key.0);
        self.groups
            .lock()
            .expect("group store poisoned")
            .insert(key, members);
    }

    pub fn get(&self, workflow_id: &str, name: &str) -> Option<GroupMembers> {
        self.groups
            .lock()
            .expect("group store poisoned")
            .get(&(workflow_id.to_string(), name.to_string()))
            .cloned()
    }

    pub fn remove_group(&self, workflow_id: &str, name: &str) -> bool {
        self.groups
            .lock()
            .expect("group store poisoned")
            .remove(&(workflow_id.to_string(), name.to_string()))
            .is_some()
    }

    pub fn list_groups(&self, workflow_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .lock()
            .expect("group store poisoned")
            .keys()
            .filter(|(wf, _)| wf == workflow_id)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}
