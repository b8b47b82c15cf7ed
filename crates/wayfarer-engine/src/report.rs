use serde::{Deserialize, Serialize};

/// A node created as a side effect of selector resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedNode {
    pub id: String,
    pub position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Accumulator returned alongside every selector/route resolution.
///
/// Append-only during one resolution pass, and the sole channel for
/// partial-failure signaling: a missing alias is a recorded fact, not an
/// error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub missing_aliases: Vec<String>,
    pub missing_ids: Vec<String>,
    pub warnings: Vec<String>,
    pub created_nodes: Vec<CreatedNode>,
}

impl ResolutionReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn missing_alias(&mut self, alias: impl Into<String>) {
        self.missing_aliases.push(alias.into());
    }

    pub fn missing_id(&mut self, id: impl Into<String>) {
        self.missing_ids.push(id.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn created(&mut self, node: CreatedNode) {
        self.created_nodes.push(node);
    }

    /// Fold another report's findings into this one.
    pub fn merge(&mut self, other: ResolutionReport) {
        self.missing_aliases.extend(other.missing_aliases);
        self.missing_ids.extend(other.missing_ids);
        self.warnings.extend(other.warnings);
        self.created_nodes.extend(other.created_nodes);
    }

    pub fn is_clean(&self) -> bool {
        self.missing_aliases.is_empty()
            && self.missing_ids.is_empty()
            && self.warnings.is_empty()
    }
}
