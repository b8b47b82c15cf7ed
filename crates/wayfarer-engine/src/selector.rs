//! Node selector resolution.
//!
//! A selector spec is a discriminated union of match rules, evaluated
//! independently and unioned. Whatever mix of rules produced them, the
//! returned positions are always deduplicated and numerically sorted.
//! Misses are recorded on the resolution report, never thrown.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::node::{NodeOptions, NodeParams, WorkflowNode};
use crate::report::{CreatedNode, ResolutionReport};
use crate::snapshot::WorkflowSnapshot;
use crate::store::{GroupMembers, GroupStore, NodeStore};

/// Pre-filter for `by_recent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RecentFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Free-form filter over type, tag membership and description/alias text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_match: Option<String>,
}

/// A brand-new node to be appended at the next free position during
/// resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineNodeSpec {
    pub params: NodeParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub options: NodeOptions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Alias or id of the logical parent container (the loop or branch
    /// that owns this node).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// One match rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSelector {
    ByAliases(Vec<String>),
    ByPositions(Vec<u32>),
    ByRange {
        start: u32,
        end: u32,
    },
    ByBetweenMarkers {
        start_alias: String,
        end_alias: String,
    },
    ByRecent {
        count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<RecentFilter>,
    },
    ByQuery(NodeQuery),
    ByGroup(String),
    InlineNodes(Vec<InlineNodeSpec>),
}

/// Legacy flexible reference: a number, an alias, an `"a..b"` alias range,
/// an `"N-M"` numeric range, or arrays thereof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeRef {
    Position(u32),
    Reference(String),
    List(Vec<NodeRef>),
}

/// What callers hand to `resolve`: one rule, many rules, or the legacy
/// shorthand. All three resolve identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeSelectorSpec {
    Many(Vec<NodeSelector>),
    One(NodeSelector),
    Shorthand(NodeRef),
}

impl NodeSelectorSpec {
    pub fn positions(positions: Vec<u32>) -> Self {
        NodeSelectorSpec::One(NodeSelector::ByPositions(positions))
    }

    pub fn aliases(aliases: Vec<&str>) -> Self {
        NodeSelectorSpec::One(NodeSelector::ByAliases(
            aliases.into_iter().map(|s| s.to_string()).collect(),
        ))
    }

    fn to_selectors(&self) -> Vec<NodeSelector> {
        match self {
            NodeSelectorSpec::Many(rules) => rules.clone(),
            NodeSelectorSpec::One(rule) => vec![rule.clone()],
            NodeSelectorSpec::Shorthand(reference) => {
                let mut out = Vec::new();
                flatten_ref(reference, &mut out);
                out
            }
        }
    }
}

fn flatten_ref(reference: &NodeRef, out: &mut Vec<NodeSelector>) {
    match reference {
        NodeRef::Position(p) => out.push(NodeSelector::ByPositions(vec![*p])),
        NodeRef::Reference(s) => out.push(parse_reference(s)),
        NodeRef::List(items) => {
            for item in items {
                flatten_ref(item, out);
            }
        }
    }
}

/// Map one shorthand string onto the structured form it must resolve
/// identically to.
fn parse_reference(s: &str) -> NodeSelector {
    let s = s.trim();

    // "a..b": numeric range or alias marker pair.
    if let Some((start, end)) = s.split_once("..") {
        let (start, end) = (start.trim(), end.trim());
        if !start.is_empty() && !end.is_empty() {
            if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                return NodeSelector::ByRange { start, end };
            }
            return NodeSelector::ByBetweenMarkers {
                start_alias: start.to_string(),
                end_alias: end.to_string(),
            };
        }
    }

    // "N-M" numeric range.
    if let Some((start, end)) = s.split_once('-') {
        if let (Ok(start), Ok(end)) = (start.trim().parse::<u32>(), end.trim().parse::<u32>()) {
            return NodeSelector::ByRange { start, end };
        }
    }

    if let Ok(position) = s.parse::<u32>() {
        return NodeSelector::ByPositions(vec![position]);
    }

    NodeSelector::ByAliases(vec![s.to_string()])
}

/// Resolves selector specs against a workflow snapshot.
pub struct SelectorResolver<'a> {
    store: &'a dyn NodeStore,
    groups: &'a GroupStore,
}

impl<'a> SelectorResolver<'a> {
    pub fn new(store: &'a dyn NodeStore, groups: &'a GroupStore) -> Self {
        Self { store, groups }
    }

    /// Resolve a spec to the deduplicated, sorted union of every rule's
    /// matches. Inline rules may append nodes to the snapshot (and the
    /// store) as a side effect; everything non-fatal lands on the report.
    pub async fn resolve(
        &self,
        spec: &NodeSelectorSpec,
        snapshot: &mut WorkflowSnapshot,
        report: &mut ResolutionReport,
    ) -> Result<Vec<u32>, EngineError> {
        let mut out = BTreeSet::new();
        for rule in spec.to_selectors() {
            self.resolve_rule(&rule, snapshot, report, &mut out).await?;
        }
        Ok(out.into_iter().collect())
    }

    /// Resolve several specs as one union.
    pub async fn resolve_all(
        &self,
        specs: &[NodeSelectorSpec],
        snapshot: &mut WorkflowSnapshot,
        report: &mut ResolutionReport,
    ) -> Result<Vec<u32>, EngineError> {
        let mut out = BTreeSet::new();
        for spec in specs {
            for rule in spec.to_selectors() {
                self.resolve_rule(&rule, snapshot, report, &mut out).await?;
            }
        }
        Ok(out.into_iter().collect())
    }

    async fn resolve_rule(
        &self,
        rule: &NodeSelector,
        snapshot: &mut WorkflowSnapshot,
        report: &mut ResolutionReport,
        out: &mut BTreeSet<u32>,
    ) -> Result<(), EngineError> {
        match rule {
            NodeSelector::ByAliases(aliases) => {
                for alias in aliases {
                    match snapshot.alias_position(alias) {
                        Some(position) => {
                            out.insert(position);
                        }
                        None => report.missing_alias(alias),
                    }
                }
            }
            NodeSelector::ByPositions(positions) => {
                out.extend(positions.iter().copied());
            }
            NodeSelector::ByRange { start, end } => {
                let (lo, hi) = if start <= end {
                    (*start, *end)
                } else {
                    (*end, *start)
                };
                out.extend(
                    snapshot
                        .positions()
                        .into_iter()
                        .filter(|p| (lo..=hi).contains(p)),
                );
            }
            NodeSelector::ByBetweenMarkers {
                start_alias,
                end_alias,
            } => {
                let start = snapshot.alias_position(start_alias);
                let end = snapshot.alias_position(end_alias);
                if start.is_none() {
                    report.missing_alias(start_alias);
                }
                if end.is_none() {
                    report.missing_alias(end_alias);
                }
                if let (Some(a), Some(b)) = (start, end) {
                    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                    out.extend(
                        snapshot
                            .positions()
                            .into_iter()
                            .filter(|p| (lo..=hi).contains(p)),
                    );
                }
            }
            NodeSelector::ByRecent { count, filter } => {
                let mut candidates: Vec<&WorkflowNode> = snapshot
                    .nodes()
                    .iter()
                    .filter(|n| recent_filter_matches(n, filter.as_ref()))
                    .collect();
                candidates.sort_by(|a, b| {
                    b.created_at
                        .cmp(&a.created_at)
                        .then(b.position.cmp(&a.position))
                });
                out.extend(candidates.iter().take(*count).map(|n| n.position));
            }
            NodeSelector::ByQuery(query) => {
                out.extend(
                    snapshot
                        .nodes()
                        .iter()
                        .filter(|n| query_matches(n, query))
                        .map(|n| n.position),
                );
            }
            NodeSelector::ByGroup(name) => match self.groups.get(snapshot.workflow_id(), name) {
                Some(GroupMembers::Positions(positions)) => {
                    out.extend(positions);
                }
                Some(GroupMembers::Aliases(aliases)) => {
                    for alias in &aliases {
                        match snapshot.alias_position(alias) {
                            Some(position) => {
                                out.insert(position);
                            }
                            None => report.missing_alias(alias),
                        }
                    }
                }
                None => report.warn(format!("group '{name}' is not defined")),
            },
            NodeSelector::InlineNodes(specs) => {
                for spec in specs {
                    self.create_inline(spec, snapshot, report, out).await?;
                }
            }
        }
        Ok(())
    }

    async fn create_inline(
        &self,
        spec: &InlineNodeSpec,
        snapshot: &mut WorkflowSnapshot,
        report: &mut ResolutionReport,
        out: &mut BTreeSet<u32>,
    ) -> Result<(), EngineError> {
        if let Some(alias) = &spec.alias {
            if let Some(existing) = snapshot.alias_position(alias) {
                // Submitting the same inline spec twice is an authoring
                // no-op, not an error.
                report.warn(format!(
                    "inline node alias '{alias}' already exists at position {existing}, skipping"
                ));
                out.insert(existing);
                return Ok(());
            }
        }

        let position = snapshot.next_free_position();
        let parent_id = spec.parent.as_ref().map(|p| {
            snapshot
                .node_by_alias(p)
                .map(|n| n.id.clone())
                .unwrap_or_else(|| p.clone())
        });

        let mut node = WorkflowNode::new(snapshot.workflow_id(), position, spec.params.clone());
        node.alias = spec.alias.clone();
        node.options = spec.options.clone();
        node.tags = spec.tags.clone();
        node.description = spec.description.clone();
        node.parent_id = parent_id;

        debug!(
            "creating inline node '{}' at position {}",
            spec.alias.as_deref().unwrap_or("<unaliased>"),
            position
        );
        self.store.insert_node(node.clone()).await?;
        report.created(CreatedNode {
            id: node.id.clone(),
            position,
            alias: node.alias.clone(),
        });
        snapshot.append(node);
        out.insert(position);
        Ok(())
    }
}

fn recent_filter_matches(node: &WorkflowNode, filter: Option<&RecentFilter>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    if let Some(kind) = &filter.kind {
        if node.params.kind() != kind {
            return false;
        }
    }
    if let Some(tag) = &filter.tag {
        if !node.tags.iter().any(|t| t == tag) {
            return false;
        }
    }
    true
}

fn query_matches(node: &WorkflowNode, query: &NodeQuery) -> bool {
    if let Some(kind) = &query.kind {
        if node.params.kind() != kind {
            return false;
        }
    }
    if let Some(tag) = &query.tag {
        if !node.tags.iter().any(|t| t == tag) {
            return false;
        }
    }
    if let Some(text) = &query.text_match {
        let needle = text.to_lowercase();
        let description_hit = node
            .description
            .as_deref()
            .is_some_and(|d| d.to_lowercase().contains(&needle));
        let alias_hit = node
            .alias
            .as_deref()
            .is_some_and(|a| a.to_lowercase().contains(&needle));
        if !description_hit && !alias_hit {
            return false;
        }
    }
    true
}
