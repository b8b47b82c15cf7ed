//! The node executor.
//!
//! Walks a resolved sequence of positions on a single logical thread of
//! control, dispatching each node through an exhaustive match on its
//! params variant. Control-flow nodes (iterate, route) recurse into nested
//! sequences. Pause and cancel take effect at node boundaries only;
//! in-flight boundary calls are left to complete or time out under the
//! boundary's own policy.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wayfarer::{AutomationBridge, DomInspector};

use crate::context::{ExecutionContext, IterationFrame};
use crate::error::EngineError;
use crate::expression;
use crate::node::{
    ExtractOutput, IterateParams, IterateSource, NodeParams, NodeStatus, RouteParams, WorkflowNode,
};
use crate::report::ResolutionReport;
use crate::selector::{NodeSelectorSpec, SelectorResolver};
use crate::snapshot::WorkflowSnapshot;
use crate::store::{GroupStore, NodeStore};
use crate::template::{stringify, walk_path, TemplateResolver};

/// Whole-workflow execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of one executed node.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeRunResult {
    pub position: u32,
    pub alias: Option<String>,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a run returns: final status, per-node results, and every warning
/// accumulated along the way. Never warnings-only silence.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: WorkflowRunStatus,
    pub results: Vec<NodeRunResult>,
    pub report: ResolutionReport,
}

/// Pause/resume/cancel control surface, cloneable and usable from outside
/// the run. Both signals take effect at the next node boundary.
#[derive(Clone)]
pub struct ControlHandle {
    pause: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
}

impl ControlHandle {
    pub fn pause(&self) {
        let _ = self.pause.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause.send(false);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

enum SequenceEnd {
    Completed,
    Failed,
    Cancelled,
}

enum NodeOutcome {
    Completed(Value),
    Failed(String),
    Cancelled,
}

pub struct WorkflowExecutor {
    store: Arc<dyn NodeStore>,
    groups: Arc<GroupStore>,
    bridge: Arc<dyn AutomationBridge>,
    inspector: Option<Arc<DomInspector>>,
    control: ControlHandle,
    pause_rx: watch::Receiver<bool>,
    default_tab: String,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn NodeStore>,
        groups: Arc<GroupStore>,
        bridge: Arc<dyn AutomationBridge>,
    ) -> Self {
        let (pause_tx, pause_rx) = watch::channel(false);
        Self {
            store,
            groups,
            bridge,
            inspector: None,
            control: ControlHandle {
                pause: Arc::new(pause_tx),
                cancel: CancellationToken::new(),
            },
            pause_rx,
            default_tab: "main".to_string(),
        }
    }

    /// Attach the inspection service so `@<element_id>` targets expand to
    /// concrete selectors before hitting the automation bridge.
    pub fn with_inspector(mut self, inspector: Arc<DomInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn with_default_tab(mut self, tab: impl Into<String>) -> Self {
        self.default_tab = tab.into();
        self
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Execute the nodes selected by `selection` with a fresh context.
    pub async fn run(
        &self,
        workflow_id: &str,
        selection: &NodeSelectorSpec,
    ) -> Result<RunOutcome, EngineError> {
        let mut ctx = ExecutionContext::new();
        self.run_with_context(workflow_id, selection, &mut ctx).await
    }

    /// Execute with a caller-provided context, preserving the global
    /// bucket and record store across runs.
    pub async fn run_with_context(
        &self,
        workflow_id: &str,
        selection: &NodeSelectorSpec,
        ctx: &mut ExecutionContext,
    ) -> Result<RunOutcome, EngineError> {
        let mut snapshot = WorkflowSnapshot::load(self.store.as_ref(), workflow_id).await?;
        let mut report = ResolutionReport::new();

        let resolver = SelectorResolver::new(self.store.as_ref(), self.groups.as_ref());
        let positions = resolver
            .resolve(selection, &mut snapshot, &mut report)
            .await?;
        info!(
            workflow_id,
            node_count = positions.len(),
            "starting workflow run"
        );

        let mut results = Vec::new();
        let end = self
            .execute_sequence(positions, &mut snapshot, ctx, &mut report, &mut results)
            .await?;

        let status = match end {
            SequenceEnd::Completed => WorkflowRunStatus::Completed,
            SequenceEnd::Failed => WorkflowRunStatus::Failed,
            SequenceEnd::Cancelled => WorkflowRunStatus::Cancelled,
        };
        info!(workflow_id, ?status, executed = results.len(), "workflow run finished");
        Ok(RunOutcome {
            status,
            results,
            report,
        })
    }

    fn execute_sequence<'a>(
        &'a self,
        positions: Vec<u32>,
        snapshot: &'a mut WorkflowSnapshot,
        ctx: &'a mut ExecutionContext,
        report: &'a mut ResolutionReport,
        results: &'a mut Vec<NodeRunResult>,
    ) -> BoxFuture<'a, Result<SequenceEnd, EngineError>> {
        async move {
            for position in positions {
                self.wait_if_paused().await;
                if self.control.is_cancelled() {
                    return Ok(SequenceEnd::Cancelled);
                }

                let Some(node) = snapshot.node_at(position).cloned() else {
                    report.warn(format!("no node at position {position}, skipping"));
                    continue;
                };

                if let Some(condition) = &node.options.run_if {
                    let met = match expression::evaluate(condition, ctx) {
                        Ok(met) => met,
                        Err(e) => {
                            report.warn(format!(
                                "run_if on position {position} failed to evaluate: {e}"
                            ));
                            false
                        }
                    };
                    if !met {
                        debug!("skipping position {}: run_if not met", position);
                        self.set_status(snapshot, &node, NodeStatus::Skipped).await?;
                        results.push(NodeRunResult {
                            position,
                            alias: node.alias.clone(),
                            status: NodeStatus::Skipped,
                            result: None,
                            error: None,
                        });
                        continue;
                    }
                }

                self.set_status(snapshot, &node, NodeStatus::Running).await?;
                let outcome = self.execute_node(&node, snapshot, ctx, report, results).await?;

                match outcome {
                    NodeOutcome::Completed(result) => {
                        self.set_status(snapshot, &node, NodeStatus::Completed).await?;
                        results.push(NodeRunResult {
                            position,
                            alias: node.alias.clone(),
                            status: NodeStatus::Completed,
                            result: Some(result),
                            error: None,
                        });
                        if let Some(delay_ms) = node.options.delay_ms {
                            if delay_ms > 0 {
                                tokio::time::sleep(std::time::Duration::from_millis(delay_ms))
                                    .await;
                            }
                        }
                    }
                    NodeOutcome::Failed(error) => {
                        warn!("node at position {} failed: {}", position, error);
                        self.set_status(snapshot, &node, NodeStatus::Failed).await?;
                        results.push(NodeRunResult {
                            position,
                            alias: node.alias.clone(),
                            status: NodeStatus::Failed,
                            result: None,
                            error: Some(error),
                        });
                        if !node.options.continue_on_error {
                            return Ok(SequenceEnd::Failed);
                        }
                    }
                    NodeOutcome::Cancelled => return Ok(SequenceEnd::Cancelled),
                }
            }
            Ok(SequenceEnd::Completed)
        }
        .boxed()
    }

    async fn execute_node(
        &self,
        node: &WorkflowNode,
        snapshot: &mut WorkflowSnapshot,
        ctx: &mut ExecutionContext,
        report: &mut ResolutionReport,
        results: &mut Vec<NodeRunResult>,
    ) -> Result<NodeOutcome, EngineError> {
        match &node.params {
            NodeParams::Iterate(params) => {
                self.run_iterate(node, params, snapshot, ctx, report, results)
                    .await
            }
            NodeParams::Route(params) => {
                self.run_route(node, params, snapshot, ctx, report, results)
                    .await
            }
            // Every remaining variant is a plain action against the
            // automation boundary.
            NodeParams::Navigate { .. }
            | NodeParams::Click { .. }
            | NodeParams::TypeText { .. }
            | NodeParams::Act { .. }
            | NodeParams::Extract { .. }
            | NodeParams::Screenshot => {
                match self.run_action(node, ctx, report).await {
                    Ok(result) => {
                        self.apply_store_policy(node, &result, ctx, report);
                        Ok(NodeOutcome::Completed(result))
                    }
                    Err(error) => Ok(NodeOutcome::Failed(error)),
                }
            }
        }
    }

    /// Resolve templated params, invoke the boundary, and shape the result.
    /// Returns a plain error string: action failures mark the node Failed
    /// but are not engine errors.
    async fn run_action(
        &self,
        node: &WorkflowNode,
        ctx: &mut ExecutionContext,
        report: &mut ResolutionReport,
    ) -> Result<Value, String> {
        let workflow_id = node.workflow_id.clone();
        let tab = node
            .options
            .tab
            .clone()
            .unwrap_or_else(|| self.default_tab.clone());

        let outcome = match &node.params {
            NodeParams::Navigate { url } => {
                let url = TemplateResolver::resolve_string(url, ctx);
                let outcome = self.bridge.navigate(&tab, &url).await;
                if outcome.is_ok() {
                    if let Some(inspector) = &self.inspector {
                        inspector.invalidate(&workflow_id, &tab).await;
                    }
                }
                outcome
            }
            NodeParams::Click { target } => {
                let target = TemplateResolver::resolve_string(target, ctx);
                let target = self.expand_target(&workflow_id, &tab, &target, report).await;
                self.bridge.click(&tab, &target).await
            }
            NodeParams::TypeText { target, text } => {
                let target = TemplateResolver::resolve_string(target, ctx);
                let target = self.expand_target(&workflow_id, &tab, &target, report).await;
                let text = TemplateResolver::resolve_string(text, ctx);
                self.bridge.type_text(&tab, &target, &text).await
            }
            NodeParams::Act { instruction } => {
                let instruction = TemplateResolver::resolve_string(instruction, ctx);
                self.bridge.act(&tab, &instruction).await
            }
            NodeParams::Extract {
                instruction,
                schema,
                output,
            } => {
                let instruction = TemplateResolver::resolve_string(instruction, ctx);
                let outcome = self
                    .bridge
                    .extract(&tab, &instruction, schema.as_ref())
                    .await;
                match outcome {
                    Ok(outcome) if *output == ExtractOutput::CreateRecords => {
                        let namespace = node_namespace(node);
                        let items = extraction_items(&outcome.result);
                        let ids = ctx.records.create_batch(&namespace, &items);
                        info!(
                            "extraction '{}' created {} records",
                            namespace,
                            ids.len()
                        );
                        if let Some(url) = outcome.current_url {
                            ctx.set_global("current_url", Value::String(url));
                        }
                        return Ok(json!({ "record_ids": ids, "count": ids.len() }));
                    }
                    other => other,
                }
            }
            NodeParams::Screenshot => self.bridge.screenshot(&tab).await,
            NodeParams::Iterate(_) | NodeParams::Route(_) => {
                unreachable!("control nodes are dispatched in execute_node")
            }
        };

        match outcome {
            Ok(outcome) => {
                if let Some(url) = outcome.current_url {
                    ctx.set_global("current_url", Value::String(url));
                }
                Ok(outcome.result)
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Apply the node's explicit store policy: mapped result sub-paths go
    /// into the global bucket, and optionally one field lands on the
    /// current record under this node's own alias. Nothing is stored
    /// implicitly.
    fn apply_store_policy(
        &self,
        node: &WorkflowNode,
        result: &Value,
        ctx: &mut ExecutionContext,
        report: &mut ResolutionReport,
    ) {
        for (sub_path, global_key) in &node.options.store {
            let value = if sub_path == "$" {
                Some(result)
            } else {
                walk_path(result, sub_path)
            };
            match value {
                Some(value) => ctx.set_global(global_key.clone(), value.clone()),
                None => report.warn(format!(
                    "store path '{}' not present in result of position {}",
                    sub_path, node.position
                )),
            }
        }

        if let Some(field_path) = &node.options.record_field {
            let Some(record_id) = ctx.current_record_id().map(String::from) else {
                report.warn(format!(
                    "record_field on position {} but no current record bound",
                    node.position
                ));
                return;
            };
            let value = if field_path == "$" {
                Some(result)
            } else {
                walk_path(result, field_path)
            };
            let Some(value) = value.cloned() else {
                report.warn(format!(
                    "record_field path '{}' not present in result of position {}",
                    field_path, node.position
                ));
                return;
            };
            let field = field_path.rsplit('.').next().unwrap_or(field_path);
            let field = if field == "$" { "result" } else { field };
            let namespace = node_namespace(node);
            ctx.records.write_field(&record_id, &namespace, field, value);
        }
    }

    async fn run_iterate(
        &self,
        node: &WorkflowNode,
        params: &IterateParams,
        snapshot: &mut WorkflowSnapshot,
        ctx: &mut ExecutionContext,
        report: &mut ResolutionReport,
        results: &mut Vec<NodeRunResult>,
    ) -> Result<NodeOutcome, EngineError> {
        // Body selection resolves once per entry into the loop; inline
        // children created here are owned by this node.
        let resolver = SelectorResolver::new(self.store.as_ref(), self.groups.as_ref());
        let body = resolver.resolve(&params.body, snapshot, report).await?;

        let elements: Vec<(Value, Option<String>)> = match &params.source {
            IterateSource::Records { pattern } => {
                let ids = ctx.records.ids_matching(pattern);
                if ids.is_empty() {
                    report.warn(format!("no records match pattern '{pattern}'"));
                }
                ids.into_iter()
                    .map(|id| {
                        let data = ctx
                            .records
                            .get(&id)
                            .map(|r| Value::Object(r.data.clone()))
                            .unwrap_or(Value::Null);
                        (data, Some(id))
                    })
                    .collect()
            }
            IterateSource::Items { items } => {
                items.iter().cloned().map(|item| (item, None)).collect()
            }
            IterateSource::Expression { expr } => {
                match TemplateResolver::resolve(expr, ctx) {
                    Value::Array(items) => items.into_iter().map(|item| (item, None)).collect(),
                    other => {
                        report.warn(format!(
                            "loop source '{}' did not resolve to an array (got {})",
                            expr,
                            stringify(&other)
                        ));
                        Vec::new()
                    }
                }
            }
        };

        let total = elements.len();
        let mut aggregated = Vec::new();

        // Elements run strictly sequentially, in source order.
        for (index, (item, record_id)) in elements.into_iter().enumerate() {
            if self.control.is_cancelled() {
                return Ok(NodeOutcome::Cancelled);
            }
            debug!(
                "loop '{}' iteration {}/{}",
                node_namespace(node),
                index + 1,
                total
            );
            ctx.push_iteration(IterationFrame {
                index,
                item,
                record_id,
            });

            let end = self
                .execute_sequence(body.clone(), snapshot, ctx, report, results)
                .await;
            let end = match end {
                Ok(end) => end,
                Err(e) => {
                    ctx.pop_iteration();
                    return Err(e);
                }
            };
            // The aggregation expression sees the per-element bindings.
            let element_value = if matches!(end, SequenceEnd::Completed) {
                params
                    .aggregate
                    .as_ref()
                    .map(|a| TemplateResolver::resolve(&a.expr, ctx))
            } else {
                None
            };
            ctx.pop_iteration();

            match end {
                SequenceEnd::Completed => {
                    if let Some(value) = element_value {
                        aggregated.push(value);
                    }
                }
                SequenceEnd::Failed => {
                    return Ok(NodeOutcome::Failed(format!(
                        "loop body failed on iteration {index}"
                    )));
                }
                SequenceEnd::Cancelled => return Ok(NodeOutcome::Cancelled),
            }
        }

        if let Some(aggregate) = &params.aggregate {
            ctx.set_global(aggregate.into.clone(), Value::Array(aggregated));
        }
        Ok(NodeOutcome::Completed(json!({ "iterations": total })))
    }

    async fn run_route(
        &self,
        node: &WorkflowNode,
        params: &RouteParams,
        snapshot: &mut WorkflowSnapshot,
        ctx: &mut ExecutionContext,
        report: &mut ResolutionReport,
        results: &mut Vec<NodeRunResult>,
    ) -> Result<NodeOutcome, EngineError> {
        if let Some(pattern) = &params.over_records {
            return self.run_route_collection(node, params, pattern, ctx, report);
        }

        for branch in &params.branches {
            let met = match expression::evaluate(&branch.condition, ctx) {
                Ok(met) => met,
                Err(e) => {
                    report.warn(format!(
                        "branch '{}' condition failed to evaluate: {e}",
                        branch.name
                    ));
                    false
                }
            };
            if !met {
                continue;
            }

            debug!("route '{}' took branch '{}'", node_namespace(node), branch.name);
            let Some(body_spec) = &branch.body else {
                report.warn(format!(
                    "branch '{}' matched but has no body selection",
                    branch.name
                ));
                return Ok(NodeOutcome::Completed(json!({ "branch": branch.name })));
            };

            let resolver = SelectorResolver::new(self.store.as_ref(), self.groups.as_ref());
            let body = resolver.resolve(body_spec, snapshot, report).await?;
            let end = self
                .execute_sequence(body, snapshot, ctx, report, results)
                .await?;
            return Ok(match end {
                SequenceEnd::Completed => {
                    NodeOutcome::Completed(json!({ "branch": branch.name }))
                }
                SequenceEnd::Failed => NodeOutcome::Failed(format!(
                    "branch '{}' body failed",
                    branch.name
                )),
                SequenceEnd::Cancelled => NodeOutcome::Cancelled,
            });
        }

        debug!("route '{}' matched no branch", node_namespace(node));
        Ok(NodeOutcome::Completed(json!({ "branch": Value::Null })))
    }

    /// Collection mode: partition record ids by the first branch each
    /// record satisfies, storing partitions under derived global keys.
    /// Bodies do not execute.
    fn run_route_collection(
        &self,
        node: &WorkflowNode,
        params: &RouteParams,
        pattern: &str,
        ctx: &mut ExecutionContext,
        report: &mut ResolutionReport,
    ) -> Result<NodeOutcome, EngineError> {
        let ids = ctx.records.ids_matching(pattern);
        if ids.is_empty() {
            report.warn(format!("no records match pattern '{pattern}'"));
        }

        let mut partitions: Vec<(String, Vec<String>)> = params
            .branches
            .iter()
            .map(|b| (b.name.clone(), Vec::new()))
            .collect();

        for (index, id) in ids.iter().enumerate() {
            let data = ctx
                .records
                .get(id)
                .map(|r| Value::Object(r.data.clone()))
                .unwrap_or(Value::Null);
            ctx.push_iteration(IterationFrame {
                index,
                item: data,
                record_id: Some(id.clone()),
            });

            let mut matched = false;
            for (branch_index, branch) in params.branches.iter().enumerate() {
                match expression::evaluate(&branch.condition, ctx) {
                    Ok(true) => {
                        partitions[branch_index].1.push(id.clone());
                        matched = true;
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        report.warn(format!(
                            "branch '{}' condition failed to evaluate: {e}",
                            branch.name
                        ));
                    }
                }
            }
            ctx.pop_iteration();

            if !matched {
                debug!("record '{}' satisfied no branch", id);
            }
        }

        let namespace = route_namespace(node);
        let mut counts = Map::new();
        for (branch_name, ids) in partitions {
            counts.insert(branch_name.clone(), json!(ids.len()));
            ctx.set_global(format!("{namespace}.{branch_name}"), json!(ids));
        }
        Ok(NodeOutcome::Completed(json!({ "partitions": counts })))
    }

    /// `@<element_id>` targets are expanded to the top-ranked selector
    /// candidate through the inspection service; anything else passes
    /// through untouched.
    async fn expand_target(
        &self,
        workflow_id: &str,
        tab: &str,
        target: &str,
        report: &mut ResolutionReport,
    ) -> String {
        let Some(rest) = target.strip_prefix('@') else {
            return target.to_string();
        };
        let Ok(element_id) = rest.parse::<u32>() else {
            return target.to_string();
        };
        let Some(inspector) = &self.inspector else {
            report.warn(format!(
                "target '@{element_id}' needs the inspection service, passing through"
            ));
            return target.to_string();
        };

        match inspector.expand(workflow_id, tab, element_id).await {
            Ok(expanded) if !expanded.selectors.is_empty() => expanded.selectors[0].clone(),
            Ok(_) => {
                report.warn(format!("element @{element_id} has no selector candidates"));
                target.to_string()
            }
            Err(e) => {
                report.warn(format!("element @{element_id} expansion failed: {e}"));
                target.to_string()
            }
        }
    }

    async fn set_status(
        &self,
        snapshot: &mut WorkflowSnapshot,
        node: &WorkflowNode,
        status: NodeStatus,
    ) -> Result<(), EngineError> {
        snapshot.set_status(node.position, status);
        self.store
            .set_status(&node.workflow_id, &node.id, status)
            .await
    }

    async fn wait_if_paused(&self) {
        let mut rx = self.pause_rx.clone();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// The namespace a node writes record fields and globals under: its alias,
/// falling back to a position-derived name.
fn node_namespace(node: &WorkflowNode) -> String {
    node.alias
        .clone()
        .unwrap_or_else(|| format!("node_{}", node.position))
}

fn route_namespace(node: &WorkflowNode) -> String {
    node.alias
        .clone()
        .unwrap_or_else(|| format!("route_{}", node.position))
}

/// Pull the record source array out of an extraction result: a bare array,
/// an `items` field, or a single object treated as one record.
fn extraction_items(result: &Value) -> Vec<Value> {
    match result {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("items") {
            Some(Value::Array(items)) => items.clone(),
            _ => vec![result.clone()],
        },
        other => vec![other.clone()],
    }
}
