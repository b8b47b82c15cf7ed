use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use wayfarer::{ActionOutcome, AutomationBridge, AutomationError};
use wayfarer_engine::{
    AggregateTarget, ExecutionContext, GroupStore, IterateParams, IterateSource, MemoryNodeStore,
    NodeOptions, NodeParams, NodeSelectorSpec, NodeStatus, NodeStore, RouteBranch, RouteParams,
    WorkflowExecutor, WorkflowNode, WorkflowRunStatus,
};

const WF: &str = "wf-exec";

/// Records every boundary call; configurable per-target failures.
struct MockBridge {
    calls: Mutex<Vec<String>>,
    extract_result: Value,
    fail_click_on: Option<String>,
}

impl MockBridge {
    fn new(extract_result: Value) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            extract_result,
            fail_click_on: None,
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl AutomationBridge for MockBridge {
    async fn navigate(&self, tab: &str, url: &str) -> Result<ActionOutcome, AutomationError> {
        self.record(format!("navigate:{tab}:{url}"));
        Ok(ActionOutcome::with_url(json!({"ok": true}), url))
    }

    async fn click(&self, tab: &str, target: &str) -> Result<ActionOutcome, AutomationError> {
        self.record(format!("click:{tab}:{target}"));
        if self.fail_click_on.as_deref() == Some(target) {
            return Err(AutomationError::TargetNotFound(target.to_string()));
        }
        Ok(ActionOutcome::new(json!({"clicked": target})))
    }

    async fn type_text(
        &self,
        tab: &str,
        target: &str,
        text: &str,
    ) -> Result<ActionOutcome, AutomationError> {
        self.record(format!("type:{tab}:{target}:{text}"));
        Ok(ActionOutcome::new(json!({"typed": text})))
    }

    async fn act(&self, tab: &str, instruction: &str) -> Result<ActionOutcome, AutomationError> {
        self.record(format!("act:{tab}:{instruction}"));
        Ok(ActionOutcome::new(
            json!({"status": "done", "instruction": instruction}),
        ))
    }

    async fn extract(
        &self,
        tab: &str,
        instruction: &str,
        _schema: Option<&Value>,
    ) -> Result<ActionOutcome, AutomationError> {
        self.record(format!("extract:{tab}:{instruction}"));
        Ok(ActionOutcome::new(self.extract_result.clone()))
    }

    async fn screenshot(&self, tab: &str) -> Result<ActionOutcome, AutomationError> {
        self.record(format!("screenshot:{tab}"));
        Ok(ActionOutcome::new(json!({"image": "png"})))
    }
}

async fn seeded_workflow(store: &MemoryNodeStore) {
    // 1: navigate, storing the ok flag.
    let mut options = NodeOptions::default();
    options.store = BTreeMap::from([("ok".to_string(), "nav.ok".to_string())]);
    store
        .insert_node(
            WorkflowNode::new(
                WF,
                1,
                NodeParams::Navigate {
                    url: "https://mail.test/inbox".to_string(),
                },
            )
            .with_alias("open_inbox")
            .with_options(options),
        )
        .await
        .unwrap();

    // 2: extraction routed into create-records mode.
    store
        .insert_node(
            WorkflowNode::new(
                WF,
                2,
                NodeParams::Extract {
                    instruction: "collect every email row".to_string(),
                    schema: None,
                    output: wayfarer_engine::ExtractOutput::CreateRecords,
                },
            )
            .with_alias("extract_emails"),
        )
        .await
        .unwrap();

    // 3: loop over the records, body is node 4, aggregating statuses.
    store
        .insert_node(
            WorkflowNode::new(
                WF,
                3,
                NodeParams::Iterate(IterateParams {
                    source: IterateSource::Records {
                        pattern: "record_*".to_string(),
                    },
                    body: NodeSelectorSpec::positions(vec![4]),
                    aggregate: Some(AggregateTarget {
                        expr: "{{current.classify.status}}".to_string(),
                        into: "statuses".to_string(),
                    }),
                }),
            )
            .with_alias("process_each"),
        )
        .await
        .unwrap();

    // 4: the loop body, writing its status onto the current record.
    let mut body_options = NodeOptions::default();
    body_options.record_field = Some("status".to_string());
    store
        .insert_node(
            WorkflowNode::new(
                WF,
                4,
                NodeParams::Act {
                    instruction: "classify {{current.extract_emails.subject}}".to_string(),
                },
            )
            .with_alias("classify")
            .with_options(body_options),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn end_to_end_extract_loop_and_templates() {
    let store = Arc::new(MemoryNodeStore::new());
    seeded_workflow(&store).await;

    let bridge = Arc::new(MockBridge::new(json!([
        {"subject": "Invoice", "from": "billing@x.test"},
        {"subject": "Reminder", "from": "events@x.test"},
    ])));
    let executor = WorkflowExecutor::new(
        store.clone(),
        Arc::new(GroupStore::new()),
        bridge.clone(),
    );

    let mut ctx = ExecutionContext::new();
    let outcome = executor
        .run_with_context(WF, &NodeSelectorSpec::positions(vec![1, 2, 3]), &mut ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Completed);
    // 1 navigate + 1 extract + 2 loop-body acts.
    assert_eq!(outcome.results.iter().filter(|r| r.status == NodeStatus::Completed).count(), 5);

    // Store policy wrote exactly the mapped sub-path.
    assert_eq!(ctx.get_global("nav.ok"), Some(&json!(true)));
    assert_eq!(ctx.get_global("current_url"), Some(&json!("https://mail.test/inbox")));

    // Records were created and namespaced under the extracting alias.
    assert_eq!(ctx.records.len(), 2);
    let first = ctx.records.get("record_1").unwrap();
    assert_eq!(
        first.get_path("extract_emails.subject"),
        Some(&json!("Invoice"))
    );

    // The loop body saw each record bound as current.
    let calls = bridge.calls();
    assert!(calls.contains(&"act:main:classify Invoice".to_string()));
    assert!(calls.contains(&"act:main:classify Reminder".to_string()));

    // The body wrote its own namespace onto each record, and the
    // aggregation target collected the per-element expression.
    assert_eq!(first.get_path("classify.status"), Some(&json!("done")));
    assert_eq!(ctx.get_global("statuses"), Some(&json!(["done", "done"])));
}

#[tokio::test]
async fn route_collection_mode_partitions_records_without_running_bodies() {
    let store = Arc::new(MemoryNodeStore::new());
    store
        .insert_node(
            WorkflowNode::new(
                WF,
                1,
                NodeParams::Extract {
                    instruction: "collect emails".to_string(),
                    schema: None,
                    output: wayfarer_engine::ExtractOutput::CreateRecords,
                },
            )
            .with_alias("extract_emails"),
        )
        .await
        .unwrap();
    store
        .insert_node(
            WorkflowNode::new(
                WF,
                2,
                NodeParams::Route(RouteParams {
                    branches: vec![
                        RouteBranch {
                            name: "finance".to_string(),
                            condition: "current.extract_emails.subject == 'Invoice'".to_string(),
                            body: Some(NodeSelectorSpec::positions(vec![3])),
                        },
                        RouteBranch {
                            name: "other".to_string(),
                            condition: "always()".to_string(),
                            body: None,
                        },
                    ],
                    over_records: Some("record_*".to_string()),
                }),
            )
            .with_alias("sort_emails"),
        )
        .await
        .unwrap();
    // Node 3 would scream if a body ran in collection mode.
    store
        .insert_node(WorkflowNode::new(
            WF,
            3,
            NodeParams::Click {
                target: "#should-not-run".to_string(),
            },
        ))
        .await
        .unwrap();

    let bridge = Arc::new(MockBridge::new(json!([
        {"subject": "Invoice"},
        {"subject": "Reminder"},
        {"subject": "Invoice"},
    ])));
    let executor = WorkflowExecutor::new(
        store.clone(),
        Arc::new(GroupStore::new()),
        bridge.clone(),
    );

    let mut ctx = ExecutionContext::new();
    let outcome = executor
        .run_with_context(WF, &NodeSelectorSpec::positions(vec![1, 2]), &mut ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Completed);
    assert_eq!(
        ctx.get_global("sort_emails.finance"),
        Some(&json!(["record_1", "record_3"]))
    );
    assert_eq!(
        ctx.get_global("sort_emails.other"),
        Some(&json!(["record_2"]))
    );
    assert!(!bridge.calls().iter().any(|c| c.starts_with("click")));
}

#[tokio::test]
async fn single_mode_route_runs_first_matching_branch_body() {
    let store = Arc::new(MemoryNodeStore::new());
    store
        .insert_node(WorkflowNode::new(
            WF,
            1,
            NodeParams::Route(RouteParams {
                branches: vec![
                    RouteBranch {
                        name: "never".to_string(),
                        condition: "false".to_string(),
                        body: Some(NodeSelectorSpec::positions(vec![2])),
                    },
                    RouteBranch {
                        name: "yes".to_string(),
                        condition: "always()".to_string(),
                        body: Some(NodeSelectorSpec::positions(vec![3])),
                    },
                ],
                over_records: None,
            }),
        ))
        .await
        .unwrap();
    store
        .insert_node(WorkflowNode::new(
            WF,
            2,
            NodeParams::Click {
                target: "#wrong".to_string(),
            },
        ))
        .await
        .unwrap();
    store
        .insert_node(WorkflowNode::new(
            WF,
            3,
            NodeParams::Click {
                target: "#right".to_string(),
            },
        ))
        .await
        .unwrap();

    let bridge = Arc::new(MockBridge::new(json!([])));
    let executor = WorkflowExecutor::new(
        store.clone(),
        Arc::new(GroupStore::new()),
        bridge.clone(),
    );

    let outcome = executor
        .run(WF, &NodeSelectorSpec::positions(vec![1]))
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowRunStatus::Completed);
    let calls = bridge.calls();
    assert!(calls.contains(&"click:main:#right".to_string()));
    assert!(!calls.contains(&"click:main:#wrong".to_string()));
}

#[tokio::test]
async fn failures_halt_unless_continue_on_error() {
    let store = Arc::new(MemoryNodeStore::new());
    store
        .insert_node(WorkflowNode::new(
            WF,
            1,
            NodeParams::Click {
                target: "#broken".to_string(),
            },
        ))
        .await
        .unwrap();
    store
        .insert_node(WorkflowNode::new(
            WF,
            2,
            NodeParams::Screenshot,
        ))
        .await
        .unwrap();

    let mut bridge = MockBridge::new(json!([]));
    bridge.fail_click_on = Some("#broken".to_string());
    let bridge = Arc::new(bridge);

    let executor = WorkflowExecutor::new(
        store.clone(),
        Arc::new(GroupStore::new()),
        bridge.clone(),
    );

    let outcome = executor
        .run(WF, &NodeSelectorSpec::positions(vec![1, 2]))
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Failed);
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].status, NodeStatus::Failed);
    assert!(!bridge.calls().iter().any(|c| c.starts_with("screenshot")));

    // The failed node's status persisted to the store.
    let nodes = store.list_nodes(WF).await.unwrap();
    assert_eq!(nodes[0].status, NodeStatus::Failed);

    // Same workflow with continue_on_error reaches the screenshot.
    let store2 = Arc::new(MemoryNodeStore::new());
    let mut options = NodeOptions::default();
    options.continue_on_error = true;
    store2
        .insert_node(
            WorkflowNode::new(
                WF,
                1,
                NodeParams::Click {
                    target: "#broken".to_string(),
                },
            )
            .with_options(options),
        )
        .await
        .unwrap();
    store2
        .insert_node(WorkflowNode::new(WF, 2, NodeParams::Screenshot))
        .await
        .unwrap();

    let mut bridge2 = MockBridge::new(json!([]));
    bridge2.fail_click_on = Some("#broken".to_string());
    let bridge2 = Arc::new(bridge2);
    let executor2 = WorkflowExecutor::new(
        store2,
        Arc::new(GroupStore::new()),
        bridge2.clone(),
    );
    let outcome = executor2
        .run(WF, &NodeSelectorSpec::positions(vec![1, 2]))
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Completed);
    assert!(bridge2.calls().iter().any(|c| c.starts_with("screenshot")));
}

#[tokio::test]
async fn run_if_skips_without_failing() {
    let store = Arc::new(MemoryNodeStore::new());
    let mut options = NodeOptions::default();
    options.run_if = Some("missing.flag".to_string());
    store
        .insert_node(
            WorkflowNode::new(WF, 1, NodeParams::Screenshot).with_options(options),
        )
        .await
        .unwrap();
    store
        .insert_node(WorkflowNode::new(WF, 2, NodeParams::Screenshot))
        .await
        .unwrap();

    let bridge = Arc::new(MockBridge::new(json!([])));
    let executor = WorkflowExecutor::new(
        store,
        Arc::new(GroupStore::new()),
        bridge.clone(),
    );

    let outcome = executor
        .run(WF, &NodeSelectorSpec::positions(vec![1, 2]))
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Completed);
    assert_eq!(outcome.results[0].status, NodeStatus::Skipped);
    assert_eq!(outcome.results[1].status, NodeStatus::Completed);
    assert_eq!(bridge.calls().len(), 1);
}

#[tokio::test]
async fn cancellation_takes_effect_at_the_node_boundary() {
    let store = Arc::new(MemoryNodeStore::new());
    store
        .insert_node(WorkflowNode::new(WF, 1, NodeParams::Screenshot))
        .await
        .unwrap();

    let bridge = Arc::new(MockBridge::new(json!([])));
    let executor = WorkflowExecutor::new(
        store,
        Arc::new(GroupStore::new()),
        bridge.clone(),
    );

    executor.control().cancel();
    let outcome = executor
        .run(WF, &NodeSelectorSpec::positions(vec![1]))
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Cancelled);
    assert!(outcome.results.is_empty());
    assert!(bridge.calls().is_empty());
}

#[tokio::test]
async fn missing_positions_warn_and_skip() {
    let store = Arc::new(MemoryNodeStore::new());
    store
        .insert_node(WorkflowNode::new(WF, 1, NodeParams::Screenshot))
        .await
        .unwrap();

    let bridge = Arc::new(MockBridge::new(json!([])));
    let executor = WorkflowExecutor::new(
        store,
        Arc::new(GroupStore::new()),
        bridge,
    );

    let outcome = executor
        .run(WF, &NodeSelectorSpec::positions(vec![1, 9]))
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Completed);
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.report.warnings.len(), 1);
}

#[tokio::test]
async fn loop_over_expression_binds_loop_locals() {
    let store = Arc::new(MemoryNodeStore::new());
    store
        .insert_node(WorkflowNode::new(
            WF,
            1,
            NodeParams::Iterate(IterateParams {
                source: IterateSource::Items {
                    items: vec![json!("alpha"), json!("beta")],
                },
                body: NodeSelectorSpec::positions(vec![2]),
                aggregate: None,
            }),
        ))
        .await
        .unwrap();
    store
        .insert_node(WorkflowNode::new(
            WF,
            2,
            NodeParams::Act {
                instruction: "handle {{loop_item}} at {{loop_index}}".to_string(),
            },
        ))
        .await
        .unwrap();

    let bridge = Arc::new(MockBridge::new(json!([])));
    let executor = WorkflowExecutor::new(
        store,
        Arc::new(GroupStore::new()),
        bridge.clone(),
    );

    let outcome = executor
        .run(WF, &NodeSelectorSpec::positions(vec![1]))
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Completed);

    let calls = bridge.calls();
    assert!(calls.contains(&"act:main:handle alpha at 0".to_string()));
    assert!(calls.contains(&"act:main:handle beta at 1".to_string()));
}

#[tokio::test]
async fn pause_holds_the_run_at_a_node_boundary() {
    let store = Arc::new(MemoryNodeStore::new());
    store
        .insert_node(WorkflowNode::new(WF, 1, NodeParams::Screenshot))
        .await
        .unwrap();
    store
        .insert_node(WorkflowNode::new(WF, 2, NodeParams::Screenshot))
        .await
        .unwrap();

    let bridge = Arc::new(MockBridge::new(json!([])));
    let executor = Arc::new(WorkflowExecutor::new(
        store,
        Arc::new(GroupStore::new()),
        bridge.clone(),
    ));
    let control = executor.control();

    control.pause();
    let task = {
        let executor = executor.clone();
        tokio::spawn(async move {
            executor
                .run(WF, &NodeSelectorSpec::positions(vec![1, 2]))
                .await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(bridge.calls().is_empty(), "paused run must not execute nodes");

    control.resume();
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.status, WorkflowRunStatus::Completed);
    assert_eq!(bridge.calls().len(), 2);
}
