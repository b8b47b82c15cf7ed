use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use wayfarer::{
    CdpConnector, CdpEvent, CdpTransport, DiffFilters, DomInspector, InspectionError,
    InspectorConfig,
};

/// Canned-payload transport that counts protocol round-trips.
struct MockTransport {
    tree_captures: AtomicU32,
    visible: AtomicU32,
    events: broadcast::Sender<CdpEvent>,
}

impl MockTransport {
    fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            tree_captures: AtomicU32::new(0),
            visible: AtomicU32::new(1),
            events,
        }
    }

    fn ax_nodes(&self) -> Value {
        json!({
            "nodes": [
                {
                    "nodeId": "1",
                    "role": {"value": "RootWebArea"},
                    "name": {"value": "Checkout"},
                    "childIds": ["2", "3"],
                    "backendDOMNodeId": 100
                },
                {
                    "nodeId": "2",
                    "role": {"value": "button"},
                    "name": {"value": "Pay now"},
                    "backendDOMNodeId": 200
                },
                {
                    "nodeId": "3",
                    "role": {"value": "button"},
                    "name": {"value": "Cancel"},
                    "backendDOMNodeId": 300
                }
            ]
        })
    }
}

#[async_trait]
impl CdpTransport for MockTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, InspectionError> {
        match method {
            "Page.enable" | "DOM.enable" | "Accessibility.enable" => Ok(json!({})),
            "Accessibility.getFullAXTree" => {
                self.tree_captures.fetch_add(1, Ordering::SeqCst);
                Ok(self.ax_nodes())
            }
            "DOM.resolveNode" => {
                let backend = params["backendNodeId"].as_i64().unwrap_or(0);
                Ok(json!({"object": {"objectId": format!("obj-{backend}")}}))
            }
            "Runtime.callFunctionOn" => {
                let object_id = params["objectId"].as_str().unwrap_or_default();
                // Element 200 toggles visibility based on the `visible` flag.
                let visible = if object_id == "obj-200" {
                    self.visible.load(Ordering::SeqCst) == 1
                } else {
                    true
                };
                Ok(json!({
                    "result": {"value": {
                        "tag": "button",
                        "attributes": {"id": object_id, "class": "btn"},
                        "text": null,
                        "visible": visible
                    }}
                }))
            }
            "Runtime.evaluate" => Ok(json!({"result": {"value": "https://shop.test/checkout"}})),
            other => Err(InspectionError::Protocol {
                method: other.to_string(),
                message: "unexpected method".to_string(),
            }),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }
}

struct MockConnector {
    transport: Arc<MockTransport>,
}

#[async_trait]
impl CdpConnector for MockConnector {
    async fn connect(&self, _tab: &str) -> Result<Arc<dyn CdpTransport>, InspectionError> {
        Ok(self.transport.clone())
    }
}

fn inspector(transport: Arc<MockTransport>) -> DomInspector {
    DomInspector::new(
        Arc::new(MockConnector { transport }),
        InspectorConfig::default(),
    )
}

#[tokio::test]
async fn snapshot_within_ttl_is_served_from_cache() {
    let transport = Arc::new(MockTransport::new());
    let inspector = inspector(transport.clone());

    let first = inspector.snapshot("wf1", "main").await.unwrap();
    let second = inspector.snapshot("wf1", "main").await.unwrap();

    assert_eq!(first.tree, second.tree);
    assert_eq!(first.url, "https://shop.test/checkout");
    // One capture round-trip total: the second call never hit the protocol.
    assert_eq!(transport.tree_captures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn navigation_event_forces_recapture_regardless_of_ttl() {
    let transport = Arc::new(MockTransport::new());
    let inspector = inspector(transport.clone());

    inspector.snapshot("wf1", "main").await.unwrap();
    let _ = transport.events.send(CdpEvent::Navigated {
        url: "https://shop.test/done".to_string(),
    });
    // Give the session watcher a beat to observe the event.
    tokio::time::sleep(Duration::from_millis(50)).await;

    inspector.snapshot("wf1", "main").await.unwrap();
    assert_eq!(transport.tree_captures.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn mutation_burst_invalidates_the_cache() {
    let transport = Arc::new(MockTransport::new());
    let inspector = inspector(transport.clone());

    inspector.snapshot("wf1", "main").await.unwrap();
    for _ in 0..60 {
        let _ = transport.events.send(CdpEvent::DomMutated);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    inspector.snapshot("wf1", "main").await.unwrap();
    assert_eq!(transport.tree_captures.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn expand_returns_ranked_selectors_from_the_cache() {
    let transport = Arc::new(MockTransport::new());
    let inspector = inspector(transport.clone());

    let snapshot = inspector.snapshot("wf1", "main").await.unwrap();
    assert!(snapshot.tree.contains("[button]"));

    // The root is #1; the first button is #2.
    let expanded = inspector.expand("wf1", "main", 2).await.unwrap();
    assert_eq!(expanded.selectors[0], "#obj-200");
    assert!(expanded.attributes.contains_key("class"));
}

#[tokio::test]
async fn expand_of_unknown_element_errors() {
    let transport = Arc::new(MockTransport::new());
    let inspector = inspector(transport.clone());

    inspector.snapshot("wf1", "main").await.unwrap();
    let err = inspector.expand("wf1", "main", 999).await.unwrap_err();
    assert!(matches!(err, InspectionError::ElementNotFound(999)));
}

#[tokio::test]
async fn diff_requires_a_baseline_then_tracks_visibility_transitions() {
    let transport = Arc::new(MockTransport::new());
    let inspector = inspector(transport.clone());

    let err = inspector
        .diff("wf1", "main", &DiffFilters::default())
        .await
        .unwrap_err();
    assert!(matches!(err, InspectionError::DiffBaselineMissing(_)));

    // Baseline with the pay button hidden.
    transport.visible.store(0, Ordering::SeqCst);
    inspector.snapshot("wf1", "main").await.unwrap();

    // Button becomes visible; under a visible-only filter that is an
    // appearance, never a modification.
    transport.visible.store(1, Ordering::SeqCst);
    let filters = DiffFilters {
        visible_only: true,
        ..Default::default()
    };
    let diff = inspector.diff("wf1", "main", &filters).await.unwrap();

    let added_names: Vec<_> = diff
        .added
        .iter()
        .filter_map(|e| e.name.as_deref())
        .collect();
    assert!(added_names.contains(&"Pay now"));
    assert!(diff
        .modified
        .iter()
        .all(|m| m.element.name.as_deref() != Some("Pay now")));
}

#[tokio::test]
async fn attribute_allow_list_is_applied_to_pulled_details() {
    let mut attrs = HashMap::new();
    attrs.insert("id".to_string(), "x".to_string());
    attrs.insert("onclick".to_string(), "evil()".to_string());
    attrs.insert("data-testid".to_string(), "pay".to_string());
    attrs.insert("style".to_string(), "color: red".to_string());

    let kept: Vec<_> = attrs
        .keys()
        .filter(|k| wayfarer::tree::attribute_allowed(k))
        .collect();
    assert_eq!(kept.len(), 2);
}
