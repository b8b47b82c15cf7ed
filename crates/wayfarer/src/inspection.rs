//! DOM inspection service.
//!
//! Owns one remote-debugging session per browser tab. Produces cleaned
//! accessibility-tree snapshots enriched with live element attributes,
//! caches them per `(workflow, tab)` with TTL and navigation/mutation
//! invalidation, serves per-element expansion, and computes bi-temporal
//! diffs against the previous snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cdp::{CdpConnector, CdpEvent, CdpTransport};
use crate::diff::{compute_diff, DiffFilters, TreeDiff};
use crate::errors::InspectionError;
use crate::selectors::selector_candidates;
use crate::tree::{self, DomNode, ElementDetails, IndexedElement};
use crate::tree_formatter::format_dom_tree;

/// Cache key: one entry per workflow per named tab.
pub type TabKey = (String, String);

/// In-page function pulling the fixed attribute allow-list plus tag, text
/// and visibility for one resolved element. Never the full attribute set.
const PULL_DETAILS_FN: &str = r#"function() {
  const attrs = {};
  if (this.attributes) {
    for (const a of this.attributes) {
      const n = a.name;
      if (n === 'id' || n === 'name' || n === 'type' || n === 'href' || n === 'class'
          || n.startsWith('data-') || n.startsWith('aria-')) {
        attrs[n] = a.value;
      }
    }
  }
  let visible = false;
  if (this.getBoundingClientRect) {
    const r = this.getBoundingClientRect();
    const style = window.getComputedStyle ? window.getComputedStyle(this) : null;
    visible = r.width > 0 && r.height > 0
      && (!style || (style.visibility !== 'hidden' && style.display !== 'none'));
  }
  const text = (this.innerText || '').trim().slice(0, 200);
  return { tag: (this.tagName || '').toLowerCase(), attributes: attrs, text: text || null, visible };
}"#;

#[derive(Debug, Clone)]
pub struct InspectorConfig {
    /// How long a cached snapshot stays valid absent invalidation events.
    pub cache_ttl: Duration,
    /// Mutation events beyond this count invalidate the cache early.
    pub mutation_threshold: u32,
    /// Per-snapshot element budget for live-attribute enrichment.
    pub max_elements: usize,
    /// Diff categories are capped at this multiple of `max_elements`.
    pub diff_cap_multiplier: usize,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            mutation_threshold: 50,
            max_elements: 500,
            diff_cap_multiplier: 2,
        }
    }
}

/// What snapshot callers receive: the compact rendering plus metadata.
/// Raw per-node attributes stay in the cache for `expand`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tree: String,
    pub element_count: u32,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ExpandedElement {
    pub element_id: u32,
    pub selectors: Vec<String>,
    pub attributes: HashMap<String, String>,
}

struct TabSession {
    transport: Arc<dyn CdpTransport>,
    navigated: Arc<AtomicBool>,
    mutations: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
    _watcher: JoinHandle<()>,
}

struct CacheEntry {
    tree: DomNode,
    formatted: String,
    index: Vec<IndexedElement>,
    url: String,
    element_count: u32,
    captured_at: Instant,
}

pub struct DomInspector {
    connector: Arc<dyn CdpConnector>,
    config: InspectorConfig,
    sessions: Mutex<HashMap<String, Arc<TabSession>>>,
    cache: Mutex<HashMap<TabKey, CacheEntry>>,
}

impl DomInspector {
    pub fn new(connector: Arc<dyn CdpConnector>, config: InspectorConfig) -> Self {
        Self {
            connector,
            config,
            sessions: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Return the current snapshot for a tab, capturing a fresh one when the
    /// cached entry is missing, expired, or invalidated. A stale entry is
    /// never served.
    pub async fn snapshot(
        &self,
        workflow_id: &str,
        tab: &str,
    ) -> Result<Snapshot, InspectionError> {
        let session = self.session(tab).await?;
        let key = (workflow_id.to_string(), tab.to_string());

        if let Some(entry) = self.cache.lock().await.get(&key) {
            if self.entry_valid(entry, &session) {
                debug!("serving cached snapshot for {:?}", key);
                return Ok(Snapshot {
                    tree: entry.formatted.clone(),
                    element_count: entry.element_count,
                    url: entry.url.clone(),
                });
            }
        }

        let entry = self.capture(&session, tab).await?;
        let snapshot = Snapshot {
            tree: entry.formatted.clone(),
            element_count: entry.element_count,
            url: entry.url.clone(),
        };
        self.cache.lock().await.insert(key, entry);
        Ok(snapshot)
    }

    /// Full detail for one element of the current snapshot: ranked selector
    /// candidates plus the raw allow-listed attributes.
    pub async fn expand(
        &self,
        workflow_id: &str,
        tab: &str,
        element_id: u32,
    ) -> Result<ExpandedElement, InspectionError> {
        // Refresh first so the id resolves against current state.
        self.snapshot(workflow_id, tab).await?;

        let key = (workflow_id.to_string(), tab.to_string());
        let cache = self.cache.lock().await;
        let entry = cache
            .get(&key)
            .ok_or_else(|| InspectionError::ElementNotFound(element_id))?;
        let el = entry
            .index
            .iter()
            .find(|el| el.element_id == element_id)
            .ok_or(InspectionError::ElementNotFound(element_id))?;

        Ok(ExpandedElement {
            element_id,
            selectors: selector_candidates(el.tag.as_deref(), &el.attributes),
            attributes: el.attributes.clone(),
        })
    }

    /// Diff the current page state against the previously captured snapshot
    /// for this tab. The fresh capture becomes the new baseline.
    pub async fn diff(
        &self,
        workflow_id: &str,
        tab: &str,
        filters: &DiffFilters,
    ) -> Result<TreeDiff, InspectionError> {
        let session = self.session(tab).await?;
        let key = (workflow_id.to_string(), tab.to_string());

        let old_index = {
            let cache = self.cache.lock().await;
            let entry = cache
                .get(&key)
                .ok_or_else(|| InspectionError::DiffBaselineMissing(tab.to_string()))?;
            entry.index.clone()
        };

        let entry = self.capture(&session, tab).await?;
        let cap = self.config.diff_cap_multiplier * self.config.max_elements;
        let diff = compute_diff(&old_index, &entry.index, filters, cap);
        self.cache.lock().await.insert(key, entry);

        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "computed snapshot diff for tab '{}'",
            tab
        );
        Ok(diff)
    }

    /// Drop the cached snapshot for a tab, forcing the next call to
    /// re-capture. Used after actions known to change the page.
    pub async fn invalidate(&self, workflow_id: &str, tab: &str) {
        let key = (workflow_id.to_string(), tab.to_string());
        self.cache.lock().await.remove(&key);
    }

    /// The structured form of the cached snapshot tree, if one is cached.
    pub async fn cached_tree(&self, workflow_id: &str, tab: &str) -> Option<DomNode> {
        let key = (workflow_id.to_string(), tab.to_string());
        self.cache.lock().await.get(&key).map(|e| e.tree.clone())
    }

    fn entry_valid(&self, entry: &CacheEntry, session: &TabSession) -> bool {
        if entry.captured_at.elapsed() >= self.config.cache_ttl {
            return false;
        }
        if session.navigated.load(Ordering::Relaxed) {
            return false;
        }
        session.mutations.load(Ordering::Relaxed) < self.config.mutation_threshold
    }

    async fn session(&self, tab: &str) -> Result<Arc<TabSession>, InspectionError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(tab) {
            if !existing.closed.load(Ordering::Relaxed) {
                return Ok(existing.clone());
            }
            warn!("debugging session for tab '{}' closed, reconnecting", tab);
            sessions.remove(tab);
        }

        let transport = self.connector.connect(tab).await?;
        for domain in ["Page.enable", "DOM.enable", "Accessibility.enable"] {
            transport.request(domain, json!({})).await?;
        }

        let navigated = Arc::new(AtomicBool::new(false));
        let mutations = Arc::new(AtomicU32::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        let mut events = transport.subscribe();
        let watcher = {
            let navigated = navigated.clone();
            let mutations = mutations.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(CdpEvent::Navigated { url }) => {
                            debug!("navigation committed to {}", url);
                            navigated.store(true, Ordering::Relaxed);
                        }
                        Ok(CdpEvent::DomMutated) => {
                            mutations.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(CdpEvent::Closed) => {
                            closed.store(true, Ordering::Relaxed);
                            break;
                        }
                        // Lagged receivers missed mutation events; be
                        // conservative and force a re-capture.
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            navigated.store(true, Ordering::Relaxed);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            closed.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            })
        };

        let session = Arc::new(TabSession {
            transport,
            navigated,
            mutations,
            closed,
            _watcher: watcher,
        });
        sessions.insert(tab.to_string(), session.clone());
        Ok(session)
    }

    async fn capture(
        &self,
        session: &TabSession,
        tab: &str,
    ) -> Result<CacheEntry, InspectionError> {
        // Reset invalidation state up front so events arriving mid-capture
        // count against the snapshot being built.
        session.navigated.store(false, Ordering::Relaxed);
        session.mutations.store(0, Ordering::Relaxed);

        let started = Instant::now();
        let ax_result = session
            .transport
            .request("Accessibility.getFullAXTree", json!({}))
            .await?;
        let nodes = ax_result
            .get("nodes")
            .and_then(|n| n.as_array())
            .cloned()
            .unwrap_or_default();

        let root = tree::parse_ax_tree(&nodes).ok_or_else(|| InspectionError::Protocol {
            method: "Accessibility.getFullAXTree".to_string(),
            message: "empty accessibility tree".to_string(),
        })?;

        let details = self.pull_details(session, &root).await;

        let mut full = tree::enrich(&root, &details);
        tree::assign_ids(&mut full);
        let mut index = Vec::new();
        tree::flatten_index(&full, &mut index);

        let cleaned = tree::clean(full.clone()).unwrap_or_else(|| DomNode {
            children: Vec::new(),
            ..full.clone()
        });
        let element_count = count_nodes(&cleaned);
        let formatted = format_dom_tree(&cleaned, 0);

        let url = self.current_url(session).await;

        info!(
            elements = element_count,
            indexed = index.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "captured snapshot for tab '{}'",
            tab
        );

        Ok(CacheEntry {
            tree: cleaned,
            formatted,
            index,
            url,
            element_count,
            captured_at: Instant::now(),
        })
    }

    /// Resolve each backend reference to a live object and pull the
    /// allow-listed attributes, bounded by the element budget. Per-element
    /// failures degrade to an unenriched node rather than failing the
    /// snapshot.
    async fn pull_details(
        &self,
        session: &TabSession,
        root: &crate::tree::AxNode,
    ) -> HashMap<i64, ElementDetails> {
        let mut backend_ids = Vec::new();
        collect_backend_ids(root, &mut backend_ids);
        if backend_ids.len() > self.config.max_elements {
            warn!(
                "element budget reached: enriching {} of {} nodes",
                self.config.max_elements,
                backend_ids.len()
            );
            backend_ids.truncate(self.config.max_elements);
        }

        let mut details = HashMap::new();
        for backend_id in backend_ids {
            match self.pull_one(session, backend_id).await {
                Ok(detail) => {
                    details.insert(backend_id, detail);
                }
                Err(e) => {
                    debug!("attribute pull failed for backend node {}: {}", backend_id, e);
                }
            }
        }
        details
    }

    async fn pull_one(
        &self,
        session: &TabSession,
        backend_id: i64,
    ) -> Result<ElementDetails, InspectionError> {
        let resolved = session
            .transport
            .request("DOM.resolveNode", json!({ "backendNodeId": backend_id }))
            .await?;
        let object_id = resolved
            .get("object")
            .and_then(|o| o.get("objectId"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| InspectionError::Protocol {
                method: "DOM.resolveNode".to_string(),
                message: format!("no object for backend node {backend_id}"),
            })?;

        let evaluated = session
            .transport
            .request(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": PULL_DETAILS_FN,
                    "returnByValue": true,
                }),
            )
            .await?;
        let value = evaluated
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    async fn current_url(&self, session: &TabSession) -> String {
        match session
            .transport
            .request(
                "Runtime.evaluate",
                json!({ "expression": "location.href", "returnByValue": true }),
            )
            .await
        {
            Ok(result) => result
                .get("result")
                .and_then(|r| r.get("value"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            Err(e) => {
                debug!("url evaluation failed: {}", e);
                String::new()
            }
        }
    }
}

fn collect_backend_ids(node: &crate::tree::AxNode, out: &mut Vec<i64>) {
    if let Some(id) = node.backend_node_id {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    for child in &node.children {
        collect_backend_ids(child, out);
    }
}

fn count_nodes(node: &DomNode) -> u32 {
    1 + node.children.iter().map(count_nodes).sum::<u32>()
}
