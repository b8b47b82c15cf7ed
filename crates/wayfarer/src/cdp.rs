use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::errors::InspectionError;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 256;

// Reduce type complexity for Clippy
type RequestResult = Result<Value, String>;
type PendingMap = HashMap<u64, oneshot::Sender<RequestResult>>;
type Pending = Arc<Mutex<PendingMap>>;

/// Protocol events the inspection service reacts to.
#[derive(Debug, Clone)]
pub enum CdpEvent {
    /// The main frame committed a navigation. Invalidates cached snapshots.
    Navigated { url: String },
    /// A DOM mutation notification arrived.
    DomMutated,
    /// The debugging session closed.
    Closed,
}

/// Request/response RPC channel to one browser tab.
///
/// The protocol itself is an external collaborator: implementations only
/// issue requests and surface events, they never interpret page semantics.
#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, InspectionError>;

    fn subscribe(&self) -> broadcast::Receiver<CdpEvent>;
}

/// Opens one transport per named tab.
#[async_trait]
pub trait CdpConnector: Send + Sync {
    async fn connect(&self, tab: &str) -> Result<Arc<dyn CdpTransport>, InspectionError>;
}

/// Websocket client for a remote-debugging endpoint.
///
/// One instance per tab. Requests are correlated by numeric id through a
/// pending map of oneshot senders; unsolicited messages are parsed into
/// [`CdpEvent`]s and broadcast to subscribers.
pub struct CdpClient {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    events: broadcast::Sender<CdpEvent>,
    next_id: AtomicU64,
    request_timeout: Duration,
    _reader: JoinHandle<()>,
    _writer: JoinHandle<()>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self, InspectionError> {
        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| InspectionError::Transport(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("debugging session send failed: {}", e);
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        Self::handle_incoming(&text, &reader_pending, &reader_events).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = reader_events.send(CdpEvent::Closed);
            // Fail anything still waiting so callers see a stale session
            // instead of hanging until their timeout.
            let mut map = reader_pending.lock().await;
            for (_, tx) in map.drain() {
                let _ = tx.send(Err("session closed".to_string()));
            }
        });

        Ok(Self {
            outgoing,
            pending,
            events,
            next_id: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            _reader: reader,
            _writer: writer,
        })
    }

    async fn handle_incoming(text: &str, pending: &Pending, events: &broadcast::Sender<CdpEvent>) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!("unparseable protocol message: {}", e);
                return;
            }
        };

        // Responses carry the id we allocated; everything else is an event.
        if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
            let outcome = if let Some(err) = value.get("error") {
                Err(err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown protocol error")
                    .to_string())
            } else {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            };
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(outcome);
            }
            return;
        }

        let Some(method) = value.get("method").and_then(|m| m.as_str()) else {
            return;
        };
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        match method {
            "Page.frameNavigated" => {
                // Only main-frame commits invalidate; subframes have a parent.
                let frame = &params["frame"];
                if frame.get("parentId").is_none() {
                    let url = frame
                        .get("url")
                        .and_then(|u| u.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let _ = events.send(CdpEvent::Navigated { url });
                }
            }
            "Page.navigatedWithinDocument" => {
                let url = params
                    .get("url")
                    .and_then(|u| u.as_str())
                    .unwrap_or_default()
                    .to_string();
                let _ = events.send(CdpEvent::Navigated { url });
            }
            "DOM.documentUpdated"
            | "DOM.childNodeCountUpdated"
            | "DOM.childNodeInserted"
            | "DOM.childNodeRemoved"
            | "DOM.attributeModified"
            | "DOM.attributeRemoved"
            | "DOM.characterDataModified" => {
                let _ = events.send(CdpEvent::DomMutated);
            }
            other => {
                debug!("ignoring protocol event {}", other);
            }
        }
    }
}

#[async_trait]
impl CdpTransport for CdpClient {
    async fn request(&self, method: &str, params: Value) -> Result<Value, InspectionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({ "id": id, "method": method, "params": params });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        self.outgoing
            .send(Message::Text(payload.to_string()))
            .map_err(|_| InspectionError::Transport("session writer gone".to_string()))?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(InspectionError::Protocol {
                method: method.to_string(),
                message,
            }),
            Ok(Err(_)) => Err(InspectionError::Transport(
                "session dropped pending request".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(InspectionError::Timeout(method.to_string()))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }
}

/// Connector that derives the per-tab websocket URL from a template,
/// substituting `{tab}` with the tab name.
pub struct WsConnector {
    url_template: String,
}

impl WsConnector {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
        }
    }
}

#[async_trait]
impl CdpConnector for WsConnector {
    async fn connect(&self, tab: &str) -> Result<Arc<dyn CdpTransport>, InspectionError> {
        let url = self.url_template.replace("{tab}", tab);
        debug!("opening debugging session for tab '{}' at {}", tab, url);
        let client = CdpClient::connect(&url).await?;
        Ok(Arc::new(client))
    }
}
