//! Browser inspection and automation for wayfarer workflows
//!
//! This crate owns the browser-facing half of the system: a remote-debugging
//! transport, an accessibility-tree inspection service with snapshot caching
//! and diffing, selector candidate generation, and the opaque automation
//! boundary that workflow nodes execute against.

pub mod automation;
pub mod cdp;
pub mod diff;
pub mod errors;
pub mod inspection;
pub mod selectors;
pub mod tree;
pub mod tree_formatter;

pub use automation::{ActionOutcome, AutomationBridge, RetryBridge};
pub use cdp::{CdpClient, CdpConnector, CdpEvent, CdpTransport, WsConnector};
pub use diff::{DiffFilters, ElementChange, ElementSummary, TreeDiff};
pub use errors::{AutomationError, InspectionError};
pub use inspection::{DomInspector, ExpandedElement, InspectorConfig, Snapshot, TabKey};
pub use selectors::selector_candidates;
pub use tree::{AxNode, DomNode, IndexedElement};
pub use tree_formatter::format_dom_tree;
pub use tokio_util::sync::CancellationToken;
