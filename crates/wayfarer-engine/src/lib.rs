//! Workflow authoring and execution engine for wayfarer.
//!
//! Workflows are ordered graphs of typed nodes executed against a live
//! browser session through the automation boundary in the `wayfarer` crate.
//! This crate owns the node model and its persistence boundary, flexible
//! node-selector resolution, the layered template/variable resolver, record
//! and group storage, and the executor that walks resolved positions.

pub mod context;
pub mod error;
pub mod executor;
pub mod expression;
pub mod node;
pub mod records;
pub mod report;
pub mod selector;
pub mod snapshot;
pub mod store;
pub mod template;

pub use context::{ExecutionContext, IterationFrame};
pub use error::EngineError;
pub use executor::{
    ControlHandle, NodeRunResult, RunOutcome, WorkflowExecutor, WorkflowRunStatus,
};
pub use node::{
    AggregateTarget, ExtractOutput, IterateParams, IterateSource, NodeOptions, NodeParams,
    NodeStatus, RouteBranch, RouteParams, WorkflowNode,
};
pub use records::{Record, RecordIdConfig, RecordStore};
pub use report::{CreatedNode, ResolutionReport};
pub use selector::{
    InlineNodeSpec, NodeQuery, NodeRef, NodeSelector, NodeSelectorSpec, RecentFilter,
    SelectorResolver,
};
pub use snapshot::WorkflowSnapshot;
pub use store::{GroupMembers, GroupStore, MemoryNodeStore, NodeStore};
pub use template::TemplateResolver;
