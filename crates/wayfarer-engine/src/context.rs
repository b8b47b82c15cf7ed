//! Execution context: the global bucket, the record store, and the stack
//! of iteration frames bound by enclosing loop nodes.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::records::RecordStore;

/// Loop binding for one element: its index, the element value, and the
/// record it represents when iterating a record set.
#[derive(Debug, Clone)]
pub struct IterationFrame {
    pub index: usize,
    pub item: Value,
    pub record_id: Option<String>,
}

/// Workflow-scoped mutable state. Single-writer: only the executor
/// mutates it; resolvers read.
#[derive(Default)]
pub struct ExecutionContext {
    globals: BTreeMap<String, Value>,
    pub records: RecordStore,
    frames: Vec<IterationFrame>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: RecordStore) -> Self {
        Self {
            globals: BTreeMap::new(),
            records,
            frames: Vec::new(),
        }
    }

    pub fn set_global(&mut self, key: impl Into<String>, value: Value) {
        self.globals.insert(key.into(), value);
    }

    pub fn get_global(&self, key: &str) -> Option<&Value> {
        self.globals.get(key)
    }

    pub fn globals(&self) -> &BTreeMap<String, Value> {
        &self.globals
    }

    /// Bind a loop element. Frames nest; the innermost binding wins.
    pub fn push_iteration(&mut self, frame: IterationFrame) {
        self.frames.push(frame);
    }

    pub fn pop_iteration(&mut self) {
        self.frames.pop();
    }

    pub fn current_frame(&self) -> Option<&IterationFrame> {
        self.frames.last()
    }

    /// The record bound as "current", when the innermost loop iterates a
    /// record set.
    pub fn current_record_id(&self) -> Option<&str> {
        self.current_frame().and_then(|f| f.record_id.as_deref())
    }

    pub fn in_iteration(&self) -> bool {
        !self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn innermost_frame_wins() {
        let mut ctx = ExecutionContext::new();
        ctx.push_iteration(IterationFrame {
            index: 0,
            item: json!("outer"),
            record_id: Some("record_1".to_string()),
        });
        ctx.push_iteration(IterationFrame {
            index: 3,
            item: json!("inner"),
            record_id: None,
        });

        assert_eq!(ctx.current_frame().unwrap().item, json!("inner"));
        // Inner frame has no record, so there is no current record.
        assert_eq!(ctx.current_record_id(), None);

        ctx.pop_iteration();
        assert_eq!(ctx.current_record_id(), Some("record_1"));
        ctx.pop_iteration();
        assert!(!ctx.in_iteration());
    }
}
