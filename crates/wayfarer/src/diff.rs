//! Bi-temporal snapshot diffing.
//!
//! An element is "added" when it fails the active filters in the old
//! snapshot (or is absent) and passes in the new one; "removed" is the
//! mirror; "modified" covers elements passing in both whose text,
//! attributes, or visibility changed. Visibility transitions are always
//! reported even when both sides fail the filters, because a hide/show is
//! usually the page change the caller is waiting on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tree::IndexedElement;

/// Active filters for one diff computation, applied identically to both
/// snapshots on top of the standard relevance predicate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffFilters {
    /// Restrict to these roles (case-insensitive) when set.
    pub roles: Option<Vec<String>>,
    #[serde(default)]
    pub interactive_only: bool,
    #[serde(default)]
    pub visible_only: bool,
}

impl DiffFilters {
    fn passes(&self, el: &IndexedElement) -> bool {
        if let Some(roles) = &self.roles {
            if !roles.iter().any(|r| r.eq_ignore_ascii_case(&el.role)) {
                return false;
            }
        }
        if self.interactive_only && !el.interactive {
            return false;
        }
        if self.visible_only && !el.visible {
            return false;
        }
        el.is_relevant()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementSummary {
    pub element_id: u32,
    pub role: String,
    pub name: Option<String>,
    pub text: Option<String>,
}

impl From<&IndexedElement> for ElementSummary {
    fn from(el: &IndexedElement) -> Self {
        Self {
            element_id: el.element_id,
            role: el.role.clone(),
            name: el.name.clone(),
            text: el.text.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementChange {
    pub element: ElementSummary,
    /// Which aspects changed: "text", "name", "attributes", "visibility".
    pub changes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeDiff {
    pub added: Vec<ElementSummary>,
    pub removed: Vec<ElementSummary>,
    pub modified: Vec<ElementChange>,
    /// Set when any category hit the per-category cap.
    #[serde(default)]
    pub truncated: bool,
}

/// Compute the diff between two snapshot indices. Entries preserve snapshot
/// order within each category (new-snapshot order for added/modified,
/// old-snapshot order for removed). Each category is capped at `cap`.
pub fn compute_diff(
    old: &[IndexedElement],
    new: &[IndexedElement],
    filters: &DiffFilters,
    cap: usize,
) -> TreeDiff {
    let old_by_backend: HashMap<i64, &IndexedElement> = old
        .iter()
        .filter_map(|el| el.backend_node_id.map(|id| (id, el)))
        .collect();
    let new_by_backend: HashMap<i64, &IndexedElement> = new
        .iter()
        .filter_map(|el| el.backend_node_id.map(|id| (id, el)))
        .collect();

    let mut diff = TreeDiff::default();

    for new_el in new {
        let matched = new_el
            .backend_node_id
            .and_then(|id| old_by_backend.get(&id).copied());
        let new_pass = filters.passes(new_el);

        match matched {
            None => {
                if new_pass {
                    diff.added.push(new_el.into());
                }
            }
            Some(old_el) => {
                let old_pass = filters.passes(old_el);
                let changes = change_set(old_el, new_el);
                if !old_pass && new_pass {
                    // A filter transition is an appearance, never a
                    // modification.
                    diff.added.push(new_el.into());
                } else if old_pass && new_pass && !changes.is_empty() {
                    diff.modified.push(ElementChange {
                        element: new_el.into(),
                        changes,
                    });
                } else if changes.iter().any(|c| c == "visibility") {
                    diff.modified.push(ElementChange {
                        element: new_el.into(),
                        changes,
                    });
                }
            }
        }
    }

    for old_el in old {
        let matched = old_el
            .backend_node_id
            .and_then(|id| new_by_backend.get(&id).copied());
        let old_pass = filters.passes(old_el);
        match matched {
            None => {
                if old_pass {
                    diff.removed.push(old_el.into());
                }
            }
            Some(new_el) => {
                if old_pass && !filters.passes(new_el) {
                    diff.removed.push(old_el.into());
                }
            }
        }
    }

    for (name, list_len) in [
        ("added", diff.added.len()),
        ("removed", diff.removed.len()),
        ("modified", diff.modified.len()),
    ] {
        if list_len > cap {
            warn!("diff category '{}' truncated from {} to {}", name, list_len, cap);
            diff.truncated = true;
        }
    }
    diff.added.truncate(cap);
    diff.removed.truncate(cap);
    diff.modified.truncate(cap);

    diff
}

fn change_set(old: &IndexedElement, new: &IndexedElement) -> Vec<String> {
    let mut changes = Vec::new();
    if old.text != new.text {
        changes.push("text".to_string());
    }
    if old.name != new.name {
        changes.push("name".to_string());
    }
    if old.attributes != new.attributes {
        changes.push("attributes".to_string());
    }
    if old.visible != new.visible {
        changes.push("visibility".to_string());
    }
    changes
}
