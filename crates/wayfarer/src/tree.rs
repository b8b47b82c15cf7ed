//! Accessibility tree model and cleaning passes.
//!
//! The raw protocol payload arrives as a flat node list. It is rebuilt into
//! an [`AxNode`] tree, enriched with live element details pulled from the
//! page, and then cleaned into the [`DomNode`] shape callers see: structural
//! wrappers stripped, redundant text children folded into their parent, and
//! only nodes that are interactive, labeled, or carry visible text kept.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Roles that accept user interaction.
const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "searchbox",
    "checkbox",
    "radio",
    "combobox",
    "listbox",
    "option",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "tab",
    "switch",
    "slider",
    "spinbutton",
];

/// Purely structural wrapper roles with no semantic value of their own.
const WRAPPER_ROLES: &[&str] = &[
    "generic",
    "genericcontainer",
    "none",
    "presentation",
    "layouttable",
    "layouttablecell",
    "layouttablerow",
];

/// Text-only roles that can be folded into an unnamed parent.
const TEXT_ROLES: &[&str] = &["statictext", "inlinetextbox"];

/// Only these attributes are ever pulled from the live page. Pulling the
/// full attribute set would balloon the payload on attribute-heavy pages.
pub fn attribute_allowed(name: &str) -> bool {
    matches!(name, "id" | "name" | "type" | "href" | "class")
        || name.starts_with("data-")
        || name.starts_with("aria-")
}

/// One node of the raw accessibility tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxNode {
    pub node_id: String,
    pub role: String,
    pub name: Option<String>,
    pub value: Option<String>,
    pub description: Option<String>,
    pub ignored: bool,
    pub backend_node_id: Option<i64>,
    #[serde(default)]
    pub children: Vec<AxNode>,
}

/// Live element details resolved through in-page evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementDetails {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub visible: bool,
}

/// A cleaned, enriched tree node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomNode {
    /// Stable per-snapshot index, assigned pre-order over the full tree
    /// before cleaning so that diff and expand agree on ids.
    pub element_id: u32,
    pub role: String,
    pub name: Option<String>,
    pub text: Option<String>,
    pub tag: Option<String>,
    pub backend_node_id: Option<i64>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub visible: bool,
    #[serde(default)]
    pub children: Vec<DomNode>,
}

impl DomNode {
    pub fn is_interactive(&self) -> bool {
        INTERACTIVE_ROLES.contains(&self.role.to_lowercase().as_str())
    }

    pub fn is_labeled(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.trim().is_empty())
    }

    pub fn has_visible_text(&self) -> bool {
        self.visible && self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// Flat index entry retained in the snapshot cache. Covers the *full*
/// enriched tree, including nodes the cleaned view filters out, so diffing
/// can observe filter transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedElement {
    pub element_id: u32,
    /// Pre-order position, used to keep diff output in snapshot order.
    pub order: u32,
    pub backend_node_id: Option<i64>,
    pub role: String,
    pub name: Option<String>,
    pub text: Option<String>,
    pub tag: Option<String>,
    pub attributes: HashMap<String, String>,
    pub visible: bool,
    pub interactive: bool,
}

impl IndexedElement {
    pub fn is_labeled(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.trim().is_empty())
    }

    pub fn has_visible_text(&self) -> bool {
        self.visible && self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    /// The default relevance predicate used by snapshot cleaning.
    pub fn is_relevant(&self) -> bool {
        self.interactive || self.is_labeled() || self.has_visible_text()
    }
}

/// Rebuild the flat protocol node list into a tree.
///
/// Ignored nodes are transparent: their children are promoted in place.
pub fn parse_ax_tree(nodes: &[Value]) -> Option<AxNode> {
    let mut by_id: HashMap<&str, &Value> = HashMap::new();
    for node in nodes {
        if let Some(id) = node.get("nodeId").and_then(|v| v.as_str()) {
            by_id.insert(id, node);
        }
    }
    let root = nodes.first()?;
    build_node(root, &by_id)
}

fn build_node(raw: &Value, by_id: &HashMap<&str, &Value>) -> Option<AxNode> {
    let node_id = raw.get("nodeId")?.as_str()?.to_string();
    let ignored = raw
        .get("ignored")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut children = Vec::new();
    if let Some(child_ids) = raw.get("childIds").and_then(|v| v.as_array()) {
        for child_id in child_ids.iter().filter_map(|v| v.as_str()) {
            if let Some(child_raw) = by_id.get(child_id) {
                if let Some(child) = build_node(child_raw, by_id) {
                    if child.ignored {
                        children.extend(child.children);
                    } else {
                        children.push(child);
                    }
                }
            }
        }
    }

    Some(AxNode {
        node_id,
        role: string_prop(raw, "role").unwrap_or_else(|| "unknown".to_string()),
        name: string_prop(raw, "name").filter(|s| !s.is_empty()),
        value: string_prop(raw, "value").filter(|s| !s.is_empty()),
        description: string_prop(raw, "description").filter(|s| !s.is_empty()),
        ignored,
        backend_node_id: raw.get("backendDOMNodeId").and_then(|v| v.as_i64()),
        children,
    })
}

// Protocol properties are `{ "value": ... }` wrappers.
fn string_prop(raw: &Value, key: &str) -> Option<String> {
    raw.get(key)?
        .get("value")
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .filter(|s| !s.is_empty())
}

/// Attach live element details to every tree node.
pub fn enrich(node: &AxNode, details: &HashMap<i64, ElementDetails>) -> DomNode {
    let detail = node
        .backend_node_id
        .and_then(|id| details.get(&id))
        .cloned();
    let (tag, attributes, text, visible) = match detail {
        Some(d) => {
            let attrs = d
                .attributes
                .into_iter()
                .filter(|(k, _)| attribute_allowed(k))
                .collect();
            (
                Some(d.tag).filter(|t| !t.is_empty()),
                attrs,
                d.text.filter(|t| !t.trim().is_empty()),
                d.visible,
            )
        }
        // Without details we assume visible; the filter passes only keep the
        // node if it is also labeled or interactive.
        None => (None, HashMap::new(), None, true),
    };

    DomNode {
        element_id: 0,
        role: node.role.clone(),
        name: node.name.clone(),
        text,
        tag,
        backend_node_id: node.backend_node_id,
        attributes,
        visible,
        children: node.children.iter().map(|c| enrich(c, details)).collect(),
    }
}

/// Assign pre-order element ids over the full tree. Returns the node count.
pub fn assign_ids(node: &mut DomNode) -> u32 {
    let mut next = 0u32;
    assign_ids_inner(node, &mut next);
    next
}

fn assign_ids_inner(node: &mut DomNode, next: &mut u32) {
    *next += 1;
    node.element_id = *next;
    for child in &mut node.children {
        assign_ids_inner(child, next);
    }
}

/// Flatten the full tree into the cache index, preserving pre-order.
pub fn flatten_index(node: &DomNode, out: &mut Vec<IndexedElement>) {
    let interactive = node.is_interactive();
    out.push(IndexedElement {
        element_id: node.element_id,
        order: out.len() as u32,
        backend_node_id: node.backend_node_id,
        role: node.role.clone(),
        name: node.name.clone(),
        text: node.text.clone(),
        tag: node.tag.clone(),
        attributes: node.attributes.clone(),
        visible: node.visible,
        interactive,
    });
    for child in &node.children {
        flatten_index(child, out);
    }
}

/// Cleaning pass: strip structural wrappers, fold text-only children into
/// unnamed parents, drop nodes that are neither interactive, labeled, nor
/// visible text carriers. Element ids are preserved.
pub fn clean(node: DomNode) -> Option<DomNode> {
    let DomNode {
        element_id,
        role,
        name,
        text,
        tag,
        backend_node_id,
        attributes,
        visible,
        children,
    } = node;

    let cleaned_children: Vec<DomNode> = children.into_iter().filter_map(clean).collect();

    let role_lower = role.to_lowercase();

    // Structural wrappers with no name of their own dissolve into their
    // children. A wrapper with no surviving children disappears entirely.
    let unnamed = name.as_deref().map(str::trim).unwrap_or("").is_empty();
    if WRAPPER_ROLES.contains(&role_lower.as_str()) && unnamed {
        return match cleaned_children.len() {
            0 => None,
            1 => cleaned_children.into_iter().next(),
            _ => Some(DomNode {
                element_id,
                role,
                name,
                text,
                tag,
                backend_node_id,
                attributes,
                visible,
                children: cleaned_children,
            }),
        };
    }

    // Fold text-only children into an unnamed parent's name.
    let (mut name, mut children) = (name, cleaned_children);
    if name.as_deref().map(str::trim).unwrap_or("").is_empty() {
        let all_text = !children.is_empty()
            && children.iter().all(|c| {
                TEXT_ROLES.contains(&c.role.to_lowercase().as_str())
                    && c.children.is_empty()
                    && c.is_labeled()
            });
        if all_text {
            let joined = children
                .iter()
                .filter_map(|c| c.name.as_deref())
                .collect::<Vec<_>>()
                .join(" ");
            name = Some(joined);
            children.clear();
        }
    }

    let rebuilt = DomNode {
        element_id,
        role,
        name,
        text,
        tag,
        backend_node_id,
        attributes,
        visible,
        children,
    };

    let keep =
        rebuilt.is_interactive() || rebuilt.is_labeled() || rebuilt.has_visible_text();
    if keep || !rebuilt.children.is_empty() {
        Some(rebuilt)
    } else {
        None
    }
}
