//! Selector candidate generation for one element.
//!
//! The ranking is a stability heuristic, not a correctness guarantee:
//! explicit ids first, then automation-oriented data attributes, then
//! aria-label, then name/type/href, and finally a class-list selector with
//! generated class names filtered out. Callers fall back through the list
//! when a candidate stops matching.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Data attributes placed specifically as automation hooks, in rank order.
const AUTOMATION_DATA_ATTRS: &[&str] = &[
    "data-testid",
    "data-test-id",
    "data-test",
    "data-qa",
    "data-cy",
    "data-automation-id",
];

// Class names emitted by CSS-in-JS toolchains and bundlers: framework
// prefixes, hash suffixes, or long hex runs. Useless as stable selectors.
static GENERATED_CLASS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(^css-|^sc-|^jsx-|^_|[0-9a-f]{6,}|--[0-9]+$)").unwrap()
});

fn looks_generated(class: &str) -> bool {
    class.len() > 24 || GENERATED_CLASS.is_match(class)
}

fn css_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Produce ranked selector candidates for an element given its tag and the
/// allow-listed attributes pulled at snapshot time.
pub fn selector_candidates(tag: Option<&str>, attributes: &HashMap<String, String>) -> Vec<String> {
    let mut candidates = Vec::new();
    let tag = tag.unwrap_or("*");

    if let Some(id) = attributes.get("id").filter(|v| !v.is_empty()) {
        candidates.push(format!("#{id}"));
    }

    for attr in AUTOMATION_DATA_ATTRS {
        if let Some(value) = attributes.get(*attr).filter(|v| !v.is_empty()) {
            candidates.push(format!("[{attr}=\"{}\"]", css_escape(value)));
        }
    }

    if let Some(label) = attributes.get("aria-label").filter(|v| !v.is_empty()) {
        candidates.push(format!("{tag}[aria-label=\"{}\"]", css_escape(label)));
    }

    if let Some(name) = attributes.get("name").filter(|v| !v.is_empty()) {
        candidates.push(format!("{tag}[name=\"{}\"]", css_escape(name)));
    }
    if let Some(ty) = attributes.get("type").filter(|v| !v.is_empty()) {
        candidates.push(format!("{tag}[type=\"{}\"]", css_escape(ty)));
    }
    if let Some(href) = attributes.get("href").filter(|v| !v.is_empty()) {
        candidates.push(format!("{tag}[href=\"{}\"]", css_escape(href)));
    }

    if let Some(class_list) = attributes.get("class") {
        let stable: Vec<&str> = class_list
            .split_whitespace()
            .filter(|c| !looks_generated(c))
            .collect();
        if !stable.is_empty() {
            candidates.push(format!("{tag}.{}", stable.join(".")));
        }
    }

    candidates
}
