use crate::tree::DomNode;

/// Format a cleaned DOM tree as compact indented text.
///
/// Output format:
/// - [role] #id name (additional context)
///   - [role] #id name
///     - ...
///
/// The `#id` is the snapshot-local element id accepted by `expand`; callers
/// reference elements through it rather than through raw backend handles.
pub fn format_dom_tree(tree: &DomNode, indent: usize) -> String {
    let mut output = String::new();
    format_node(tree, indent, &mut output);
    output
}

fn format_node(node: &DomNode, indent: usize, output: &mut String) {
    let indent_str = if indent > 0 {
        "  ".repeat(indent)
    } else {
        String::new()
    };

    output.push_str(&indent_str);
    output.push_str("- ");
    output.push_str(&format!("[{}] #{}", node.role, node.element_id));

    if let Some(ref name) = node.name {
        if !name.is_empty() {
            output.push_str(&format!(" {}", truncate(name)));
        }
    }

    let mut context_parts = Vec::new();

    if let Some(ref text) = node.text {
        if !text.is_empty() && node.name.as_deref() != Some(text.as_str()) {
            context_parts.push(format!("text: {}", truncate(text)));
        }
    }

    if let Some(ref tag) = node.tag {
        context_parts.push(format!("tag: {tag}"));
    }

    if let Some(id) = node.attributes.get("id") {
        if !id.is_empty() {
            context_parts.push(format!("id: {id}"));
        }
    }

    if let Some(href) = node.attributes.get("href") {
        if !href.is_empty() {
            context_parts.push(format!("href: {}", truncate(href)));
        }
    }

    if !node.visible {
        context_parts.push("hidden".to_string());
    }

    if !context_parts.is_empty() {
        output.push_str(&format!(" ({})", context_parts.join(", ")));
    }

    output.push('\n');

    for child in &node.children {
        format_node(child, indent + 1, output);
    }
}

fn truncate(s: &str) -> String {
    let clean = s.replace('\n', " ").replace('\r', "");
    if clean.chars().count() > 60 {
        let prefix: String = clean.chars().take(57).collect();
        format!("{prefix}...")
    } else {
        clean
    }
}
