//! Template/variable resolution for `{{...}}` expressions.
//!
//! Each expression unit resolves through a strict precedence, first match
//! wins: the current iteration record, a specific record by id, the
//! `get_all_records` projection, iteration locals, then the global bucket.
//! Unresolvable expressions degrade to their original literal text rather
//! than erroring, so a bad template shows up as visible text instead of a
//! crashed run. [`TemplateResolver::lint`] is the strict authoring-time
//! counterpart.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::context::ExecutionContext;

static EXPR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap());

static GET_ALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^get_all_records\(\s*"([^"]+)"\s*\)$"#).unwrap());

pub struct TemplateResolver;

impl TemplateResolver {
    /// Resolve every `{{...}}` in `input`.
    ///
    /// When the whole string is exactly one expression the typed value is
    /// returned; embedded expressions are stringified in place.
    pub fn resolve(input: &str, ctx: &ExecutionContext) -> Value {
        let trimmed = input.trim();
        if let Some(caps) = EXPR_RE.captures(trimmed) {
            if caps.get(0).map(|m| m.as_str()) == Some(trimmed) {
                let expr = caps.get(1).expect("capture group").as_str();
                return match Self::resolve_expr(expr, ctx) {
                    Some(value) => value,
                    None => Value::String(input.to_string()),
                };
            }
        }

        let replaced = EXPR_RE.replace_all(input, |caps: &regex::Captures| {
            let expr = caps.get(1).expect("capture group").as_str();
            match Self::resolve_expr(expr, ctx) {
                Some(value) => stringify(&value),
                None => caps.get(0).expect("whole match").as_str().to_string(),
            }
        });
        Value::String(replaced.into_owned())
    }

    /// Resolve to a display string regardless of the typed result.
    pub fn resolve_string(input: &str, ctx: &ExecutionContext) -> String {
        stringify(&Self::resolve(input, ctx))
    }

    /// Resolve one bare expression (no braces). `None` means unresolvable.
    pub fn resolve_expr(expr: &str, ctx: &ExecutionContext) -> Option<Value> {
        let expr = expr.trim();

        // 1. current.<path>, only valid inside an iteration bound to a
        //    record.
        if let Some(path) = expr.strip_prefix("current.") {
            let record_id = ctx.current_record_id()?;
            return ctx.records.get(record_id)?.get_path(path).cloned();
        }

        // 2. <record_id>.<path>
        if let Some((head, path)) = expr.split_once('.') {
            if ctx.records.is_record_id(head) {
                return ctx.records.get(head)?.get_path(path).cloned();
            }
        }

        // 3. get_all_records("<path>") projection, creation order.
        if let Some(caps) = GET_ALL_RE.captures(expr) {
            return Some(Value::Array(ctx.records.project(&caps[1])));
        }

        // 4. Iteration locals bound by the innermost enclosing loop.
        if let Some(frame) = ctx.current_frame() {
            if expr == "loop_index" {
                return Some(Value::from(frame.index as u64));
            }
            if expr == "loop_item" {
                return Some(frame.item.clone());
            }
            if let Some(path) = expr.strip_prefix("loop_item.") {
                return walk_path(&frame.item, path).cloned();
            }
        }

        // 5. Global bucket: exact dotted key first, then the bare head
        //    with the remainder walked into its value.
        if let Some(value) = ctx.get_global(expr) {
            return Some(value.clone());
        }
        if let Some((head, rest)) = expr.split_once('.') {
            if let Some(value) = ctx.get_global(head) {
                return walk_path(value, rest).cloned();
            }
        }

        None
    }

    /// Strict mode: the expressions in `input` that would fail open at
    /// runtime. Intended for authoring validation and tests; runtime
    /// behavior stays fail-open.
    pub fn lint(input: &str, ctx: &ExecutionContext) -> Vec<String> {
        EXPR_RE
            .captures_iter(input)
            .filter_map(|caps| {
                let expr = caps.get(1).expect("capture group").as_str();
                if Self::resolve_expr(expr, ctx).is_none() {
                    Some(expr.to_string())
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Walk a dotted path through objects and array indices.
pub(crate) fn walk_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IterationFrame;
    use serde_json::json;

    fn ctx_with_records() -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        let ids = ctx.records.create_batch(
            "extract_emails",
            &[
                json!({"subject": "Invoice", "from": "billing@x.test"}),
                json!({"subject": "Reminder"}),
                json!({"subject": "Offer"}),
            ],
        );
        ctx.records.write_field(&ids[0], "classify", "type", json!("finance"));
        ctx.records.write_field(&ids[2], "classify", "type", json!("spam"));
        ctx
    }

    #[test]
    fn current_resolves_only_inside_an_iteration() {
        let mut ctx = ctx_with_records();

        // Outside a loop the expression fails open to the literal text.
        let outside = TemplateResolver::resolve("{{current.extract_emails.subject}}", &ctx);
        assert_eq!(outside, json!("{{current.extract_emails.subject}}"));

        ctx.push_iteration(IterationFrame {
            index: 0,
            item: json!("record_1"),
            record_id: Some("record_1".to_string()),
        });
        let inside = TemplateResolver::resolve("{{current.extract_emails.subject}}", &ctx);
        assert_eq!(inside, json!("Invoice"));
    }

    #[test]
    fn record_id_lookup_walks_the_namespaced_path() {
        let ctx = ctx_with_records();
        let value = TemplateResolver::resolve("{{record_1.classify.type}}", &ctx);
        assert_eq!(value, json!("finance"));

        // Unknown record ids fail open.
        let missing = TemplateResolver::resolve("{{record_99.classify.type}}", &ctx);
        assert_eq!(missing, json!("{{record_99.classify.type}}"));
    }

    #[test]
    fn get_all_records_skips_missing_fields_and_keeps_order() {
        let ctx = ctx_with_records();
        let value = TemplateResolver::resolve(r#"{{get_all_records("classify.type")}}"#, &ctx);
        assert_eq!(value, json!(["finance", "spam"]));
    }

    #[test]
    fn embedded_get_all_records_stringifies() {
        let ctx = ctx_with_records();
        let value =
            TemplateResolver::resolve(r#"types: {{get_all_records("classify.type")}}"#, &ctx);
        assert_eq!(value, json!(r#"types: ["finance","spam"]"#));
    }

    #[test]
    fn iteration_locals_resolve_index_and_item() {
        let mut ctx = ExecutionContext::new();
        ctx.push_iteration(IterationFrame {
            index: 2,
            item: json!({"name": "third"}),
            record_id: None,
        });

        assert_eq!(TemplateResolver::resolve("{{loop_index}}", &ctx), json!(2));
        assert_eq!(
            TemplateResolver::resolve("{{loop_item.name}}", &ctx),
            json!("third")
        );
    }

    #[test]
    fn globals_resolve_dotted_key_then_bare_head() {
        let mut ctx = ExecutionContext::new();
        ctx.set_global("search.result_count", json!(12));
        ctx.set_global("profile", json!({"email": "me@x.test"}));

        assert_eq!(
            TemplateResolver::resolve("{{search.result_count}}", &ctx),
            json!(12)
        );
        // No dotted key "profile.email"; the bare head is walked instead.
        assert_eq!(
            TemplateResolver::resolve("{{profile.email}}", &ctx),
            json!("me@x.test")
        );
    }

    #[test]
    fn iteration_locals_shadow_globals() {
        let mut ctx = ExecutionContext::new();
        ctx.set_global("loop_index", json!("global"));
        ctx.push_iteration(IterationFrame {
            index: 5,
            item: json!(null),
            record_id: None,
        });
        assert_eq!(TemplateResolver::resolve("{{loop_index}}", &ctx), json!(5));
    }

    #[test]
    fn whole_expression_returns_typed_value_embedded_stringifies() {
        let mut ctx = ExecutionContext::new();
        ctx.set_global("count", json!(3));

        assert_eq!(TemplateResolver::resolve("{{count}}", &ctx), json!(3));
        assert_eq!(
            TemplateResolver::resolve("found {{count}} items", &ctx),
            json!("found 3 items")
        );
    }

    #[test]
    fn lint_reports_unresolvable_expressions() {
        let mut ctx = ExecutionContext::new();
        ctx.set_global("known", json!(1));

        let problems =
            TemplateResolver::lint("{{known}} and {{unknown.path}} and {{current.x}}", &ctx);
        assert_eq!(problems, vec!["unknown.path", "current.x"]);
    }
}
