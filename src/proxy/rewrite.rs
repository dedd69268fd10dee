//! Best-effort request body rewriting for upstream schema compatibility.
//!
//! Coding agents built against other SDK dialects send request shapes the
//! upstream JSON API rejects: camelCase `functionDeclarations`,
//! `parametersJsonSchema` instead of `parameters`, JSON Schema attributes the
//! upstream does not support, a `role` inside `systemInstruction`, and
//! `thinkingLevel` where the API wants a numeric `thinkingBudget`. This module
//! normalizes all of that on the way out.
//!
//! Rewriting never fails a request: if the body is not a JSON object, or
//! re-serialization fails, the original bytes pass through untouched.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::logbuf::{LogBuffer, LogLevel};

/// JSON Schema attributes the upstream rejects inside tool parameters.
const UNSUPPORTED_SCHEMA_KEYS: [&str; 5] =
    ["additionalProperties", "default", "optional", "maximum", "oneOf"];

/// `thinkingLevel` to token-budget mapping; unknown levels get the high budget.
fn thinking_budget_for(level: &str) -> u64 {
    match level {
        "medium" => 13_120,
        "low" => 6_560,
        _ => 26_240,
    }
}

/// What a rewrite pass changed, for observability.
#[derive(Debug, Default)]
pub struct RewriteReport {
    pub modified: bool,
    /// Declarations whose schema was touched, by function name.
    pub tools_fixed: usize,
    /// Removed schema attributes: dotted path -> removed value.
    pub removed_fields: Map<String, Value>,
    /// Value of the deleted `systemInstruction.role`, if any.
    pub removed_role: Option<Value>,
    /// `(level, budget)` when `thinkingLevel` was converted.
    pub thinking_budget: Option<(String, u64)>,
}

/// Rewrite `body` if it parses as a JSON object and needs changes.
///
/// Returns `Some(bytes)` with the re-serialized body only when a mutation
/// occurred; `None` means "forward the original bytes".
pub async fn rewrite_request_body(body: &[u8], log: &LogBuffer) -> Option<Vec<u8>> {
    let root = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => return None,
    };

    let mut root = root;
    let report = apply_fixes(&mut root);
    if !report.modified {
        return None;
    }

    record_report(&report, log).await;

    match serde_json::to_vec(&Value::Object(root)) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Failed to re-serialize rewritten body, forwarding original: {e}");
            None
        }
    }
}

/// Apply all fixes to a parsed request object. Pure; the async wrapper handles
/// parsing and logging.
pub fn apply_fixes(root: &mut Map<String, Value>) -> RewriteReport {
    let mut report = RewriteReport::default();
    fix_tool_definitions(root, &mut report);
    fix_system_instruction(root, &mut report);
    report
}

/// Normalize `tools[*]` declarations and scrub their parameter schemas.
fn fix_tool_definitions(root: &mut Map<String, Value>, report: &mut RewriteReport) {
    let Some(Value::Array(tools)) = root.get_mut("tools") else {
        return;
    };

    for tool in tools {
        let Value::Object(tool_obj) = tool else {
            continue;
        };

        if tool_obj.contains_key("functionDeclarations")
            && !tool_obj.contains_key("function_declarations")
        {
            let decls = tool_obj
                .remove("functionDeclarations")
                .expect("key checked above");
            tool_obj.insert("function_declarations".to_string(), decls);
            report.modified = true;
        }

        let Some(Value::Array(decls)) = tool_obj.get_mut("function_declarations") else {
            continue;
        };

        for decl in decls {
            let Value::Object(func) = decl else {
                continue;
            };
            let name = func
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            report.tools_fixed += 1;

            if let Some(schema) = func.remove("parametersJsonSchema") {
                func.insert("parameters".to_string(), schema);
                report.modified = true;
                debug!(function = %name, "Moved parametersJsonSchema to parameters");
            }

            if let Some(Value::Object(params)) = func.get_mut("parameters") {
                if clean_schema(params, &name, &mut report.removed_fields) {
                    report.modified = true;
                }
            }
        }
    }
}

/// Recursively remove unsupported attributes from a parameter schema object.
/// Descends into `properties.*` and `items` (which covers `items.properties.*`).
fn clean_schema(obj: &mut Map<String, Value>, path: &str, removed: &mut Map<String, Value>) -> bool {
    let mut modified = false;

    for key in UNSUPPORTED_SCHEMA_KEYS {
        if let Some(value) = obj.remove(key) {
            debug!(path = %path, key, "Removed unsupported schema attribute");
            removed.insert(format!("{path}.{key}"), value);
            modified = true;
        }
    }

    if let Some(Value::Object(props)) = obj.get_mut("properties") {
        for (name, child) in props.iter_mut() {
            if let Value::Object(child_obj) = child {
                let child_path = format!("{path}.properties.{name}");
                if clean_schema(child_obj, &child_path, removed) {
                    modified = true;
                }
            }
        }
    }

    if let Some(Value::Object(items)) = obj.get_mut("items") {
        let items_path = format!("{path}.items");
        if clean_schema(items, &items_path, removed) {
            modified = true;
        }
    }

    modified
}

/// Delete `systemInstruction.role` and convert `thinkingLevel` to a budget.
fn fix_system_instruction(root: &mut Map<String, Value>, report: &mut RewriteReport) {
    if let Some(Value::Object(sys)) = root.get_mut("systemInstruction") {
        if let Some(role) = sys.remove("role") {
            report.removed_role = Some(role);
            report.modified = true;
        }
    }

    let Some(Value::Object(gen)) = root.get_mut("generationConfig") else {
        return;
    };
    let Some(Value::Object(thinking)) = gen.get_mut("thinkingConfig") else {
        return;
    };
    let level = thinking
        .get("thinkingLevel")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    if let Some(level) = level {
        let budget = thinking_budget_for(&level);
        thinking.insert("thinkingBudget".to_string(), json!(budget));
        thinking.remove("thinkingLevel");
        report.thinking_budget = Some((level, budget));
        report.modified = true;
    }
}

/// Mirror the rewrite outcome into the log buffer for the web UI.
async fn record_report(report: &RewriteReport, log: &LogBuffer) {
    if report.tools_fixed > 0 || !report.removed_fields.is_empty() {
        log.append(
            LogLevel::Info,
            format!(
                "Rewrote {} tool declarations for upstream compatibility",
                report.tools_fixed
            ),
            Some(json!({
                "total_tools": report.tools_fixed,
                "removed_field_count": report.removed_fields.len(),
                "removed_fields": Value::Object(report.removed_fields.clone()),
            })),
        )
        .await;
    }
    if let Some(ref role) = report.removed_role {
        warn!("Removed unsupported 'role' from systemInstruction");
        log.append(
            LogLevel::Warn,
            "Removed unsupported 'role' from systemInstruction",
            Some(json!({"removed_field": "role", "removed_value": role})),
        )
        .await;
    }
    if let Some((ref level, budget)) = report.thinking_budget {
        log.append(
            LogLevel::Info,
            format!("Mapped thinkingLevel '{level}' to thinkingBudget {budget}"),
            None,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_object(value: &Value) -> &Map<String, Value> {
        value.as_object().expect("object")
    }

    /// Walk a schema object asserting no forbidden key survives at any depth.
    fn assert_clean(value: &Value) {
        if let Value::Object(obj) = value {
            for key in UNSUPPORTED_SCHEMA_KEYS {
                assert!(!obj.contains_key(key), "found forbidden key {key}");
            }
            for child in obj.values() {
                assert_clean(child);
            }
        } else if let Value::Array(items) = value {
            for child in items {
                assert_clean(child);
            }
        }
    }

    fn rewrite(body: &str) -> (Value, RewriteReport) {
        let Value::Object(mut root) = serde_json::from_str(body).unwrap() else {
            panic!("test body must be an object");
        };
        let report = apply_fixes(&mut root);
        (Value::Object(root), report)
    }

    #[test]
    fn test_full_rewrite_scenario() {
        let body = r#"{
            "tools": [{"functionDeclarations": [{
                "name": "f",
                "parametersJsonSchema": {
                    "type": "object",
                    "properties": {"x": {"type": "number", "maximum": 10}},
                    "additionalProperties": false
                }
            }]}],
            "systemInstruction": {"role": "user", "parts": [{"text": "s"}]},
            "generationConfig": {"thinkingConfig": {"thinkingLevel": "low"}}
        }"#;

        let (result, report) = rewrite(body);
        assert!(report.modified);

        let tool = &result["tools"][0];
        assert!(as_object(tool).contains_key("function_declarations"));
        assert!(!as_object(tool).contains_key("functionDeclarations"));

        let decl = &tool["function_declarations"][0];
        assert!(as_object(decl).contains_key("parameters"));
        assert!(!as_object(decl).contains_key("parametersJsonSchema"));
        assert_clean(&decl["parameters"]);
        assert_eq!(decl["parameters"]["properties"]["x"]["type"], "number");

        assert!(!as_object(&result["systemInstruction"]).contains_key("role"));
        assert_eq!(result["systemInstruction"]["parts"][0]["text"], "s");

        let thinking = &result["generationConfig"]["thinkingConfig"];
        assert_eq!(thinking["thinkingBudget"], 6560);
        assert!(!as_object(thinking).contains_key("thinkingLevel"));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let body = r#"{
            "tools": [{"functionDeclarations": [{
                "name": "f",
                "parametersJsonSchema": {"type": "object", "oneOf": [], "default": 1}
            }]}],
            "systemInstruction": {"role": "model"},
            "generationConfig": {"thinkingConfig": {"thinkingLevel": "high"}}
        }"#;

        let (once, _) = rewrite(body);
        let Value::Object(mut twice_root) = once.clone() else {
            unreachable!()
        };
        let second = apply_fixes(&mut twice_root);
        assert!(!second.modified);
        assert_eq!(once, Value::Object(twice_root));
    }

    #[test]
    fn test_deep_schema_cleanup() {
        let body = r#"{"tools": [{"function_declarations": [{
            "name": "deep",
            "parameters": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "a": {
                        "type": "array",
                        "maximum": 5,
                        "items": {
                            "type": "object",
                            "oneOf": [{"type": "string"}],
                            "properties": {
                                "b": {"type": "string", "default": "x", "optional": true}
                            }
                        }
                    }
                }
            }
        }]}]}"#;

        let (result, report) = rewrite(body);
        assert!(report.modified);
        assert_clean(&result["tools"][0]["function_declarations"][0]["parameters"]);

        // Removed (path, value) pairs are collected for observability.
        assert_eq!(
            report.removed_fields["deep.additionalProperties"],
            Value::Bool(false)
        );
        assert_eq!(report.removed_fields["deep.properties.a.maximum"], 5);
        assert!(report
            .removed_fields
            .contains_key("deep.properties.a.items.oneOf"));
        assert_eq!(
            report.removed_fields["deep.properties.a.items.properties.b.default"],
            "x"
        );
    }

    #[test]
    fn test_untouched_body_reports_unmodified() {
        let (_, report) = rewrite(r#"{"contents": [{"parts": [{"text": "hello"}]}]}"#);
        assert!(!report.modified);
    }

    #[test]
    fn test_snake_case_present_wins_over_camel() {
        let body = r#"{"tools": [{
            "functionDeclarations": [{"name": "camel"}],
            "function_declarations": [{"name": "snake"}]
        }]}"#;
        let (result, report) = rewrite(body);
        // Rename is skipped; the existing snake_case list is authoritative.
        assert!(as_object(&result["tools"][0]).contains_key("functionDeclarations"));
        assert_eq!(
            result["tools"][0]["function_declarations"][0]["name"],
            "snake"
        );
        assert!(!report.modified);
    }

    #[test]
    fn test_unknown_thinking_level_maps_high() {
        let (result, report) =
            rewrite(r#"{"generationConfig": {"thinkingConfig": {"thinkingLevel": "maximal"}}}"#);
        assert_eq!(
            result["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            26240
        );
        assert_eq!(
            report.thinking_budget,
            Some(("maximal".to_string(), 26240))
        );
    }

    #[test]
    fn test_numeric_thinking_level_untouched() {
        let (result, report) =
            rewrite(r#"{"generationConfig": {"thinkingConfig": {"thinkingLevel": 3}}}"#);
        assert!(!report.modified);
        assert_eq!(
            result["generationConfig"]["thinkingConfig"]["thinkingLevel"],
            3
        );
    }

    #[test]
    fn test_medium_level_budget() {
        let (result, _) =
            rewrite(r#"{"generationConfig": {"thinkingConfig": {"thinkingLevel": "medium"}}}"#);
        assert_eq!(
            result["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            13120
        );
    }

    #[tokio::test]
    async fn test_non_json_body_passes_through() {
        let log = LogBuffer::new(16);
        assert!(rewrite_request_body(b"not json at all", &log).await.is_none());
        assert!(rewrite_request_body(b"[1,2,3]", &log).await.is_none());
        assert!(rewrite_request_body(b"", &log).await.is_none());
    }

    #[tokio::test]
    async fn test_unmodified_body_passes_through() {
        let log = LogBuffer::new(16);
        let body = br#"{"contents": []}"#;
        assert!(rewrite_request_body(body, &log).await.is_none());
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn test_modified_body_reserializes_and_logs() {
        let log = LogBuffer::new(16);
        let body = br#"{"systemInstruction": {"role": "user", "parts": []}}"#;
        let out = rewrite_request_body(body, &log).await.unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert!(!as_object(&parsed["systemInstruction"]).contains_key("role"));
        assert_eq!(log.len().await, 1);
    }
}
