// SPDX-FileCopyrightText: 2026 Nurture Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `{{placeholder}}` rendering for message content.
//!
//! Placeholders are dot-separated paths into a JSON object. A placeholder
//! whose path does not resolve is left in the output unchanged.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    // Literal pattern; compilation cannot fail.
    Regex::new(r"\{\{\s*([a-zA-Z0-9_.]+)\s*\}\}").expect("valid placeholder regex")
});

/// Render `template` against `context`.
pub fn render(template: &str, context: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let path = &caps[1];
            match lookup(context, path) {
                Some(value) => display(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// The render context for step `step` of `total_steps`: the captured
/// execution context plus `user_id`, `step`, `step_number` and `total_steps`.
///
/// Built-ins take precedence over captured keys of the same name.
pub fn step_context(
    execution_context: &Map<String, Value>,
    user_id: &str,
    step: Option<u32>,
    total_steps: Option<u32>,
) -> Map<String, Value> {
    let mut context = execution_context.clone();
    context.insert("user_id".into(), Value::from(user_id));
    if let Some(step) = step {
        context.insert("step".into(), Value::from(step));
        context.insert("step_number".into(), Value::from(step + 1));
    }
    if let Some(total) = total_steps {
        context.insert("total_steps".into(), Value::from(total));
    }
    context
}

fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = context.get(parts.next()?)?;
    parts.try_fold(first, |value, key| value.get(key))
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn fills_flat_and_nested_placeholders() {
        let c = ctx(json!({"name": "Ada", "goal": {"title": "run 5k"}, "streak": 5}));
        assert_eq!(
            render("Hi {{name}}, {{ goal.title }} x{{streak}}", &c),
            "Hi Ada, run 5k x5"
        );
    }

    #[test]
    fn unknown_placeholders_stay_verbatim() {
        let c = ctx(json!({"name": "Ada"}));
        assert_eq!(render("Hi {{nickname}}!", &c), "Hi {{nickname}}!");
        assert_eq!(render("{{name.first}}", &c), "{{name.first}}");
    }

    #[test]
    fn builtins_override_captured_keys() {
        let c = ctx(json!({"user_id": "spoofed", "plan": "pro"}));
        let full = step_context(&c, "u-1", Some(1), Some(3));
        assert_eq!(
            render("{{user_id}} {{step_number}}/{{total_steps}} {{plan}}", &full),
            "u-1 2/3 pro"
        );
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        assert_eq!(render("plain {text}", &Map::new()), "plain {text}");
    }
}
