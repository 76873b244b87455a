//! Template resolution for step inputs and executor configs.
//!
//! Two reference forms are understood:
//!
//! * `$input.<path>` reads from the invocation's input bag.
//! * `$<stepId>.<path>` reads from the output of a completed step.
//!
//! A path is a dot-separated list of object keys and array indices
//! (`items.0.id`). A string that is exactly one reference resolves to the
//! referenced value with its type intact. Inside longer strings, references
//! are written `${input.id}` and interpolated as text. Anything else passes
//! through unchanged.

use crate::{StepId, TemplateError, Value};
use std::collections::BTreeMap;

/// Namespace for the invocation input bag.
pub const INPUT_ROOT: &str = "input";

/// Values visible to templates: the input bag and the outputs of every step
/// that has completed so far.
#[derive(Debug, Clone, Default)]
pub struct TemplateScope {
    input: Value,
    steps: BTreeMap<StepId, Value>,
}

impl TemplateScope {
    pub fn new(inputs: BTreeMap<String, Value>) -> Self {
        Self {
            input: Value::Object(inputs),
            steps: BTreeMap::new(),
        }
    }

    pub fn with_step_output(mut self, step_id: impl Into<StepId>, output: Value) -> Self {
        self.insert_step_output(step_id, output);
        self
    }

    pub fn insert_step_output(&mut self, step_id: impl Into<StepId>, output: Value) {
        self.steps.insert(step_id.into(), output);
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id)
    }
}

/// Root of a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Root {
    Input,
    Step(StepId),
}

/// A parsed `$root.path` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub root: Root,
    pub path: Vec<String>,
}

impl Reference {
    /// Parse a whole-string reference. Returns `None` for anything that is
    /// not one, which callers treat as a literal.
    pub fn parse(text: &str) -> Option<Self> {
        let body = text.strip_prefix('$')?;
        let mut parts = body.split('.');
        let root = parts.next()?;
        if !is_root_name(root) {
            return None;
        }
        let path: Vec<String> = parts.map(str::to_string).collect();
        if path.iter().any(|s| !is_path_segment(s)) {
            return None;
        }
        let root = if root == INPUT_ROOT {
            Root::Input
        } else {
            Root::Step(root.to_string())
        };
        Some(Self { root, path })
    }

    /// Step id this reference reads from, if any.
    pub fn step(&self) -> Option<&str> {
        match &self.root {
            Root::Step(id) => Some(id),
            Root::Input => None,
        }
    }

    fn lookup<'a>(&self, template: &str, scope: &'a TemplateScope) -> Result<&'a Value, TemplateError> {
        let base = match &self.root {
            Root::Input => scope.input(),
            Root::Step(step) => {
                scope
                    .step_output(step)
                    .ok_or_else(|| TemplateError::StepNotCompleted {
                        template: template.to_string(),
                        step: step.clone(),
                    })?
            }
        };
        base.get_path(&self.path)
            .map_err(|segment| TemplateError::MissingSegment {
                template: template.to_string(),
                segment,
            })
    }
}

fn is_root_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_path_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Resolve a single template string.
pub fn resolve(template: &str, scope: &TemplateScope) -> Result<Value, TemplateError> {
    if let Some(reference) = Reference::parse(template) {
        return reference.lookup(template, scope).cloned();
    }
    if template.contains("${") {
        return interpolate(template, scope).map(Value::String);
    }
    Ok(Value::String(template.to_string()))
}

/// Resolve every template inside a value. Strings are resolved, arrays and
/// objects element-wise, other literals are returned as-is.
pub fn resolve_value(value: &Value, scope: &TemplateScope) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => resolve(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_value(v, scope).map(|v| (k.clone(), v)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolve a step's `inputs` map.
pub fn resolve_inputs(
    inputs: &BTreeMap<String, Value>,
    scope: &TemplateScope,
) -> Result<BTreeMap<String, Value>, TemplateError> {
    inputs
        .iter()
        .map(|(name, template)| resolve_value(template, scope).map(|v| (name.clone(), v)))
        .collect()
}

/// Replace every `${reference}` in `text` with the referenced value rendered
/// as text.
pub fn interpolate(text: &str, scope: &TemplateScope) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| TemplateError::Malformed {
            template: text.to_string(),
            reason: "unterminated '${'".to_string(),
        })?;
        let inner = after[..end].trim();
        let reference =
            Reference::parse(&format!("${}", inner)).ok_or_else(|| TemplateError::Malformed {
                template: text.to_string(),
                reason: format!("invalid reference '{}'", inner),
            })?;
        let value = reference.lookup(text, scope)?;
        out.push_str(&value.to_display_string());
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Every step referenced anywhere inside `value`, in first-seen order.
pub fn referenced_steps(value: &Value) -> Vec<StepId> {
    let mut found = Vec::new();
    collect_steps(value, &mut found);
    found
}

fn collect_steps(value: &Value, found: &mut Vec<StepId>) {
    match value {
        Value::String(s) => {
            let mut push = |r: Reference| {
                if let Some(step) = r.step() {
                    if !found.iter().any(|f| f == step) {
                        found.push(step.to_string());
                    }
                }
            };
            if let Some(reference) = Reference::parse(s) {
                push(reference);
                return;
            }
            let mut rest = s.as_str();
            while let Some(start) = rest.find("${") {
                let after = &rest[start + 2..];
                let Some(end) = after.find('}') else { break };
                if let Some(reference) = Reference::parse(&format!("${}", after[..end].trim())) {
                    push(reference);
                }
                rest = &after[end + 1..];
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_steps(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_steps(v, found)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> TemplateScope {
        let inputs = match Value::from(json!({
            "token": "abc",
            "channel": {"id": "UC123", "tags": ["a", "b"]}
        })) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        TemplateScope::new(inputs)
            .with_step_output("a", Value::from(json!({"v": 10, "items": [{"id": "first"}]})))
    }

    #[test]
    fn resolves_input_paths() {
        let s = scope();
        assert_eq!(resolve("$input.token", &s).unwrap(), Value::from("abc"));
        assert_eq!(resolve("$input.channel.tags.1", &s).unwrap(), Value::from("b"));
    }

    #[test]
    fn resolves_step_outputs_with_types() {
        let s = scope();
        assert_eq!(resolve("$a.v", &s).unwrap(), Value::Number(10.0));
        assert_eq!(resolve("$a.items.0.id", &s).unwrap(), Value::from("first"));
        assert!(matches!(resolve("$a", &s).unwrap(), Value::Object(_)));
    }

    #[test]
    fn literals_pass_through() {
        let s = scope();
        assert_eq!(resolve("plain text", &s).unwrap(), Value::from("plain text"));
        assert_eq!(resolve("$5.00", &s).unwrap(), Value::from("$5.00"));
        assert_eq!(
            resolve_value(&Value::Number(3.0), &s).unwrap(),
            Value::Number(3.0)
        );
    }

    #[test]
    fn missing_input_names_the_segment() {
        let err = resolve("$input.missingField", &scope()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingSegment {
                template: "$input.missingField".to_string(),
                segment: "missingField".to_string(),
            }
        );
    }

    #[test]
    fn uncompleted_step_is_an_error() {
        let err = resolve("$later.v", &scope()).unwrap_err();
        assert!(matches!(err, TemplateError::StepNotCompleted { step, .. } if step == "later"));
    }

    #[test]
    fn interpolates_embedded_references() {
        let s = scope();
        assert_eq!(
            resolve("https://api.test/channels/${input.channel.id}?n=${a.v}", &s).unwrap(),
            Value::from("https://api.test/channels/UC123?n=10")
        );
        assert!(matches!(
            interpolate("Bearer ${input.token", &s),
            Err(TemplateError::Malformed { .. })
        ));
    }

    #[test]
    fn resolves_nested_structures() {
        let s = scope();
        let template = Value::from(json!({"auth": "$input.token", "ids": ["$a.items.0.id", 1]}));
        assert_eq!(
            resolve_value(&template, &s).unwrap(),
            Value::from(json!({"auth": "abc", "ids": ["first", 1]}))
        );
    }

    #[test]
    fn resolution_is_repeatable() {
        let s = scope();
        let first = resolve("$a.items.0", &s).unwrap();
        let second = resolve("$a.items.0", &s).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn finds_referenced_steps() {
        let template = Value::from(json!({"x": "$a.v", "y": "id=${b.id}&t=${input.token}", "z": "$a"}));
        assert_eq!(referenced_steps(&template), vec!["a".to_string(), "b".to_string()]);
    }
}
