//! JSON Schema keyword evaluation (draft-07 subset, plus `$defs` and
//! `prefixItems` so documents generated by `schemars` validate as well).
//!
//! Unsupported keywords (`format`, `dependencies`, remote `$ref`) are
//! treated as annotations and ignored.

use crate::error::ValidationErrors;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;

const MAX_DEPTH: usize = 64;

/// A schema document with its regexes compiled and `$ref`s checked.
#[derive(Debug)]
pub(crate) struct CompiledSchema {
    root: Value,
    patterns: HashMap<String, Regex>,
}

impl CompiledSchema {
    pub(crate) fn compile(root: Value) -> Result<Self, String> {
        if !root.is_object() && !root.is_boolean() {
            return Err("schema must be a JSON object or boolean".to_string());
        }
        let mut patterns = HashMap::new();
        collect(&root, &root, &mut patterns, 0)?;
        Ok(Self { root, patterns })
    }

    pub(crate) fn validate(&self, instance: &Value) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        self.check(&self.root, instance, "$", &mut errors, 0);
        errors
    }

    fn is_valid(&self, schema: &Value, instance: &Value, path: &str, depth: usize) -> bool {
        let mut scratch = ValidationErrors::new();
        self.check(schema, instance, path, &mut scratch, depth);
        scratch.is_empty()
    }

    fn check(
        &self,
        schema: &Value,
        instance: &Value,
        path: &str,
        errors: &mut ValidationErrors,
        depth: usize,
    ) {
        if depth > MAX_DEPTH {
            errors.add(path, "schema nesting too deep");
            return;
        }

        let keywords = match schema {
            Value::Bool(true) => return,
            Value::Bool(false) => {
                errors.add(path, "is not allowed");
                return;
            }
            Value::Object(keywords) => keywords,
            _ => return,
        };

        if let Some(target) = keywords.get("$ref").and_then(Value::as_str)
            && let Some(resolved) = resolve_ref(&self.root, target)
        {
            self.check(resolved, instance, path, errors, depth + 1);
        }

        if let Some(expected) = keywords.get("type")
            && !type_matches(expected, instance)
        {
            errors.add(path, format!("must be of type {}", describe_type(expected)));
            return;
        }

        if let Some(allowed) = keywords.get("enum").and_then(Value::as_array)
            && !allowed.iter().any(|candidate| json_eq(candidate, instance))
        {
            let listed: Vec<String> = allowed.iter().map(Value::to_string).collect();
            errors.add(path, format!("must be one of: {}", listed.join(", ")));
        }

        if let Some(expected) = keywords.get("const")
            && !json_eq(expected, instance)
        {
            errors.add(path, format!("must be equal to {}", expected));
        }

        match instance {
            Value::String(text) => self.check_string(keywords, text, path, errors),
            Value::Number(_) => check_number(keywords, instance, path, errors),
            Value::Object(fields) => self.check_object(keywords, fields, path, errors, depth),
            Value::Array(items) => self.check_array(keywords, items, path, errors, depth),
            _ => {}
        }

        self.check_combinators(keywords, instance, path, errors, depth);
    }

    fn check_string(
        &self,
        keywords: &Map<String, Value>,
        text: &str,
        path: &str,
        errors: &mut ValidationErrors,
    ) {
        let length = text.chars().count() as u64;
        if let Some(min) = keywords.get("minLength").and_then(Value::as_u64)
            && length < min
        {
            errors.add(path, format!("must be at least {} characters long", min));
        }
        if let Some(max) = keywords.get("maxLength").and_then(Value::as_u64)
            && length > max
        {
            errors.add(path, format!("must be at most {} characters long", max));
        }
        if let Some(pattern) = keywords.get("pattern").and_then(Value::as_str)
            && let Some(regex) = self.patterns.get(pattern)
            && !regex.is_match(text)
        {
            errors.add(path, format!("must match pattern {}", pattern));
        }
    }

    fn check_object(
        &self,
        keywords: &Map<String, Value>,
        fields: &Map<String, Value>,
        path: &str,
        errors: &mut ValidationErrors,
        depth: usize,
    ) {
        if let Some(required) = keywords.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !fields.contains_key(name) {
                    errors.add(child(path, name), "is required");
                }
            }
        }

        let count = fields.len() as u64;
        if let Some(min) = keywords.get("minProperties").and_then(Value::as_u64)
            && count < min
        {
            errors.add(path, format!("must have at least {} properties", min));
        }
        if let Some(max) = keywords.get("maxProperties").and_then(Value::as_u64)
            && count > max
        {
            errors.add(path, format!("must have at most {} properties", max));
        }

        let properties = keywords.get("properties").and_then(Value::as_object);
        let pattern_properties = keywords.get("patternProperties").and_then(Value::as_object);

        for (name, value) in fields {
            let field_path = child(path, name);
            let mut matched = false;

            if let Some(subschema) = properties.and_then(|p| p.get(name)) {
                matched = true;
                self.check(subschema, value, &field_path, errors, depth + 1);
            }
            if let Some(pattern_properties) = pattern_properties {
                for (pattern, subschema) in pattern_properties {
                    if self.patterns.get(pattern).is_some_and(|r| r.is_match(name)) {
                        matched = true;
                        self.check(subschema, value, &field_path, errors, depth + 1);
                    }
                }
            }
            if !matched && let Some(additional) = keywords.get("additionalProperties") {
                match additional {
                    Value::Bool(false) => errors.add(field_path, "is not allowed"),
                    other => self.check(other, value, &field_path, errors, depth + 1),
                }
            }
        }
    }

    fn check_array(
        &self,
        keywords: &Map<String, Value>,
        items: &[Value],
        path: &str,
        errors: &mut ValidationErrors,
        depth: usize,
    ) {
        let count = items.len() as u64;
        if let Some(min) = keywords.get("minItems").and_then(Value::as_u64)
            && count < min
        {
            errors.add(path, format!("must contain at least {} items", min));
        }
        if let Some(max) = keywords.get("maxItems").and_then(Value::as_u64)
            && count > max
        {
            errors.add(path, format!("must contain at most {} items", max));
        }
        if keywords.get("uniqueItems").and_then(Value::as_bool) == Some(true) {
            let duplicate = items
                .iter()
                .enumerate()
                .any(|(i, a)| items[i + 1..].iter().any(|b| json_eq(a, b)));
            if duplicate {
                errors.add(path, "must not contain duplicate items");
            }
        }

        // Positional schemas: draft-07 tuple `items`, or `prefixItems`.
        let (positional, rest) = match (keywords.get("prefixItems"), keywords.get("items")) {
            (Some(Value::Array(prefix)), rest) => (Some(prefix), rest),
            (None, Some(Value::Array(tuple))) => (Some(tuple), keywords.get("additionalItems")),
            (_, rest) => (None, rest),
        };

        let skip = positional.map_or(0, |schemas| {
            for (index, (schema, item)) in schemas.iter().zip(items).enumerate() {
                self.check(schema, item, &indexed(path, index), errors, depth + 1);
            }
            schemas.len()
        });

        if let Some(rest) = rest {
            for (index, item) in items.iter().enumerate().skip(skip) {
                match rest {
                    Value::Bool(false) => errors.add(indexed(path, index), "is not allowed"),
                    schema => self.check(schema, item, &indexed(path, index), errors, depth + 1),
                }
            }
        }
    }

    fn check_combinators(
        &self,
        keywords: &Map<String, Value>,
        instance: &Value,
        path: &str,
        errors: &mut ValidationErrors,
        depth: usize,
    ) {
        if let Some(all) = keywords.get("allOf").and_then(Value::as_array) {
            for schema in all {
                self.check(schema, instance, path, errors, depth + 1);
            }
        }

        if let Some(any) = keywords.get("anyOf").and_then(Value::as_array)
            && !any.iter().any(|s| self.is_valid(s, instance, path, depth + 1))
        {
            errors.add(path, "must match at least one schema in anyOf");
        }

        if let Some(one) = keywords.get("oneOf").and_then(Value::as_array) {
            let matches = one
                .iter()
                .filter(|s| self.is_valid(s, instance, path, depth + 1))
                .count();
            if matches != 1 {
                errors.add(
                    path,
                    format!("must match exactly one schema in oneOf, matched {}", matches),
                );
            }
        }

        if let Some(not) = keywords.get("not")
            && self.is_valid(not, instance, path, depth + 1)
        {
            errors.add(path, "must not match the schema in not");
        }

        if let Some(condition) = keywords.get("if") {
            let branch = if self.is_valid(condition, instance, path, depth + 1) {
                keywords.get("then")
            } else {
                keywords.get("else")
            };
            if let Some(branch) = branch {
                self.check(branch, instance, path, errors, depth + 1);
            }
        }
    }
}

fn check_number(keywords: &Map<String, Value>, instance: &Value, path: &str, errors: &mut ValidationErrors) {
    let Some(value) = instance.as_f64() else {
        return;
    };
    let bound = |name: &str| keywords.get(name).and_then(Value::as_f64);

    if let Some(min) = bound("minimum")
        && value < min
    {
        errors.add(path, format!("must be >= {}", min));
    }
    if let Some(max) = bound("maximum")
        && value > max
    {
        errors.add(path, format!("must be <= {}", max));
    }
    if let Some(min) = bound("exclusiveMinimum")
        && value <= min
    {
        errors.add(path, format!("must be > {}", min));
    }
    if let Some(max) = bound("exclusiveMaximum")
        && value >= max
    {
        errors.add(path, format!("must be < {}", max));
    }
    if let Some(step) = bound("multipleOf")
        && step > 0.0
    {
        let quotient = value / step;
        if (quotient - quotient.round()).abs() > 1e-9 {
            errors.add(path, format!("must be a multiple of {}", step));
        }
    }
}

/// Walk the document: compile every regex and verify every `$ref`.
fn collect(
    root: &Value,
    node: &Value,
    patterns: &mut HashMap<String, Regex>,
    depth: usize,
) -> Result<(), String> {
    if depth > MAX_DEPTH {
        return Err("schema nesting too deep".to_string());
    }
    match node {
        Value::Object(keywords) => {
            if let Some(pattern) = keywords.get("pattern").and_then(Value::as_str) {
                compile_pattern(pattern, patterns)?;
            }
            if let Some(pattern_properties) = keywords.get("patternProperties").and_then(Value::as_object) {
                for pattern in pattern_properties.keys() {
                    compile_pattern(pattern, patterns)?;
                }
            }
            if let Some(target) = keywords.get("$ref").and_then(Value::as_str)
                && resolve_ref(root, target).is_none()
            {
                return Err(format!("unresolvable $ref '{}'", target));
            }
            for (key, value) in keywords {
                match key.as_str() {
                    // Literal values, not subschemas.
                    "enum" | "const" | "default" | "examples" => {}
                    // Keys here are property or definition names, not keywords.
                    "properties" | "patternProperties" | "definitions" | "$defs" | "dependencies" => {
                        if let Some(named) = value.as_object() {
                            for subschema in named.values() {
                                collect(root, subschema, patterns, depth + 1)?;
                            }
                        }
                    }
                    _ => collect(root, value, patterns, depth + 1)?,
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(root, item, patterns, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn compile_pattern(pattern: &str, patterns: &mut HashMap<String, Regex>) -> Result<(), String> {
    if patterns.contains_key(pattern) {
        return Ok(());
    }
    let regex = Regex::new(pattern).map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;
    patterns.insert(pattern.to_string(), regex);
    Ok(())
}

/// Local references only: `#` or a JSON pointer such as `#/definitions/x`.
fn resolve_ref<'a>(root: &'a Value, target: &str) -> Option<&'a Value> {
    match target {
        "#" => Some(root),
        _ => target.strip_prefix('#').and_then(|pointer| root.pointer(pointer)),
    }
}

fn type_matches(expected: &Value, instance: &Value) -> bool {
    match expected {
        Value::String(name) => type_name_matches(name, instance),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| type_name_matches(name, instance)),
        _ => true,
    }
}

fn type_name_matches(name: &str, instance: &Value) -> bool {
    match name {
        "null" => instance.is_null(),
        "boolean" => instance.is_boolean(),
        "string" => instance.is_string(),
        "array" => instance.is_array(),
        "object" => instance.is_object(),
        "number" => instance.is_number(),
        "integer" => {
            instance.is_i64()
                || instance.is_u64()
                || instance.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
        }
        _ => false,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        Value::String(name) => name.clone(),
        other => other.to_string(),
    }
}

/// Equality with numeric normalisation (`1 == 1.0`).
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => a == b,
    }
}

fn child(path: &str, name: &str) -> String {
    if path == "$" {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn indexed(path: &str, index: usize) -> String {
    format!("{}[{}]", path, index)
}
