//! Config validation against a [`Schema`].
//!
//! Validation runs before anything is submitted to the backend. Besides type
//! and presence checks it enforces the cross-attribute rules declared in the
//! schema, which is where a disk slot declaring two acquisition modes at once
//! gets rejected.
//!
//! # Example
//!
//! ```
//! use proxmox_provider::schema::{Attribute, Schema};
//! use proxmox_provider::validation::validate;
//! use serde_json::json;
//!
//! let schema = Schema::v0()
//!     .with_attribute("content", Attribute::optional_string().conflicts_with(["size_gb"]))
//!     .with_attribute("size_gb", Attribute::optional_int64());
//!
//! assert!(validate(&schema, &json!({"content": "local:iso/a.iso"})).is_empty());
//! let diagnostics = validate(&schema, &json!({"content": "local:iso/a.iso", "size_gb": 4}));
//! assert_eq!(diagnostics.len(), 1);
//! ```

use crate::schema::{
    Attribute, AttributeType, Block, BlockNestingMode, Diagnostic, NestedBlock, Schema,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Validate a JSON value against a schema.
///
/// Returns one diagnostic per problem found; an empty list means valid.
///
/// - Required attributes must be present and non-null.
/// - Computed-only attributes are skipped.
/// - Types must match.
/// - `conflicts_with` / `also_requires` are checked between siblings.
/// - List blocks and list attributes respect their size limits.
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    validate_block(&schema.block, value, "", &mut diagnostics);
    if let Value::Object(obj) = value {
        check_list_limits(&schema.list_limits, obj, &mut diagnostics);
    }
    diagnostics
}

/// Like [`validate`], but as a `Result`.
pub fn validate_result(schema: &Schema, value: &Value) -> Result<(), Vec<Diagnostic>> {
    let diagnostics = validate(schema, value);
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

/// Whether the value passes validation.
pub fn is_valid(schema: &Schema, value: &Value) -> bool {
    validate(schema, value).is_empty()
}

fn validate_block(block: &Block, value: &Value, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let obj = match value {
        Value::Object(map) => map,
        Value::Null => return,
        _ => {
            let mut diag = Diagnostic::error("Expected object")
                .with_detail(format!("Got {}", type_name(value)));
            if !path.is_empty() {
                diag = diag.with_attribute(path);
            }
            diagnostics.push(diag);
            return;
        },
    };

    let mut reported = BTreeSet::new();
    for (name, attr) in &block.attributes {
        let attr_path = join_path(path, name);
        validate_attribute(attr, obj.get(name), &attr_path, diagnostics);
        if is_set(obj.get(name)) {
            check_relations(name, attr, obj, path, &mut reported, diagnostics);
        }
    }

    for (name, nested) in &block.blocks {
        let block_path = join_path(path, name);
        validate_nested_block(nested, obj.get(name), &block_path, diagnostics);
    }
}

fn validate_attribute(
    attr: &Attribute,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if attr.is_computed_only() {
        return;
    }

    match value {
        None | Some(Value::Null) => {
            if attr.flags.required {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required attribute '{}'", path))
                        .with_detail("This attribute is required and must be provided")
                        .with_attribute(path),
                );
            }
        },
        Some(v) => validate_type(&attr.attr_type, v, path, diagnostics),
    }
}

fn check_relations(
    name: &str,
    attr: &Attribute,
    siblings: &Map<String, Value>,
    path: &str,
    reported: &mut BTreeSet<(String, String)>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let attr_path = join_path(path, name);
    for other in &attr.conflicts_with {
        if !is_set(siblings.get(other)) {
            continue;
        }
        // Each conflicting pair is reported once, whichever side declares it.
        let pair = if name < other.as_str() {
            (name.to_string(), other.clone())
        } else {
            (other.clone(), name.to_string())
        };
        if reported.insert(pair) {
            diagnostics.push(
                Diagnostic::error(format!(
                    "Conflicting attributes '{}' and '{}'",
                    attr_path,
                    join_path(path, other)
                ))
                .with_detail("Only one of these attributes may be set")
                .with_attribute(&attr_path),
            );
        }
    }
    for other in &attr.also_requires {
        if !is_set(siblings.get(other)) {
            diagnostics.push(
                Diagnostic::error(format!(
                    "Attribute '{}' requires '{}'",
                    attr_path,
                    join_path(path, other)
                ))
                .with_attribute(&attr_path),
            );
        }
    }
}

fn validate_type(
    attr_type: &AttributeType,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match attr_type {
        AttributeType::String => {
            if !value.is_string() {
                diagnostics.push(type_error(path, "string", value));
            }
        },
        AttributeType::Int64 => {
            if !is_int64(value) {
                diagnostics.push(type_error(path, "int64", value));
            }
        },
        AttributeType::Bool => {
            if !value.is_boolean() {
                diagnostics.push(type_error(path, "bool", value));
            }
        },
        AttributeType::List(element) => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    validate_type(element, item, &format!("{}.{}", path, i), diagnostics);
                }
            },
            None => diagnostics.push(type_error(path, "list", value)),
        },
        AttributeType::Map(element) => match value.as_object() {
            Some(entries) => {
                for (key, item) in entries {
                    validate_type(element, item, &format!("{}.{}", path, key), diagnostics);
                }
            },
            None => diagnostics.push(type_error(path, "map", value)),
        },
    }
}

fn validate_nested_block(
    nested: &NestedBlock,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (nested.nesting_mode, value) {
        (_, None | Some(Value::Null)) => {
            if nested.min_items > 0 {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' requires at least {} item(s)",
                        path, nested.min_items
                    ))
                    .with_attribute(path),
                );
            }
        },
        (BlockNestingMode::Single, Some(v)) => validate_block(&nested.block, v, path, diagnostics),
        (BlockNestingMode::List, Some(Value::Array(items))) => {
            let len = items.len() as u32;
            if len < nested.min_items {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' requires at least {} item(s), got {}",
                        path, nested.min_items, len
                    ))
                    .with_attribute(path),
                );
            }
            if nested.max_items > 0 && len > nested.max_items {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Block '{}' allows at most {} item(s), got {}",
                        path, nested.max_items, len
                    ))
                    .with_attribute(path),
                );
            }
            for (i, item) in items.iter().enumerate() {
                validate_block(&nested.block, item, &format!("{}.{}", path, i), diagnostics);
            }
        },
        (BlockNestingMode::List, Some(v)) => {
            diagnostics.push(
                Diagnostic::error(format!("Expected list for block '{}'", path))
                    .with_detail(format!("Got {}", type_name(v)))
                    .with_attribute(path),
            );
        },
    }
}

fn check_list_limits(
    limits: &BTreeMap<String, u32>,
    obj: &Map<String, Value>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for (name, max) in limits {
        if let Some(Value::Array(items)) = obj.get(name) {
            if *max > 0 && items.len() as u32 > *max {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "Attribute '{}' allows at most {} item(s), got {}",
                        name,
                        max,
                        items.len()
                    ))
                    .with_attribute(name),
                );
            }
        }
    }
}

fn is_set(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null))
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_int64(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.is_i64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
        _ => false,
    }
}

fn type_error(path: &str, expected: &str, got: &Value) -> Diagnostic {
    Diagnostic::error(format!("Invalid type for attribute '{}'", path))
        .with_detail(format!("Expected {}, got {}", expected, type_name(got)))
        .with_attribute(path)
}
