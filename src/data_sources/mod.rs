//! Read-only data sources.
//!
//! Most data sources are a single `GET` whose answer is projected onto a
//! fixed set of computed attributes. [`Projection`] describes one such
//! fetch declaratively; [`node`] is the one that needs custom logic.

pub mod access;
pub mod firewall;
pub mod node;

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::instrument;

use crate::client::property::{format_bool, parse_bool};
use crate::client::ProxmoxApi;
use crate::error::ProviderError;
use crate::schema::{Attribute, AttributeFlags, AttributeType, Block, NestedBlock, Schema};

/// A data source read.
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    /// Type name, e.g. `proxmox_access_group`.
    fn type_name(&self) -> &'static str;

    /// Schema of the config and result.
    fn schema(&self) -> Schema;

    /// Fetch and return the full result, config attributes included.
    async fn read(&self, api: &dyn ProxmoxApi, config: Value) -> Result<Value, ProviderError>;
}

/// How a response value becomes an attribute value.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Any scalar, rendered as a string.
    String,
    /// Integer; numeric strings and booleans are accepted.
    Int,
    /// Boolean; `0`/`1` and their string forms are accepted.
    Bool,
    /// List of strings; a comma separated string is split.
    StringList,
    /// Map whose values are rendered as strings.
    StringMap,
    /// List of nested records.
    Records(&'static [Field]),
}

/// One projected attribute.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    /// Attribute name. Response keys match it after lowercasing and
    /// dropping dots and dashes, so `VM.Allocate` lands in `vmallocate`.
    pub name: &'static str,
    /// Conversion.
    pub kind: FieldKind,
}

impl Field {
    /// A field of `kind`.
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// Required attribute whose value addresses the object.
#[derive(Debug, Clone, Copy)]
pub struct Key {
    /// Attribute name.
    pub name: &'static str,
    /// `String` or `Int`.
    pub kind: FieldKind,
}

/// What the response looks like.
#[derive(Debug, Clone, Copy)]
pub enum Shape {
    /// A single object mapped onto top-level attributes.
    Object(&'static [Field]),
    /// An array of objects exposed as a list block.
    List {
        /// Block name.
        attribute: &'static str,
        /// Fields of each item.
        fields: &'static [Field],
    },
    /// A single object exposed whole as a string map attribute.
    Attrs(&'static str),
}

/// Placeholder in [`Projection::path`] replaced by the key value.
pub const KEY_SEGMENT: &str = "{key}";

/// A declarative fetch-and-map data source.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    /// Type name.
    pub type_name: &'static str,
    /// Schema description.
    pub description: &'static str,
    /// Lookup key, if the path addresses one object.
    pub key: Option<Key>,
    /// Path segments; [`KEY_SEGMENT`] is replaced by the key value.
    pub path: &'static [&'static str],
    /// Required boolean attributes forwarded as `0`/`1` query parameters.
    pub query: &'static [&'static str],
    /// Response shape.
    pub shape: Shape,
}

#[async_trait::async_trait]
impl DataSource for Projection {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn schema(&self) -> Schema {
        let mut schema = Schema::v0().with_description(self.description);
        if let Some(key) = &self.key {
            schema = schema.with_attribute(
                key.name,
                Attribute::new(attribute_type(key.kind), AttributeFlags::required()),
            );
        }
        for name in self.query {
            schema = schema.with_attribute(*name, Attribute::required_bool());
        }
        match self.shape {
            Shape::Object(fields) => {
                for field in fields {
                    schema = schema.with_attribute(field.name, computed(field.kind));
                }
            },
            Shape::List { attribute, fields } => {
                schema = schema.with_block(attribute, records_block(fields));
            },
            Shape::Attrs(attribute) => {
                schema = schema.with_attribute(attribute, computed(FieldKind::StringMap));
            },
        }
        schema
    }

    #[instrument(skip(self, api, config), fields(data_source = self.type_name))]
    async fn read(&self, api: &dyn ProxmoxApi, config: Value) -> Result<Value, ProviderError> {
        let mut state = match config {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let key = match &self.key {
            Some(key) => Some(
                state
                    .get(key.name)
                    .and_then(scalar_string)
                    .ok_or_else(|| {
                        ProviderError::Validation(format!(
                            "Missing required attribute '{}'",
                            key.name
                        ))
                    })?,
            ),
            None => None,
        };
        let segments: Vec<&str> = self
            .path
            .iter()
            .map(|segment| match (*segment, key.as_deref()) {
                (KEY_SEGMENT, Some(key)) => key,
                (segment, _) => segment,
            })
            .collect();

        let mut query = Vec::new();
        for name in self.query {
            let value = state.get(*name).and_then(to_bool).unwrap_or(false);
            query.push((*name, format_bool(value).to_string()));
        }

        let response = api
            .get(&segments, &query)
            .await
            .map_err(|e| ProviderError::api(format!("Unable to read {}", self.type_name), e))?;

        match self.shape {
            Shape::Object(fields) => {
                let object = response.as_object().cloned().unwrap_or_default();
                project_into(&mut state, &object, fields);
            },
            Shape::List { attribute, fields } => {
                state.insert(attribute.to_string(), project_records(&response, fields));
            },
            Shape::Attrs(attribute) => {
                state.insert(attribute.to_string(), convert(&response, FieldKind::StringMap));
            },
        }
        Ok(Value::Object(state))
    }
}

/// Every data source this provider serves.
pub fn all() -> Vec<Arc<dyn DataSource>> {
    let mut sources: Vec<Arc<dyn DataSource>> = vec![Arc::new(node::NodeDataSource)];
    for projection in access::PROJECTIONS.iter().chain(firewall::PROJECTIONS) {
        sources.push(Arc::new(*projection));
    }
    sources
}

fn attribute_type(kind: FieldKind) -> AttributeType {
    match kind {
        FieldKind::String => AttributeType::String,
        FieldKind::Int => AttributeType::Int64,
        FieldKind::Bool => AttributeType::Bool,
        FieldKind::StringList => AttributeType::list(AttributeType::String),
        FieldKind::StringMap => AttributeType::map(AttributeType::String),
        // Records are blocks, never attributes.
        FieldKind::Records(_) => AttributeType::String,
    }
}

fn computed(kind: FieldKind) -> Attribute {
    Attribute::new(attribute_type(kind), AttributeFlags::computed())
}

fn records_block(fields: &'static [Field]) -> NestedBlock {
    let mut block = Block::new();
    for field in fields {
        block = match field.kind {
            FieldKind::Records(nested) => block.with_block(field.name, records_block(nested)),
            kind => block.with_attribute(field.name, computed(kind)),
        };
    }
    NestedBlock::list(block)
}

/// `VM.Allocate` -> `vmallocate`, `realm-type` -> `realmtype`.
fn normalize_key(key: &str) -> String {
    key.chars().filter(|c| !matches!(c, '.' | '-')).flat_map(char::to_lowercase).collect()
}

fn project_into(target: &mut Map<String, Value>, source: &Map<String, Value>, fields: &[Field]) {
    for field in fields {
        let value = source
            .iter()
            .find(|(k, _)| normalize_key(k) == field.name)
            .map(|(_, v)| convert(v, field.kind))
            .unwrap_or(Value::Null);
        target.insert(field.name.to_string(), value);
    }
}

fn project_records(value: &Value, fields: &[Field]) -> Value {
    let Some(items) = value.as_array() else {
        return Value::Array(Vec::new());
    };
    items
        .iter()
        .filter_map(Value::as_object)
        .map(|item| {
            let mut record = Map::new();
            project_into(&mut record, item, fields);
            Value::Object(record)
        })
        .collect()
}

/// Convert a response value to what `kind` promises; anything that does
/// not fit becomes null.
pub(crate) fn convert(value: &Value, kind: FieldKind) -> Value {
    match kind {
        FieldKind::String => to_string(value).map(Value::String).unwrap_or(Value::Null),
        FieldKind::Int => to_int(value).map(Value::from).unwrap_or(Value::Null),
        FieldKind::Bool => to_bool(value).map(Value::Bool).unwrap_or(Value::Null),
        FieldKind::StringList => match value {
            Value::Array(items) => items.iter().filter_map(to_string).map(Value::String).collect(),
            Value::String(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
            _ => Value::Null,
        },
        FieldKind::StringMap => match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter_map(|(k, v)| to_string(v).map(|s| (k.clone(), Value::String(s))))
                    .collect(),
            ),
            _ => Value::Null,
        },
        FieldKind::Records(fields) => project_records(value, fields),
    }
}

fn to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Lookup keys are scalars only.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => parse_bool(s.trim()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProxmox;
    use crate::validation::is_valid;
    use serde_json::json;
    use tokio_test::assert_ok;

    const THING_FIELDS: &[Field] = &[
        Field::new("comment", FieldKind::String),
        Field::new("enable", FieldKind::Bool),
        Field::new("members", FieldKind::StringList),
    ];

    const THING: Projection = Projection {
        type_name: "proxmox_thing",
        description: "A thing",
        key: Some(Key { name: "name", kind: FieldKind::String }),
        path: &["things", KEY_SEGMENT],
        query: &[],
        shape: Shape::Object(THING_FIELDS),
    };

    #[test]
    fn test_convert() {
        assert_eq!(convert(&json!(3), FieldKind::String), json!("3"));
        assert_eq!(convert(&json!("7"), FieldKind::Int), json!(7));
        assert_eq!(convert(&json!("x"), FieldKind::Int), Value::Null);
        assert_eq!(convert(&json!(1), FieldKind::Bool), json!(true));
        assert_eq!(convert(&json!("0"), FieldKind::Bool), json!(false));
        assert_eq!(convert(&json!("a,b,,c"), FieldKind::StringList), json!(["a", "b", "c"]));
        assert_eq!(
            convert(&json!({"a": 1, "b": true, "c": "x", "d": null}), FieldKind::StringMap),
            json!({"a": "1", "b": "true", "c": "x"})
        );
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("VM.Config.CDROM"), "vmconfigcdrom");
        assert_eq!(normalize_key("realm-type"), "realmtype");
        assert_eq!(normalize_key("comment"), "comment");
    }

    #[test]
    fn test_schema() {
        let schema = THING.schema();
        assert!(schema.block.attributes["name"].flags.required);
        assert!(schema.block.attributes["comment"].is_computed_only());
        assert!(is_valid(&schema, &json!({"name": "a"})));
        assert!(!is_valid(&schema, &json!({})));
    }

    #[tokio::test]
    async fn test_read_object() {
        let fake = FakeProxmox::new();
        fake.put_path("things/a", json!({"comment": "hi", "enable": 1, "members": ["x@pve"]}));

        let state = assert_ok!(THING.read(&fake, json!({"name": "a"})).await);
        assert_eq!(
            state,
            json!({"name": "a", "comment": "hi", "enable": true, "members": ["x@pve"]})
        );
    }

    #[tokio::test]
    async fn test_read_missing_key() {
        let fake = FakeProxmox::new();
        let err = THING.read(&fake, json!({})).await.unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[tokio::test]
    async fn test_read_error_names_data_source() {
        let fake = FakeProxmox::new();
        let err = THING.read(&fake, json!({"name": "nope"})).await.unwrap_err();
        assert_eq!(err.message(), "Unable to read proxmox_thing");
    }

    #[test]
    fn test_all_names_unique() {
        let sources = all();
        let mut names: Vec<_> = sources.iter().map(|s| s.type_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), sources.len());
        assert_eq!(sources.len(), 13);
    }
}
