//! Plain data types exchanged with the plugin runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A change to a single attribute during a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Dotted path to the attribute (`scsi.1.size_gb`).
    pub path: String,
    /// Value before the change, `None` when the attribute is new.
    pub before: Option<Value>,
    /// Value after the change, `None` when the attribute goes away.
    pub after: Option<Value>,
    /// Whether this change alone forces replacement.
    #[serde(default)]
    pub requires_replace: bool,
}

impl AttributeChange {
    /// Create a new attribute change.
    pub fn new(path: impl Into<String>, before: Option<Value>, after: Option<Value>) -> Self {
        Self {
            path: path.into(),
            before,
            after,
            requires_replace: false,
        }
    }

    /// An attribute that appears.
    pub fn added(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, None, Some(value))
    }

    /// An attribute that disappears.
    pub fn removed(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, Some(value), None)
    }

    /// An attribute whose value changes.
    pub fn modified(path: impl Into<String>, before: Value, after: Value) -> Self {
        Self::new(path, Some(before), Some(after))
    }

    /// Mark this change as forcing replacement.
    pub fn forcing_replace(mut self) -> Self {
        self.requires_replace = true;
        self
    }
}

/// The result of a plan operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// The state the resource is expected to have after apply.
    pub planned_state: Value,
    /// Attribute-level changes.
    pub changes: Vec<AttributeChange>,
    /// Whether the resource must be destroyed and recreated.
    pub requires_replace: bool,
}

impl PlanResult {
    /// A plan with no changes.
    pub fn no_change(state: Value) -> Self {
        Self {
            planned_state: state,
            changes: Vec::new(),
            requires_replace: false,
        }
    }

    /// A plan with changes; replacement is derived from the changes.
    pub fn from_changes(planned_state: Value, changes: Vec<AttributeChange>) -> Self {
        let requires_replace = changes.iter().any(|c| c.requires_replace);
        Self {
            planned_state,
            changes,
            requires_replace,
        }
    }

    /// Whether applying this plan would do anything.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// A resource produced by an import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedResource {
    /// The resource type.
    pub resource_type: String,
    /// The imported state.
    pub state: Value,
}

impl ImportedResource {
    /// Create a new imported resource.
    pub fn new(resource_type: impl Into<String>, state: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            state,
        }
    }
}

/// Provider metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderMetadata {
    /// Resource type names.
    pub resources: Vec<String>,
    /// Data source type names.
    pub data_sources: Vec<String>,
    /// Server capabilities.
    pub capabilities: ServerCapabilities,
}

/// Server capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    /// Whether destroy operations are planned.
    pub plan_destroy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_change_constructors() {
        let added = AttributeChange::added("scsi.1", json!({"size_gb": 4}));
        assert!(added.before.is_none());
        assert!(!added.requires_replace);

        let removed = AttributeChange::removed("network.0", json!({"bridge": "vmbr0"}));
        assert!(removed.after.is_none());

        let modified = AttributeChange::modified("node", json!("a"), json!("b")).forcing_replace();
        assert!(modified.requires_replace);
    }

    #[test]
    fn test_plan_result_replacement_derived() {
        let plan = PlanResult::from_changes(
            json!({"id": 101}),
            vec![
                AttributeChange::modified("memory", json!(512), json!(1024)),
                AttributeChange::modified("id", json!(100), json!(101)).forcing_replace(),
            ],
        );
        assert!(plan.requires_replace);
        assert!(plan.has_changes());

        let plan = PlanResult::no_change(json!({"id": 100}));
        assert!(!plan.requires_replace);
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_imported_resource() {
        let imported =
            ImportedResource::new("proxmox_cluster_ha_resources", json!({"id": "vm:100"}));
        assert_eq!(imported.state["id"], "vm:100");
    }
}
