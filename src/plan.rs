//! Plan computation.
//!
//! A plan is the proposed state with computed attributes filled in from the
//! prior state wherever they are still valid, plus the attribute-level diff
//! the runtime shows before applying.
//!
//! Paths in the diff are dotted: `memory`, `iso.url`, `scsi.1.size_gb`, or
//! `scsi.1` when a whole slot appears or disappears.
//!
//! # Example
//!
//! ```
//! use proxmox_provider::plan::plan;
//! use proxmox_provider::schema::{Attribute, Schema};
//! use serde_json::json;
//!
//! let schema = Schema::v0()
//!     .with_attribute("node", Attribute::required_string().with_force_new())
//!     .with_attribute("memory", Attribute::required_int64());
//!
//! let prior = json!({"node": "pve1", "memory": 512});
//! let result = plan(&schema, Some(&prior), &json!({"node": "pve1", "memory": 1024}));
//! assert!(!result.requires_replace);
//!
//! let result = plan(&schema, Some(&prior), &json!({"node": "pve2", "memory": 512}));
//! assert!(result.requires_replace);
//! ```

use serde_json::{Map, Value};

use crate::schema::{Block, BlockNestingMode, Schema};
use crate::types::{AttributeChange, PlanResult};

/// Plan a transition from `prior` to `proposed`.
///
/// - No prior state: a create. Computed-only attributes are unknown (null).
/// - Null `proposed`: a destroy.
/// - Otherwise an update. Changing a force-new attribute that had a value
///   forces replacement; setting one that was never known does not.
pub fn plan(schema: &Schema, prior: Option<&Value>, proposed: &Value) -> PlanResult {
    let prior = prior.filter(|v| !v.is_null());
    match (prior, proposed) {
        (None, Value::Null) => PlanResult::no_change(Value::Null),
        (Some(prior), Value::Null) => {
            PlanResult::from_changes(Value::Null, top_level_changes(prior, false))
        },
        (None, proposed) => {
            let planned = clear_computed(&schema.block, proposed);
            let changes = top_level_changes(&planned, true);
            PlanResult::from_changes(planned, changes)
        },
        (Some(prior), proposed) => {
            let planned = carry_forward(&schema.block, prior, proposed);
            let mut changes = Vec::new();
            diff_block(&schema.block, "", prior, &planned, &mut changes);
            PlanResult::from_changes(planned, changes)
        },
    }
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// A value that says something: not null and not an empty list or map.
/// State written back by a resource may hold `[]` where config left the
/// attribute out, and the two must not diff.
fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| match v {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(entries) => !entries.is_empty(),
        _ => true,
    })
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn top_level_changes(state: &Value, added: bool) -> Vec<AttributeChange> {
    let Some(object) = state.as_object() else {
        return Vec::new();
    };
    object
        .iter()
        .filter(|(_, value)| present(Some(value)).is_some())
        .map(|(name, value)| {
            if added {
                AttributeChange::added(name.clone(), value.clone())
            } else {
                AttributeChange::removed(name.clone(), value.clone())
            }
        })
        .collect()
}

fn clear_computed(block: &Block, value: &Value) -> Value {
    let Value::Object(object) = value else {
        return value.clone();
    };
    let mut planned = object.clone();
    for (name, attr) in &block.attributes {
        if attr.is_computed_only() {
            planned.insert(name.clone(), Value::Null);
        }
    }
    for (name, nested) in &block.blocks {
        let cleared = match (nested.nesting_mode, object.get(name)) {
            (BlockNestingMode::Single, Some(inner)) => clear_computed(&nested.block, inner),
            (BlockNestingMode::List, Some(Value::Array(slots))) => {
                slots.iter().map(|slot| clear_computed(&nested.block, slot)).collect()
            },
            _ => continue,
        };
        planned.insert(name.clone(), cleared);
    }
    Value::Object(planned)
}

fn carry_forward(block: &Block, prior: &Value, proposed: &Value) -> Value {
    let (Value::Object(prior), Value::Object(proposed)) = (prior, proposed) else {
        return proposed.clone();
    };
    let mut planned = proposed.clone();
    for (name, attr) in &block.attributes {
        if !attr.flags.computed || present(planned.get(name)).is_some() {
            continue;
        }
        if let Some(value) = prior.get(name) {
            planned.insert(name.clone(), value.clone());
        }
    }
    for (name, nested) in &block.blocks {
        let (Some(before), Some(after)) = (prior.get(name), proposed.get(name)) else {
            continue;
        };
        let carried = match nested.nesting_mode {
            BlockNestingMode::Single => carry_forward(&nested.block, before, after),
            BlockNestingMode::List => carry_slots(&nested.block, before, after),
        };
        planned.insert(name.clone(), carried);
    }
    Value::Object(planned)
}

/// Computed values of a slot survive only while the slot itself is unchanged.
fn carry_slots(block: &Block, prior: &Value, proposed: &Value) -> Value {
    let (Value::Array(prior), Value::Array(proposed)) = (prior, proposed) else {
        return proposed.clone();
    };
    proposed
        .iter()
        .enumerate()
        .map(|(index, slot)| match prior.get(index) {
            Some(before) if slot_unchanged(block, before, slot) => {
                carry_forward(block, before, slot)
            },
            _ => slot.clone(),
        })
        .collect()
}

fn slot_unchanged(block: &Block, prior: &Value, proposed: &Value) -> bool {
    let (Value::Object(prior), Value::Object(proposed)) = (prior, proposed) else {
        return false;
    };
    let attributes_match = block
        .attributes
        .iter()
        .filter(|(_, attr)| !attr.is_computed_only())
        .all(|(name, attr)| match present(proposed.get(name)) {
            Some(value) => prior.get(name) == Some(value),
            None => attr.flags.computed || present(prior.get(name)).is_none(),
        });
    attributes_match
        && block
            .blocks
            .keys()
            .all(|name| present(proposed.get(name)) == present(prior.get(name)))
}

fn change(path: String, before: Option<&Value>, after: Option<&Value>) -> Option<AttributeChange> {
    match (before, after) {
        (None, Some(after)) => Some(AttributeChange::added(path, after.clone())),
        (Some(before), None) => Some(AttributeChange::removed(path, before.clone())),
        (Some(before), Some(after)) if before != after => {
            Some(AttributeChange::modified(path, before.clone(), after.clone()))
        },
        _ => None,
    }
}

fn diff_block(
    block: &Block,
    path: &str,
    prior: &Value,
    planned: &Value,
    changes: &mut Vec<AttributeChange>,
) {
    let empty = Map::new();
    let prior = prior.as_object().unwrap_or(&empty);
    let planned = planned.as_object().unwrap_or(&empty);

    for (name, attr) in &block.attributes {
        let after = present(planned.get(name));
        // Computed values are outcomes of the apply, not part of the diff.
        if attr.is_computed_only() || (attr.flags.computed && after.is_none()) {
            continue;
        }
        let before = present(prior.get(name));
        if let Some(c) = change(join(path, name), before, after) {
            changes.push(if attr.force_new && before.is_some() {
                c.forcing_replace()
            } else {
                c
            });
        }
    }

    for (name, nested) in &block.blocks {
        let block_path = join(path, name);
        let before = present(prior.get(name)).unwrap_or(&Value::Null);
        let after = present(planned.get(name)).unwrap_or(&Value::Null);
        match nested.nesting_mode {
            // A missing single block diffs as one whose attributes are all null.
            BlockNestingMode::Single => {
                diff_block(&nested.block, &block_path, before, after, changes)
            },
            BlockNestingMode::List => {
                let before = before.as_array().map(Vec::as_slice).unwrap_or_default();
                let after = after.as_array().map(Vec::as_slice).unwrap_or_default();
                for index in 0..before.len().max(after.len()) {
                    let slot_path = join(&block_path, &index.to_string());
                    match (non_null(before.get(index)), non_null(after.get(index))) {
                        (Some(b), Some(a)) => diff_block(&nested.block, &slot_path, b, a, changes),
                        (b, a) => changes.extend(change(slot_path, b, a)),
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{storage_content, vm};
    use serde_json::json;

    fn vm_state() -> Value {
        json!({
            "id": 100,
            "node": "pve1",
            "name": "web",
            "memory": 1024,
            "cpus": 2,
            "scsi": [
                {"volume_id": "local-lvm:vm-100-disk-0", "storage": "local-lvm", "size_gb": 10},
                {"volume_id": "local-lvm:vm-100-disk-1", "storage": "local-lvm", "size_gb": 4}
            ],
            "network": [{"bridge": "vmbr0", "firewall": true}]
        })
    }

    fn vm_config() -> Value {
        json!({
            "id": 100,
            "node": "pve1",
            "name": "web",
            "memory": 1024,
            "cpus": 2,
            "scsi": [
                {"volume_id": null, "storage": "local-lvm", "size_gb": 10},
                {"volume_id": null, "storage": "local-lvm", "size_gb": 4}
            ],
            "network": [{"bridge": "vmbr0", "firewall": true}]
        })
    }

    #[test]
    fn test_create_clears_computed() {
        let mut proposed = vm_config();
        proposed["scsi"][0]["volume_id"] = json!("bogus");
        let result = plan(&vm::schema(), None, &proposed);

        assert_eq!(result.planned_state["scsi"][0]["volume_id"], Value::Null);
        assert_eq!(result.planned_state["scsi"][0]["size_gb"], 10);
        assert!(result.has_changes());
        assert!(!result.requires_replace);
        assert!(result.changes.iter().all(|c| c.before.is_none()));
        assert!(result.changes.iter().any(|c| c.path == "memory"));
    }

    #[test]
    fn test_no_change_carries_volume_ids() {
        let result = plan(&vm::schema(), Some(&vm_state()), &vm_config());
        assert!(!result.has_changes());
        assert_eq!(result.planned_state, vm_state());
    }

    #[test]
    fn test_empty_lists_match_omitted_config() {
        let mut state = vm_state();
        state["serials"] = json!([]);
        state["ide"] = json!([]);
        let result = plan(&vm::schema(), Some(&state), &vm_config());
        assert!(!result.has_changes(), "{:?}", result.changes);

        let mut proposed = vm_config();
        proposed["serials"] = json!(["socket"]);
        let result = plan(&vm::schema(), Some(&state), &proposed);
        assert_eq!(result.changes, vec![AttributeChange::added("serials", json!(["socket"]))]);

        proposed["serials"] = json!([]);
        let result = plan(&vm::schema(), Some(&state), &proposed);
        assert!(!result.has_changes());
    }

    #[test]
    fn test_memory_change_in_place() {
        let mut proposed = vm_config();
        proposed["memory"] = json!(2048);
        let result = plan(&vm::schema(), Some(&vm_state()), &proposed);

        assert_eq!(
            result.changes,
            vec![AttributeChange::modified("memory", json!(1024), json!(2048))]
        );
        assert!(!result.requires_replace);
        assert_eq!(result.planned_state["scsi"][1]["volume_id"], "local-lvm:vm-100-disk-1");
    }

    #[test]
    fn test_node_change_forces_replacement() {
        let mut proposed = vm_config();
        proposed["node"] = json!("pve2");
        let result = plan(&vm::schema(), Some(&vm_state()), &proposed);

        assert!(result.requires_replace);
        assert_eq!(
            result.changes,
            vec![AttributeChange::modified("node", json!("pve1"), json!("pve2")).forcing_replace()]
        );
    }

    #[test]
    fn test_changed_slot_loses_volume_id() {
        let mut proposed = vm_config();
        proposed["scsi"][1]["size_gb"] = json!(8);
        let result = plan(&vm::schema(), Some(&vm_state()), &proposed);

        assert_eq!(result.planned_state["scsi"][0]["volume_id"], "local-lvm:vm-100-disk-0");
        assert_eq!(result.planned_state["scsi"][1]["volume_id"], Value::Null);
        assert_eq!(
            result.changes,
            vec![AttributeChange::modified("scsi.1.size_gb", json!(4), json!(8))]
        );
    }

    #[test]
    fn test_removed_slot() {
        let mut proposed = vm_config();
        proposed["scsi"].as_array_mut().unwrap().pop();
        let result = plan(&vm::schema(), Some(&vm_state()), &proposed);

        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].path, "scsi.1");
        assert!(result.changes[0].after.is_none());
        assert!(!result.requires_replace);
    }

    #[test]
    fn test_added_slot() {
        let mut proposed = vm_config();
        proposed["network"]
            .as_array_mut()
            .unwrap()
            .push(json!({"bridge": "vmbr1", "firewall": false}));
        let result = plan(&vm::schema(), Some(&vm_state()), &proposed);

        assert_eq!(
            result.changes,
            vec![AttributeChange::added("network.1", json!({"bridge": "vmbr1", "firewall": false}))]
        );
    }

    #[test]
    fn test_destroy() {
        let result = plan(&vm::schema(), Some(&vm_state()), &Value::Null);
        assert_eq!(result.planned_state, Value::Null);
        assert!(result.changes.iter().all(|c| c.after.is_none()));
        assert!(!result.requires_replace);

        assert!(!plan(&vm::schema(), None, &Value::Null).has_changes());
    }

    #[test]
    fn test_iso_url_after_import_does_not_replace() {
        let imported = json!({
            "id": "local:iso/debian-12.iso",
            "storage": "pve/local",
            "filename": "debian-12.iso",
            "iso": {"url": null, "checksum": null, "checksum_algorithm": null}
        });
        let proposed = json!({
            "id": null,
            "storage": "pve/local",
            "filename": "debian-12.iso",
            "iso": {
                "url": "https://example.com/debian-12.iso",
                "checksum": null,
                "checksum_algorithm": null
            }
        });
        let result = plan(&storage_content::schema(), Some(&imported), &proposed);

        assert!(!result.requires_replace);
        assert_eq!(result.planned_state["id"], "local:iso/debian-12.iso");
        assert_eq!(
            result.changes,
            vec![AttributeChange::added("iso.url", json!("https://example.com/debian-12.iso"))]
        );

        let mut moved = proposed.clone();
        moved["iso"]["url"] = json!("https://mirror.example.com/debian-12.iso");
        let result = plan(&storage_content::schema(), Some(&result.planned_state), &moved);
        assert!(result.requires_replace);
    }
}
