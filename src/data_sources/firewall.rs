//! Cluster firewall: aliases, security groups and rules.

use super::{Field, FieldKind, Key, Projection, Shape, KEY_SEGMENT};

const ALIASES_FIELDS: &[Field] = &[
    Field::new("cidr", FieldKind::String),
    Field::new("digest", FieldKind::String),
    Field::new("name", FieldKind::String),
    Field::new("comment", FieldKind::String),
];

const POSITION_FIELDS: &[Field] = &[Field::new("pos", FieldKind::Int)];

const GROUPS_FIELDS: &[Field] = &[
    Field::new("digest", FieldKind::String),
    Field::new("group", FieldKind::String),
    Field::new("comment", FieldKind::String),
];

const RULE_FIELDS: &[Field] = &[
    Field::new("action", FieldKind::String),
    Field::new("type", FieldKind::String),
    Field::new("comment", FieldKind::String),
    Field::new("dest", FieldKind::String),
    Field::new("dport", FieldKind::String),
    Field::new("enable", FieldKind::Int),
    Field::new("icmptype", FieldKind::String),
    Field::new("iface", FieldKind::String),
    Field::new("ipversion", FieldKind::Int),
    Field::new("log", FieldKind::String),
    Field::new("macro", FieldKind::String),
    Field::new("proto", FieldKind::String),
    Field::new("source", FieldKind::String),
    Field::new("sport", FieldKind::String),
];

/// Cluster firewall data sources.
pub const PROJECTIONS: &[Projection] = &[
    Projection {
        type_name: "proxmox_cluster_firewall_alias",
        description: "A cluster firewall alias",
        key: Some(Key { name: "name", kind: FieldKind::String }),
        path: &["cluster", "firewall", "aliases", KEY_SEGMENT],
        query: &[],
        shape: Shape::Attrs("attrs"),
    },
    Projection {
        type_name: "proxmox_cluster_firewall_aliases",
        description: "All cluster firewall aliases",
        key: None,
        path: &["cluster", "firewall", "aliases"],
        query: &[],
        shape: Shape::List { attribute: "cluster_firewall_aliases", fields: ALIASES_FIELDS },
    },
    Projection {
        type_name: "proxmox_cluster_firewall_group",
        description: "Rule positions of a security group",
        key: Some(Key { name: "group", kind: FieldKind::String }),
        path: &["cluster", "firewall", "groups", KEY_SEGMENT],
        query: &[],
        shape: Shape::List { attribute: "cluster_firewall_group", fields: POSITION_FIELDS },
    },
    Projection {
        type_name: "proxmox_cluster_firewall_groups",
        description: "All security groups",
        key: None,
        path: &["cluster", "firewall", "groups"],
        query: &[],
        shape: Shape::List { attribute: "cluster_firewall_groups", fields: GROUPS_FIELDS },
    },
    Projection {
        type_name: "proxmox_cluster_firewall_rule",
        description: "A cluster firewall rule",
        key: Some(Key { name: "pos", kind: FieldKind::Int }),
        path: &["cluster", "firewall", "rules", KEY_SEGMENT],
        query: &[],
        shape: Shape::Object(RULE_FIELDS),
    },
    Projection {
        type_name: "proxmox_cluster_firewall_rules",
        description: "Positions of all cluster firewall rules",
        key: None,
        path: &["cluster", "firewall", "rules"],
        query: &[],
        shape: Shape::List { attribute: "cluster_firewall_rules", fields: POSITION_FIELDS },
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sources::DataSource;
    use crate::schema::AttributeType;
    use crate::testing::FakeProxmox;
    use serde_json::{json, Value};
    use tokio_test::{assert_err, assert_ok};

    fn projection(name: &str) -> &'static Projection {
        PROJECTIONS.iter().find(|p| p.type_name == name).unwrap()
    }

    #[tokio::test]
    async fn test_alias_attrs() {
        let fake = FakeProxmox::new();
        fake.put_path(
            "cluster/firewall/aliases/lan",
            json!({"cidr": "10.0.0.0/24", "ipversion": 4, "name": "lan"}),
        );
        let alias = projection("proxmox_cluster_firewall_alias");
        let state = assert_ok!(alias.read(&fake, json!({"name": "lan"})).await);
        assert_eq!(state["attrs"], json!({"cidr": "10.0.0.0/24", "ipversion": "4", "name": "lan"}));
    }

    #[tokio::test]
    async fn test_rule_by_position() {
        let fake = FakeProxmox::new();
        fake.put_path(
            "cluster/firewall/rules/0",
            json!({"action": "ACCEPT", "type": "in", "enable": 1, "dport": 22, "pos": 0}),
        );
        let rule = projection("proxmox_cluster_firewall_rule");
        assert_eq!(rule.schema().block.attributes["pos"].attr_type, AttributeType::Int64);

        let state = assert_ok!(rule.read(&fake, json!({"pos": 0})).await);
        assert_eq!(state["pos"], 0);
        assert_eq!(state["action"], "ACCEPT");
        assert_eq!(state["type"], "in");
        assert_eq!(state["enable"], 1);
        assert_eq!(state["dport"], "22");
        assert_eq!(state["macro"], Value::Null);

        let err = assert_err!(rule.read(&fake, json!({"pos": 9})).await);
        assert_eq!(err.message(), "Unable to read proxmox_cluster_firewall_rule");
    }

    #[tokio::test]
    async fn test_group_positions() {
        let fake = FakeProxmox::new();
        fake.put_path(
            "cluster/firewall/groups/web",
            json!([{"pos": 0, "action": "ACCEPT"}, {"pos": 1}]),
        );

        let group = projection("proxmox_cluster_firewall_group");
        let state = assert_ok!(group.read(&fake, json!({"group": "web"})).await);
        assert_eq!(state["cluster_firewall_group"], json!([{"pos": 0}, {"pos": 1}]));
    }

    #[tokio::test]
    async fn test_non_list_response_is_empty() {
        let fake = FakeProxmox::new();
        fake.put_path("cluster/firewall/groups", Value::Null);

        let groups = projection("proxmox_cluster_firewall_groups");
        let state = assert_ok!(groups.read(&fake, json!({})).await);
        assert_eq!(state["cluster_firewall_groups"], json!([]));
    }
}
