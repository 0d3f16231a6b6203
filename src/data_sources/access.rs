//! Access control: groups, users and roles.

use super::{Field, FieldKind, Key, Projection, Shape, KEY_SEGMENT};

const GROUP_FIELDS: &[Field] = &[
    Field::new("members", FieldKind::StringList),
    Field::new("comment", FieldKind::String),
];

const GROUPS_FIELDS: &[Field] = &[
    Field::new("groupid", FieldKind::String),
    Field::new("comment", FieldKind::String),
    Field::new("users", FieldKind::String),
];

const USER_FIELDS: &[Field] = &[
    Field::new("comment", FieldKind::String),
    Field::new("email", FieldKind::String),
    Field::new("enable", FieldKind::Bool),
    Field::new("expire", FieldKind::Int),
    Field::new("firstname", FieldKind::String),
    Field::new("groups", FieldKind::StringList),
    Field::new("keys", FieldKind::String),
    Field::new("lastname", FieldKind::String),
    Field::new("tokens", FieldKind::StringMap),
];

const TOKEN_FIELDS: &[Field] = &[
    Field::new("tokenid", FieldKind::String),
    Field::new("comment", FieldKind::String),
    Field::new("expire", FieldKind::Int),
    Field::new("privsep", FieldKind::Bool),
];

const USERS_FIELDS: &[Field] = &[
    Field::new("userid", FieldKind::String),
    Field::new("comment", FieldKind::String),
    Field::new("email", FieldKind::String),
    Field::new("enable", FieldKind::Bool),
    Field::new("expire", FieldKind::Int),
    Field::new("firstname", FieldKind::String),
    Field::new("groups", FieldKind::String),
    Field::new("keys", FieldKind::String),
    Field::new("lastname", FieldKind::String),
    Field::new("realmtype", FieldKind::String),
    Field::new("tokens", FieldKind::Records(TOKEN_FIELDS)),
];

macro_rules! privileges {
    ($($name:literal),* $(,)?) => {
        &[$(Field::new($name, FieldKind::Bool)),*]
    };
}

const ROLE_FIELDS: &[Field] = privileges![
    "datastoreallocate",
    "datastoreallocatespace",
    "datastoreallocatetemplate",
    "datastoreaudit",
    "groupallocate",
    "permissionsmodify",
    "poolallocate",
    "poolaudit",
    "realmallocate",
    "realmallocateuser",
    "sdnallocate",
    "sdnaudit",
    "sysaudit",
    "sysconsole",
    "sysincoming",
    "sysmodify",
    "syspowermgmt",
    "syssyslog",
    "usermodify",
    "vmallocate",
    "vmaudit",
    "vmbackup",
    "vmclone",
    "vmconfigcdrom",
    "vmconfigcloudinit",
    "vmconfigcpu",
    "vmconfigdisk",
    "vmconfighwtype",
    "vmconfigmemory",
    "vmconfignetwork",
    "vmconfigoptions",
    "vmconsole",
    "vmmigrate",
    "vmmonitor",
    "vmpowermgmt",
    "vmsnapshot",
    "vmsnapshotrollback",
];

const ROLES_FIELDS: &[Field] = &[
    Field::new("roleid", FieldKind::String),
    Field::new("privs", FieldKind::String),
    Field::new("special", FieldKind::Bool),
];

/// Access control data sources.
pub const PROJECTIONS: &[Projection] = &[
    Projection {
        type_name: "proxmox_access_group",
        description: "An access control group",
        key: Some(Key { name: "groupid", kind: FieldKind::String }),
        path: &["access", "groups", KEY_SEGMENT],
        query: &[],
        shape: Shape::Object(GROUP_FIELDS),
    },
    Projection {
        type_name: "proxmox_access_groups",
        description: "All access control groups",
        key: None,
        path: &["access", "groups"],
        query: &[],
        shape: Shape::List { attribute: "access_groups", fields: GROUPS_FIELDS },
    },
    Projection {
        type_name: "proxmox_access_user",
        description: "A user",
        key: Some(Key { name: "userid", kind: FieldKind::String }),
        path: &["access", "users", KEY_SEGMENT],
        query: &[],
        shape: Shape::Object(USER_FIELDS),
    },
    Projection {
        type_name: "proxmox_access_users",
        description: "All users",
        key: None,
        path: &["access", "users"],
        query: &["enabled", "full"],
        shape: Shape::List { attribute: "access_users", fields: USERS_FIELDS },
    },
    Projection {
        type_name: "proxmox_access_role",
        description: "The privileges of a role",
        key: Some(Key { name: "roleid", kind: FieldKind::String }),
        path: &["access", "roles", KEY_SEGMENT],
        query: &[],
        shape: Shape::Object(ROLE_FIELDS),
    },
    Projection {
        type_name: "proxmox_access_roles",
        description: "All roles",
        key: None,
        path: &["access", "roles"],
        query: &[],
        shape: Shape::List { attribute: "access_roles", fields: ROLES_FIELDS },
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sources::DataSource;
    use crate::testing::FakeProxmox;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn projection(name: &str) -> &'static Projection {
        PROJECTIONS.iter().find(|p| p.type_name == name).unwrap()
    }

    #[tokio::test]
    async fn test_user_tokens_map_normalized() {
        let fake = FakeProxmox::new();
        fake.put_path(
            "access/users/root@pam",
            json!({
                "enable": 1,
                "expire": 0,
                "groups": ["admins"],
                "tokens": {"tf": {"privsep": 0}}
            }),
        );
        let user = projection("proxmox_access_user");
        let state = assert_ok!(user.read(&fake, json!({"userid": "root@pam"})).await);
        assert_eq!(state["enable"], true);
        assert_eq!(state["expire"], 0);
        assert_eq!(state["groups"], json!(["admins"]));
        assert_eq!(state["tokens"], json!({"tf": "{\"privsep\":0}"}));
        assert_eq!(state["email"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_users_forwards_query() {
        let fake = FakeProxmox::new();
        fake.put_path(
            "access/users",
            json!([{
                "userid": "root@pam",
                "enable": 1,
                "realm-type": "pam",
                "tokens": [{"tokenid": "tf", "privsep": 1, "expire": 0}]
            }]),
        );
        let users = projection("proxmox_access_users");
        let state = assert_ok!(users.read(&fake, json!({"enabled": true, "full": false})).await);
        let user = &state["access_users"][0];
        assert_eq!(user["userid"], "root@pam");
        assert_eq!(user["realmtype"], "pam");
        assert_eq!(
            user["tokens"][0],
            json!({"tokenid": "tf", "comment": null, "expire": 0, "privsep": true})
        );
        assert_eq!(
            fake.get_requests(),
            vec![(
                "access/users".to_string(),
                vec![
                    ("enabled".to_string(), "1".to_string()),
                    ("full".to_string(), "0".to_string())
                ]
            )]
        );

        let schema = users.schema();
        assert!(schema.block.blocks["access_users"].block.blocks.contains_key("tokens"));
    }

    #[tokio::test]
    async fn test_role_privileges() {
        let fake = FakeProxmox::new();
        fake.put_path(
            "access/roles/PVEVMUser",
            json!({"VM.Audit": 1, "VM.Console": 1, "VM.Backup": 0}),
        );

        let role = projection("proxmox_access_role");
        let state = assert_ok!(role.read(&fake, json!({"roleid": "PVEVMUser"})).await);
        assert_eq!(state["vmaudit"], true);
        assert_eq!(state["vmconsole"], true);
        assert_eq!(state["vmbackup"], false);
        assert_eq!(state["sysaudit"], serde_json::Value::Null);
        assert_eq!(state["roleid"], "PVEVMUser");
    }

    #[tokio::test]
    async fn test_groups_list() {
        let fake = FakeProxmox::new();
        fake.put_path("access/groups", json!([{"groupid": "admins", "users": "root@pam,ops@pve"}]));

        let state = assert_ok!(projection("proxmox_access_groups").read(&fake, json!({})).await);
        assert_eq!(
            state["access_groups"],
            json!([{"groupid": "admins", "comment": null, "users": "root@pam,ops@pve"}])
        );
    }
}
