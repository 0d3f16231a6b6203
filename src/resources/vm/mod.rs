//! `proxmox_node_virtual_machine`.
//!
//! Disk and network declarations are positional: entry `N` of `scsi` is the
//! `scsiN` device. Gaps are `None` and survive every conversion.

pub mod disk;
pub mod engine;
pub mod network;

use serde::{Deserialize, Serialize};

use super::null_as_default;
use crate::client::models::DiskBus;
use crate::schema::{Attribute, AttributeFlags, AttributeType, Block, NestedBlock, Schema};

pub use engine::VmResource;

/// Resource type name.
pub const TYPE_NAME: &str = "proxmox_node_virtual_machine";

/// Maximum number of serial devices.
pub const MAX_SERIALS: usize = 3;

/// QEMU arguments carrying `fw_config` start with this.
pub const FW_CFG_PREFIX: &str = "-fw_cfg ";

/// One disk declaration.
///
/// Exactly one acquisition mode is set: `content`, `size_gb` with
/// `storage`, or `import_from` with `storage`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSlot {
    /// Backend volume id, assigned after creation.
    pub volume_id: Option<String>,
    /// Storage pool.
    pub storage: Option<String>,
    /// Size of a fresh allocation in GB.
    pub size_gb: Option<u64>,
    /// Existing volume to attach.
    pub content: Option<String>,
    /// Volume to copy from.
    pub import_from: Option<String>,
    /// Snapshot mode.
    pub readonly: Option<bool>,
    /// Include in backups.
    pub backup: Option<bool>,
}

/// One network interface declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSlot {
    /// Host bridge.
    pub bridge: String,
    /// Proxmox firewall enabled.
    pub firewall: bool,
}

/// Plan and state shape of a virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmModel {
    /// VM id.
    pub id: u32,
    /// Node the VM lives on.
    pub node: String,
    /// VM name.
    pub name: Option<String>,
    /// Memory in MB.
    pub memory: u64,
    /// Core count.
    pub cpus: u64,
    /// Guest agent enabled.
    pub agent: Option<bool>,
    /// `-fw_cfg` argument passed to QEMU.
    pub fw_config: Option<String>,
    /// Reboot after a configuration change.
    pub reboot: Option<bool>,
    /// Serial devices.
    #[serde(deserialize_with = "null_as_default")]
    pub serials: Vec<Option<String>>,
    /// IDE disks.
    #[serde(deserialize_with = "null_as_default")]
    pub ide: Vec<Option<DiskSlot>>,
    /// SCSI disks.
    #[serde(deserialize_with = "null_as_default")]
    pub scsi: Vec<Option<DiskSlot>>,
    /// Network interfaces.
    #[serde(deserialize_with = "null_as_default")]
    pub network: Vec<Option<NetworkSlot>>,
}

impl VmModel {
    /// Disk slots for `bus`.
    pub fn disks(&self, bus: DiskBus) -> &[Option<DiskSlot>] {
        match bus {
            DiskBus::Ide => &self.ide,
            DiskBus::Scsi => &self.scsi,
        }
    }

    /// Mutable disk slots for `bus`.
    pub fn disks_mut(&mut self, bus: DiskBus) -> &mut Vec<Option<DiskSlot>> {
        match bus {
            DiskBus::Ide => &mut self.ide,
            DiskBus::Scsi => &mut self.scsi,
        }
    }

    /// QEMU `args` for the configured `fw_config`.
    pub fn qemu_args(&self) -> Option<String> {
        self.fw_config
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(|c| format!("{}{}", FW_CFG_PREFIX, c))
    }
}

/// Reconcile `local` slots against what the backend reports.
///
/// Gaps propagate, trailing local slots beyond the observed length are
/// dropped, and a local slot is merged in place only when `reuse` accepts
/// it; otherwise it is rebuilt from the observed record alone.
pub(crate) fn merge_slots<S, R>(
    local: &mut Vec<Option<S>>,
    observed: &[Option<R>],
    reuse: impl Fn(&S, &R) -> bool,
    decode: impl Fn(&mut S, &R),
) where
    S: Default,
{
    local.truncate(observed.len());
    local.resize_with(observed.len(), || None);

    for (slot, record) in local.iter_mut().zip(observed) {
        let Some(record) = record else {
            *slot = None;
            continue;
        };
        match slot {
            Some(existing) if reuse(existing, record) => decode(existing, record),
            _ => {
                let mut fresh = S::default();
                decode(&mut fresh, record);
                *slot = Some(fresh);
            },
        }
    }
}

fn disk_block(bus: DiskBus) -> NestedBlock {
    let block = Block::new()
        .with_description(format!("A {} disk; position N is device {}N", bus, bus))
        .with_attribute(
            "volume_id",
            Attribute::computed_string().with_description("The volume ID for this disk"),
        )
        .with_attribute(
            "storage",
            Attribute::optional_string()
                .with_computed()
                .with_description("The node storage ID to place the new disk"),
        )
        .with_attribute(
            "size_gb",
            Attribute::optional_int64()
                .with_description("The size in GB if creating a disk")
                .also_requires(["storage"])
                .conflicts_with(["import_from"]),
        )
        .with_attribute(
            "content",
            Attribute::optional_string()
                .with_description("The content ID for this disk")
                .conflicts_with(["storage", "import_from"]),
        )
        .with_attribute(
            "import_from",
            Attribute::optional_string()
                .with_description("A volid of an existing disk to copy from")
                .also_requires(["storage"])
                .conflicts_with(["size_gb", "content"]),
        )
        .with_attribute(
            "readonly",
            Attribute::optional_bool()
                .with_description("If set will put the disk in 'snapshot' mode making it readonly"),
        )
        .with_attribute(
            "backup",
            Attribute::optional_bool().with_description("Include the disk in backups"),
        );
    NestedBlock::list(block).with_max_items(bus.max_slots() as u32)
}

fn network_block() -> NestedBlock {
    NestedBlock::list(
        Block::new()
            .with_description("A network interface; position N is device netN")
            .with_attribute(
                "bridge",
                Attribute::required_string().with_description("The hosts network bridge to use"),
            )
            .with_attribute(
                "firewall",
                Attribute::required_bool()
                    .with_description("If set will utilize the proxmox firewall"),
            ),
    )
}

/// Schema for [`TYPE_NAME`].
pub fn schema() -> Schema {
    Schema::v0()
        .with_description("A QEMU virtual machine on a Proxmox node")
        .with_attribute(
            "id",
            Attribute::required_int64()
                .with_description("The vmid of the VM")
                .with_force_new(),
        )
        .with_attribute(
            "node",
            Attribute::required_string()
                .with_description("The name of the node to schedule the VM onto")
                .with_force_new(),
        )
        .with_attribute("name", Attribute::optional_string().with_description("The VM name"))
        .with_attribute(
            "memory",
            Attribute::required_int64().with_description("Memory allocation in MB"),
        )
        .with_attribute(
            "cpus",
            Attribute::required_int64().with_description("The number of cpus/cores to allocate"),
        )
        .with_attribute(
            "agent",
            Attribute::optional_bool().with_description("Enable the QEMU guest agent"),
        )
        .with_attribute(
            "fw_config",
            Attribute::optional_string().with_description("Additional arguments to pass to qemu"),
        )
        .with_attribute(
            "reboot",
            Attribute::optional_bool().with_description("Reboot on config change"),
        )
        .with_attribute(
            "serials",
            Attribute::new(AttributeType::list(AttributeType::String), AttributeFlags::optional())
                .with_description("A list (max 3) of serial devices on the guest"),
        )
        .with_list_limit("serials", MAX_SERIALS as u32)
        .with_block("ide", disk_block(DiskBus::Ide))
        .with_block("scsi", disk_block(DiskBus::Scsi))
        .with_block("network", network_block())
}
