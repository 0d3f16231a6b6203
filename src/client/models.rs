//! Wire models for the Proxmox API.
//!
//! VM configuration is flat on the wire: every device is its own key
//! (`scsi0`, `net1`, `serial2`) holding a property string. [`VmConfig`]
//! gathers those keys back into positional, gap-preserving slot vectors.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::client::property::{format_bool, parse_bool, PropertyString};
use crate::error::ApiError;

/// Media kind for CD-ROM attachments.
pub const MEDIA_CDROM: &str = "cdrom";
/// The only network model this provider creates.
pub const NET_MODEL_VIRTIO: &str = "virtio";

const NET_MODELS: &[&str] = &["virtio", "e1000", "e1000e", "rtl8139", "vmxnet3"];

/// Handle for an asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    /// The task's UPID.
    pub upid: String,
    /// Node the task runs on.
    pub node: String,
}

impl TaskHandle {
    /// Create a handle.
    pub fn new(node: impl Into<String>, upid: impl Into<String>) -> Self {
        Self {
            upid: upid.into(),
            node: node.into(),
        }
    }
}

/// `GET /nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TaskStatus {
    /// `running` while in flight.
    pub status: String,
    /// Set once the task stopped; `OK` on success.
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    /// A task still in flight.
    pub fn running() -> Self {
        Self {
            status: "running".to_string(),
            exitstatus: None,
        }
    }

    /// A stopped task with the given exit status.
    pub fn stopped(exit: impl Into<String>) -> Self {
        Self {
            status: "stopped".to_string(),
            exitstatus: Some(exit.into()),
        }
    }

    /// Whether the task is still in flight.
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Disk controller family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiskBus {
    /// IDE, four slots.
    Ide,
    /// SCSI, thirty-one slots.
    Scsi,
}

impl DiskBus {
    /// Every bus, in the order deletions are emitted.
    pub const ALL: [DiskBus; 2] = [DiskBus::Ide, DiskBus::Scsi];

    /// Config key prefix and schema block name.
    pub fn prefix(self) -> &'static str {
        match self {
            DiskBus::Ide => "ide",
            DiskBus::Scsi => "scsi",
        }
    }

    /// Number of device slots on this bus.
    pub fn max_slots(self) -> usize {
        match self {
            DiskBus::Ide => 4,
            DiskBus::Scsi => 31,
        }
    }

    /// Config key for slot `index`.
    pub fn key(self, index: usize) -> String {
        format!("{}{}", self.prefix(), index)
    }
}

impl fmt::Display for DiskBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A disk attachment as the API sees it, for either bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskRecord {
    /// Volume id, `{storage}:{size}` allocation directive, or device path.
    pub file: String,
    /// `cdrom` or `disk`.
    pub media: Option<String>,
    /// Volume to import from on creation.
    pub import_from: Option<String>,
    /// Snapshot (read-only) mode.
    pub snapshot: Option<bool>,
    /// Include in backups.
    pub backup: Option<bool>,
}

impl DiskRecord {
    /// A record for `file` with nothing else set.
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ..Default::default()
        }
    }

    /// Parse the property string of a disk key. Records without a file are
    /// not disks and yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let props = PropertyString::parse(value, "file");
        let file = props.default_value()?.to_string();
        Some(Self {
            file,
            media: props.get("media").map(str::to_string),
            import_from: props.get("import-from").map(str::to_string),
            snapshot: props.get_bool("snapshot"),
            backup: props.get_bool("backup"),
        })
    }

    /// Render as a property string.
    pub fn to_property_string(&self) -> String {
        PropertyString::new()
            .with_default(self.file.clone())
            .with_opt("media", self.media.clone())
            .with_opt("import-from", self.import_from.clone())
            .with_bool("snapshot", self.snapshot)
            .with_bool("backup", self.backup)
            .to_string()
    }
}

/// A network interface as the API sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetRecord {
    /// NIC model, e.g. `virtio`.
    pub model: Option<String>,
    /// MAC address, assigned by the backend when not supplied.
    pub macaddr: Option<String>,
    /// Host bridge.
    pub bridge: Option<String>,
    /// Proxmox firewall enabled.
    pub firewall: Option<bool>,
}

impl NetRecord {
    /// Parse the property string of a `netN` key.
    pub fn parse(value: &str) -> Self {
        let props = PropertyString::parse(value, "model");
        let mut record = Self {
            model: props.default_value().map(str::to_string),
            macaddr: props.get("macaddr").map(str::to_string),
            bridge: props.get("bridge").map(str::to_string),
            firewall: props.get_bool("firewall"),
        };
        if let Some((model, mac)) = props.pairs().find(|(k, _)| NET_MODELS.contains(k)) {
            record.model = Some(model.to_string());
            if !mac.is_empty() {
                record.macaddr = Some(mac.to_string());
            }
        }
        record
    }

    /// Render as a property string.
    pub fn to_property_string(&self) -> String {
        let model = self.model.as_deref().unwrap_or(NET_MODEL_VIRTIO);
        PropertyString::new()
            .with(model, self.macaddr.clone().unwrap_or_default())
            .with_opt("bridge", self.bridge.clone())
            .with_bool("firewall", self.firewall)
            .to_string()
    }
}

/// `GET /nodes/{node}/qemu/{vmid}/config`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmConfig {
    /// Memory in MB.
    pub memory: Option<u64>,
    /// Core count.
    pub cores: Option<u64>,
    /// VM name.
    pub name: Option<String>,
    /// Extra QEMU arguments.
    pub args: Option<String>,
    /// Guest agent enabled.
    pub agent: Option<bool>,
    /// IDE slots; `None` marks a gap.
    pub ide: Vec<Option<DiskRecord>>,
    /// SCSI slots; `None` marks a gap.
    pub scsi: Vec<Option<DiskRecord>>,
    /// Network slots; `None` marks a gap.
    pub nets: Vec<Option<NetRecord>>,
    /// Serial devices; `None` marks a gap.
    pub serials: Vec<Option<String>>,
}

impl VmConfig {
    /// Build from the flat key/value map the API returns.
    pub fn from_api(map: &Map<String, Value>) -> Result<Self, ApiError> {
        let mut config = Self {
            memory: lenient_u64(map.get("memory"), "memory")?,
            cores: lenient_u64(map.get("cores"), "cores")?,
            name: map.get("name").and_then(Value::as_str).map(str::to_string),
            args: map.get("args").and_then(Value::as_str).map(str::to_string),
            agent: map.get("agent").and_then(agent_enabled),
            ..Default::default()
        };

        for (key, value) in map {
            let Some(text) = value.as_str() else { continue };
            if let Some(index) = slot_index(key, "ide") {
                put_slot(&mut config.ide, index, DiskRecord::parse(text));
            } else if let Some(index) = slot_index(key, "scsi") {
                put_slot(&mut config.scsi, index, DiskRecord::parse(text));
            } else if let Some(index) = slot_index(key, "net") {
                put_slot(&mut config.nets, index, Some(NetRecord::parse(text)));
            } else if let Some(index) = slot_index(key, "serial") {
                put_slot(&mut config.serials, index, Some(text.to_string()));
            }
        }
        Ok(config)
    }

    /// Disk slots for `bus`.
    pub fn disks(&self, bus: DiskBus) -> &[Option<DiskRecord>] {
        match bus {
            DiskBus::Ide => &self.ide,
            DiskBus::Scsi => &self.scsi,
        }
    }

    /// Mutable disk slots for `bus`.
    pub fn disks_mut(&mut self, bus: DiskBus) -> &mut Vec<Option<DiskRecord>> {
        match bus {
            DiskBus::Ide => &mut self.ide,
            DiskBus::Scsi => &mut self.scsi,
        }
    }
}

fn slot_index(key: &str, prefix: &str) -> Option<usize> {
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

fn put_slot<T>(slots: &mut Vec<Option<T>>, index: usize, value: Option<T>) {
    if slots.len() <= index {
        slots.resize_with(index + 1, || None);
    }
    slots[index] = value;
}

fn lenient_u64(value: Option<&Value>, field: &str) -> Result<Option<u64>, ApiError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| {
                ApiError::Decode(format!("{} is not an unsigned integer: {}", field, n))
            }),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| {
                ApiError::Decode(format!("{} is not an unsigned integer: {:?}", field, s))
            }),
        Some(other) => Err(ApiError::Decode(format!("unexpected {} value: {}", field, other))),
    }
}

fn agent_enabled(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_u64().map(|n| n != 0),
        Value::String(s) => {
            let props = PropertyString::parse(s, "enabled");
            props.default_value().and_then(parse_bool)
        },
        _ => None,
    }
}

/// Form parameters for a request body.
pub type Params = Vec<(String, String)>;

/// `POST /nodes/{node}/qemu`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateVm {
    /// Target node.
    pub node: String,
    /// VM id.
    pub vmid: u32,
    /// Memory in MB.
    pub memory: u64,
    /// Core count.
    pub cores: u64,
    /// VM name.
    pub name: Option<String>,
    /// Guest agent enabled.
    pub agent: Option<bool>,
    /// Extra QEMU arguments.
    pub args: Option<String>,
    /// Serial devices, positional.
    pub serials: Vec<Option<String>>,
    /// IDE disks, positional.
    pub ide: Vec<Option<DiskRecord>>,
    /// SCSI disks, positional.
    pub scsi: Vec<Option<DiskRecord>>,
    /// Network interfaces, positional.
    pub nets: Vec<Option<NetRecord>>,
}

impl CreateVm {
    /// Disk slots for `bus`.
    pub fn disks(&self, bus: DiskBus) -> &[Option<DiskRecord>] {
        match bus {
            DiskBus::Ide => &self.ide,
            DiskBus::Scsi => &self.scsi,
        }
    }

    /// Mutable disk slots for `bus`.
    pub fn disks_mut(&mut self, bus: DiskBus) -> &mut Vec<Option<DiskRecord>> {
        match bus {
            DiskBus::Ide => &mut self.ide,
            DiskBus::Scsi => &mut self.scsi,
        }
    }

    /// Encode as form parameters.
    pub fn to_params(&self) -> Params {
        let mut params = vec![
            ("vmid".to_string(), self.vmid.to_string()),
            ("memory".to_string(), self.memory.to_string()),
            ("cores".to_string(), self.cores.to_string()),
        ];
        push_common(&mut params, &self.name, &self.args, self.agent);
        push_positional(&mut params, "serial", &self.serials, |s| s.clone());
        for bus in DiskBus::ALL {
            push_positional(
                &mut params,
                bus.prefix(),
                self.disks(bus),
                DiskRecord::to_property_string,
            );
        }
        push_positional(&mut params, "net", &self.nets, NetRecord::to_property_string);
        params
    }
}

/// `POST /nodes/{node}/qemu/{vmid}/config`.
///
/// Only fields that changed are set; device maps are keyed by slot index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateVmConfig {
    /// Target node.
    pub node: String,
    /// VM id.
    pub vmid: u32,
    /// Memory in MB.
    pub memory: Option<u64>,
    /// Core count.
    pub cores: Option<u64>,
    /// VM name.
    pub name: Option<String>,
    /// Extra QEMU arguments.
    pub args: Option<String>,
    /// Guest agent enabled.
    pub agent: Option<bool>,
    /// Changed IDE slots.
    pub ide: BTreeMap<usize, DiskRecord>,
    /// Changed SCSI slots.
    pub scsi: BTreeMap<usize, DiskRecord>,
    /// Changed network slots.
    pub nets: BTreeMap<usize, NetRecord>,
    /// Changed serial slots.
    pub serials: BTreeMap<usize, String>,
    /// Comma joined device keys to remove, e.g. `scsi1,net2`.
    pub delete: Option<String>,
}

impl UpdateVmConfig {
    /// An update for the given VM with nothing set.
    pub fn new(node: impl Into<String>, vmid: u32) -> Self {
        Self {
            node: node.into(),
            vmid,
            ..Default::default()
        }
    }

    /// Changed slots for `bus`.
    pub fn disks(&self, bus: DiskBus) -> &BTreeMap<usize, DiskRecord> {
        match bus {
            DiskBus::Ide => &self.ide,
            DiskBus::Scsi => &self.scsi,
        }
    }

    /// Mutable changed slots for `bus`.
    pub fn disks_mut(&mut self, bus: DiskBus) -> &mut BTreeMap<usize, DiskRecord> {
        match bus {
            DiskBus::Ide => &mut self.ide,
            DiskBus::Scsi => &mut self.scsi,
        }
    }

    /// Whether submitting this would change nothing.
    pub fn is_empty(&self) -> bool {
        self.memory.is_none()
            && self.cores.is_none()
            && self.name.is_none()
            && self.args.is_none()
            && self.agent.is_none()
            && self.ide.is_empty()
            && self.scsi.is_empty()
            && self.nets.is_empty()
            && self.serials.is_empty()
            && self.delete.is_none()
    }

    /// Encode as form parameters.
    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        if let Some(memory) = self.memory {
            params.push(("memory".to_string(), memory.to_string()));
        }
        if let Some(cores) = self.cores {
            params.push(("cores".to_string(), cores.to_string()));
        }
        push_common(&mut params, &self.name, &self.args, self.agent);
        for (i, serial) in &self.serials {
            params.push((format!("serial{}", i), serial.clone()));
        }
        for bus in DiskBus::ALL {
            for (i, disk) in self.disks(bus) {
                params.push((bus.key(*i), disk.to_property_string()));
            }
        }
        for (i, net) in &self.nets {
            params.push((format!("net{}", i), net.to_property_string()));
        }
        if let Some(delete) = &self.delete {
            params.push(("delete".to_string(), delete.clone()));
        }
        params
    }
}

fn push_common(
    params: &mut Params,
    name: &Option<String>,
    args: &Option<String>,
    agent: Option<bool>,
) {
    if let Some(name) = name {
        params.push(("name".to_string(), name.clone()));
    }
    if let Some(args) = args {
        params.push(("args".to_string(), args.clone()));
    }
    if let Some(agent) = agent {
        params.push(("agent".to_string(), format_bool(agent).to_string()));
    }
}

fn push_positional<T>(
    params: &mut Params,
    prefix: &str,
    slots: &[Option<T>],
    encode: impl Fn(&T) -> String,
) {
    for (i, slot) in slots.iter().enumerate() {
        if let Some(item) = slot {
            params.push((format!("{}{}", prefix, i), encode(item)));
        }
    }
}

/// `POST /nodes/{node}/storage/{storage}/download-url`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadUrlRequest {
    /// Target node.
    pub node: String,
    /// Target storage.
    pub storage: String,
    /// Content type, `iso`.
    pub content: String,
    /// File name in the storage.
    pub filename: String,
    /// Source URL.
    pub url: String,
    /// Expected checksum.
    pub checksum: Option<String>,
    /// Checksum algorithm, e.g. `sha256`.
    pub checksum_algorithm: Option<String>,
}

impl DownloadUrlRequest {
    /// Encode as form parameters.
    pub fn to_params(&self) -> Params {
        let mut params = vec![
            ("content".to_string(), self.content.clone()),
            ("filename".to_string(), self.filename.clone()),
            ("url".to_string(), self.url.clone()),
        ];
        if let Some(checksum) = &self.checksum {
            params.push(("checksum".to_string(), checksum.clone()));
        }
        if let Some(algorithm) = &self.checksum_algorithm {
            params.push(("checksum-algorithm".to_string(), algorithm.clone()));
        }
        params
    }
}

/// `/cluster/ha/resources/{sid}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct HaResource {
    /// Resource id, e.g. `vm:101`.
    pub sid: String,
    /// Free-form comment.
    #[serde(default)]
    pub comment: Option<String>,
    /// HA group.
    #[serde(default)]
    pub group: Option<String>,
    /// Relocation attempts.
    #[serde(default, deserialize_with = "lenient_i64")]
    pub max_relocate: Option<i64>,
    /// Restart attempts.
    #[serde(default, deserialize_with = "lenient_i64")]
    pub max_restart: Option<i64>,
    /// Requested state, e.g. `started`.
    #[serde(default)]
    pub state: Option<String>,
}

impl HaResource {
    /// Encode as form parameters. `sid` is only sent on creation; updates
    /// address it through the path.
    pub fn to_params(&self, include_sid: bool) -> Params {
        let mut params = Params::new();
        if include_sid {
            params.push(("sid".to_string(), self.sid.clone()));
        }
        let fields = [
            ("comment", self.comment.clone()),
            ("group", self.group.clone()),
            ("max_relocate", self.max_relocate.map(|v| v.to_string())),
            ("max_restart", self.max_restart.map(|v| v.to_string())),
            ("state", self.state.clone()),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                params.push((key.to_string(), value));
            }
        }
        params
    }
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_i64()),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!("expected integer, got {}", other))),
    }
}
