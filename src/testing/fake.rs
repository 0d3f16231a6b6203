//! An in-memory Proxmox backend.
//!
//! [`FakeProxmox`] behaves enough like a single-cluster PVE API for the
//! resources to run their full lifecycles: VM configs are stored per
//! `(node, vmid)`, allocation directives such as `local-lvm:10` become
//! volume ids, `delete` directives remove keys, and every mutating call
//! hands back a task that can be scripted. Every call is recorded by name.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};

use crate::client::models::{
    CreateVm, DiskBus, DiskRecord, DownloadUrlRequest, HaResource, NetRecord, TaskHandle,
    TaskStatus, UpdateVmConfig, VmConfig,
};
use crate::client::ProxmoxApi;
use crate::error::ApiError;
use crate::tasks::EXIT_OK;

#[derive(Debug)]
struct ScriptedTask {
    running_polls: usize,
    exit: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<String>,
    failures: HashMap<String, ApiError>,
    task_status_failure: Option<ApiError>,
    task_exit: Option<String>,
    stall_tasks: bool,
    scripted: HashMap<String, ScriptedTask>,
    polls: HashMap<String, usize>,
    next_task: u32,

    vms: BTreeMap<(String, u32), VmConfig>,
    ignore_disks: bool,
    create_requests: Vec<CreateVm>,
    update_requests: Vec<UpdateVmConfig>,
    delete_requests: Vec<(String, u32, bool)>,
    reboots: Vec<(String, u32, u32)>,

    downloads: Vec<DownloadUrlRequest>,
    volumes: BTreeSet<(String, String)>,

    ha: BTreeMap<String, HaResource>,

    paths: HashMap<String, Value>,
    get_requests: Vec<(String, Vec<(String, String)>)>,
}

impl State {
    /// Record a call and return its scripted failure, if any.
    fn enter(&mut self, op: &str) -> Result<(), ApiError> {
        self.calls.push(op.to_string());
        match self.failures.remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn task(&mut self, node: &str, kind: &str) -> TaskHandle {
        self.next_task += 1;
        TaskHandle::new(node, format!("UPID:{}:{:08X}:{}:", node, self.next_task, kind))
    }
}

fn vm_missing(node: &str, vmid: u32) -> ApiError {
    ApiError::status(
        500,
        format!("Configuration file 'nodes/{}/qemu-server/{}.conf' does not exist", node, vmid),
    )
}

fn put_slot<T>(slots: &mut Vec<Option<T>>, index: usize, value: Option<T>) {
    if slots.len() <= index {
        slots.resize_with(index + 1, || None);
    }
    slots[index] = value;
}

fn trim_gaps<T>(slots: &mut Vec<Option<T>>) {
    while matches!(slots.last(), Some(None)) {
        slots.pop();
    }
}

/// Turn `{storage}:{size}` into the first free `vm-{vmid}-disk-{n}` volume,
/// as the storage layer does.
fn allocate(record: &DiskRecord, vmid: u32, used: &mut BTreeSet<String>) -> DiskRecord {
    let mut record = record.clone();
    let Some((storage, size)) = record.file.split_once(':') else {
        return record;
    };
    if size.parse::<u64>().is_err() {
        return record;
    }
    let file = (0..)
        .map(|n| format!("{}:vm-{}-disk-{}", storage, vmid, n))
        .find(|file| !used.contains(file))
        .unwrap_or_default();
    used.insert(file.clone());
    record.file = file;
    record.import_from = None;
    record
}

fn volumes_in_use(config: &VmConfig) -> BTreeSet<String> {
    DiskBus::ALL
        .iter()
        .flat_map(|bus| config.disks(*bus).iter().flatten())
        .map(|record| record.file.clone())
        .collect()
}

fn with_mac(net: &NetRecord, index: usize, vmid: u32) -> NetRecord {
    let mut net = net.clone();
    if net.macaddr.is_none() {
        net.macaddr = Some(format!(
            "BC:24:11:{:02X}:{:02X}:{:02X}",
            (vmid >> 8) & 0xff,
            vmid & 0xff,
            index
        ));
    }
    net
}

fn apply_delete(config: &mut VmConfig, token: &str) {
    match token {
        "name" => config.name = None,
        "args" => config.args = None,
        "agent" => config.agent = None,
        _ => {
            let split = token.find(|c: char| c.is_ascii_digit()).unwrap_or(token.len());
            let (prefix, index) = token.split_at(split);
            let Ok(index) = index.parse::<usize>() else { return };
            match prefix {
                "ide" => put_slot(&mut config.ide, index, None),
                "scsi" => put_slot(&mut config.scsi, index, None),
                "net" => put_slot(&mut config.nets, index, None),
                "serial" => put_slot(&mut config.serials, index, None),
                _ => {},
            }
        },
    }
}

/// Scriptable in-memory [`ProxmoxApi`].
///
/// Failures set with [`fail_call`](Self::fail_call) fire once, on the next
/// call of that name. Unscripted tasks stop with `OK` on their first poll.
#[derive(Debug, Default)]
pub struct FakeProxmox {
    state: Mutex<State>,
}

impl FakeProxmox {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of every call made so far, failed ones included.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Make the next call of `op` (a [`ProxmoxApi`] method name) fail.
    pub fn fail_call(&self, op: &str, err: ApiError) {
        self.state().failures.insert(op.to_string(), err);
    }

    /// Make the next task status poll fail.
    pub fn fail_task_status(&self, err: ApiError) {
        self.state().task_status_failure = Some(err);
    }

    /// Stop every unscripted task with `exit` instead of `OK`.
    pub fn fail_tasks_with(&self, exit: &str) {
        self.state().task_exit = Some(exit.to_string());
    }

    /// Keep every unscripted task running forever.
    pub fn stall_tasks(&self) {
        self.state().stall_tasks = true;
    }

    /// Report `states` for the first polls of `upid`, then stop with `exit`.
    pub fn script_task(&self, upid: &str, states: &[&str], exit: &str) {
        let running_polls = states.iter().filter(|s| **s == "running").count();
        self.state().scripted.insert(
            upid.to_string(),
            ScriptedTask {
                running_polls,
                exit: Some(exit.to_string()),
            },
        );
    }

    /// Stop `upid` on its first poll without an exit status.
    pub fn script_task_without_exit(&self, upid: &str) {
        self.state().scripted.insert(
            upid.to_string(),
            ScriptedTask {
                running_polls: 0,
                exit: None,
            },
        );
    }

    /// How often `upid` was polled.
    pub fn task_polls(&self, upid: &str) -> usize {
        self.state().polls.get(upid).copied().unwrap_or_default()
    }

    /// Accept disk changes without applying them, so the next read comes
    /// back short.
    pub fn ignore_disks(&self) {
        self.state().ignore_disks = true;
    }

    /// Store a VM config as if it already existed.
    pub fn put_vm(&self, node: &str, vmid: u32, config: VmConfig) {
        self.state().vms.insert((node.to_string(), vmid), config);
    }

    /// The stored config of a VM.
    pub fn vm(&self, node: &str, vmid: u32) -> Option<VmConfig> {
        self.state().vms.get(&(node.to_string(), vmid)).cloned()
    }

    /// Every VM creation request received.
    pub fn create_requests(&self) -> Vec<CreateVm> {
        self.state().create_requests.clone()
    }

    /// Every config update request received.
    pub fn update_requests(&self) -> Vec<UpdateVmConfig> {
        self.state().update_requests.clone()
    }

    /// Every `(node, vmid, purge)` deletion request received.
    pub fn delete_requests(&self) -> Vec<(String, u32, bool)> {
        self.state().delete_requests.clone()
    }

    /// Every `(node, vmid, timeout)` reboot request received.
    pub fn reboots(&self) -> Vec<(String, u32, u32)> {
        self.state().reboots.clone()
    }

    /// Every download request received.
    pub fn download_requests(&self) -> Vec<DownloadUrlRequest> {
        self.state().downloads.clone()
    }

    /// Store an HA resource as if it already existed.
    pub fn put_ha_resource(&self, res: HaResource) {
        self.state().ha.insert(res.sid.clone(), res);
    }

    /// The stored HA resource `sid`.
    pub fn ha_resource(&self, sid: &str) -> Option<HaResource> {
        self.state().ha.get(sid).cloned()
    }

    /// Serve `value` for `GET` of `path`, e.g. `access/groups/admins`.
    pub fn put_path(&self, path: &str, value: Value) {
        self.state().paths.insert(path.to_string(), value);
    }

    /// Every `GET` received, as path and query pairs.
    pub fn get_requests(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.state().get_requests.clone()
    }
}

#[async_trait::async_trait]
impl ProxmoxApi for FakeProxmox {
    async fn task_status(&self, _node: &str, upid: &str) -> Result<TaskStatus, ApiError> {
        let mut state = self.state();
        state.calls.push("task_status".to_string());
        *state.polls.entry(upid.to_string()).or_default() += 1;
        if let Some(err) = state.task_status_failure.take() {
            return Err(err);
        }

        if let Some(script) = state.scripted.get_mut(upid) {
            if script.running_polls > 0 {
                script.running_polls -= 1;
                return Ok(TaskStatus::running());
            }
            return Ok(TaskStatus {
                status: "stopped".to_string(),
                exitstatus: script.exit.clone(),
            });
        }
        if state.stall_tasks {
            return Ok(TaskStatus::running());
        }
        Ok(TaskStatus::stopped(state.task_exit.clone().unwrap_or_else(|| EXIT_OK.to_string())))
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> Result<VmConfig, ApiError> {
        let mut state = self.state();
        state.enter("vm_config")?;
        state
            .vms
            .get(&(node.to_string(), vmid))
            .cloned()
            .ok_or_else(|| vm_missing(node, vmid))
    }

    async fn create_vm(&self, req: &CreateVm) -> Result<TaskHandle, ApiError> {
        let mut state = self.state();
        state.enter("create_vm")?;
        state.create_requests.push(req.clone());

        let key = (req.node.clone(), req.vmid);
        if state.vms.contains_key(&key) {
            return Err(ApiError::status(
                500,
                format!("VM {} already exists on node '{}'", req.vmid, req.node),
            ));
        }

        let mut config = VmConfig {
            memory: Some(req.memory),
            cores: Some(req.cores),
            name: req.name.clone(),
            args: req.args.clone(),
            agent: req.agent,
            serials: req.serials.clone(),
            nets: req
                .nets
                .iter()
                .enumerate()
                .map(|(i, net)| net.as_ref().map(|n| with_mac(n, i, req.vmid)))
                .collect(),
            ..Default::default()
        };
        if !state.ignore_disks {
            let mut used = BTreeSet::new();
            for bus in DiskBus::ALL {
                *config.disks_mut(bus) = req
                    .disks(bus)
                    .iter()
                    .map(|slot| slot.as_ref().map(|r| allocate(r, req.vmid, &mut used)))
                    .collect();
            }
        }
        state.vms.insert(key, config);
        Ok(state.task(&req.node, "qmcreate"))
    }

    async fn update_vm_config(&self, req: &UpdateVmConfig) -> Result<TaskHandle, ApiError> {
        let mut state = self.state();
        state.enter("update_vm_config")?;
        state.update_requests.push(req.clone());

        let key = (req.node.clone(), req.vmid);
        let ignore_disks = state.ignore_disks;
        let config = state
            .vms
            .get_mut(&key)
            .ok_or_else(|| vm_missing(&req.node, req.vmid))?;

        if let Some(memory) = req.memory {
            config.memory = Some(memory);
        }
        if let Some(cores) = req.cores {
            config.cores = Some(cores);
        }
        if let Some(name) = &req.name {
            config.name = Some(name.clone());
        }
        if let Some(args) = &req.args {
            config.args = Some(args.clone());
        }
        if let Some(agent) = req.agent {
            config.agent = Some(agent);
        }
        for (i, serial) in &req.serials {
            put_slot(&mut config.serials, *i, Some(serial.clone()));
        }
        for (i, net) in &req.nets {
            put_slot(&mut config.nets, *i, Some(with_mac(net, *i, req.vmid)));
        }
        if !ignore_disks {
            let mut used = volumes_in_use(config);
            for bus in DiskBus::ALL {
                for (i, record) in req.disks(bus) {
                    let record = allocate(record, req.vmid, &mut used);
                    put_slot(config.disks_mut(bus), *i, Some(record));
                }
            }
        }
        for token in req.delete.iter().flat_map(|d| d.split(',')) {
            apply_delete(config, token);
        }
        trim_gaps(&mut config.ide);
        trim_gaps(&mut config.scsi);
        trim_gaps(&mut config.nets);
        trim_gaps(&mut config.serials);

        Ok(state.task(&req.node, "qmconfig"))
    }

    async fn reboot_vm(
        &self,
        node: &str,
        vmid: u32,
        timeout_secs: u32,
    ) -> Result<TaskHandle, ApiError> {
        let mut state = self.state();
        state.enter("reboot_vm")?;
        if !state.vms.contains_key(&(node.to_string(), vmid)) {
            return Err(vm_missing(node, vmid));
        }
        state.reboots.push((node.to_string(), vmid, timeout_secs));
        Ok(state.task(node, "qmreboot"))
    }

    async fn delete_vm(&self, node: &str, vmid: u32, purge: bool) -> Result<TaskHandle, ApiError> {
        let mut state = self.state();
        state.enter("delete_vm")?;
        state.delete_requests.push((node.to_string(), vmid, purge));
        state
            .vms
            .remove(&(node.to_string(), vmid))
            .ok_or_else(|| vm_missing(node, vmid))?;
        Ok(state.task(node, "qmdestroy"))
    }

    async fn download_url(&self, req: &DownloadUrlRequest) -> Result<TaskHandle, ApiError> {
        let mut state = self.state();
        state.enter("download_url")?;
        state.downloads.push(req.clone());
        let volume = format!("{}:{}/{}", req.storage, req.content, req.filename);
        state.volumes.insert((req.node.clone(), volume));
        Ok(state.task(&req.node, "download"))
    }

    async fn find_content(
        &self,
        node: &str,
        storage: &str,
        volume: &str,
    ) -> Result<Value, ApiError> {
        let mut state = self.state();
        state.enter("find_content")?;
        if state.volumes.contains(&(node.to_string(), volume.to_string())) {
            Ok(json!({"volid": volume, "storage": storage}))
        } else {
            Err(ApiError::status(
                500,
                format!("volume_size_info on '{}' failed: no such volume", volume),
            ))
        }
    }

    async fn delete_content(
        &self,
        node: &str,
        _storage: &str,
        volume: &str,
    ) -> Result<TaskHandle, ApiError> {
        let mut state = self.state();
        state.enter("delete_content")?;
        if !state.volumes.remove(&(node.to_string(), volume.to_string())) {
            return Err(ApiError::status(500, format!("volume '{}' does not exist", volume)));
        }
        Ok(state.task(node, "imgdel"))
    }

    async fn create_ha_resource(&self, res: &HaResource) -> Result<(), ApiError> {
        let mut state = self.state();
        state.enter("create_ha_resource")?;
        if state.ha.contains_key(&res.sid) {
            return Err(ApiError::status(500, format!("resource ID '{}' already defined", res.sid)));
        }
        state.ha.insert(res.sid.clone(), res.clone());
        Ok(())
    }

    async fn update_ha_resource(&self, res: &HaResource) -> Result<(), ApiError> {
        let mut state = self.state();
        state.enter("update_ha_resource")?;
        match state.ha.get_mut(&res.sid) {
            Some(stored) => {
                *stored = res.clone();
                Ok(())
            },
            None => Err(ApiError::status(500, format!("no such resource '{}'", res.sid))),
        }
    }

    async fn find_ha_resource(&self, sid: &str) -> Result<HaResource, ApiError> {
        let mut state = self.state();
        state.enter("find_ha_resource")?;
        state
            .ha
            .get(sid)
            .cloned()
            .ok_or_else(|| ApiError::status(500, format!("no such resource '{}'", sid)))
    }

    async fn delete_ha_resource(&self, sid: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        state.enter("delete_ha_resource")?;
        state
            .ha
            .remove(sid)
            .map(|_| ())
            .ok_or_else(|| ApiError::status(500, format!("no such resource '{}'", sid)))
    }

    async fn get(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Value, ApiError> {
        let mut state = self.state();
        state.enter("get")?;
        let path = segments.join("/");
        state.get_requests.push((
            path.clone(),
            query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        ));
        state
            .paths
            .get(&path)
            .cloned()
            .ok_or_else(|| ApiError::status(500, format!("no such path '{}'", path)))
    }
}
