//! VM convergence.
//!
//! Create and update submit a request, wait for its task, then re-read the
//! configuration so every declared disk learns the volume id the backend
//! gave it. Updates are partial: only changed scalars and changed slot
//! indices are sent, and shrinking a slot list names the dropped devices in
//! a single `delete` directive.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{disk, network, VmModel, FW_CFG_PREFIX};
use crate::client::models::{CreateVm, DiskBus, DiskRecord, UpdateVmConfig, VmConfig};
use crate::client::ProxmoxApi;
use crate::error::ProviderError;
use crate::resources::{from_state, to_state, Resource};
use crate::tasks::TaskWaiter;

/// Seconds the guest gets to shut down during a reboot.
pub const REBOOT_TIMEOUT_SECS: u32 = 300;

const IMPORT_FORMAT: &str = "node/vmid";

/// Lifecycle of `proxmox_node_virtual_machine`.
#[derive(Clone)]
pub struct VmResource {
    waiter: TaskWaiter,
}

impl VmResource {
    /// Create the resource around a task waiter and the client it polls.
    pub fn new(waiter: TaskWaiter) -> Self {
        Self { waiter }
    }

    fn api(&self) -> &dyn ProxmoxApi {
        self.waiter.api().as_ref()
    }

    /// Build the creation request for `model`.
    pub fn create_request(model: &VmModel) -> Result<CreateVm, ProviderError> {
        let mut req = CreateVm {
            node: model.node.clone(),
            vmid: model.id,
            memory: model.memory,
            cores: model.cpus,
            name: model.name.clone(),
            agent: model.agent,
            args: model.qemu_args(),
            serials: model.serials.clone(),
            nets: model
                .network
                .iter()
                .map(|slot| slot.as_ref().map(network::encode))
                .collect(),
            ..Default::default()
        };
        for bus in DiskBus::ALL {
            *req.disks_mut(bus) = model
                .disks(bus)
                .iter()
                .enumerate()
                .map(|(i, slot)| slot.as_ref().map(|s| encode_disk(bus, i, s)).transpose())
                .collect::<Result<Vec<_>, _>>()?;
        }
        Ok(req)
    }

    /// Build the partial update that takes `prior` to `planned`.
    ///
    /// Unchanged scalars and slots are left out. Slots that held a device
    /// and no longer do, whether emptied in place or cut off the end of a
    /// shrunken list, become `delete` tokens, ordered ide, scsi, net, serial.
    pub fn update_request(
        prior: &VmModel,
        planned: &VmModel,
    ) -> Result<UpdateVmConfig, ProviderError> {
        let mut req = UpdateVmConfig::new(&planned.node, planned.id);
        let mut delete = Vec::new();

        if planned.memory != prior.memory {
            req.memory = Some(planned.memory);
        }
        if planned.cpus != prior.cpus {
            req.cores = Some(planned.cpus);
        }

        for bus in DiskBus::ALL {
            let (changed, removed) = diff_slots(prior.disks(bus), planned.disks(bus));
            for (i, slot) in changed {
                req.disks_mut(bus).insert(i, encode_disk(bus, i, slot)?);
            }
            delete.extend(removed.into_iter().map(|i| bus.key(i)));
        }

        let (changed, removed) = diff_slots(&prior.network, &planned.network);
        req.nets = changed
            .into_iter()
            .map(|(i, slot)| (i, network::encode(slot)))
            .collect();
        delete.extend(removed.into_iter().map(|i| format!("net{}", i)));

        let (changed, removed) = diff_slots(&prior.serials, &planned.serials);
        req.serials = changed.into_iter().map(|(i, s)| (i, s.clone())).collect::<BTreeMap<_, _>>();
        delete.extend(removed.into_iter().map(|i| format!("serial{}", i)));

        if planned.name != prior.name {
            match &planned.name {
                Some(name) => req.name = Some(name.clone()),
                None => delete.push("name".to_string()),
            }
        }
        let (planned_args, prior_args) = (planned.qemu_args(), prior.qemu_args());
        if planned_args != prior_args {
            match planned_args {
                Some(args) => req.args = Some(args),
                None => delete.push("args".to_string()),
            }
        }
        if planned.agent != prior.agent {
            match planned.agent {
                Some(agent) => req.agent = Some(agent),
                None => delete.push("agent".to_string()),
            }
        }

        if !delete.is_empty() {
            req.delete = Some(delete.join(","));
        }
        Ok(req)
    }

    /// Create the VM and return `planned` with volume ids filled in.
    #[instrument(skip(self, planned), fields(node = %planned.node, vmid = planned.id))]
    pub async fn create_vm(&self, mut planned: VmModel) -> Result<VmModel, ProviderError> {
        let req = Self::create_request(&planned)?;
        let task = self
            .api()
            .create_vm(&req)
            .await
            .map_err(|e| ProviderError::api("Error creating VM", e))?;
        self.waiter
            .wait(&task)
            .await
            .map_err(|e| ProviderError::task("Error creating VM", e))?;

        self.backfill_volume_ids(&mut planned).await?;
        info!("VM created");
        Ok(planned)
    }

    /// Refresh `state` from the backend. `None` means the VM is gone.
    #[instrument(skip(self, state), fields(node = %state.node, vmid = state.id))]
    pub async fn read_vm(&self, mut state: VmModel) -> Result<Option<VmModel>, ProviderError> {
        let config = match self.api().vm_config(&state.node, state.id).await {
            Ok(config) => config,
            Err(e) => {
                let err = ProviderError::api("Error getting VM config", e);
                if err.is_missing_vm(&state.node, state.id) {
                    warn!("VM no longer exists, dropping from state");
                    return Ok(None);
                }
                return Err(err);
            },
        };

        apply_config(&mut state, &config)?;
        Ok(Some(state))
    }

    /// Converge from `prior` to `planned`, rebooting afterwards when asked.
    #[instrument(skip(self, prior, planned), fields(node = %planned.node, vmid = planned.id))]
    pub async fn update_vm(
        &self,
        prior: &VmModel,
        mut planned: VmModel,
    ) -> Result<VmModel, ProviderError> {
        let req = Self::update_request(prior, &planned)?;
        if req.is_empty() {
            debug!("nothing to change");
        } else {
            debug!(delete = ?req.delete, "submitting config update");
            let task = self
                .api()
                .update_vm_config(&req)
                .await
                .map_err(|e| ProviderError::api("Error updating VM", e))?;
            self.waiter
                .wait(&task)
                .await
                .map_err(|e| ProviderError::task("Error updating VM", e))?;

            if planned.reboot == Some(true) {
                let task = self
                    .api()
                    .reboot_vm(&planned.node, planned.id, REBOOT_TIMEOUT_SECS)
                    .await
                    .map_err(|e| ProviderError::api("Error rebooting VM", e))?;
                self.waiter
                    .wait(&task)
                    .await
                    .map_err(|e| ProviderError::task("Error rebooting VM", e))?;
                info!("VM rebooted");
            }
        }

        self.backfill_volume_ids(&mut planned).await?;
        Ok(planned)
    }

    /// Destroy the VM and its disks. A VM that is already gone is not an
    /// error.
    #[instrument(skip(self, state), fields(node = %state.node, vmid = state.id))]
    pub async fn delete_vm(&self, state: &VmModel) -> Result<(), ProviderError> {
        let task = match self.api().delete_vm(&state.node, state.id, true).await {
            Ok(task) => task,
            Err(e) => {
                let err = ProviderError::api("Error deleting VM", e);
                if err.is_missing_vm(&state.node, state.id) {
                    debug!("VM already gone");
                    return Ok(());
                }
                return Err(err);
            },
        };
        self.waiter
            .wait(&task)
            .await
            .map_err(|e| ProviderError::task("Error deleting VM", e))
    }

    /// Import from `node/vmid`.
    pub async fn import_vm(&self, id: &str) -> Result<VmModel, ProviderError> {
        let invalid = || ProviderError::InvalidImportId {
            expected: IMPORT_FORMAT,
            got: id.to_string(),
        };
        let (node, vmid) = id.split_once('/').ok_or_else(invalid)?;
        if node.is_empty() || vmid.contains('/') {
            return Err(invalid());
        }
        let vmid: u32 = vmid.parse().map_err(|_| invalid())?;

        let seed = VmModel {
            id: vmid,
            node: node.to_string(),
            ..Default::default()
        };
        self.read_vm(seed)
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("VM {} on node {}", vmid, node)))
    }

    /// Re-read the configuration and record each declared disk's volume id.
    async fn backfill_volume_ids(&self, model: &mut VmModel) -> Result<(), ProviderError> {
        let config = self
            .api()
            .vm_config(&model.node, model.id)
            .await
            .map_err(|e| ProviderError::api("Error getting VM config", e))?;

        for bus in DiskBus::ALL {
            let observed = config.disks(bus);
            for (i, slot) in model.disks_mut(bus).iter_mut().enumerate() {
                let Some(slot) = slot else { continue };
                match observed.get(i) {
                    Some(Some(record)) => slot.volume_id = Some(record.file.clone()),
                    _ => {
                        return Err(ProviderError::Consistency(format!(
                            "Not enough disks: {} has no {} device after the task completed",
                            model.id,
                            bus.key(i)
                        )))
                    },
                }
            }
        }
        Ok(())
    }
}

/// Fold a fetched configuration into `state`.
fn apply_config(state: &mut VmModel, config: &VmConfig) -> Result<(), ProviderError> {
    let (Some(memory), Some(cores)) = (config.memory, config.cores) else {
        return Err(ProviderError::Consistency(
            "Memory or cores missing from VM config".to_string(),
        ));
    };
    state.memory = memory;
    state.cpus = cores;
    state.name = config.name.clone();
    state.agent = disk::merge_flag(state.agent, config.agent);

    if let Some(fw_config) = config.args.as_deref().and_then(|a| a.strip_prefix(FW_CFG_PREFIX)) {
        state.fw_config = Some(fw_config.to_string());
    }

    for bus in DiskBus::ALL {
        disk::merge_disks(state.disks_mut(bus), config.disks(bus));
    }
    network::merge_networks(&mut state.network, &config.nets);
    state.serials = config.serials.clone();
    Ok(())
}

fn encode_disk(
    bus: DiskBus,
    index: usize,
    slot: &super::DiskSlot,
) -> Result<DiskRecord, ProviderError> {
    disk::encode(slot).ok_or_else(|| {
        ProviderError::Validation(format!(
            "{} needs one of content, size_gb or import_from",
            bus.key(index)
        ))
    })
}

/// Indices whose slot differs from `prior`, plus every index that holds a
/// device in `prior` but none in `planned`, gaps and truncated tails alike.
fn diff_slots<'a, T: PartialEq>(
    prior: &[Option<T>],
    planned: &'a [Option<T>],
) -> (Vec<(usize, &'a T)>, Vec<usize>) {
    let changed = planned
        .iter()
        .enumerate()
        .filter_map(|(i, slot)| {
            let slot = slot.as_ref()?;
            let before = prior.get(i).and_then(Option::as_ref);
            (before != Some(slot)).then_some((i, slot))
        })
        .collect();
    let removed = prior
        .iter()
        .enumerate()
        .filter(|(i, slot)| slot.is_some() && planned.get(*i).map_or(true, Option::is_none))
        .map(|(i, _)| i)
        .collect();
    (changed, removed)
}

#[async_trait::async_trait]
impl Resource for VmResource {
    fn lock_key(&self, state: &Value) -> String {
        format!(
            "vm/{}/{}",
            state.get("node").and_then(Value::as_str).unwrap_or_default(),
            state.get("id").and_then(Value::as_u64).unwrap_or_default()
        )
    }

    async fn create(&self, planned: Value) -> Result<Value, ProviderError> {
        let model = self.create_vm(from_state(planned)?).await?;
        to_state(&model)
    }

    async fn read(&self, state: Value) -> Result<Value, ProviderError> {
        match self.read_vm(from_state(state)?).await? {
            Some(model) => to_state(&model),
            None => Ok(Value::Null),
        }
    }

    async fn update(&self, prior: Value, planned: Value) -> Result<Value, ProviderError> {
        let prior: VmModel = from_state(prior)?;
        let model = self.update_vm(&prior, from_state(planned)?).await?;
        to_state(&model)
    }

    async fn delete(&self, state: Value) -> Result<(), ProviderError> {
        self.delete_vm(&from_state(state)?).await
    }

    async fn import(&self, id: &str) -> Result<Value, ProviderError> {
        to_state(&self.import_vm(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::client::models::NetRecord;
    use crate::error::ApiError;
    use crate::resources::vm::{DiskSlot, NetworkSlot};
    use crate::testing::FakeProxmox;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn resource(fake: &Arc<FakeProxmox>) -> VmResource {
        VmResource::new(TaskWaiter::new(fake.clone()).with_poll_interval(Duration::from_millis(1)))
    }

    fn sized(storage: &str, size: u64) -> Option<DiskSlot> {
        Some(DiskSlot {
            storage: Some(storage.to_string()),
            size_gb: Some(size),
            ..Default::default()
        })
    }

    fn vm() -> VmModel {
        VmModel {
            id: 100,
            node: "pve".to_string(),
            memory: 2048,
            cpus: 2,
            scsi: vec![sized("local-lvm", 10)],
            network: vec![Some(NetworkSlot {
                bridge: "vmbr0".to_string(),
                firewall: true,
            })],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_submits_and_backfills_volume_id() {
        let fake = Arc::new(FakeProxmox::new());
        let created = assert_ok!(resource(&fake).create_vm(vm()).await);

        let requests = fake.create_requests();
        assert_eq!(requests.len(), 1);
        let req = &requests[0];
        assert_eq!(req.scsi[0].as_ref().unwrap().file, "local-lvm:10");
        assert_eq!(
            req.nets[0],
            Some(NetRecord {
                model: Some("virtio".to_string()),
                macaddr: None,
                bridge: Some("vmbr0".to_string()),
                firewall: Some(true),
            })
        );

        let slot = created.scsi[0].as_ref().unwrap();
        assert_eq!(slot.volume_id.as_deref(), Some("local-lvm:vm-100-disk-0"));
        assert_eq!(slot.size_gb, Some(10));
    }

    #[tokio::test]
    async fn test_create_encodes_gaps_and_scalars() {
        let fake = Arc::new(FakeProxmox::new());
        let mut model = vm();
        model.name = Some("web".to_string());
        model.agent = Some(true);
        model.fw_config = Some("name=opt/x,string=y".to_string());
        model.serials = vec![Some("socket".to_string())];
        model.scsi = vec![None, sized("local-lvm", 4)];

        let created = assert_ok!(resource(&fake).create_vm(model).await);
        let req = &fake.create_requests()[0];
        assert!(req.scsi[0].is_none());
        assert_eq!(req.args.as_deref(), Some("-fw_cfg name=opt/x,string=y"));

        let params = req.to_params();
        assert!(params.contains(&("scsi1".to_string(), "local-lvm:4".to_string())));
        assert!(!params.iter().any(|(k, _)| k == "scsi0"));
        assert!(params.contains(&("serial0".to_string(), "socket".to_string())));
        assert!(params.contains(&("agent".to_string(), "1".to_string())));

        assert!(created.scsi[0].is_none());
        assert!(created.scsi[1].as_ref().unwrap().volume_id.is_some());
    }

    #[tokio::test]
    async fn test_create_rejects_empty_disk() {
        let fake = Arc::new(FakeProxmox::new());
        let mut model = vm();
        model.ide = vec![Some(DiskSlot::default())];

        let err = assert_err!(resource(&fake).create_vm(model).await);
        assert!(matches!(err, ProviderError::Validation(ref m) if m.contains("ide0")));
        assert!(fake.create_requests().is_empty());
    }

    #[tokio::test]
    async fn test_create_submission_error_stops() {
        let fake = Arc::new(FakeProxmox::new());
        fake.fail_call("create_vm", ApiError::status(403, "Permission check failed"));

        let err = assert_err!(resource(&fake).create_vm(vm()).await);
        assert_eq!(err.message(), "Error creating VM");
        assert_eq!(fake.calls(), vec!["create_vm"]);
    }

    #[tokio::test]
    async fn test_create_task_failure() {
        let fake = Arc::new(FakeProxmox::new());
        fake.fail_tasks_with("storage 'local-lvm' does not exist");

        let err = assert_err!(resource(&fake).create_vm(vm()).await);
        match err {
            ProviderError::Task { source, .. } => {
                assert!(source.to_string().contains("storage 'local-lvm' does not exist"))
            },
            other => panic!("expected task error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_not_enough_disks() {
        let fake = Arc::new(FakeProxmox::new());
        fake.ignore_disks();

        let err = assert_err!(resource(&fake).create_vm(vm()).await);
        assert!(matches!(
            err,
            ProviderError::Consistency(ref m) if m.starts_with("Not enough disks")
        ));
    }

    #[tokio::test]
    async fn test_read_missing_vm_is_gone() {
        let fake = Arc::new(FakeProxmox::new());
        assert_eq!(assert_ok!(resource(&fake).read_vm(vm()).await), None);
    }

    #[tokio::test]
    async fn test_read_other_error_is_reported() {
        let fake = Arc::new(FakeProxmox::new());
        fake.fail_call(
            "vm_config",
            ApiError::status(
                500,
                "Configuration file 'nodes/pve/qemu-server/999.conf' does not exist",
            ),
        );

        let err = assert_err!(resource(&fake).read_vm(vm()).await);
        assert_eq!(err.message(), "Error getting VM config");
    }

    #[tokio::test]
    async fn test_read_requires_memory_and_cores() {
        let fake = Arc::new(FakeProxmox::new());
        fake.put_vm("pve", 100, VmConfig { cores: Some(2), ..Default::default() });

        let err = assert_err!(resource(&fake).read_vm(vm()).await);
        assert!(matches!(err, ProviderError::Consistency(_)));
    }

    #[tokio::test]
    async fn test_read_after_create_is_stable() {
        let fake = Arc::new(FakeProxmox::new());
        let res = resource(&fake);
        let created = assert_ok!(res.create_vm(vm()).await);

        let read = assert_ok!(res.read_vm(created.clone()).await).unwrap();
        assert_eq!(read.scsi, created.scsi);
        assert_eq!(read.network, created.network);
        assert_eq!(read.memory, 2048);
        assert_eq!(read.cpus, 2);
    }

    #[tokio::test]
    async fn test_read_propagates_gaps_and_fw_config() {
        let fake = Arc::new(FakeProxmox::new());
        let map = json!({
            "memory": 1024,
            "cores": 1,
            "args": "-fw_cfg name=opt/a,string=b",
            "scsi0": "local-lvm:vm-100-disk-0",
            "scsi2": "local-lvm:vm-100-disk-1,snapshot=1",
            "net0": "virtio=BC:24:11:00:00:01,bridge=vmbr0"
        });
        fake.put_vm("pve", 100, VmConfig::from_api(map.as_object().unwrap()).unwrap());

        let mut state = vm();
        state.scsi[0].as_mut().unwrap().volume_id = Some("local-lvm:vm-100-disk-0".to_string());
        let read = assert_ok!(resource(&fake).read_vm(state).await).unwrap();

        assert_eq!(read.fw_config.as_deref(), Some("name=opt/a,string=b"));
        assert_eq!(read.scsi.len(), 3);
        assert_eq!(read.scsi[0].as_ref().unwrap().size_gb, Some(10));
        assert!(read.scsi[1].is_none());
        assert_eq!(read.scsi[2].as_ref().unwrap().readonly, Some(true));
        // bridge reported, firewall absent: the local value stays.
        assert_eq!(
            read.network[0],
            Some(NetworkSlot { bridge: "vmbr0".to_string(), firewall: true })
        );
    }

    #[tokio::test]
    async fn test_read_keeps_foreign_args() {
        let fake = Arc::new(FakeProxmox::new());
        fake.put_vm(
            "pve",
            100,
            VmConfig {
                memory: Some(512),
                cores: Some(1),
                args: Some("-cpu host".to_string()),
                ..Default::default()
            },
        );
        let mut state = vm();
        state.fw_config = Some("name=opt/a,string=b".to_string());
        let read = assert_ok!(resource(&fake).read_vm(state).await).unwrap();
        assert_eq!(read.fw_config.as_deref(), Some("name=opt/a,string=b"));
    }

    #[test]
    fn test_update_request_only_changes() {
        let mut prior = vm();
        prior.scsi = vec![sized("local-lvm", 10), sized("local-lvm", 4)];
        let mut planned = prior.clone();
        planned.memory = 4096;
        planned.scsi[1] = sized("local-lvm", 8);

        let req = VmResource::update_request(&prior, &planned).unwrap();
        assert_eq!(req.memory, Some(4096));
        assert_eq!(req.cores, None);
        assert_eq!(req.name, None);
        assert_eq!(req.scsi.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert!(req.nets.is_empty());
        assert_eq!(req.delete, None);
    }

    #[test]
    fn test_update_request_shrink_emits_tokens_for_dropped_indices() {
        for (n, m) in [(5usize, 2usize), (3, 0), (4, 3), (2, 2)] {
            let mut prior = vm();
            prior.scsi = (0..n).map(|_| sized("local-lvm", 1)).collect();
            let mut planned = prior.clone();
            planned.scsi.truncate(m);

            let req = VmResource::update_request(&prior, &planned).unwrap();
            let tokens: Vec<String> = req
                .delete
                .map(|d| d.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            let expected: Vec<String> = (m..n).map(|i| format!("scsi{}", i)).collect();
            assert_eq!(tokens, expected, "{} -> {}", n, m);
            assert!(req.scsi.is_empty());
        }
    }

    #[test]
    fn test_update_request_emptied_slot_emits_token() {
        let mut prior = vm();
        prior.scsi = vec![sized("local-lvm", 10), sized("local-lvm", 4), sized("local-lvm", 2)];
        let mut planned = prior.clone();
        planned.scsi[0] = None;
        planned.scsi[2] = None;

        let req = VmResource::update_request(&prior, &planned).unwrap();
        assert_eq!(req.delete.as_deref(), Some("scsi0,scsi2"));
        assert!(req.scsi.is_empty());

        // A gap that was already empty is not deleted again.
        let mut prior = vm();
        prior.scsi = vec![None, sized("local-lvm", 4)];
        let req = VmResource::update_request(&prior, &prior.clone()).unwrap();
        assert!(req.is_empty());
    }

    #[tokio::test]
    async fn test_read_after_create_plans_no_changes() {
        let fake = Arc::new(FakeProxmox::new());
        let res = resource(&fake);
        let config = json!({
            "id": 100,
            "node": "pve",
            "memory": 2048,
            "cpus": 2,
            "ide": [{"content": "local:iso/debian-12.iso"}],
            "scsi": [
                {"storage": "local-lvm", "size_gb": 10, "readonly": true},
                {"storage": "local-lvm", "size_gb": 4, "backup": false}
            ],
            "network": [{"bridge": "vmbr0", "firewall": true}]
        });

        let planned = crate::plan::plan(&super::super::schema(), None, &config).planned_state;
        let created = assert_ok!(res.create(planned).await);
        let state = assert_ok!(res.read(created).await);
        assert_eq!(state["ide"][0]["storage"], "local");
        assert_eq!(state["ide"][0]["volume_id"], "local:iso/debian-12.iso");
        assert_eq!(state["scsi"][0]["readonly"], true);
        assert_eq!(state["serials"], json!([]));

        let result = crate::plan::plan(&super::super::schema(), Some(&state), &config);
        assert!(!result.has_changes(), "{:?}", result.changes);

        // A second refresh of the refreshed state is stable too.
        let again = assert_ok!(res.read(state.clone()).await);
        assert_eq!(again, state);
    }

    #[tokio::test]
    async fn test_update_emptied_slot_converges() {
        let fake = Arc::new(FakeProxmox::new());
        let res = resource(&fake);
        let mut planned = vm();
        planned.scsi = vec![sized("local-lvm", 10), sized("local-lvm", 4)];
        let created = assert_ok!(res.create_vm(planned).await);

        let mut planned = created.clone();
        planned.scsi[0] = None;
        let updated = assert_ok!(res.update_vm(&created, planned).await);
        assert_eq!(fake.update_requests()[0].delete.as_deref(), Some("scsi0"));

        let read = assert_ok!(res.read_vm(updated.clone()).await).unwrap();
        assert_eq!(read.scsi.len(), 2);
        assert!(read.scsi[0].is_none());
        assert_eq!(
            read.scsi[1].as_ref().and_then(|s| s.volume_id.as_deref()),
            Some("local-lvm:vm-100-disk-1")
        );
        assert!(VmResource::update_request(&read, &updated).unwrap().is_empty());
    }

    #[test]
    fn test_update_request_delete_order() {
        let mut prior = vm();
        prior.ide = vec![sized("local", 1), sized("local", 1)];
        prior.scsi = vec![sized("local", 1), sized("local", 1)];
        prior.network.push(Some(NetworkSlot { bridge: "vmbr1".to_string(), firewall: false }));
        prior.serials = vec![Some("socket".to_string()), Some("socket".to_string())];
        prior.name = Some("old".to_string());

        let mut planned = prior.clone();
        planned.ide.truncate(1);
        planned.scsi.truncate(1);
        planned.network.truncate(1);
        planned.serials.truncate(1);
        planned.name = None;

        let req = VmResource::update_request(&prior, &planned).unwrap();
        assert_eq!(req.delete.as_deref(), Some("ide1,scsi1,net1,serial1,name"));
    }

    #[test]
    fn test_update_request_unchanged_is_empty() {
        let mut prior = vm();
        prior.scsi[0].as_mut().unwrap().volume_id = Some("local-lvm:vm-100-disk-0".to_string());
        let req = VmResource::update_request(&prior, &prior.clone()).unwrap();
        assert!(req.is_empty());
    }

    #[tokio::test]
    async fn test_update_two_scsi_to_one() {
        let fake = Arc::new(FakeProxmox::new());
        let res = resource(&fake);
        let mut model = vm();
        model.scsi.push(sized("local-lvm", 4));
        let prior = assert_ok!(res.create_vm(model).await);

        let mut planned = prior.clone();
        planned.scsi.truncate(1);
        let updated = assert_ok!(res.update_vm(&prior, planned).await);

        let updates = fake.update_requests();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].delete.as_deref(), Some("scsi1"));
        assert!(updates[0].scsi.is_empty());
        assert_eq!(updated.scsi.len(), 1);
        assert_eq!(fake.vm("pve", 100).unwrap().scsi.len(), 1);
    }

    #[tokio::test]
    async fn test_update_reboots_after_config_task() {
        let fake = Arc::new(FakeProxmox::new());
        let res = resource(&fake);
        let prior = assert_ok!(res.create_vm(vm()).await);
        fake.clear_calls();

        let mut planned = prior.clone();
        planned.cpus = 4;
        planned.reboot = Some(true);
        assert_ok!(res.update_vm(&prior, planned).await);

        assert_eq!(
            fake.calls(),
            vec!["update_vm_config", "task_status", "reboot_vm", "task_status", "vm_config"]
        );
        assert_eq!(fake.reboots(), vec![("pve".to_string(), 100, REBOOT_TIMEOUT_SECS)]);
    }

    #[tokio::test]
    async fn test_update_without_changes_submits_nothing() {
        let fake = Arc::new(FakeProxmox::new());
        let res = resource(&fake);
        let prior = assert_ok!(res.create_vm(vm()).await);
        fake.clear_calls();

        let mut planned = prior.clone();
        planned.reboot = Some(true);
        assert_ok!(res.update_vm(&prior, planned).await);
        assert_eq!(fake.calls(), vec!["vm_config"]);
    }

    #[tokio::test]
    async fn test_update_not_enough_disks() {
        let fake = Arc::new(FakeProxmox::new());
        let res = resource(&fake);
        let prior = assert_ok!(res.create_vm(vm()).await);
        fake.ignore_disks();

        let mut planned = prior.clone();
        planned.scsi.push(sized("local-lvm", 2));
        let err = assert_err!(res.update_vm(&prior, planned).await);
        assert!(matches!(err, ProviderError::Consistency(ref m) if m.contains("scsi1")));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let fake = Arc::new(FakeProxmox::new());
        let res = resource(&fake);
        let created = assert_ok!(res.create_vm(vm()).await);

        assert_ok!(res.delete_vm(&created).await);
        assert_ok!(res.delete_vm(&created).await);
        assert_eq!(fake.vm("pve", 100), None);
        assert_eq!(fake.delete_requests(), vec![("pve".to_string(), 100, true); 2]);
    }

    #[tokio::test]
    async fn test_delete_other_error() {
        let fake = Arc::new(FakeProxmox::new());
        fake.fail_call("delete_vm", ApiError::status(500, "VM is locked (backup)"));

        let err = assert_err!(resource(&fake).delete_vm(&vm()).await);
        assert_eq!(err.message(), "Error deleting VM");
    }

    #[tokio::test]
    async fn test_import() {
        let fake = Arc::new(FakeProxmox::new());
        let res = resource(&fake);
        assert_ok!(res.create_vm(vm()).await);

        let imported = assert_ok!(res.import_vm("pve/100").await);
        assert_eq!(imported.node, "pve");
        assert_eq!(imported.id, 100);
        assert_eq!(imported.memory, 2048);
        let slot = imported.scsi[0].as_ref().unwrap();
        assert_eq!(slot.volume_id.as_deref(), Some("local-lvm:vm-100-disk-0"));
        assert_eq!(slot.storage.as_deref(), Some("local-lvm"));

        for bad in ["pve", "pve/abc", "/100", "pve/100/1"] {
            let err = assert_err!(res.import_vm(bad).await);
            assert!(matches!(err, ProviderError::InvalidImportId { .. }), "{}", bad);
        }
        assert!(matches!(
            assert_err!(res.import_vm("pve/101").await),
            ProviderError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_resource_trait_json_roundtrip() {
        let fake = Arc::new(FakeProxmox::new());
        let res = resource(&fake);
        let planned = json!({
            "id": 100,
            "node": "pve",
            "memory": 1024,
            "cpus": 1,
            "scsi": [{"storage": "local-lvm", "size_gb": 10}],
            "network": [{"bridge": "vmbr0", "firewall": false}]
        });
        assert_eq!(res.lock_key(&planned), "vm/pve/100");

        let state = assert_ok!(res.create(planned).await);
        assert_eq!(state["scsi"][0]["volume_id"], "local-lvm:vm-100-disk-0");

        assert_ok!(res.delete(state.clone()).await);
        assert_eq!(assert_ok!(res.read(state).await), Value::Null);
    }
}
