//! The Proxmox API seam.
//!
//! Resources talk to the backend only through [`ProxmoxApi`]. The production
//! implementation is [`HttpClient`]; tests use
//! [`FakeProxmox`](crate::testing::FakeProxmox).

pub mod http;
pub mod models;
pub mod property;

use serde_json::Value;

use crate::error::ApiError;
use models::{
    CreateVm, DownloadUrlRequest, HaResource, TaskHandle, TaskStatus, UpdateVmConfig, VmConfig,
};

pub use http::HttpClient;

/// Typed calls against the Proxmox API.
///
/// Every call that starts a task returns its [`TaskHandle`]; callers wait on
/// it with [`TaskWaiter`](crate::tasks::TaskWaiter).
#[async_trait::async_trait]
pub trait ProxmoxApi: Send + Sync {
    /// Read a task's status.
    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus, ApiError>;

    /// Read a VM's current configuration.
    async fn vm_config(&self, node: &str, vmid: u32) -> Result<VmConfig, ApiError>;

    /// Create a VM.
    async fn create_vm(&self, req: &CreateVm) -> Result<TaskHandle, ApiError>;

    /// Apply a partial configuration update.
    async fn update_vm_config(&self, req: &UpdateVmConfig) -> Result<TaskHandle, ApiError>;

    /// Reboot a VM, giving the guest `timeout_secs` to shut down.
    async fn reboot_vm(
        &self,
        node: &str,
        vmid: u32,
        timeout_secs: u32,
    ) -> Result<TaskHandle, ApiError>;

    /// Destroy a VM.
    async fn delete_vm(&self, node: &str, vmid: u32, purge: bool) -> Result<TaskHandle, ApiError>;

    /// Download a URL into a storage.
    async fn download_url(&self, req: &DownloadUrlRequest) -> Result<TaskHandle, ApiError>;

    /// Look up a volume in a storage.
    async fn find_content(
        &self,
        node: &str,
        storage: &str,
        volume: &str,
    ) -> Result<Value, ApiError>;

    /// Delete a volume from a storage.
    async fn delete_content(
        &self,
        node: &str,
        storage: &str,
        volume: &str,
    ) -> Result<TaskHandle, ApiError>;

    /// Create an HA resource.
    async fn create_ha_resource(&self, res: &HaResource) -> Result<(), ApiError>;

    /// Update an HA resource.
    async fn update_ha_resource(&self, res: &HaResource) -> Result<(), ApiError>;

    /// Read an HA resource.
    async fn find_ha_resource(&self, sid: &str) -> Result<HaResource, ApiError>;

    /// Delete an HA resource.
    async fn delete_ha_resource(&self, sid: &str) -> Result<(), ApiError>;

    /// Read-only `GET` of the path made of `segments` (relative to
    /// `/api2/json`), returning the unwrapped `data` payload.
    async fn get(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Value, ApiError>;
}
