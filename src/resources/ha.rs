//! `proxmox_cluster_ha_resources`: plain CRUD with no task to wait on.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use super::{from_state, to_state, Resource};
use crate::client::models::HaResource;
use crate::client::ProxmoxApi;
use crate::error::ProviderError;
use crate::schema::{Attribute, Schema};

/// Resource type name.
pub const TYPE_NAME: &str = "proxmox_cluster_ha_resources";

/// Plan and state shape of an HA resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaModel {
    /// Resource id, e.g. `vm:101`.
    pub id: String,
    /// Free-form comment.
    pub comment: Option<String>,
    /// HA group.
    pub group: Option<String>,
    /// Relocation attempts.
    pub max_relocate: Option<i64>,
    /// Restart attempts.
    pub max_restart: Option<i64>,
    /// Requested state.
    pub state: Option<String>,
}

impl HaModel {
    fn to_record(&self) -> HaResource {
        HaResource {
            sid: self.id.clone(),
            comment: self.comment.clone(),
            group: self.group.clone(),
            max_relocate: self.max_relocate,
            max_restart: self.max_restart,
            state: self.state.clone(),
        }
    }

    /// Copy every field the backend reported; absent ones stay as they are.
    fn absorb(&mut self, record: HaResource) {
        if record.comment.is_some() {
            self.comment = record.comment;
        }
        if record.group.is_some() {
            self.group = record.group;
        }
        if record.state.is_some() {
            self.state = record.state;
        }
        if record.max_relocate.is_some() {
            self.max_relocate = record.max_relocate;
        }
        if record.max_restart.is_some() {
            self.max_restart = record.max_restart;
        }
    }
}

/// Schema for [`TYPE_NAME`].
pub fn schema() -> Schema {
    Schema::v0()
        .with_description("Cluster HA Resource")
        .with_attribute(
            "id",
            Attribute::required_string()
                .with_description("The resource ID (vm:101)")
                .with_force_new(),
        )
        .with_attribute(
            "comment",
            Attribute::optional_string().with_description("A helpful comment on the HA resource"),
        )
        .with_attribute(
            "group",
            Attribute::optional_string().with_description("The HA Group Identifier"),
        )
        .with_attribute(
            "max_relocate",
            Attribute::optional_int64().with_description(
                "The maximum number of times to relocate the resource (default: 1)",
            ),
        )
        .with_attribute(
            "max_restart",
            Attribute::optional_int64().with_description(
                "The maximum number of times to restart the resource (default: 1)",
            ),
        )
        .with_attribute(
            "state",
            Attribute::optional_string()
                .with_description("The desired state of the resource (default: started)"),
        )
}

/// Lifecycle of `proxmox_cluster_ha_resources`.
#[derive(Clone)]
pub struct ClusterHaResource {
    api: Arc<dyn ProxmoxApi>,
}

impl ClusterHaResource {
    /// Create the resource around a client.
    pub fn new(api: Arc<dyn ProxmoxApi>) -> Self {
        Self { api }
    }

    #[instrument(skip(self, planned), fields(sid = %planned.id))]
    async fn create_ha(&self, planned: HaModel) -> Result<HaModel, ProviderError> {
        self.api
            .create_ha_resource(&planned.to_record())
            .await
            .map_err(|e| ProviderError::api("Error creating HA resource", e))?;
        Ok(planned)
    }

    #[instrument(skip(self, planned), fields(sid = %planned.id))]
    async fn update_ha(&self, planned: HaModel) -> Result<HaModel, ProviderError> {
        self.api
            .update_ha_resource(&planned.to_record())
            .await
            .map_err(|e| ProviderError::api("Error updating HA resource", e))?;
        Ok(planned)
    }

    #[instrument(skip(self, state), fields(sid = %state.id))]
    async fn read_ha(&self, mut state: HaModel) -> Result<HaModel, ProviderError> {
        let record = self
            .api
            .find_ha_resource(&state.id)
            .await
            .map_err(|e| ProviderError::api("Error reading HA resource", e))?;
        state.absorb(record);
        Ok(state)
    }
}

#[async_trait::async_trait]
impl Resource for ClusterHaResource {
    fn lock_key(&self, state: &Value) -> String {
        format!("ha/{}", state.get("id").and_then(Value::as_str).unwrap_or_default())
    }

    async fn create(&self, planned: Value) -> Result<Value, ProviderError> {
        to_state(&self.create_ha(from_state(planned)?).await?)
    }

    async fn read(&self, state: Value) -> Result<Value, ProviderError> {
        to_state(&self.read_ha(from_state(state)?).await?)
    }

    async fn update(&self, _prior: Value, planned: Value) -> Result<Value, ProviderError> {
        to_state(&self.update_ha(from_state(planned)?).await?)
    }

    async fn delete(&self, state: Value) -> Result<(), ProviderError> {
        let state: HaModel = from_state(state)?;
        self.api
            .delete_ha_resource(&state.id)
            .await
            .map_err(|e| ProviderError::api("Error deleting ha resource", e))
    }

    async fn import(&self, id: &str) -> Result<Value, ProviderError> {
        let seed = HaModel {
            id: id.to_string(),
            ..Default::default()
        };
        to_state(&self.read_ha(seed).await?)
    }
}
