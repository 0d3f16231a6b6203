//! The Proxmox provider.
//!
//! [`ProxmoxProvider`] is what the plugin runtime talks to. It owns the
//! schema of every resource and data source, builds the API client on
//! `configure`, and dispatches each lifecycle call to the matching
//! [`Resource`] or [`DataSource`].

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::client::{HttpClient, ProxmoxApi};
use crate::config::{provider_schema, ProviderConfig};
use crate::data_sources::{self, DataSource};
use crate::error::ProviderError;
use crate::locks::KeyedLocks;
use crate::plan::plan;
use crate::resources::ha::{self, ClusterHaResource};
use crate::resources::storage_content::{self, StorageContentResource};
use crate::resources::vm::{self, VmResource};
use crate::resources::Resource;
use crate::schema::{Diagnostic, ProviderSchema, Schema};
use crate::service::ProviderService;
use crate::tasks::TaskWaiter;
use crate::types::{ImportedResource, PlanResult, ProviderMetadata, ServerCapabilities};
use crate::validation::validate;

/// Schemas of every managed resource type.
fn resource_schemas() -> BTreeMap<&'static str, Schema> {
    BTreeMap::from([
        (vm::TYPE_NAME, vm::schema()),
        (storage_content::TYPE_NAME, storage_content::schema()),
        (ha::TYPE_NAME, ha::schema()),
    ])
}

/// Everything that exists only once the provider is configured.
#[derive(Clone)]
struct Backend {
    api: Arc<dyn ProxmoxApi>,
    resources: BTreeMap<&'static str, Arc<dyn Resource>>,
}

impl Backend {
    fn new(api: Arc<dyn ProxmoxApi>, waiter: TaskWaiter) -> Self {
        let resources: BTreeMap<&'static str, Arc<dyn Resource>> = BTreeMap::from([
            (vm::TYPE_NAME, Arc::new(VmResource::new(waiter.clone())) as Arc<dyn Resource>),
            (
                storage_content::TYPE_NAME,
                Arc::new(StorageContentResource::new(waiter)) as Arc<dyn Resource>,
            ),
            (ha::TYPE_NAME, Arc::new(ClusterHaResource::new(api.clone())) as Arc<dyn Resource>),
        ]);
        Self { api, resources }
    }
}

/// Proxmox VE provider.
///
/// Mutating calls against the same remote object are serialized; `stop`
/// aborts every task wait in flight.
pub struct ProxmoxProvider {
    backend: RwLock<Option<Backend>>,
    schemas: BTreeMap<&'static str, Schema>,
    data_sources: BTreeMap<&'static str, Arc<dyn DataSource>>,
    locks: KeyedLocks,
    cancel: CancellationToken,
}

impl Default for ProxmoxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxmoxProvider {
    /// An unconfigured provider.
    pub fn new() -> Self {
        Self {
            backend: RwLock::new(None),
            schemas: resource_schemas(),
            data_sources: data_sources::all().into_iter().map(|ds| (ds.type_name(), ds)).collect(),
            locks: KeyedLocks::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// A provider already configured against `api`, polling tasks every
    /// `poll_interval`.
    pub fn with_api(api: Arc<dyn ProxmoxApi>, poll_interval: Duration) -> Self {
        let provider = Self::new();
        provider.install(api, poll_interval, None);
        provider
    }

    fn install(
        &self,
        api: Arc<dyn ProxmoxApi>,
        poll_interval: Duration,
        deadline: Option<Duration>,
    ) {
        let waiter = TaskWaiter::new(api.clone())
            .with_poll_interval(poll_interval)
            .with_deadline(deadline)
            .with_cancellation(self.cancel.clone());
        let backend = Backend::new(api, waiter);
        *self.backend.write().unwrap_or_else(PoisonError::into_inner) = Some(backend);
    }

    fn backend(&self) -> Result<Backend, ProviderError> {
        self.backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ProviderError::Configuration("Provider is not configured".to_string()))
    }

    fn resource_schema(&self, resource_type: &str) -> Result<&Schema, ProviderError> {
        self.schemas
            .get(resource_type)
            .ok_or_else(|| ProviderError::UnknownResource(resource_type.to_string()))
    }

    fn resource(&self, resource_type: &str) -> Result<Arc<dyn Resource>, ProviderError> {
        self.resource_schema(resource_type)?;
        self.backend()?
            .resources
            .get(resource_type)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownResource(resource_type.to_string()))
    }

    fn data_source(&self, data_source_type: &str) -> Result<Arc<dyn DataSource>, ProviderError> {
        self.data_sources
            .get(data_source_type)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownResource(data_source_type.to_string()))
    }
}

#[async_trait::async_trait]
impl ProviderService for ProxmoxProvider {
    fn schema(&self) -> ProviderSchema {
        let mut schema = ProviderSchema::new().with_provider_config(provider_schema());
        for (name, resource) in &self.schemas {
            schema = schema.with_resource(*name, resource.clone());
        }
        for (name, ds) in &self.data_sources {
            schema = schema.with_data_source(*name, ds.schema());
        }
        schema
    }

    fn metadata(&self) -> ProviderMetadata {
        let schema = self.schema();
        ProviderMetadata {
            resources: schema.resources.into_keys().collect(),
            data_sources: schema.data_sources.into_keys().collect(),
            capabilities: ServerCapabilities { plan_destroy: true },
        }
    }

    async fn validate_provider_config(
        &self,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(validate(&provider_schema(), &config))
    }

    #[instrument(skip(self, config))]
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let diagnostics = validate(&provider_schema(), &config);
        if !diagnostics.is_empty() {
            return Ok(diagnostics);
        }
        let resolved = match ProviderConfig::from_value(&config)?.resolve() {
            Ok(resolved) => resolved,
            Err(diagnostics) => return Ok(diagnostics),
        };

        let client = HttpClient::new(&resolved).map_err(|e| {
            ProviderError::Configuration(format!("Unable to create Proxmox API client: {}", e))
        })?;
        self.install(Arc::new(client), resolved.poll_interval, resolved.task_timeout);
        info!(endpoint = %resolved.endpoint, insecure = resolved.insecure, "provider configured");
        Ok(vec![])
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        debug!("cancelling in-flight task waits");
        self.cancel.cancel();
        Ok(())
    }

    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(validate(self.resource_schema(resource_type)?, &config))
    }

    #[instrument(skip(self, prior_state, proposed_state, _config))]
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        _config: Value,
    ) -> Result<PlanResult, ProviderError> {
        let schema = self.resource_schema(resource_type)?;
        let result = plan(schema, prior_state.as_ref(), &proposed_state);
        debug!(
            changes = result.changes.len(),
            requires_replace = result.requires_replace,
            "planned"
        );
        Ok(result)
    }

    #[instrument(skip(self, planned_state))]
    async fn create(
        &self,
        resource_type: &str,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        let resource = self.resource(resource_type)?;
        let _guard = self.locks.lock(&resource.lock_key(&planned_state)).await;
        resource.create(planned_state).await
    }

    #[instrument(skip(self, current_state))]
    async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Value, ProviderError> {
        self.resource(resource_type)?.read(current_state).await
    }

    #[instrument(skip(self, prior_state, planned_state))]
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        let resource = self.resource(resource_type)?;
        let _guard = self.locks.lock(&resource.lock_key(&prior_state)).await;
        resource.update(prior_state, planned_state).await
    }

    #[instrument(skip(self, current_state))]
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        let resource = self.resource(resource_type)?;
        let _guard = self.locks.lock(&resource.lock_key(&current_state)).await;
        resource.delete(current_state).await
    }

    #[instrument(skip(self))]
    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        let state = self.resource(resource_type)?.import(id).await?;
        Ok(vec![ImportedResource::new(resource_type, state)])
    }

    async fn validate_data_source_config(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(validate(&self.data_source(data_source_type)?.schema(), &config))
    }

    #[instrument(skip(self, config))]
    async fn read_data_source(
        &self,
        data_source_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        let data_source = self.data_source(data_source_type)?;
        let backend = self.backend()?;
        data_source.read(backend.api.as_ref(), config).await
    }
}
