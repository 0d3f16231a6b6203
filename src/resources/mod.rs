//! Managed resources.
//!
//! Each resource converts plan/state JSON to its own model, talks to the
//! backend through [`TaskWaiter`](crate::tasks::TaskWaiter) and the
//! [`ProxmoxApi`](crate::client::ProxmoxApi) behind it, and converts back.

pub mod ha;
pub mod storage_content;
pub mod vm;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

/// Lifecycle of one resource type.
#[async_trait::async_trait]
pub trait Resource: Send + Sync {
    /// Key that serializes mutating calls against the same remote object.
    fn lock_key(&self, state: &Value) -> String;

    /// Create the resource and return its state.
    async fn create(&self, planned: Value) -> Result<Value, ProviderError>;

    /// Refresh state. `Value::Null` means the object is gone.
    async fn read(&self, state: Value) -> Result<Value, ProviderError>;

    /// Converge from `prior` to `planned`.
    async fn update(&self, prior: Value, planned: Value) -> Result<Value, ProviderError>;

    /// Destroy the resource; an object that is already gone is not an error.
    async fn delete(&self, state: Value) -> Result<(), ProviderError>;

    /// Build state from an import identifier.
    async fn import(&self, id: &str) -> Result<Value, ProviderError>;
}

/// Deserialize a model from plan or state JSON.
pub(crate) fn from_state<T: DeserializeOwned>(value: Value) -> Result<T, ProviderError> {
    Ok(serde_json::from_value(value)?)
}

/// Serialize a model to state JSON.
pub(crate) fn to_state<T: Serialize>(model: &T) -> Result<Value, ProviderError> {
    Ok(serde_json::to_value(model)?)
}

/// Treat an explicit `null` like a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
