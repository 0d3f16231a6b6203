//! `proxmox_node`: a node's primary address.

use serde_json::{Map, Value};
use tracing::instrument;

use super::DataSource;
use crate::client::ProxmoxApi;
use crate::error::ProviderError;
use crate::schema::{Attribute, Schema};

const TYPE_NAME: &str = "proxmox_node";

/// Looks up the address of a node's first bridge.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeDataSource;

#[async_trait::async_trait]
impl DataSource for NodeDataSource {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_description("A cluster node")
            .with_attribute("name", Attribute::required_string().with_description("The node name"))
            .with_attribute(
                "ip_address",
                Attribute::computed_string()
                    .with_description("The address of the node's first bridge"),
            )
    }

    #[instrument(skip(self, api, config))]
    async fn read(&self, api: &dyn ProxmoxApi, config: Value) -> Result<Value, ProviderError> {
        let mut state = match config {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let name = state
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::Validation("Missing required attribute 'name'".to_string())
            })?;

        let interfaces = api
            .get(&["nodes", name.as_str(), "network"], &[])
            .await
            .map_err(|e| ProviderError::api(format!("Unable to read {}", TYPE_NAME), e))?;

        let address = interfaces
            .as_array()
            .into_iter()
            .flatten()
            .filter(|iface| iface.get("type").and_then(Value::as_str) == Some("bridge"))
            .find_map(|iface| iface.get("address").and_then(Value::as_str))
            .map(|address| Value::String(address.to_string()))
            .unwrap_or(Value::Null);

        state.insert("ip_address".to_string(), address);
        Ok(Value::Object(state))
    }
}
