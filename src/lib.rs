//! Proxmox VE provider
//!
//! This crate implements an infrastructure-as-code provider for
//! [Proxmox VE](https://www.proxmox.com/en/proxmox-virtual-environment).
//! It is driven through [`ProviderService`] by a plugin runtime that owns
//! plan and state storage; the provider turns plans into Proxmox API calls
//! and waits for the asynchronous tasks those calls start.
//!
//! # Overview
//!
//! - **Resources**: QEMU virtual machines (`proxmox_node_virtual_machine`),
//!   storage content such as downloaded ISOs (`proxmox_node_storage_content`)
//!   and cluster HA resources (`proxmox_cluster_ha_resources`)
//! - **Data sources**: nodes plus read-only projections of the access and
//!   firewall configuration
//! - **Task waiting**: every mutating call that returns a task id is polled
//!   to completion by [`tasks::TaskWaiter`], which honours a deadline and
//!   the provider's `stop`
//! - **Testing**: [`testing::FakeProxmox`] and [`testing::ProviderTester`]
//!   exercise the whole lifecycle without a cluster
//!
//! # Quick Start
//!
//! ```ignore
//! use proxmox_provider::{init_logging, ProviderService, ProxmoxProvider};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging();
//!
//!     let provider = ProxmoxProvider::new();
//!     provider.configure(json!({
//!         "endpoint": "https://pve.example.com:8006",
//!         "api_token": "root@pam!terraform=00000000-0000-0000-0000-000000000000",
//!     })).await?;
//!
//!     let state = provider.create("proxmox_node_virtual_machine", json!({
//!         "id": 100,
//!         "node": "pve",
//!         "memory": 2048,
//!         "cpus": 2,
//!         "scsi": [{"storage": "local-lvm", "size_gb": 32}],
//!         "network": [{"bridge": "vmbr0", "firewall": true}],
//!     })).await?;
//!     println!("{}", state["scsi"][0]["volume_id"]);
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! `endpoint` and `api_token` fall back to `PROXMOX_ENDPOINT` and
//! `PROXMOX_API_TOKEN`; see [`config`] for the rest.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod data_sources;
pub mod error;
pub mod locks;
pub mod logging;
pub mod plan;
pub mod provider;
pub mod resources;
pub mod schema;
pub mod service;
pub mod tasks;
pub mod testing;
pub mod types;
pub mod validation;

pub use client::{HttpClient, ProxmoxApi};
pub use config::{ProviderConfig, ResolvedConfig};
pub use error::{ApiError, ProviderError, TaskError};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::ProxmoxProvider;
pub use schema::ProviderSchema;
pub use service::ProviderService;
pub use tasks::TaskWaiter;
pub use types::{
    AttributeChange, ImportedResource, PlanResult, ProviderMetadata, ServerCapabilities,
};
pub use validation::{is_valid, validate, validate_result};

pub use async_trait::async_trait;

pub use serde_json;
pub use tracing;
