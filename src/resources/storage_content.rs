//! `proxmox_node_storage_content`: a file placed in a node's storage, such
//! as an ISO downloaded from a URL.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::{from_state, to_state, Resource};
use crate::client::models::DownloadUrlRequest;
use crate::client::ProxmoxApi;
use crate::error::{classify_error, ErrorKind, ProviderError, Subject};
use crate::schema::{Attribute, Block, NestedBlock, Schema};
use crate::tasks::TaskWaiter;

/// Resource type name.
pub const TYPE_NAME: &str = "proxmox_node_storage_content";

const ISO_FORMAT: &str = "iso";
const IMPORT_FORMAT: &str = "node@volume:format/filename";

/// A storage addressed as `node/storage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageId {
    /// Node name.
    pub node: String,
    /// Storage name on that node.
    pub storage: String,
}

impl FromStr for StorageId {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [node, storage] => Ok(Self {
                node: node.to_string(),
                storage: storage.to_string(),
            }),
            _ => Err(ProviderError::Validation(format!(
                "Bad storage ID format: expected node/storage, got {:?}",
                s
            ))),
        }
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.storage)
    }
}

/// Where an ISO comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsoSource {
    /// Download URL.
    pub url: Option<String>,
    /// Expected checksum of the download.
    pub checksum: Option<String>,
    /// Algorithm of `checksum`, e.g. `sha256`.
    pub checksum_algorithm: Option<String>,
}

/// Plan and state shape of a storage content item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageContentModel {
    /// Volume id, `{storage}:{format}/{filename}`.
    pub id: Option<String>,
    /// Target storage as `node/storage`.
    pub storage: String,
    /// File name in the storage.
    pub filename: String,
    /// Download the file as an ISO.
    pub iso: Option<IsoSource>,
}

/// Schema for [`TYPE_NAME`].
pub fn schema() -> Schema {
    Schema::v0()
        .with_description("A file in a node's storage")
        .with_attribute("id", Attribute::computed_string().with_description("The volume ID"))
        .with_attribute(
            "storage",
            Attribute::required_string()
                .with_description("The storage to place the file in, as node/storage")
                .with_force_new(),
        )
        .with_attribute(
            "filename",
            Attribute::required_string()
                .with_description("The file name within the storage")
                .with_force_new(),
        )
        .with_block(
            "iso",
            NestedBlock::single(
                Block::new()
                    .with_description("Download an ISO image from a URL")
                    .with_attribute(
                        "url",
                        Attribute::required_string()
                            .with_description("The URL to download from")
                            .with_force_new(),
                    )
                    .with_attribute("checksum", Attribute::optional_string())
                    .with_attribute(
                        "checksum_algorithm",
                        Attribute::optional_string().with_description("e.g. sha256"),
                    ),
            ),
        )
}

/// Lifecycle of `proxmox_node_storage_content`.
#[derive(Clone)]
pub struct StorageContentResource {
    waiter: TaskWaiter,
}

impl StorageContentResource {
    /// Create the resource around a task waiter and the client it polls.
    pub fn new(waiter: TaskWaiter) -> Self {
        Self { waiter }
    }

    fn api(&self) -> &dyn ProxmoxApi {
        self.waiter.api().as_ref()
    }

    /// Download the content when it is an ISO and record its volume id.
    #[instrument(
        skip(self, planned),
        fields(storage = %planned.storage, filename = %planned.filename)
    )]
    pub async fn create_content(
        &self,
        mut planned: StorageContentModel,
    ) -> Result<StorageContentModel, ProviderError> {
        let target: StorageId = planned.storage.parse()?;
        let mut format = "";

        if let Some(iso) = &planned.iso {
            format = ISO_FORMAT;
            let url = iso
                .url
                .clone()
                .ok_or_else(|| ProviderError::Validation("iso.url is required".to_string()))?;
            let req = DownloadUrlRequest {
                node: target.node.clone(),
                storage: target.storage.clone(),
                content: ISO_FORMAT.to_string(),
                filename: planned.filename.clone(),
                url,
                checksum: iso.checksum.clone(),
                checksum_algorithm: iso.checksum_algorithm.clone(),
            };
            let task = self
                .api()
                .download_url(&req)
                .await
                .map_err(|e| ProviderError::api("Error downloading iso", e))?;
            self.waiter
                .wait(&task)
                .await
                .map_err(|e| ProviderError::task("Error downloading iso", e))?;
            info!("iso downloaded");
        }

        planned.id = Some(format!("{}:{}/{}", target.storage, format, planned.filename));
        Ok(planned)
    }

    /// Check the volume still exists. `None` means it is gone.
    #[instrument(skip(self, state), fields(id = ?state.id))]
    pub async fn read_content(
        &self,
        state: StorageContentModel,
    ) -> Result<Option<StorageContentModel>, ProviderError> {
        let target: StorageId = state.storage.parse()?;
        let Some(volume) = state.id.as_deref() else {
            return Ok(None);
        };

        match self.api().find_content(&target.node, &target.storage, volume).await {
            Ok(_) => Ok(Some(state)),
            Err(e) if classify_error(&e, Subject::Content) == ErrorKind::ContentMissing => {
                debug!("content no longer exists");
                Ok(None)
            },
            Err(e) => Err(ProviderError::api("Error retrieving content information", e)),
        }
    }

    /// Delete the volume.
    #[instrument(skip(self, state), fields(id = ?state.id))]
    pub async fn delete_content(&self, state: &StorageContentModel) -> Result<(), ProviderError> {
        let target: StorageId = state.storage.parse()?;
        let volume = state.id.as_deref().unwrap_or_default();
        let task = self
            .api()
            .delete_content(&target.node, &target.storage, volume)
            .await
            .map_err(|e| ProviderError::api("Error deleting content", e))?;
        self.waiter
            .wait(&task)
            .await
            .map_err(|e| ProviderError::task("Error deleting content", e))
    }
}

/// Parse `node@volume:format/filename` into state.
pub fn parse_import_id(id: &str) -> Result<StorageContentModel, ProviderError> {
    let invalid = || ProviderError::InvalidImportId {
        expected: IMPORT_FORMAT,
        got: id.to_string(),
    };

    let [node, volume] = split_exact(id, '@').ok_or_else(invalid)?;
    let [storage, path] = split_exact(volume, ':').ok_or_else(invalid)?;
    let [format, filename] = split_exact(path, '/').ok_or_else(invalid)?;

    Ok(StorageContentModel {
        id: Some(volume.to_string()),
        storage: StorageId {
            node: node.to_string(),
            storage: storage.to_string(),
        }
        .to_string(),
        filename: filename.to_string(),
        iso: (format == ISO_FORMAT).then(IsoSource::default),
    })
}

fn split_exact(s: &str, sep: char) -> Option<[&str; 2]> {
    let mut parts = s.split(sep);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => Some([a, b]),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Resource for StorageContentResource {
    fn lock_key(&self, state: &Value) -> String {
        format!(
            "content/{}/{}",
            state.get("storage").and_then(Value::as_str).unwrap_or_default(),
            state.get("filename").and_then(Value::as_str).unwrap_or_default()
        )
    }

    async fn create(&self, planned: Value) -> Result<Value, ProviderError> {
        to_state(&self.create_content(from_state(planned)?).await?)
    }

    async fn read(&self, state: Value) -> Result<Value, ProviderError> {
        match self.read_content(from_state(state)?).await? {
            Some(model) => to_state(&model),
            None => Ok(Value::Null),
        }
    }

    async fn update(&self, _prior: Value, planned: Value) -> Result<Value, ProviderError> {
        // Everything that reaches the backend forces replacement.
        let model: StorageContentModel = from_state(planned)?;
        to_state(&model)
    }

    async fn delete(&self, state: Value) -> Result<(), ProviderError> {
        self.delete_content(&from_state(state)?).await
    }

    async fn import(&self, id: &str) -> Result<Value, ProviderError> {
        to_state(&parse_import_id(id)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::error::ApiError;
    use crate::testing::FakeProxmox;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn resource(fake: &Arc<FakeProxmox>) -> StorageContentResource {
        StorageContentResource::new(
            TaskWaiter::new(fake.clone()).with_poll_interval(Duration::from_millis(1)),
        )
    }

    fn debian() -> StorageContentModel {
        StorageContentModel {
            id: None,
            storage: "pve/local".to_string(),
            filename: "debian-12.iso".to_string(),
            iso: Some(IsoSource {
                url: Some("https://cdimage.debian.org/debian-12.iso".to_string()),
                checksum: Some("abc123".to_string()),
                checksum_algorithm: Some("sha256".to_string()),
            }),
        }
    }

    #[test]
    fn test_storage_id() {
        let id: StorageId = "pve/local".parse().unwrap();
        assert_eq!(id.node, "pve");
        assert_eq!(id.storage, "local");
        assert_eq!(id.to_string(), "pve/local");

        for bad in ["pve", "pve/local/x", ""] {
            let err = bad.parse::<StorageId>().unwrap_err();
            assert!(err.to_string().contains("Bad storage ID format"), "{}", bad);
        }
    }

    #[test]
    fn test_parse_import_id() {
        let model = parse_import_id("pve@local:iso/debian-12.iso").unwrap();
        assert_eq!(model.id.as_deref(), Some("local:iso/debian-12.iso"));
        assert_eq!(model.storage, "pve/local");
        assert_eq!(model.filename, "debian-12.iso");
        assert_eq!(model.iso, Some(IsoSource::default()));

        let model = parse_import_id("pve@local:vztmpl/alpine.tar.xz").unwrap();
        assert_eq!(model.iso, None);

        for bad in [
            "local:iso/a.iso",
            "a@b@c:iso/x",
            "pve@local",
            "pve@local:a:b/c",
            "pve@local:iso",
            "pve@local:iso/a/b",
        ] {
            let err = parse_import_id(bad).unwrap_err();
            assert!(err.to_string().contains(IMPORT_FORMAT), "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_create_downloads_iso() {
        let fake = Arc::new(FakeProxmox::new());
        let created = assert_ok!(resource(&fake).create_content(debian()).await);
        assert_eq!(created.id.as_deref(), Some("local:iso/debian-12.iso"));

        let downloads = fake.download_requests();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].node, "pve");
        assert_eq!(downloads[0].storage, "local");
        assert_eq!(downloads[0].content, "iso");
        assert_eq!(downloads[0].checksum_algorithm.as_deref(), Some("sha256"));
    }

    #[tokio::test]
    async fn test_create_without_iso_skips_download() {
        let fake = Arc::new(FakeProxmox::new());
        let model = StorageContentModel { iso: None, ..debian() };
        let created = assert_ok!(resource(&fake).create_content(model).await);
        assert_eq!(created.id.as_deref(), Some("local:/debian-12.iso"));
        assert!(fake.download_requests().is_empty());
    }

    #[tokio::test]
    async fn test_create_bad_storage_id() {
        let fake = Arc::new(FakeProxmox::new());
        let model = StorageContentModel { storage: "local".to_string(), ..debian() };
        assert!(matches!(
            assert_err!(resource(&fake).create_content(model).await),
            ProviderError::Validation(_)
        ));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_download_task_fails() {
        let fake = Arc::new(FakeProxmox::new());
        fake.fail_tasks_with("checksum mismatch");
        let err = assert_err!(resource(&fake).create_content(debian()).await);
        assert_eq!(err.message(), "Error downloading iso");
    }

    #[tokio::test]
    async fn test_read_missing_is_gone() {
        let fake = Arc::new(FakeProxmox::new());
        let res = resource(&fake);
        let created = assert_ok!(res.create_content(debian()).await);
        assert!(assert_ok!(res.read_content(created.clone()).await).is_some());

        assert_ok!(res.delete_content(&created).await);
        assert_eq!(assert_ok!(res.read_content(created).await), None);
    }

    #[tokio::test]
    async fn test_read_other_error() {
        let fake = Arc::new(FakeProxmox::new());
        fake.fail_call("find_content", ApiError::status(500, "storage 'local' is not online"));
        let state = StorageContentModel {
            id: Some("local:iso/debian-12.iso".to_string()),
            ..debian()
        };
        let err = assert_err!(resource(&fake).read_content(state).await);
        assert_eq!(err.message(), "Error retrieving content information");
    }

    #[tokio::test]
    async fn test_delete_failure() {
        let fake = Arc::new(FakeProxmox::new());
        fake.fail_call("delete_content", ApiError::status(500, "volume is in use"));
        let state = StorageContentModel {
            id: Some("local:iso/debian-12.iso".to_string()),
            ..debian()
        };
        let err = assert_err!(resource(&fake).delete_content(&state).await);
        assert_eq!(err.message(), "Error deleting content");
    }

    #[tokio::test]
    async fn test_resource_trait() {
        let fake = Arc::new(FakeProxmox::new());
        let res = resource(&fake);
        let imported = assert_ok!(res.import("pve@local:iso/debian-12.iso").await);
        assert_eq!(
            imported,
            json!({
                "id": "local:iso/debian-12.iso",
                "storage": "pve/local",
                "filename": "debian-12.iso",
                "iso": {"url": null, "checksum": null, "checksum_algorithm": null}
            })
        );
        assert_eq!(res.lock_key(&imported), "content/pve/local/debian-12.iso");

        let planned = json!({
            "id": "local:iso/debian-12.iso",
            "storage": "pve/local",
            "filename": "debian-12.iso",
            "iso": null
        });
        assert_eq!(assert_ok!(res.update(imported, planned.clone()).await), planned);
    }
}
