//! `reqwest` implementation of [`ProxmoxApi`].

use std::time::Duration;

use hyper::ext::ReasonPhrase;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::models::{
    CreateVm, DownloadUrlRequest, HaResource, TaskHandle, TaskStatus, UpdateVmConfig, VmConfig,
};
use super::property::format_bool;
use super::ProxmoxApi;
use crate::config::ResolvedConfig;
use crate::error::ApiError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Every API answer wraps its payload in `data`.
#[derive(Deserialize)]
struct ResponseBase<T> {
    data: T,
}

/// HTTP client authenticated with an API token.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    base: Url,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient").field("base", &self.base.as_str()).finish()
    }
}

impl HttpClient {
    /// Build a client for the resolved provider configuration.
    pub fn new(config: &ResolvedConfig) -> Result<Self, ApiError> {
        let base = Url::parse(&format!("{}/api2/json", config.endpoint))
            .map_err(|e| {
                ApiError::Decode(format!("invalid endpoint {:?}: {}", config.endpoint, e))
            })?;

        let mut auth = HeaderValue::from_str(&format!("PVEAPIToken={}", config.api_token))
            .map_err(|_| {
                ApiError::Decode("API token contains invalid header characters".to_string())
            })?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(config.insecure)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { client, base })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Decode(format!("endpoint {} cannot take a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, ApiError> {
        let url = self.url(segments)?;
        debug!(%method, path = url.path(), "proxmox request");
        Ok(self.client.request(method, url))
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let response = builder.send().await?;
        let status = response.status();
        let reason = reason_phrase(&response);
        let body = response.text().await?;

        if !status.is_success() {
            let message = error_message(status, reason.as_deref(), &body);
            return Err(ApiError::status(status.as_u16(), message));
        }

        let envelope: ResponseBase<T> = serde_json::from_str(&body)
            .map_err(|e| ApiError::Decode(format!("{} in response {:?}", e, body)))?;
        Ok(envelope.data)
    }

    async fn send_task(&self, node: &str, builder: RequestBuilder) -> Result<TaskHandle, ApiError> {
        let upid: Option<String> = self.send(builder).await?;
        match upid {
            Some(upid) if !upid.is_empty() => Ok(TaskHandle::new(node, upid)),
            _ => Err(ApiError::Decode("no task id returned".to_string())),
        }
    }
}

/// The status line's reason phrase, when the server sent a non-standard one.
///
/// `pveproxy` often puts the whole error there, e.g. `500 Configuration file
/// 'nodes/pve/qemu-server/100.conf' does not exist`, with `{"data":null}` as
/// the body.
fn reason_phrase(response: &Response) -> Option<String> {
    response
        .extensions()
        .get::<ReasonPhrase>()
        .and_then(|reason| std::str::from_utf8(reason.as_bytes()).ok())
        .map(str::trim)
        .filter(|reason| !reason.is_empty())
        .map(str::to_string)
}

/// Proxmox reports the reason in the body's `message`, with per-parameter
/// problems under `errors`; failing both, in the status line.
fn error_message(status: StatusCode, reason: Option<&str>, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string);
    let errors = parsed
        .as_ref()
        .and_then(|v| v.get("errors"))
        .and_then(Value::as_object)
        .map(|errs| {
            errs.iter()
                .map(|(k, v)| format!("{}: {}", k, v.as_str().unwrap_or_default().trim()))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|e| !e.is_empty());

    match (message, errors) {
        (Some(m), Some(e)) => format!("{} ({})", m, e),
        (Some(m), None) => m,
        (None, Some(e)) => e,
        (None, None) => reason
            .or_else(|| status.canonical_reason())
            .unwrap_or("unknown error")
            .to_string(),
    }
}

#[async_trait::async_trait]
impl ProxmoxApi for HttpClient {
    #[instrument(skip(self))]
    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus, ApiError> {
        let req = self.request(Method::GET, &["nodes", node, "tasks", upid, "status"])?;
        self.send(req).await
    }

    #[instrument(skip(self))]
    async fn vm_config(&self, node: &str, vmid: u32) -> Result<VmConfig, ApiError> {
        let vmid = vmid.to_string();
        let req = self.request(Method::GET, &["nodes", node, "qemu", &vmid, "config"])?;
        let map: serde_json::Map<String, Value> = self.send(req).await?;
        VmConfig::from_api(&map)
    }

    #[instrument(skip(self, req), fields(node = %req.node, vmid = req.vmid))]
    async fn create_vm(&self, req: &CreateVm) -> Result<TaskHandle, ApiError> {
        let builder = self
            .request(Method::POST, &["nodes", &req.node, "qemu"])?
            .form(&req.to_params());
        self.send_task(&req.node, builder).await
    }

    #[instrument(skip(self, req), fields(node = %req.node, vmid = req.vmid))]
    async fn update_vm_config(&self, req: &UpdateVmConfig) -> Result<TaskHandle, ApiError> {
        let vmid = req.vmid.to_string();
        let builder = self
            .request(Method::POST, &["nodes", &req.node, "qemu", &vmid, "config"])?
            .form(&req.to_params());
        self.send_task(&req.node, builder).await
    }

    #[instrument(skip(self))]
    async fn reboot_vm(
        &self,
        node: &str,
        vmid: u32,
        timeout_secs: u32,
    ) -> Result<TaskHandle, ApiError> {
        let vmid = vmid.to_string();
        let builder = self
            .request(Method::POST, &["nodes", node, "qemu", &vmid, "status", "reboot"])?
            .form(&[("timeout", timeout_secs.to_string())]);
        self.send_task(node, builder).await
    }

    #[instrument(skip(self))]
    async fn delete_vm(&self, node: &str, vmid: u32, purge: bool) -> Result<TaskHandle, ApiError> {
        let vmid = vmid.to_string();
        let builder = self
            .request(Method::DELETE, &["nodes", node, "qemu", &vmid])?
            .query(&[("purge", format_bool(purge))]);
        self.send_task(node, builder).await
    }

    #[instrument(skip(self, req), fields(node = %req.node, storage = %req.storage))]
    async fn download_url(&self, req: &DownloadUrlRequest) -> Result<TaskHandle, ApiError> {
        let builder = self
            .request(Method::POST, &["nodes", &req.node, "storage", &req.storage, "download-url"])?
            .form(&req.to_params());
        self.send_task(&req.node, builder).await
    }

    #[instrument(skip(self))]
    async fn find_content(
        &self,
        node: &str,
        storage: &str,
        volume: &str,
    ) -> Result<Value, ApiError> {
        let req =
            self.request(Method::GET, &["nodes", node, "storage", storage, "content", volume])?;
        self.send(req).await
    }

    #[instrument(skip(self))]
    async fn delete_content(
        &self,
        node: &str,
        storage: &str,
        volume: &str,
    ) -> Result<TaskHandle, ApiError> {
        let req =
            self.request(Method::DELETE, &["nodes", node, "storage", storage, "content", volume])?;
        self.send_task(node, req).await
    }

    #[instrument(skip(self, res), fields(sid = %res.sid))]
    async fn create_ha_resource(&self, res: &HaResource) -> Result<(), ApiError> {
        let builder = self
            .request(Method::POST, &["cluster", "ha", "resources"])?
            .form(&res.to_params(true));
        let _: Value = self.send(builder).await?;
        Ok(())
    }

    #[instrument(skip(self, res), fields(sid = %res.sid))]
    async fn update_ha_resource(&self, res: &HaResource) -> Result<(), ApiError> {
        let builder = self
            .request(Method::PUT, &["cluster", "ha", "resources", &res.sid])?
            .form(&res.to_params(false));
        let _: Value = self.send(builder).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_ha_resource(&self, sid: &str) -> Result<HaResource, ApiError> {
        let req = self.request(Method::GET, &["cluster", "ha", "resources", sid])?;
        self.send(req).await
    }

    #[instrument(skip(self))]
    async fn delete_ha_resource(&self, sid: &str) -> Result<(), ApiError> {
        let req = self.request(Method::DELETE, &["cluster", "ha", "resources", sid])?;
        let _: Value = self.send(req).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Value, ApiError> {
        let mut req = self.request(Method::GET, segments)?;
        if !query.is_empty() {
            req = req.query(query);
        }
        self.send(req).await
    }
}
