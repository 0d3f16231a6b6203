//! Error types for the Proxmox provider.
//!
//! Three layers of failure exist:
//!
//! - [`ApiError`]: anything the Proxmox HTTP API returned or failed to return.
//! - [`TaskError`]: an asynchronous task that could not be waited on, or that
//!   finished with a non-`OK` exit status.
//! - [`ProviderError`]: what a lifecycle call reports back to the runtime.
//!
//! The backend signals "object does not exist" only through free-form error
//! text. All of that matching lives in [`classify_error`]. The text arrives
//! either as the JSON body's `message` or, when the body carries none, as
//! the HTTP reason phrase, which the client reads through hyper's
//! `ReasonPhrase` response extension.

use std::time::Duration;

use thiserror::Error;

use crate::schema::Diagnostic;

/// Errors returned by the Proxmox API client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("non 200: {code} {message}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Message reported by the API.
        message: String,
    },

    /// The API answered, but the payload did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Shorthand for a status error.
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }
}

/// Errors produced while waiting on an asynchronous task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Polling the task status failed.
    #[error("failed to read task status: {0}")]
    Transport(#[source] ApiError),

    /// The task finished with an exit status other than `OK`.
    #[error("received bad exit status: {0}")]
    BadExit(String),

    /// The task stopped but reported no exit status.
    #[error("task stopped without an exit status")]
    MissingExitStatus,

    /// The wait was cancelled by the caller.
    #[error("wait cancelled")]
    Cancelled,

    /// The task did not finish before the configured deadline.
    #[error("task still running after {0:?}")]
    DeadlineExceeded(Duration),
}

/// Errors that can occur while running a provider lifecycle call.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested object was not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The configuration failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The provider itself is not configured correctly.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested resource or data source type is unknown.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// State could not be converted to or from JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A Proxmox API call failed.
    #[error("{context}: Proxmox API error: {source}")]
    Api {
        /// What the provider was doing.
        context: String,
        /// The underlying client error.
        #[source]
        source: ApiError,
    },

    /// A Proxmox task failed or could not be waited on.
    #[error("{context}: Proxmox task error: {source}")]
    Task {
        /// What the provider was doing.
        context: String,
        /// The underlying wait error.
        #[source]
        source: TaskError,
    },

    /// The backend state disagrees with what was just requested.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// An import identifier did not have the expected shape.
    #[error("Unexpected import identifier: expected format {expected}, got {got:?}")]
    InvalidImportId {
        /// The accepted format.
        expected: &'static str,
        /// What was supplied.
        got: String,
    },

    /// The operation is not supported for this resource type.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),
}

impl ProviderError {
    /// Wrap an API error with what the provider was doing.
    pub fn api(context: impl Into<String>, source: ApiError) -> Self {
        Self::Api {
            context: context.into(),
            source,
        }
    }

    /// Wrap a task error with what the provider was doing.
    pub fn task(context: impl Into<String>, source: TaskError) -> Self {
        Self::Task {
            context: context.into(),
            source,
        }
    }

    /// Get the short summary for this error.
    pub fn message(&self) -> String {
        match self {
            Self::NotFound(msg)
            | Self::Validation(msg)
            | Self::Configuration(msg)
            | Self::UnknownResource(msg)
            | Self::Consistency(msg)
            | Self::Unimplemented(msg) => msg.clone(),
            Self::Serialization(_) => "serialization error".to_string(),
            Self::Api { context, .. } | Self::Task { context, .. } => context.clone(),
            Self::InvalidImportId { .. } => "Unexpected Import Identifier".to_string(),
        }
    }

    /// Render this error as an error diagnostic.
    ///
    /// The summary is [`ProviderError::message`]; the detail carries the
    /// original backend or task message so operators see it verbatim.
    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = Diagnostic::error(self.message());
        match self {
            Self::Api { source, .. } => {
                diag.with_detail(format!("Proxmox API Error: {}", source))
            },
            Self::Task { source, .. } => {
                diag.with_detail(format!("Proxmox Task Error: {}", source))
            },
            Self::Serialization(err) => diag.with_detail(err.to_string()),
            Self::InvalidImportId { .. } => diag.with_detail(self.to_string()),
            _ => diag,
        }
    }

    /// Whether the wrapped API error means the VM is already gone.
    pub fn is_missing_vm(&self, node: &str, vmid: u32) -> bool {
        match self {
            Self::Api { source, .. } => {
                classify_error(source, Subject::Vm { node, vmid }) == ErrorKind::VmMissing
            },
            _ => false,
        }
    }
}

/// What kind of object an API call addressed, for error classification.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    /// A QEMU virtual machine.
    Vm {
        /// Node the VM lives on.
        node: &'a str,
        /// Numeric VM id.
        vmid: u32,
    },
    /// A storage content volume.
    Content,
    /// Anything else.
    Other,
}

/// Classification of a backend error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The VM configuration file does not exist.
    VmMissing,
    /// The storage content volume does not exist.
    ContentMissing,
    /// Any other failure.
    Other,
}

/// Substring the storage layer reports when a volume cannot be found.
const CONTENT_MISSING_MARKER: &str = "volume_size_info on";

/// The exact error text Proxmox returns for a VM with no configuration file.
pub fn vm_missing_message(node: &str, vmid: u32) -> String {
    format!(
        "non 200: 500 Configuration file 'nodes/{}/qemu-server/{}.conf' does not exist",
        node, vmid
    )
}

/// Classify a backend error against the object it addressed.
///
/// The VM match is exact; the content match is a substring. Both are
/// coupled to the backend's error text and kept here so nothing else
/// depends on it.
pub fn classify_error(err: &ApiError, subject: Subject<'_>) -> ErrorKind {
    let text = err.to_string();
    match subject {
        Subject::Vm { node, vmid } if text == vm_missing_message(node, vmid) => {
            ErrorKind::VmMissing
        },
        Subject::Content if text.contains(CONTENT_MISSING_MARKER) => ErrorKind::ContentMissing,
        _ => ErrorKind::Other,
    }
}
