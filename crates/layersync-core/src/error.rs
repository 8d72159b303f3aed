//! Error types
//!
//! Every failure in the adapter is scoped to a feature or a layer. None of
//! these errors stop the reactor; they are logged and, where a user should
//! know, surfaced as a `SyncNotice`.

use thiserror::Error;

use crate::models::{LayerId, LocalId, RemoteId};

/// Errors raised by the synchronization adapter
#[derive(Error, Debug)]
pub enum SyncError {
    /// Identity map double-bind
    #[error("Identity conflict in layer {layer}: {local} / {remote} clashes with an existing binding")]
    Conflict {
        layer: LayerId,
        local: LocalId,
        remote: RemoteId,
    },

    /// Geometry or attributes cannot be converted
    #[error("Malformed feature: {details}")]
    MalformedFeature { details: String },

    /// Merge requested on a layer without a parent
    #[error("Layer {0} is not a sub-layer")]
    NotASubLayer(LayerId),

    /// Sub-layer requested from a layer that is itself a sub-layer
    #[error("Layer {0} is already a sub-layer; sub-layers cannot be nested")]
    NestedSubLayer(LayerId),

    /// Sub-layer requested without any selected features
    #[error("No features selected for the new sub-layer")]
    EmptySelection,

    /// The layer is not known to the registry
    #[error("Unknown layer {0}")]
    UnknownLayer(LayerId),

    /// A merge of this sub-layer is already running
    #[error("Sub-layer {0} is already being merged")]
    MergeInProgress(LayerId),

    /// Remote request failed
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Host store failed
    #[error(transparent)]
    Host(#[from] HostError),

    /// The adapter task is gone
    #[error("Adapter is not running")]
    AdapterClosed,
}

impl SyncError {
    pub fn malformed(details: impl Into<String>) -> Self {
        SyncError::MalformedFeature {
            details: details.into(),
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_transient(),
            SyncError::MergeInProgress(_) | SyncError::AdapterClosed => true,
            _ => false,
        }
    }

    /// Short message suitable for a visible, non-fatal notice
    pub fn user_notice(&self) -> Option<&'static str> {
        match self {
            SyncError::MalformedFeature { .. } => {
                Some("A feature could not be converted and was skipped. Other features keep syncing.")
            }
            SyncError::NotASubLayer(_) => Some("Only sub-layers can be merged."),
            SyncError::NestedSubLayer(_) => {
                Some("This layer is already a sub-layer; you cannot create a sub-layer from it.")
            }
            SyncError::EmptySelection => {
                Some("Select features from the loaded layer to create a sub-layer.")
            }
            SyncError::Remote(_) => {
                Some("The remote store rejected the change. The local feature was kept; edit it again to retry.")
            }
            _ => None,
        }
    }
}

/// Errors from the remote query interface
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Transport failure (connection refused, timeout, TLS)
    #[error("Remote request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("({status}) {message}")]
    Status { status: u16, message: String },

    /// The response body could not be decoded
    #[error("Failed to decode remote response: {0}")]
    Decode(String),

    /// The row or layer does not exist remotely
    #[error("Not found: {0}")]
    NotFound(String),

    /// The remote rejected the write (constraint, transaction abort)
    #[error("Rejected by remote: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Network-level failures and 5xx responses may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Http(e) => e.is_timeout() || e.is_connect(),
            RemoteError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Errors from the host feature store
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Host layer {0} is not open")]
    UnknownLayer(LayerId),

    #[error("Host feature {0} does not exist")]
    UnknownFeature(LocalId),

    #[error("Host store error: {0}")]
    Store(String),
}

/// Result type for adapter operations
pub type SyncResult<T> = Result<T, SyncError>;
