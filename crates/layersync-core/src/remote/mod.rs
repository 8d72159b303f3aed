//! Remote feature store
//!
//! [`RemoteStore`] is the row-oriented CRUD contract over the `layers` and
//! `points` tables plus the `merge_sub_layer` procedure. [`RestClient`]
//! talks to a PostgREST endpoint; [`MemoryRemote`] implements the same
//! contract in process, triggers included.

mod memory;
mod rest;

pub use memory::MemoryRemote;
pub use rest::{RestClient, RestConfig};

use async_trait::async_trait;
use std::fmt;

use crate::error::RemoteError;
use crate::models::{LayerAttribute, LayerId, LayerInfo, RemoteFeature, RemoteId};

/// Row change reported by the remote change stream
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Insert(RemoteFeature),
    Update(RemoteFeature),
    /// Deletes only carry the row identifier
    Delete { id: RemoteId },
}

impl RemoteChange {
    pub fn id(&self) -> RemoteId {
        match self {
            RemoteChange::Insert(row) | RemoteChange::Update(row) => row.id,
            RemoteChange::Delete { id } => *id,
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// All layers, sorted by name
    async fn list_layers(&self) -> Result<Vec<LayerInfo>, RemoteError>;

    async fn get_layer(&self, id: LayerId) -> Result<LayerInfo, RemoteError>;

    async fn fetch_features(&self, layer: LayerId) -> Result<Vec<RemoteFeature>, RemoteError>;

    async fn insert_features(&self, rows: &[RemoteFeature]) -> Result<(), RemoteError>;

    /// Overwrite rows by id
    async fn update_features(&self, rows: &[RemoteFeature]) -> Result<(), RemoteError>;

    async fn delete_features(&self, ids: &[RemoteId]) -> Result<(), RemoteError>;

    async fn create_layer(&self, layer: &LayerInfo) -> Result<(), RemoteError>;

    async fn drop_layer(&self, id: LayerId) -> Result<(), RemoteError>;

    async fn rename_layer(&self, id: LayerId, name: &str) -> Result<(), RemoteError>;

    async fn update_layer_attributes(
        &self,
        id: LayerId,
        attributes: &[LayerAttribute],
    ) -> Result<(), RemoteError>;

    /// Fold a sub-layer into its parent as one transaction
    async fn merge_sub_layer(&self, sub_layer: LayerId) -> Result<(), RemoteError>;
}

/// A write the adapter sends to the remote store
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteRequest {
    InsertFeatures(Vec<RemoteFeature>),
    UpdateFeatures(Vec<RemoteFeature>),
    DeleteFeatures(Vec<RemoteId>),
    UpdateLayerAttributes {
        layer: LayerId,
        attributes: Vec<LayerAttribute>,
    },
    MergeSubLayer(LayerId),
}

impl RemoteRequest {
    pub async fn execute(&self, store: &dyn RemoteStore) -> Result<(), RemoteError> {
        match self {
            RemoteRequest::InsertFeatures(rows) => store.insert_features(rows).await,
            RemoteRequest::UpdateFeatures(rows) => store.update_features(rows).await,
            RemoteRequest::DeleteFeatures(ids) => store.delete_features(ids).await,
            RemoteRequest::UpdateLayerAttributes { layer, attributes } => {
                store.update_layer_attributes(*layer, attributes).await
            }
            RemoteRequest::MergeSubLayer(layer) => store.merge_sub_layer(*layer).await,
        }
    }

    /// Number of rows the request touches
    pub fn len(&self) -> usize {
        match self {
            RemoteRequest::InsertFeatures(rows) | RemoteRequest::UpdateFeatures(rows) => rows.len(),
            RemoteRequest::DeleteFeatures(ids) => ids.len(),
            RemoteRequest::UpdateLayerAttributes { .. } | RemoteRequest::MergeSubLayer(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for RemoteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteRequest::InsertFeatures(rows) => write!(f, "insert {} feature(s)", rows.len()),
            RemoteRequest::UpdateFeatures(rows) => write!(f, "update {} feature(s)", rows.len()),
            RemoteRequest::DeleteFeatures(ids) => write!(f, "delete {} feature(s)", ids.len()),
            RemoteRequest::UpdateLayerAttributes { layer, .. } => {
                write!(f, "update attributes of layer {}", layer)
            }
            RemoteRequest::MergeSubLayer(layer) => write!(f, "merge sub-layer {}", layer),
        }
    }
}
