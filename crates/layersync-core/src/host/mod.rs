//! Host feature store
//!
//! The host is the locally editable side: a desktop GIS layer, or in this
//! workspace a SQLite feature file. The adapter only needs a narrow
//! capability from it, captured by [`HostStore`]. Change notifications
//! travel separately as [`LocalChange`]s on a bounded channel.

mod memory;

pub use memory::MemoryHost;

use crate::error::HostError;
use crate::models::{LayerAttribute, LayerId, LayerInfo, LocalFeature, LocalId, RemoteId};

/// A mutation the adapter applies to a host layer
#[derive(Debug, Clone, PartialEq)]
pub enum HostMutation {
    Insert(LocalFeature),
    Update(LocalId, LocalFeature),
    Delete(LocalId),
}

/// Change reported by the host for one of its layers
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChange {
    pub layer: LayerId,
    pub kind: LocalChangeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocalChangeKind {
    /// Feature added; `local_id` is set
    Insert(LocalFeature),
    /// Feature geometry or attributes changed; `local_id` is set
    Update(LocalFeature),
    Delete(LocalId),
    /// The layer's attribute schema was edited
    SchemaChanged(Vec<LayerAttribute>),
}

impl LocalChange {
    pub fn insert(layer: LayerId, feature: LocalFeature) -> Self {
        Self {
            layer,
            kind: LocalChangeKind::Insert(feature),
        }
    }

    pub fn update(layer: LayerId, feature: LocalFeature) -> Self {
        Self {
            layer,
            kind: LocalChangeKind::Update(feature),
        }
    }

    pub fn delete(layer: LayerId, id: LocalId) -> Self {
        Self {
            layer,
            kind: LocalChangeKind::Delete(id),
        }
    }
}

/// Capability the adapter consumes from the host
pub trait HostStore: Send {
    /// Make a layer available for editing, creating it if needed
    fn open_layer(&mut self, layer: &LayerInfo) -> Result<(), HostError>;

    /// Remove a layer from the host
    fn close_layer(&mut self, layer: LayerId) -> Result<(), HostError>;

    /// Apply a mutation; inserts return the id the host assigned
    fn apply_feature(
        &mut self,
        layer: LayerId,
        mutation: HostMutation,
    ) -> Result<Option<LocalId>, HostError>;

    /// Snapshot of the layer's features, with their embedded remote ids
    fn current_features(&self, layer: LayerId) -> Result<Vec<LocalFeature>, HostError>;

    /// Store (or clear) the remote id in the feature's host metadata
    ///
    /// Tagging is not an edit and must not produce a change notification.
    fn tag_feature(
        &mut self,
        layer: LayerId,
        local: LocalId,
        remote: Option<RemoteId>,
    ) -> Result<(), HostError>;

    /// Whether mutations applied through this trait come back as changes
    fn echoes_mutations(&self) -> bool {
        true
    }
}
