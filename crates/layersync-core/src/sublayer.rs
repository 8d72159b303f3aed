//! Sub-layer lifecycle
//!
//! A sub-layer is a working copy of some features of a parent layer. Every
//! copied row keeps a reference to its original in `parent_id`; merging
//! replays the sub-layer's content and its tombstones onto the parent in a
//! single remote transaction.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::SyncError;
use crate::models::{LayerId, LayerInfo, RemoteFeature, RemoteId};
use crate::remote::RemoteStore;

/// Lifecycle of a sub-layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubLayerState {
    Detached,
    Merging,
    Merged,
}

impl fmt::Display for SubLayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubLayerState::Detached => write!(f, "detached"),
            SubLayerState::Merging => write!(f, "merging"),
            SubLayerState::Merged => write!(f, "merged"),
        }
    }
}

/// Known layers, keyed by id
#[derive(Debug, Default)]
pub struct LayerRegistry {
    layers: HashMap<LayerId, LayerInfo>,
    states: HashMap<LayerId, SubLayerState>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the known layers with a fresh listing
    ///
    /// Sub-layers that are merging keep their state; merged ones no longer
    /// listed are forgotten.
    pub fn replace_all(&mut self, layers: Vec<LayerInfo>) {
        self.layers = layers.into_iter().map(|layer| (layer.id, layer)).collect();
        let layers = &self.layers;
        self.states.retain(|id, state| {
            *state == SubLayerState::Merging || layers.contains_key(id)
        });
        for layer in self.layers.values() {
            if layer.is_sub_layer() {
                self.states.entry(layer.id).or_insert(SubLayerState::Detached);
            }
        }
    }

    pub fn insert(&mut self, layer: LayerInfo) {
        if layer.is_sub_layer() {
            self.states.insert(layer.id, SubLayerState::Detached);
        }
        self.layers.insert(layer.id, layer);
    }

    pub fn get(&self, id: LayerId) -> Option<&LayerInfo> {
        self.layers.get(&id)
    }

    pub fn get_mut(&mut self, id: LayerId) -> Option<&mut LayerInfo> {
        self.layers.get_mut(&id)
    }

    pub fn remove(&mut self, id: LayerId) -> Option<LayerInfo> {
        self.states.remove(&id);
        self.layers.remove(&id)
    }

    pub fn state(&self, id: LayerId) -> Option<SubLayerState> {
        self.states.get(&id).copied()
    }

    /// All layers sorted by name
    pub fn list(&self) -> Vec<&LayerInfo> {
        let mut layers: Vec<&LayerInfo> = self.layers.values().collect();
        layers.sort_by(|a, b| a.name.cmp(&b.name));
        layers
    }

    pub fn sub_layers_of(&self, parent: LayerId) -> Vec<&LayerInfo> {
        let mut layers: Vec<&LayerInfo> = self
            .layers
            .values()
            .filter(|layer| layer.parent_id == Some(parent))
            .collect();
        layers.sort_by(|a, b| a.name.cmp(&b.name));
        layers
    }

    /// Validate a merge request and mark the sub-layer as merging
    ///
    /// Runs before any remote call. Returns the sub-layer's info.
    pub fn begin_merge(&mut self, id: LayerId) -> Result<LayerInfo, SyncError> {
        let layer = self.layers.get(&id).ok_or(SyncError::UnknownLayer(id))?;
        if !layer.is_sub_layer() {
            return Err(SyncError::NotASubLayer(id));
        }
        if self.states.get(&id) == Some(&SubLayerState::Merging) {
            return Err(SyncError::MergeInProgress(id));
        }
        self.states.insert(id, SubLayerState::Merging);
        Ok(layer.clone())
    }

    /// Record the outcome of a merge
    ///
    /// A merged sub-layer no longer exists remotely and is removed from the
    /// known layers. A failed merge changed nothing, so the sub-layer is
    /// detached again.
    pub fn finish_merge(&mut self, id: LayerId, merged: bool) {
        if merged {
            self.layers.remove(&id);
            self.states.insert(id, SubLayerState::Merged);
        } else {
            self.states.insert(id, SubLayerState::Detached);
        }
    }
}

/// Remote side of sub-layer creation and merge
#[derive(Clone)]
pub struct SubLayerManager {
    remote: Arc<dyn RemoteStore>,
}

impl SubLayerManager {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self { remote }
    }

    /// Create a sub-layer holding copies of `rows`
    ///
    /// `rows` are rows of `parent` as they should be copied. Each copy gets
    /// a fresh id and refers to the row it was copied from.
    pub async fn create(
        &self,
        parent: &LayerInfo,
        name: &str,
        rows: Vec<RemoteFeature>,
    ) -> Result<LayerInfo, SyncError> {
        if parent.is_sub_layer() {
            return Err(SyncError::NestedSubLayer(parent.id));
        }
        if rows.is_empty() {
            return Err(SyncError::EmptySelection);
        }

        let sub_layer = LayerInfo {
            id: LayerId::new(),
            name: name.to_string(),
            geometry_type: parent.geometry_type.clone(),
            srid: parent.srid,
            attributes: parent.attributes.clone(),
            parent_id: Some(parent.id),
            temporary: false,
        };
        self.remote.create_layer(&sub_layer).await?;

        let copies = copy_rows(sub_layer.id, rows);
        debug!(
            "Copying {} feature(s) from '{}' into sub-layer '{}'",
            copies.len(),
            parent.name,
            sub_layer.name
        );
        self.remote.insert_features(&copies).await?;

        info!(
            "Created sub-layer '{}' ({}) of '{}' with {} feature(s)",
            sub_layer.name,
            sub_layer.id,
            parent.name,
            copies.len()
        );
        Ok(sub_layer)
    }

    /// Run the remote merge procedure for an unsubscribed sub-layer
    pub async fn merge(&self, sub_layer: LayerId) -> Result<(), SyncError> {
        self.remote.merge_sub_layer(sub_layer).await?;
        info!("Merged sub-layer {}", sub_layer);
        Ok(())
    }
}

fn copy_rows(sub_layer: LayerId, rows: Vec<RemoteFeature>) -> Vec<RemoteFeature> {
    rows.into_iter()
        .map(|row| RemoteFeature {
            id: RemoteId::new(),
            layer_id: sub_layer,
            geom: row.geom,
            attributes: row.attributes,
            parent_id: Some(row.id),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttributeType, LayerAttribute};
    use crate::remote::MemoryRemote;
    use serde_json::json;

    fn parent() -> LayerInfo {
        LayerInfo::new("poles", 4326).with_attribute(LayerAttribute::new("code", AttributeType::Text))
    }

    fn row(layer: LayerId, code: &str) -> RemoteFeature {
        RemoteFeature {
            id: RemoteId::new(),
            layer_id: layer,
            geom: json!({"type": "Point", "coordinates": [1.0, 2.0, 3.0]}),
            attributes: json!({ "code": code }).as_object().cloned().unwrap(),
            parent_id: None,
        }
    }

    #[test]
    fn test_registry_merge_checks() {
        let mut registry = LayerRegistry::new();
        let parent = parent();
        let mut sub = LayerInfo::new("poles-edit", 4326);
        sub.parent_id = Some(parent.id);
        registry.insert(parent.clone());
        registry.insert(sub.clone());

        assert!(matches!(
            registry.begin_merge(parent.id),
            Err(SyncError::NotASubLayer(_))
        ));
        assert!(matches!(
            registry.begin_merge(LayerId::new()),
            Err(SyncError::UnknownLayer(_))
        ));

        assert_eq!(registry.state(sub.id), Some(SubLayerState::Detached));
        registry.begin_merge(sub.id).unwrap();
        assert_eq!(registry.state(sub.id), Some(SubLayerState::Merging));
        assert!(matches!(
            registry.begin_merge(sub.id),
            Err(SyncError::MergeInProgress(_))
        ));

        registry.finish_merge(sub.id, false);
        assert_eq!(registry.state(sub.id), Some(SubLayerState::Detached));

        registry.begin_merge(sub.id).unwrap();
        registry.finish_merge(sub.id, true);
        assert_eq!(registry.state(sub.id), Some(SubLayerState::Merged));
        assert!(registry.get(sub.id).is_none());
    }

    #[test]
    fn test_registry_listing() {
        let mut registry = LayerRegistry::new();
        let parent = parent();
        let mut b = LayerInfo::new("b-edit", 4326);
        b.parent_id = Some(parent.id);
        let mut a = LayerInfo::new("a-edit", 4326);
        a.parent_id = Some(parent.id);
        registry.replace_all(vec![b.clone(), parent.clone(), a.clone()]);

        let names: Vec<&str> = registry.list().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["a-edit", "b-edit", "poles"]);
        let subs: Vec<&str> = registry
            .sub_layers_of(parent.id)
            .iter()
            .map(|l| l.name.as_str())
            .collect();
        assert_eq!(subs, vec!["a-edit", "b-edit"]);
        assert_eq!(registry.state(a.id), Some(SubLayerState::Detached));
        assert_eq!(registry.state(parent.id), None);
    }

    #[tokio::test]
    async fn test_create_copies_rows_with_parent_reference() {
        let remote = MemoryRemote::new();
        let parent = parent();
        let rows = vec![row(parent.id, "a"), row(parent.id, "b")];
        remote.seed(parent.clone(), rows.clone());

        let manager = SubLayerManager::new(Arc::new(remote.clone()));
        let sub = manager
            .create(&parent, "poles-edit", rows.clone())
            .await
            .unwrap();

        assert_eq!(sub.parent_id, Some(parent.id));
        assert_eq!(sub.attributes, parent.attributes);
        assert!(remote.layer(sub.id).is_some());

        let copies = remote.points_of(sub.id);
        assert_eq!(copies.len(), 2);
        for copy in &copies {
            let original = copy.parent_id.unwrap();
            assert!(rows.iter().any(|r| r.id == original));
            assert_ne!(copy.id, original);
        }
        // The parent is untouched
        assert_eq!(remote.points_of(parent.id).len(), 2);
    }

    #[tokio::test]
    async fn test_create_refuses_nested_and_empty() {
        let remote = MemoryRemote::new();
        let manager = SubLayerManager::new(Arc::new(remote.clone()));
        let parent = parent();
        remote.seed(parent.clone(), Vec::new());

        let err = manager.create(&parent, "empty", Vec::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::EmptySelection));

        let mut sub = LayerInfo::new("nested", 4326);
        sub.parent_id = Some(parent.id);
        let err = manager
            .create(&sub, "deeper", vec![row(sub.id, "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NestedSubLayer(_)));
        assert!(remote.requests().is_empty());
    }
}
