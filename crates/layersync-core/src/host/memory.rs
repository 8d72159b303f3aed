//! In-memory host
//!
//! Behaves like a desktop GIS layer set: edits made "by the user" are
//! reported as [`LocalChange`]s, and so are mutations applied by the
//! adapter unless echoing is turned off. Clones share the same store.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::warn;

use super::{HostMutation, HostStore, LocalChange, LocalChangeKind};
use crate::error::HostError;
use crate::models::{LayerAttribute, LayerId, LayerInfo, LocalFeature, LocalId, RemoteId};

#[derive(Debug, Default)]
struct Inner {
    open: HashSet<LayerId>,
    layers: BTreeMap<LayerId, BTreeMap<LocalId, LocalFeature>>,
    schemas: BTreeMap<LayerId, Vec<LayerAttribute>>,
    next_id: i64,
}

impl Inner {
    fn allocate(&mut self) -> LocalId {
        self.next_id += 1;
        LocalId(self.next_id)
    }

    fn layer_mut(&mut self, layer: LayerId) -> Result<&mut BTreeMap<LocalId, LocalFeature>, HostError> {
        if !self.open.contains(&layer) {
            return Err(HostError::UnknownLayer(layer));
        }
        self.layers
            .get_mut(&layer)
            .ok_or(HostError::UnknownLayer(layer))
    }
}

#[derive(Debug, Clone)]
pub struct MemoryHost {
    inner: Arc<Mutex<Inner>>,
    changes: mpsc::Sender<LocalChange>,
    echo: bool,
}

impl MemoryHost {
    /// Create a host and the receiving end of its change notifications
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LocalChange>) {
        let (tx, rx) = mpsc::channel(capacity);
        let host = Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            changes: tx,
            echo: true,
        };
        (host, rx)
    }

    /// Stop reporting adapter-applied mutations as changes
    pub fn without_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, change: LocalChange) {
        if let Err(e) = self.changes.try_send(change) {
            warn!("Dropping host change notification: {}", e);
        }
    }

    /// Load features as if read from a file, without notifications
    pub fn load(&self, layer: LayerId, features: Vec<LocalFeature>) -> Vec<LocalId> {
        let mut inner = self.lock();
        let mut ids = Vec::with_capacity(features.len());
        for mut feature in features {
            let id = match feature.local_id {
                Some(id) => {
                    inner.next_id = inner.next_id.max(id.0);
                    id
                }
                None => inner.allocate(),
            };
            feature.local_id = Some(id);
            inner.layers.entry(layer).or_default().insert(id, feature);
            ids.push(id);
        }
        ids
    }

    /// User adds a feature
    pub fn user_insert(&self, layer: LayerId, feature: LocalFeature) -> Result<LocalId, HostError> {
        let (id, stored) = {
            let mut inner = self.lock();
            let id = inner.allocate();
            let stored = LocalFeature {
                local_id: Some(id),
                remote_id: None,
                ..feature
            };
            inner.layer_mut(layer)?.insert(id, stored.clone());
            (id, stored)
        };
        self.notify(LocalChange::insert(layer, stored));
        Ok(id)
    }

    /// User edits a feature in place
    pub fn user_update<F>(&self, layer: LayerId, id: LocalId, edit: F) -> Result<(), HostError>
    where
        F: FnOnce(&mut LocalFeature),
    {
        let updated = {
            let mut inner = self.lock();
            let feature = inner
                .layer_mut(layer)?
                .get_mut(&id)
                .ok_or(HostError::UnknownFeature(id))?;
            edit(feature);
            feature.clone()
        };
        self.notify(LocalChange::update(layer, updated));
        Ok(())
    }

    /// User deletes a feature
    pub fn user_delete(&self, layer: LayerId, id: LocalId) -> Result<(), HostError> {
        self.lock()
            .layer_mut(layer)?
            .remove(&id)
            .ok_or(HostError::UnknownFeature(id))?;
        self.notify(LocalChange::delete(layer, id));
        Ok(())
    }

    /// User edits the attribute schema of a layer
    pub fn user_change_schema(
        &self,
        layer: LayerId,
        attributes: Vec<LayerAttribute>,
    ) -> Result<(), HostError> {
        {
            let mut inner = self.lock();
            inner.layer_mut(layer)?;
            inner.schemas.insert(layer, attributes.clone());
        }
        self.notify(LocalChange {
            layer,
            kind: LocalChangeKind::SchemaChanged(attributes),
        });
        Ok(())
    }

    pub fn is_open(&self, layer: LayerId) -> bool {
        self.lock().open.contains(&layer)
    }

    pub fn features(&self, layer: LayerId) -> Vec<LocalFeature> {
        self.lock()
            .layers
            .get(&layer)
            .map(|features| features.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn feature(&self, layer: LayerId, id: LocalId) -> Option<LocalFeature> {
        self.lock().layers.get(&layer)?.get(&id).cloned()
    }

    /// Find a feature by its embedded remote id
    pub fn find_by_remote(&self, layer: LayerId, remote: RemoteId) -> Option<LocalFeature> {
        self.lock()
            .layers
            .get(&layer)?
            .values()
            .find(|f| f.remote_id == Some(remote))
            .cloned()
    }

    pub fn schema(&self, layer: LayerId) -> Option<Vec<LayerAttribute>> {
        self.lock().schemas.get(&layer).cloned()
    }
}

impl HostStore for MemoryHost {
    fn open_layer(&mut self, layer: &LayerInfo) -> Result<(), HostError> {
        let mut inner = self.lock();
        inner.open.insert(layer.id);
        inner.layers.entry(layer.id).or_default();
        inner.schemas.insert(layer.id, layer.attributes.clone());
        Ok(())
    }

    fn close_layer(&mut self, layer: LayerId) -> Result<(), HostError> {
        let mut inner = self.lock();
        if !inner.open.remove(&layer) {
            return Err(HostError::UnknownLayer(layer));
        }
        inner.layers.remove(&layer);
        inner.schemas.remove(&layer);
        Ok(())
    }

    fn apply_feature(
        &mut self,
        layer: LayerId,
        mutation: HostMutation,
    ) -> Result<Option<LocalId>, HostError> {
        let (assigned, change) = {
            let mut inner = self.lock();
            match mutation {
                HostMutation::Insert(feature) => {
                    let id = inner.allocate();
                    let stored = LocalFeature {
                        local_id: Some(id),
                        ..feature
                    };
                    inner.layer_mut(layer)?.insert(id, stored.clone());
                    (Some(id), LocalChange::insert(layer, stored))
                }
                HostMutation::Update(id, feature) => {
                    let existing = inner
                        .layer_mut(layer)?
                        .get_mut(&id)
                        .ok_or(HostError::UnknownFeature(id))?;
                    existing.geometry = feature.geometry;
                    existing.attributes = feature.attributes;
                    if feature.remote_id.is_some() {
                        existing.remote_id = feature.remote_id;
                    }
                    (None, LocalChange::update(layer, existing.clone()))
                }
                HostMutation::Delete(id) => {
                    inner
                        .layer_mut(layer)?
                        .remove(&id)
                        .ok_or(HostError::UnknownFeature(id))?;
                    (None, LocalChange::delete(layer, id))
                }
            }
        };

        if self.echo {
            self.notify(change);
        }
        Ok(assigned)
    }

    fn current_features(&self, layer: LayerId) -> Result<Vec<LocalFeature>, HostError> {
        let inner = self.lock();
        let features = inner
            .layers
            .get(&layer)
            .ok_or(HostError::UnknownLayer(layer))?;
        Ok(features.values().cloned().collect())
    }

    fn tag_feature(
        &mut self,
        layer: LayerId,
        local: LocalId,
        remote: Option<RemoteId>,
    ) -> Result<(), HostError> {
        let mut inner = self.lock();
        let feature = inner
            .layer_mut(layer)?
            .get_mut(&local)
            .ok_or(HostError::UnknownFeature(local))?;
        feature.remote_id = remote;
        Ok(())
    }

    fn echoes_mutations(&self) -> bool {
        self.echo
    }
}
