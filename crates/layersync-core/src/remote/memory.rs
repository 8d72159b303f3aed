//! In-process remote store
//!
//! Implements the whole remote schema contract in memory: the `layers` and
//! `points` tables, the `points_log` audit trail and `sub_layer_deletes`
//! tombstones written by the server triggers, and the transactional
//! `merge_sub_layer` procedure. Every committed row change is published to
//! subscribers the way the realtime stream would, with geometry as hex
//! EWKB. Clones share the same store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{RemoteChange, RemoteRequest, RemoteStore};
use crate::convert::{decode_point, encode_ewkb_hex, encode_point};
use crate::echo::Operation;
use crate::error::RemoteError;
use crate::models::{LayerAttribute, LayerId, LayerInfo, RemoteFeature, RemoteId};

/// One row of the `points_log` audit table
#[derive(Debug, Clone, PartialEq)]
pub struct PointLogEntry {
    pub point_id: RemoteId,
    pub layer_id: LayerId,
    pub operation: Operation,
    pub at: DateTime<Utc>,
}

/// One row of `sub_layer_deletes`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    pub sub_layer_id: LayerId,
    pub parent_feature_id: RemoteId,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    layers: BTreeMap<LayerId, LayerInfo>,
    points: BTreeMap<RemoteId, RemoteFeature>,
    points_log: Vec<PointLogEntry>,
    sub_layer_deletes: Vec<Tombstone>,
}

impl Tables {
    fn srid_of(&self, layer: LayerId) -> i32 {
        self.layers.get(&layer).map(|l| l.srid).unwrap_or(4326)
    }

    fn log(&mut self, row: &RemoteFeature, operation: Operation) {
        self.points_log.push(PointLogEntry {
            point_id: row.id,
            layer_id: row.layer_id,
            operation,
            at: Utc::now(),
        });
    }

    /// Validate and normalize a row before it is written
    fn check_row(&self, row: &RemoteFeature) -> Result<RemoteFeature, RemoteError> {
        let layer = self
            .layers
            .get(&row.layer_id)
            .ok_or_else(|| RemoteError::Rejected(format!("layer {} does not exist", row.layer_id)))?;
        let point = decode_point(&row.geom).map_err(|e| RemoteError::Status {
            status: 400,
            message: e.to_string(),
        })?;
        let geom = encode_point(&point, layer.srid).map_err(|e| RemoteError::Status {
            status: 400,
            message: e.to_string(),
        })?;
        Ok(RemoteFeature {
            geom,
            ..row.clone()
        })
    }

    fn insert_point(&mut self, row: RemoteFeature) -> Result<RemoteChange, RemoteError> {
        if self.points.contains_key(&row.id) {
            return Err(RemoteError::Status {
                status: 409,
                message: "duplicate key value violates unique constraint \"points_pkey\"".to_string(),
            });
        }
        self.log(&row, Operation::Insert);
        let change = RemoteChange::Insert(self.wire_row(&row));
        self.points.insert(row.id, row);
        Ok(change)
    }

    fn update_point(&mut self, row: RemoteFeature) -> RemoteChange {
        self.log(&row, Operation::Update);
        let change = RemoteChange::Update(self.wire_row(&row));
        self.points.insert(row.id, row);
        change
    }

    /// Delete a point, recording a tombstone when it came from a parent
    fn delete_point(&mut self, id: RemoteId, tombstone: bool) -> Option<RemoteChange> {
        let row = self.points.remove(&id)?;
        self.log(&row, Operation::Delete);
        if let (true, Some(parent_feature_id)) = (tombstone, row.parent_id) {
            self.sub_layer_deletes.push(Tombstone {
                sub_layer_id: row.layer_id,
                parent_feature_id,
            });
        }
        Some(RemoteChange::Delete { id })
    }

    /// The row as the change stream reports it
    fn wire_row(&self, row: &RemoteFeature) -> RemoteFeature {
        let geom = decode_point(&row.geom)
            .map(|p| serde_json::Value::String(encode_ewkb_hex(&p, self.srid_of(row.layer_id))))
            .unwrap_or_else(|_| row.geom.clone());
        RemoteFeature {
            geom,
            ..row.clone()
        }
    }

    fn merge(&mut self, sub_layer: LayerId) -> Result<Vec<RemoteChange>, RemoteError> {
        let sub = self
            .layers
            .get(&sub_layer)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("layer {}", sub_layer)))?;
        let parent = sub
            .parent_id
            .ok_or_else(|| RemoteError::Rejected(format!("layer {} is not a sub-layer", sub.id)))?;

        let sub_rows: Vec<RemoteFeature> = self
            .points
            .values()
            .filter(|p| p.layer_id == sub_layer)
            .cloned()
            .collect();
        let mut changes = Vec::new();

        for row in &sub_rows {
            match row.parent_id {
                Some(parent_feature) => {
                    let Some(target) = self.points.get(&parent_feature).cloned() else {
                        debug!("Parent feature {} no longer exists, skipping", parent_feature);
                        continue;
                    };
                    let updated = RemoteFeature {
                        geom: row.geom.clone(),
                        attributes: row.attributes.clone(),
                        ..target
                    };
                    changes.push(self.update_point(updated));
                }
                None => {
                    let inserted = RemoteFeature {
                        id: RemoteId::new(),
                        layer_id: parent,
                        geom: row.geom.clone(),
                        attributes: row.attributes.clone(),
                        parent_id: None,
                    };
                    changes.push(self.insert_point(inserted)?);
                }
            }
        }

        let tombstones: Vec<RemoteId> = self
            .sub_layer_deletes
            .iter()
            .filter(|t| t.sub_layer_id == sub_layer)
            .map(|t| t.parent_feature_id)
            .collect();
        for id in tombstones {
            if let Some(change) = self.delete_point(id, false) {
                changes.push(change);
            }
        }

        for row in &sub_rows {
            if let Some(change) = self.delete_point(row.id, false) {
                changes.push(change);
            }
        }
        self.sub_layer_deletes.retain(|t| t.sub_layer_id != sub_layer);
        self.layers.remove(&sub_layer);

        Ok(changes)
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: Tables,
    requests: Vec<RemoteRequest>,
    subscribers: Vec<mpsc::Sender<RemoteChange>>,
    failures: usize,
    reject_merge: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<Inner>>,
    latency: Option<Duration>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every write by `latency` before it is applied, and every
    /// feature read by `latency` after its snapshot is taken
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receive committed row changes, like a realtime subscription
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<RemoteChange> {
        let (tx, rx) = mpsc::channel(capacity);
        self.lock().subscribers.push(tx);
        rx
    }

    /// Create a layer and its rows without logging or notifications
    pub fn seed(&self, layer: LayerInfo, rows: Vec<RemoteFeature>) {
        let mut inner = self.lock();
        inner.tables.layers.insert(layer.id, layer);
        for row in rows {
            inner.tables.points.insert(row.id, row);
        }
    }

    /// Make the next `count` write requests fail with a server error
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failures = count;
    }

    /// Make `merge_sub_layer` abort
    pub fn reject_merges(&self, reject: bool) {
        self.lock().reject_merge = reject;
    }

    /// Write requests received so far, in order
    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    pub fn layer(&self, id: LayerId) -> Option<LayerInfo> {
        self.lock().tables.layers.get(&id).cloned()
    }

    pub fn point(&self, id: RemoteId) -> Option<RemoteFeature> {
        self.lock().tables.points.get(&id).cloned()
    }

    pub fn points_of(&self, layer: LayerId) -> Vec<RemoteFeature> {
        self.lock()
            .tables
            .points
            .values()
            .filter(|p| p.layer_id == layer)
            .cloned()
            .collect()
    }

    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.lock().tables.sub_layer_deletes.clone()
    }

    pub fn points_log(&self) -> Vec<PointLogEntry> {
        self.lock().tables.points_log.clone()
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Run a write as one transaction and publish its changes on commit
    fn transact<F>(&self, request: Option<RemoteRequest>, apply: F) -> Result<(), RemoteError>
    where
        F: FnOnce(&mut Tables) -> Result<Vec<RemoteChange>, RemoteError>,
    {
        let mut inner = self.lock();
        if let Some(request) = request {
            inner.requests.push(request);
        }

        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(RemoteError::Status {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }

        let mut staged = inner.tables.clone();
        let changes = apply(&mut staged)?;
        inner.tables = staged;

        inner.subscribers.retain(|tx| !tx.is_closed());
        for change in changes {
            for tx in &inner.subscribers {
                if let Err(e) = tx.try_send(change.clone()) {
                    warn!("Dropping remote change for a slow subscriber: {}", e);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_layers(&self) -> Result<Vec<LayerInfo>, RemoteError> {
        let mut layers: Vec<LayerInfo> = self.lock().tables.layers.values().cloned().collect();
        layers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(layers)
    }

    async fn get_layer(&self, id: LayerId) -> Result<LayerInfo, RemoteError> {
        self.layer(id)
            .ok_or_else(|| RemoteError::NotFound(format!("layer {}", id)))
    }

    async fn fetch_features(&self, layer: LayerId) -> Result<Vec<RemoteFeature>, RemoteError> {
        let rows = self.points_of(layer);
        self.delay().await;
        Ok(rows)
    }

    async fn insert_features(&self, rows: &[RemoteFeature]) -> Result<(), RemoteError> {
        self.delay().await;
        self.transact(Some(RemoteRequest::InsertFeatures(rows.to_vec())), |tables| {
            let mut changes = Vec::with_capacity(rows.len());
            for row in rows {
                let row = tables.check_row(row)?;
                changes.push(tables.insert_point(row)?);
            }
            Ok(changes)
        })
    }

    async fn update_features(&self, rows: &[RemoteFeature]) -> Result<(), RemoteError> {
        self.delay().await;
        self.transact(Some(RemoteRequest::UpdateFeatures(rows.to_vec())), |tables| {
            let mut changes = Vec::with_capacity(rows.len());
            for row in rows {
                let row = tables.check_row(row)?;
                let change = if tables.points.contains_key(&row.id) {
                    tables.update_point(row)
                } else {
                    tables.insert_point(row)?
                };
                changes.push(change);
            }
            Ok(changes)
        })
    }

    async fn delete_features(&self, ids: &[RemoteId]) -> Result<(), RemoteError> {
        self.delay().await;
        self.transact(Some(RemoteRequest::DeleteFeatures(ids.to_vec())), |tables| {
            Ok(ids
                .iter()
                .filter_map(|id| tables.delete_point(*id, true))
                .collect())
        })
    }

    async fn create_layer(&self, layer: &LayerInfo) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        if inner.tables.layers.contains_key(&layer.id) {
            return Err(RemoteError::Status {
                status: 409,
                message: "duplicate key value violates unique constraint \"layers_pkey\"".to_string(),
            });
        }
        if let Some(parent) = layer.parent_id {
            if !inner.tables.layers.contains_key(&parent) {
                return Err(RemoteError::Rejected(format!("parent layer {} does not exist", parent)));
            }
        }
        inner.tables.layers.insert(layer.id, layer.clone());
        Ok(())
    }

    async fn drop_layer(&self, id: LayerId) -> Result<(), RemoteError> {
        if self.layer(id).is_none() {
            return Err(RemoteError::NotFound(format!("layer {}", id)));
        }
        self.transact(None, |tables| {
            let ids: Vec<RemoteId> = tables
                .points
                .values()
                .filter(|p| p.layer_id == id)
                .map(|p| p.id)
                .collect();
            let changes = ids
                .into_iter()
                .filter_map(|point| tables.delete_point(point, false))
                .collect();
            tables.sub_layer_deletes.retain(|t| t.sub_layer_id != id);
            tables.layers.remove(&id);
            Ok(changes)
        })
    }

    async fn rename_layer(&self, id: LayerId, name: &str) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        let layer = inner
            .tables
            .layers
            .get_mut(&id)
            .ok_or_else(|| RemoteError::NotFound(format!("layer {}", id)))?;
        layer.name = name.to_string();
        Ok(())
    }

    async fn update_layer_attributes(
        &self,
        id: LayerId,
        attributes: &[LayerAttribute],
    ) -> Result<(), RemoteError> {
        self.delay().await;
        let request = RemoteRequest::UpdateLayerAttributes {
            layer: id,
            attributes: attributes.to_vec(),
        };
        self.transact(Some(request), |tables| {
            let layer = tables
                .layers
                .get_mut(&id)
                .ok_or_else(|| RemoteError::NotFound(format!("layer {}", id)))?;
            layer.attributes = attributes.to_vec();
            Ok(Vec::new())
        })
    }

    async fn merge_sub_layer(&self, sub_layer: LayerId) -> Result<(), RemoteError> {
        self.delay().await;
        let reject = self.lock().reject_merge;
        self.transact(Some(RemoteRequest::MergeSubLayer(sub_layer)), |tables| {
            let changes = tables.merge(sub_layer)?;
            if reject {
                return Err(RemoteError::Rejected("merge_sub_layer aborted".to_string()));
            }
            Ok(changes)
        })
    }
}
