//! Identity map
//!
//! Bidirectional association between host feature ids and remote feature
//! ids, scoped to one layer. The map lives in memory only; after a restart
//! it is rebuilt with [`IdentityMap::rebuild`] from the remote rows and the
//! remote ids the host embedded in its own feature metadata.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::error::SyncError;
use crate::models::{LayerId, LocalFeature, LocalId, RemoteFeature, RemoteId};

/// Per-layer local <-> remote identifier map
#[derive(Debug)]
pub struct IdentityMap {
    layer: LayerId,
    local_to_remote: HashMap<LocalId, RemoteId>,
    remote_to_local: HashMap<RemoteId, LocalId>,
}

/// Outcome of matching host features against the remote rows of a layer
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Remote rows the host does not have yet
    pub missing_locally: Vec<RemoteFeature>,
    /// Bound pairs; the remote row is the current server state
    pub bound: Vec<(LocalFeature, RemoteFeature)>,
    /// Host features whose remote row is gone
    pub deleted_remotely: Vec<LocalId>,
    /// Host features that never reached the remote store
    pub unsynced: Vec<LocalFeature>,
}

impl IdentityMap {
    pub fn new(layer: LayerId) -> Self {
        Self {
            layer,
            local_to_remote: HashMap::new(),
            remote_to_local: HashMap::new(),
        }
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }

    /// Register a correspondence
    ///
    /// Binding an identical pair twice is a no-op. If either side is already
    /// bound to a different counterpart the existing binding is kept.
    pub fn bind(&mut self, local: LocalId, remote: RemoteId) -> Result<(), SyncError> {
        let existing_remote = self.local_to_remote.get(&local).copied();
        let existing_local = self.remote_to_local.get(&remote).copied();

        match (existing_remote, existing_local) {
            (Some(r), Some(l)) if r == remote && l == local => Ok(()),
            (None, None) => {
                self.local_to_remote.insert(local, remote);
                self.remote_to_local.insert(remote, local);
                Ok(())
            }
            _ => Err(SyncError::Conflict {
                layer: self.layer,
                local,
                remote,
            }),
        }
    }

    pub fn local_of(&self, remote: &RemoteId) -> Option<LocalId> {
        self.remote_to_local.get(remote).copied()
    }

    pub fn remote_of(&self, local: &LocalId) -> Option<RemoteId> {
        self.local_to_remote.get(local).copied()
    }

    pub fn contains_remote(&self, remote: &RemoteId) -> bool {
        self.remote_to_local.contains_key(remote)
    }

    /// Remove the entry for a remote id, returning its local counterpart
    pub fn unbind_remote(&mut self, remote: &RemoteId) -> Option<LocalId> {
        let local = self.remote_to_local.remove(remote)?;
        self.local_to_remote.remove(&local);
        Some(local)
    }

    /// Remove the entry for a local id, returning its remote counterpart
    pub fn unbind_local(&mut self, local: &LocalId) -> Option<RemoteId> {
        let remote = self.local_to_remote.remove(local)?;
        self.remote_to_local.remove(&remote);
        Some(remote)
    }

    pub fn len(&self) -> usize {
        self.local_to_remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local_to_remote.is_empty()
    }

    pub fn clear(&mut self) {
        self.local_to_remote.clear();
        self.remote_to_local.clear();
    }

    /// Rebuild the map from a host snapshot and the layer's remote rows
    ///
    /// Host features are matched by the remote id embedded in their metadata.
    /// A remote id claimed by two host features binds the first one; the
    /// second is reported as unsynced.
    pub fn rebuild(
        &mut self,
        local_features: Vec<LocalFeature>,
        remote_rows: Vec<RemoteFeature>,
    ) -> Reconciliation {
        self.clear();

        let mut rows: HashMap<RemoteId, RemoteFeature> =
            remote_rows.into_iter().map(|row| (row.id, row)).collect();
        let mut seen: HashSet<RemoteId> = HashSet::new();
        let mut result = Reconciliation::default();

        for feature in local_features {
            let Some(local_id) = feature.local_id else {
                continue;
            };
            let Some(remote_id) = feature.remote_id else {
                result.unsynced.push(feature);
                continue;
            };

            if !seen.insert(remote_id) {
                warn!(
                    "Layer {}: feature {} claims remote id {} already bound, treating as unsynced",
                    self.layer, local_id, remote_id
                );
                result.unsynced.push(LocalFeature {
                    remote_id: None,
                    ..feature
                });
                continue;
            }

            match rows.remove(&remote_id) {
                Some(row) => {
                    if let Err(e) = self.bind(local_id, remote_id) {
                        warn!("{}", e);
                        continue;
                    }
                    result.bound.push((feature, row));
                }
                None => result.deleted_remotely.push(local_id),
            }
        }

        let mut missing: Vec<RemoteFeature> = rows.into_values().collect();
        missing.sort_by_key(|row| row.id);
        result.missing_locally = missing;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Point3;
    use serde_json::json;

    fn row(id: RemoteId, layer: LayerId) -> RemoteFeature {
        RemoteFeature {
            id,
            layer_id: layer,
            geom: json!({"type": "Point", "coordinates": [0.0, 0.0, 0.0]}),
            attributes: Default::default(),
            parent_id: None,
        }
    }

    #[test]
    fn test_bind_and_lookup() {
        let mut map = IdentityMap::new(LayerId::new());
        let remote = RemoteId::new();

        assert!(map.local_of(&remote).is_none());
        map.bind(LocalId(1), remote).unwrap();
        assert_eq!(map.local_of(&remote), Some(LocalId(1)));
        assert_eq!(map.remote_of(&LocalId(1)), Some(remote));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_rebind_same_pair_is_noop() {
        let mut map = IdentityMap::new(LayerId::new());
        let remote = RemoteId::new();
        map.bind(LocalId(1), remote).unwrap();
        map.bind(LocalId(1), remote).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_conflict_keeps_first_binding() {
        let mut map = IdentityMap::new(LayerId::new());
        let first = RemoteId::new();
        let second = RemoteId::new();
        map.bind(LocalId(1), first).unwrap();

        let err = map.bind(LocalId(1), second).unwrap_err();
        assert!(matches!(err, SyncError::Conflict { .. }));
        assert!(map.bind(LocalId(2), first).is_err());

        assert_eq!(map.remote_of(&LocalId(1)), Some(first));
        assert!(map.local_of(&second).is_none());
        assert!(map.remote_of(&LocalId(2)).is_none());
    }

    #[test]
    fn test_unbind_both_directions() {
        let mut map = IdentityMap::new(LayerId::new());
        let a = RemoteId::new();
        let b = RemoteId::new();
        map.bind(LocalId(1), a).unwrap();
        map.bind(LocalId(2), b).unwrap();

        assert_eq!(map.unbind_remote(&a), Some(LocalId(1)));
        assert!(map.remote_of(&LocalId(1)).is_none());
        assert_eq!(map.unbind_local(&LocalId(2)), Some(b));
        assert!(map.is_empty());
        assert!(map.unbind_local(&LocalId(2)).is_none());
    }

    #[test]
    fn test_rebuild_reconciles_both_sides() {
        let layer = LayerId::new();
        let mut map = IdentityMap::new(layer);

        let kept = RemoteId::new();
        let gone = RemoteId::new();
        let fresh_remote = RemoteId::new();

        let local = vec![
            LocalFeature::new(Point3::new(1.0, 1.0, 0.0))
                .with_local_id(LocalId(1))
                .with_remote_id(kept),
            LocalFeature::new(Point3::new(2.0, 2.0, 0.0))
                .with_local_id(LocalId(2))
                .with_remote_id(gone),
            LocalFeature::new(Point3::new(3.0, 3.0, 0.0)).with_local_id(LocalId(3)),
        ];
        let rows = vec![row(kept, layer), row(fresh_remote, layer)];

        let result = map.rebuild(local, rows);

        assert_eq!(map.local_of(&kept), Some(LocalId(1)));
        assert_eq!(result.bound.len(), 1);
        assert_eq!(result.deleted_remotely, vec![LocalId(2)]);
        assert_eq!(result.unsynced.len(), 1);
        assert_eq!(result.unsynced[0].local_id, Some(LocalId(3)));
        assert_eq!(result.missing_locally.len(), 1);
        assert_eq!(result.missing_locally[0].id, fresh_remote);
    }

    #[test]
    fn test_rebuild_duplicate_embedded_id() {
        let layer = LayerId::new();
        let mut map = IdentityMap::new(layer);
        let remote = RemoteId::new();

        let local = vec![
            LocalFeature::new(Point3::new(0.0, 0.0, 0.0))
                .with_local_id(LocalId(1))
                .with_remote_id(remote),
            LocalFeature::new(Point3::new(0.0, 0.0, 0.0))
                .with_local_id(LocalId(2))
                .with_remote_id(remote),
        ];
        let result = map.rebuild(local, vec![row(remote, layer)]);

        assert_eq!(map.local_of(&remote), Some(LocalId(1)));
        assert_eq!(result.unsynced.len(), 1);
        assert!(result.unsynced[0].remote_id.is_none());
    }
}
