//! Event router
//!
//! The central state machine. Owns the host handle and one [`LayerContext`]
//! per subscribed layer, consumes local and remote change events, and
//! produces [`Outbound`] requests for the remote store. Everything here is
//! synchronous: the reactor in [`crate::adapter`] feeds events in one at a
//! time and ships the returned requests to the layer's pipeline.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batch::{BatchDispatcher, BatchState, PendingOp, DEFAULT_BATCH_WINDOW};
use crate::convert::{self, Converted};
use crate::echo::{EchoGuard, EchoKey, Operation, DEFAULT_ECHO_TTL};
use crate::error::{HostError, RemoteError, SyncError};
use crate::host::{HostMutation, HostStore, LocalChange, LocalChangeKind};
use crate::identity::IdentityMap;
use crate::models::{
    AttributeValue, LayerId, LayerInfo, LocalFeature, LocalId, RemoteFeature, RemoteId,
};
use crate::remote::{RemoteChange, RemoteRequest};

/// Timing knobs of the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterSettings {
    pub batch_window: Duration,
    pub echo_ttl: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            batch_window: DEFAULT_BATCH_WINDOW,
            echo_ttl: DEFAULT_ECHO_TTL,
        }
    }
}

/// A request bound for a layer's outbound pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub layer: LayerId,
    /// Subscription generation the request was produced under
    pub generation: u64,
    pub request: RemoteRequest,
    /// Features the request carries, for rollback on failure
    pub affected: Vec<(LocalId, RemoteId)>,
}

/// Completion of an [`Outbound`] request
#[derive(Debug)]
pub struct RemoteResponse {
    pub outbound: Outbound,
    pub result: Result<(), RemoteError>,
}

/// User-facing, non-fatal notices
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncNotice {
    Malformed {
        layer: LayerId,
        details: String,
    },
    Conflict {
        layer: LayerId,
        local: LocalId,
        remote: RemoteId,
    },
    SyncFailed {
        layer: LayerId,
        request: String,
        error: String,
        features: usize,
    },
    EchoExpired {
        layer: LayerId,
        key: String,
        operation: Operation,
    },
    LayerReady {
        layer: LayerId,
        name: String,
        features: usize,
    },
    SubLayerCreated {
        parent: LayerId,
        layer: LayerId,
        name: String,
        features: usize,
    },
    SubLayerMerged {
        layer: LayerId,
        parent: LayerId,
    },
}

impl fmt::Display for SyncNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncNotice::Malformed { layer, details } => {
                write!(f, "Skipped a feature of layer {}: {}", layer, details)
            }
            SyncNotice::Conflict { layer, local, remote } => write!(
                f,
                "Identity conflict in layer {}: {} / {} was not bound",
                layer, local, remote
            ),
            SyncNotice::SyncFailed {
                layer,
                request,
                error,
                features,
            } => write!(
                f,
                "Failed to {} in layer {} ({} feature(s) kept locally): {}",
                request, layer, features, error
            ),
            SyncNotice::EchoExpired {
                layer,
                key,
                operation,
            } => write!(
                f,
                "No confirmation for {} of {} in layer {}",
                operation, key, layer
            ),
            SyncNotice::LayerReady {
                name, features, ..
            } => write!(f, "Layer '{}' loaded with {} feature(s)", name, features),
            SyncNotice::SubLayerCreated { name, features, .. } => {
                write!(f, "Sub-layer '{}' created with {} feature(s)", name, features)
            }
            SyncNotice::SubLayerMerged { layer, parent } => {
                write!(f, "Sub-layer {} merged into {}", layer, parent)
            }
        }
    }
}

/// Inspection snapshot of one layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStats {
    pub layer: LayerId,
    pub name: String,
    pub bound: usize,
    pub pending_echoes: usize,
    pub pending_batch: usize,
    pub batch_state: BatchState,
}

/// Per-layer synchronization state
#[derive(Debug)]
pub struct LayerContext {
    pub info: LayerInfo,
    pub identity: IdentityMap,
    pub echo: EchoGuard,
    pub batch: BatchDispatcher,
    pub generation: u64,
    /// Parent feature of rows copied into a sub-layer
    parents: HashMap<RemoteId, RemoteId>,
}

impl LayerContext {
    fn new(info: LayerInfo, generation: u64, settings: &RouterSettings) -> Self {
        Self {
            identity: IdentityMap::new(info.id),
            echo: EchoGuard::new(settings.echo_ttl),
            batch: BatchDispatcher::new(settings.batch_window),
            info,
            generation,
            parents: HashMap::new(),
        }
    }

    fn outbound(&self, request: RemoteRequest, affected: Vec<(LocalId, RemoteId)>) -> Outbound {
        Outbound {
            layer: self.info.id,
            generation: self.generation,
            request,
            affected,
        }
    }

    fn track_parent(&mut self, row: &RemoteFeature) {
        match row.parent_id {
            Some(parent) => {
                self.parents.insert(row.id, parent);
            }
            None => {
                self.parents.remove(&row.id);
            }
        }
    }
}

pub struct EventRouter<H: HostStore> {
    host: H,
    settings: RouterSettings,
    contexts: HashMap<LayerId, LayerContext>,
    next_generation: u64,
    notices: mpsc::UnboundedSender<SyncNotice>,
}

impl<H: HostStore> EventRouter<H> {
    pub fn new(host: H, settings: RouterSettings) -> (Self, mpsc::UnboundedReceiver<SyncNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Self {
            host,
            settings,
            contexts: HashMap::new(),
            next_generation: 0,
            notices: tx,
        };
        (router, rx)
    }

    /// Emit a notice on the router's notice channel
    pub fn notify(&self, notice: SyncNotice) {
        let _ = self.notices.send(notice);
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn is_subscribed(&self, layer: LayerId) -> bool {
        self.contexts.contains_key(&layer)
    }

    pub fn layer_info(&self, layer: LayerId) -> Option<&LayerInfo> {
        self.contexts.get(&layer).map(|ctx| &ctx.info)
    }

    pub fn context(&self, layer: LayerId) -> Option<&LayerContext> {
        self.contexts.get(&layer)
    }

    pub fn subscribed(&self) -> Vec<LayerId> {
        self.contexts.keys().copied().collect()
    }

    /// Start synchronizing a layer
    ///
    /// Opens the host layer, rebuilds the identity map from the host's
    /// embedded remote ids and the current remote rows, and brings the host
    /// up to date. Host features that never reached the remote store are
    /// queued as inserts. Returns the corrective backfill request, if any.
    pub fn subscribe(
        &mut self,
        info: LayerInfo,
        rows: Vec<RemoteFeature>,
        now: Instant,
    ) -> Result<Vec<Outbound>, SyncError> {
        if self.contexts.contains_key(&info.id) {
            self.unsubscribe(info.id)?;
        }

        self.host.open_layer(&info)?;
        let local = self.host.current_features(info.id)?;

        self.next_generation += 1;
        let mut ctx = LayerContext::new(info, self.next_generation, &self.settings);
        let reconciliation = ctx.identity.rebuild(local, rows);
        let mut corrections = Vec::new();

        for (feature, row) in reconciliation.bound {
            ctx.track_parent(&row);
            let Some(local) = feature.local_id else {
                continue;
            };
            let Some(converted) = convert_row(&self.notices, &ctx, &row) else {
                continue;
            };
            if !feature.same_content(&converted.feature) {
                let mutation = HostMutation::Update(local, converted.feature.clone());
                if let Err(e) = apply_to_host(&mut self.host, &mut ctx, mutation, now) {
                    warn!("Layer {}: failed to refresh {}: {}", ctx.info.id, local, e);
                }
            }
            queue_backfill(&ctx, local, &row, converted, &mut corrections);
        }

        for row in reconciliation.missing_locally {
            apply_remote_row(&mut self.host, &self.notices, &mut ctx, row, now, &mut corrections);
        }

        for local in reconciliation.deleted_remotely {
            if let Err(e) = apply_to_host(&mut self.host, &mut ctx, HostMutation::Delete(local), now) {
                warn!("Layer {}: failed to remove {}: {}", ctx.info.id, local, e);
            }
        }

        for feature in reconciliation.unsynced {
            if let Some(local) = feature.local_id {
                ctx.batch.record(local, PendingOp::Insert(feature), now);
            }
        }

        let layer = ctx.info.id;
        info!(
            "Subscribed to layer '{}' ({}): {} bound, {} queued",
            ctx.info.name,
            layer,
            ctx.identity.len(),
            ctx.batch.len()
        );
        let _ = self.notices.send(SyncNotice::LayerReady {
            layer,
            name: ctx.info.name.clone(),
            features: ctx.identity.len() + ctx.batch.len(),
        });

        let outbound = corrections_outbound(&mut ctx, corrections, now);
        self.contexts.insert(layer, ctx);
        Ok(outbound.into_iter().collect())
    }

    /// Stop synchronizing a layer
    ///
    /// Pending batch entries are discarded without being sent and the host
    /// layer is closed. Responses still in flight are ignored when they
    /// arrive. Returns how many batch entries were dropped.
    pub fn unsubscribe(&mut self, layer: LayerId) -> Result<usize, SyncError> {
        let mut ctx = self
            .contexts
            .remove(&layer)
            .ok_or(SyncError::UnknownLayer(layer))?;

        let dropped = ctx.batch.cancel();
        ctx.identity.clear();
        ctx.echo.clear();
        if dropped > 0 {
            warn!(
                "Layer {}: discarded {} unsent edit(s) on unsubscribe",
                layer, dropped
            );
        }

        if let Err(e) = self.host.close_layer(layer) {
            warn!("Layer {}: failed to close host layer: {}", layer, e);
        }
        info!("Unsubscribed from layer '{}' ({})", ctx.info.name, layer);
        Ok(dropped)
    }

    /// Process a change reported by the host
    pub fn handle_local(&mut self, change: LocalChange, now: Instant) -> Vec<Outbound> {
        let Some(ctx) = self.contexts.get_mut(&change.layer) else {
            debug!("Ignoring local change for unsubscribed layer {}", change.layer);
            return Vec::new();
        };

        let reported = match &change.kind {
            LocalChangeKind::Insert(_) => Operation::Insert,
            LocalChangeKind::Delete(_) => Operation::Delete,
            _ => Operation::Update,
        };
        match change.kind {
            LocalChangeKind::Insert(feature) | LocalChangeKind::Update(feature) => {
                let Some(local) = feature.local_id else {
                    warn!("Layer {}: local change without a feature id", ctx.info.id);
                    return Vec::new();
                };
                if ctx.echo.consume(EchoKey::Local(local), reported, now) {
                    debug!("Layer {}: dropped echo of {} {}", ctx.info.id, reported, local);
                    return Vec::new();
                }
                // Bound features are updated remotely whatever the host reported
                let op = if ctx.identity.remote_of(&local).is_some() {
                    PendingOp::Update(feature)
                } else {
                    PendingOp::Insert(feature)
                };
                debug!("Layer {}: queued {} {}", ctx.info.id, reported, local);
                ctx.batch.record(local, op, now);
            }
            LocalChangeKind::Delete(local) => {
                if ctx.echo.consume(EchoKey::Local(local), reported, now) {
                    debug!("Layer {}: dropped echo of delete {}", ctx.info.id, local);
                    return Vec::new();
                }
                if ctx.identity.remote_of(&local).is_some() || ctx.batch.contains(&local) {
                    debug!("Layer {}: queued delete of {}", ctx.info.id, local);
                    ctx.batch.record(local, PendingOp::Delete, now);
                }
            }
            LocalChangeKind::SchemaChanged(attributes) => {
                if ctx.info.attributes == attributes {
                    return Vec::new();
                }
                info!(
                    "Layer {}: attribute schema changed ({} attribute(s))",
                    ctx.info.id,
                    attributes.len()
                );
                ctx.info.attributes = attributes.clone();
                let request = RemoteRequest::UpdateLayerAttributes {
                    layer: ctx.info.id,
                    attributes,
                };
                return vec![ctx.outbound(request, Vec::new())];
            }
        }
        Vec::new()
    }

    /// Process a change reported by the remote change stream
    pub fn handle_remote(&mut self, change: RemoteChange, now: Instant) -> Vec<Outbound> {
        let id = change.id();
        let layer = match &change {
            RemoteChange::Insert(row) | RemoteChange::Update(row) => Some(row.layer_id),
            RemoteChange::Delete { id } => self.layer_of_remote(id),
        };
        let Some(ctx) = layer.and_then(|layer| self.contexts.get_mut(&layer)) else {
            debug!("Ignoring remote change for {}: layer not subscribed", id);
            return Vec::new();
        };

        let operation = match &change {
            RemoteChange::Insert(_) => Operation::Insert,
            RemoteChange::Update(_) => Operation::Update,
            RemoteChange::Delete { .. } => Operation::Delete,
        };
        if ctx.echo.consume(EchoKey::Remote(id), operation, now) {
            debug!("Layer {}: dropped echo of remote {} {}", ctx.info.id, operation, id);
            return Vec::new();
        }

        match change {
            RemoteChange::Insert(row) | RemoteChange::Update(row) => {
                if let Some(local) = ctx.identity.local_of(&row.id) {
                    match ctx.batch.pending(&local) {
                        Some(PendingOp::Delete) => {
                            debug!(
                                "Layer {}: remote change of {} superseded by local delete of {}",
                                ctx.info.id, row.id, local
                            );
                            return Vec::new();
                        }
                        // The remote change is newer than the unsent local edit
                        Some(_) => {
                            ctx.batch.remove(&local);
                        }
                        None => {}
                    }
                }
                let mut corrections = Vec::new();
                apply_remote_row(&mut self.host, &self.notices, ctx, row, now, &mut corrections);
                corrections_outbound(ctx, corrections, now)
                    .into_iter()
                    .collect()
            }
            RemoteChange::Delete { id } => {
                ctx.parents.remove(&id);
                let Some(local) = ctx.identity.unbind_remote(&id) else {
                    debug!("Layer {}: delete of unknown remote {}", ctx.info.id, id);
                    return Vec::new();
                };
                // The remote delete is newer than any unsent local edit
                ctx.batch.remove(&local);
                match apply_to_host(&mut self.host, ctx, HostMutation::Delete(local), now) {
                    Ok(_) => debug!("Layer {}: deleted {} (remote {})", ctx.info.id, local, id),
                    Err(HostError::UnknownFeature(_)) => {
                        debug!("Layer {}: {} already gone locally", ctx.info.id, local)
                    }
                    Err(e) => warn!("Layer {}: failed to delete {}: {}", ctx.info.id, local, e),
                }
                Vec::new()
            }
        }
    }

    fn layer_of_remote(&self, id: &RemoteId) -> Option<LayerId> {
        let key = EchoKey::Remote(*id);
        self.contexts
            .values()
            .find(|ctx| ctx.identity.contains_remote(id) || ctx.echo.is_pending(&key))
            .map(|ctx| ctx.info.id)
    }

    /// Earliest batch deadline across all layers
    pub fn next_deadline(&self) -> Option<Instant> {
        self.contexts
            .values()
            .filter_map(|ctx| ctx.batch.deadline())
            .min()
    }

    /// Flush every layer whose batching window has closed
    pub fn flush_due(&mut self, now: Instant) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        for ctx in self.contexts.values_mut() {
            if ctx.batch.is_due(now) {
                outbound.extend(flush_context(&mut self.host, &self.notices, ctx, now));
            }
        }
        outbound
    }

    /// Flush one layer immediately, whatever its window
    pub fn flush_layer(&mut self, layer: LayerId, now: Instant) -> Result<Vec<Outbound>, SyncError> {
        let ctx = self
            .contexts
            .get_mut(&layer)
            .ok_or(SyncError::UnknownLayer(layer))?;
        Ok(flush_context(&mut self.host, &self.notices, ctx, now))
    }

    /// Request merging a subscribed sub-layer, on its own pipeline
    pub fn merge_request(&self, layer: LayerId) -> Result<Outbound, SyncError> {
        let ctx = self
            .contexts
            .get(&layer)
            .ok_or(SyncError::UnknownLayer(layer))?;
        if !ctx.info.is_sub_layer() {
            return Err(SyncError::NotASubLayer(layer));
        }
        Ok(ctx.outbound(RemoteRequest::MergeSubLayer(layer), Vec::new()))
    }

    /// Apply the result of an outbound request
    ///
    /// Responses for unsubscribed layers or older subscriptions are dropped.
    /// A confirmed delete releases its bindings. A failed request withdraws
    /// the echo records it created and leaves the host features in their
    /// pre-sync state: failed inserts are unbound so the next edit retries
    /// them, and deletes that failed transiently are queued again.
    pub fn handle_response(&mut self, response: RemoteResponse, now: Instant) {
        let RemoteResponse { outbound, result } = response;
        let Some(ctx) = self.contexts.get_mut(&outbound.layer) else {
            debug!("Discarding response for removed layer {}", outbound.layer);
            return;
        };
        if ctx.generation != outbound.generation {
            debug!(
                "Discarding response from an earlier subscription of layer {}",
                outbound.layer
            );
            return;
        }

        let error = match result {
            Ok(()) => {
                debug!("Layer {}: {} succeeded", outbound.layer, outbound.request);
                if let RemoteRequest::DeleteFeatures(_) = outbound.request {
                    for (local, remote) in &outbound.affected {
                        ctx.identity.unbind_local(local);
                        ctx.parents.remove(remote);
                    }
                }
                return;
            }
            Err(e) => e,
        };

        warn!(
            "Layer {}: failed to {}: {}",
            outbound.layer, outbound.request, error
        );
        let operation = match outbound.request {
            RemoteRequest::InsertFeatures(_) => Operation::Insert,
            RemoteRequest::DeleteFeatures(_) => Operation::Delete,
            _ => Operation::Update,
        };
        let retry = error.is_transient();
        for (local, remote) in &outbound.affected {
            ctx.echo.cancel(EchoKey::Remote(*remote), operation);
            match outbound.request {
                RemoteRequest::InsertFeatures(_) => {
                    ctx.identity.unbind_remote(remote);
                    if let Err(e) = self.host.tag_feature(outbound.layer, *local, None) {
                        debug!("Layer {}: could not untag {}: {}", outbound.layer, local, e);
                    }
                }
                // The host feature is already gone, so no edit can retry it
                RemoteRequest::DeleteFeatures(_) if retry => {
                    ctx.batch.record(*local, PendingOp::Delete, now);
                }
                _ => {}
            }
        }

        let _ = self.notices.send(SyncNotice::SyncFailed {
            layer: outbound.layer,
            request: outbound.request.to_string(),
            error: error.to_string(),
            features: outbound.affected.len(),
        });
    }

    /// Drop expired echo records, warning about each
    pub fn expire_echoes(&mut self, now: Instant) -> usize {
        let mut count = 0;
        for ctx in self.contexts.values_mut() {
            for expired in ctx.echo.expire(now) {
                warn!(
                    "Layer {}: no echo for {} of {} after {:?}, state may be inconsistent",
                    ctx.info.id, expired.operation, expired.key, expired.age
                );
                let _ = self.notices.send(SyncNotice::EchoExpired {
                    layer: ctx.info.id,
                    key: expired.key.to_string(),
                    operation: expired.operation,
                });
                count += 1;
            }
        }
        count
    }

    pub fn stats(&self, layer: LayerId) -> Option<LayerStats> {
        self.contexts.get(&layer).map(|ctx| LayerStats {
            layer,
            name: ctx.info.name.clone(),
            bound: ctx.identity.len(),
            pending_echoes: ctx.echo.pending(),
            pending_batch: ctx.batch.len(),
            batch_state: ctx.batch.state(),
        })
    }

    /// Rows of a subscribed layer to copy into a new sub-layer
    ///
    /// Uses the host's current state. Features that were never synced have
    /// no parent row to refer to and are skipped.
    pub fn rows_for_selection(
        &self,
        layer: LayerId,
        selection: &[LocalId],
    ) -> Result<Vec<RemoteFeature>, SyncError> {
        let ctx = self
            .contexts
            .get(&layer)
            .ok_or(SyncError::UnknownLayer(layer))?;
        let features = self.host.current_features(layer)?;

        let mut rows = Vec::new();
        for feature in features {
            let Some(local) = feature.local_id else {
                continue;
            };
            if !selection.contains(&local) {
                continue;
            }
            let Some(remote) = ctx.identity.remote_of(&local) else {
                warn!("Layer {}: {} was never synced, not copied", layer, local);
                continue;
            };
            let parent = ctx.parents.get(&remote).copied();
            rows.push(convert::local_to_remote(&feature, &ctx.info, remote, parent)?);
        }
        Ok(rows)
    }
}

/// Apply a mutation to the host, expecting its echo when the host has one
fn apply_to_host<H: HostStore>(
    host: &mut H,
    ctx: &mut LayerContext,
    mutation: HostMutation,
    now: Instant,
) -> Result<Option<LocalId>, HostError> {
    let known = match &mutation {
        HostMutation::Insert(_) => None,
        HostMutation::Update(id, _) => Some((*id, Operation::Update)),
        HostMutation::Delete(id) => Some((*id, Operation::Delete)),
    };

    let assigned = host.apply_feature(ctx.info.id, mutation)?;

    if host.echoes_mutations() {
        match (known, assigned) {
            (Some((id, op)), _) => ctx.echo.expect(EchoKey::Local(id), op, now),
            (None, Some(id)) => ctx.echo.expect(EchoKey::Local(id), Operation::Insert, now),
            (None, None) => {}
        }
    }
    Ok(assigned)
}

fn convert_row(
    notices: &mpsc::UnboundedSender<SyncNotice>,
    ctx: &LayerContext,
    row: &RemoteFeature,
) -> Option<Converted> {
    match convert::remote_to_local(row, &ctx.info) {
        Ok(converted) => Some(converted),
        Err(e) => {
            warn!("Layer {}: skipping remote {}: {}", ctx.info.id, row.id, e);
            let _ = notices.send(SyncNotice::Malformed {
                layer: ctx.info.id,
                details: e.to_string(),
            });
            None
        }
    }
}

/// Apply an inserted or updated remote row to the host
///
/// Inserts of a bound row become updates and updates of an unknown row
/// become inserts, so replayed or reordered events still converge.
fn apply_remote_row<H: HostStore>(
    host: &mut H,
    notices: &mpsc::UnboundedSender<SyncNotice>,
    ctx: &mut LayerContext,
    row: RemoteFeature,
    now: Instant,
    corrections: &mut Vec<(LocalId, RemoteFeature)>,
) {
    let Some(converted) = convert_row(notices, ctx, &row) else {
        return;
    };
    ctx.track_parent(&row);

    let local = match ctx.identity.local_of(&row.id) {
        Some(local) => {
            let mutation = HostMutation::Update(local, converted.feature.clone());
            match apply_to_host(host, ctx, mutation, now) {
                Ok(_) => local,
                Err(e) => {
                    warn!("Layer {}: failed to update {}: {}", ctx.info.id, local, e);
                    return;
                }
            }
        }
        None => {
            let mutation = HostMutation::Insert(converted.feature.clone());
            let local = match apply_to_host(host, ctx, mutation, now) {
                Ok(Some(local)) => local,
                Ok(None) => {
                    warn!("Layer {}: host assigned no id to remote {}", ctx.info.id, row.id);
                    return;
                }
                Err(e) => {
                    warn!("Layer {}: failed to insert remote {}: {}", ctx.info.id, row.id, e);
                    return;
                }
            };
            if let Err(e) = ctx.identity.bind(local, row.id) {
                warn!("{}", e);
                let _ = notices.send(SyncNotice::Conflict {
                    layer: ctx.info.id,
                    local,
                    remote: row.id,
                });
                return;
            }
            local
        }
    };

    debug!("Layer {}: applied remote {} as {}", ctx.info.id, row.id, local);
    queue_backfill(ctx, local, &row, converted, corrections);
}

fn queue_backfill(
    ctx: &LayerContext,
    local: LocalId,
    row: &RemoteFeature,
    converted: Converted,
    corrections: &mut Vec<(LocalId, RemoteFeature)>,
) {
    let Some(attributes) = converted.backfill else {
        return;
    };
    let geom = match convert::encode_point(&converted.feature.geometry, ctx.info.srid) {
        Ok(geom) => geom,
        Err(e) => {
            warn!("Layer {}: cannot backfill {}: {}", ctx.info.id, row.id, e);
            return;
        }
    };
    corrections.push((
        local,
        RemoteFeature {
            id: row.id,
            layer_id: ctx.info.id,
            geom,
            attributes,
            parent_id: row.parent_id,
        },
    ));
}

/// One corrective update carrying resolved defaults
fn corrections_outbound(
    ctx: &mut LayerContext,
    corrections: Vec<(LocalId, RemoteFeature)>,
    now: Instant,
) -> Option<Outbound> {
    if corrections.is_empty() {
        return None;
    }
    let mut affected = Vec::with_capacity(corrections.len());
    let mut rows = Vec::with_capacity(corrections.len());
    for (local, row) in corrections {
        ctx.echo.expect(EchoKey::Remote(row.id), Operation::Update, now);
        affected.push((local, row.id));
        rows.push(row);
    }
    debug!(
        "Layer {}: backfilling defaults on {} row(s)",
        ctx.info.id,
        rows.len()
    );
    Some(ctx.outbound(RemoteRequest::UpdateFeatures(rows), affected))
}

/// Resolve attributes that cannot be stored as they are
///
/// Non-finite floats read back from the remote store as null, which then
/// resolves to the schema default. The outgoing row and the host feature
/// both take that resolved value so the two sides agree.
fn resolve_non_finite<H: HostStore>(
    host: &mut H,
    ctx: &mut LayerContext,
    local: LocalId,
    feature: &LocalFeature,
    row: RemoteFeature,
    now: Instant,
) -> RemoteFeature {
    let lossy = feature
        .attributes
        .values()
        .any(|value| matches!(value, AttributeValue::Float(x) if !x.is_finite()));
    if !lossy {
        return row;
    }

    let resolved = match convert::remote_to_local(&row, &ctx.info) {
        Ok(converted) => converted.feature,
        Err(e) => {
            warn!("Layer {}: cannot resolve {}: {}", ctx.info.id, local, e);
            return row;
        }
    };
    let attributes = convert::sanitize_attributes(&resolved.attributes);
    let layer = ctx.info.id;
    match apply_to_host(host, ctx, HostMutation::Update(local, resolved), now) {
        Ok(_) => debug!("Layer {}: replaced non-finite values of {}", layer, local),
        Err(e) => warn!("Layer {}: failed to update {}: {}", layer, local, e),
    }
    RemoteFeature { attributes, ..row }
}

/// Turn the current batch into at most three bulk requests
fn flush_context<H: HostStore>(
    host: &mut H,
    notices: &mpsc::UnboundedSender<SyncNotice>,
    ctx: &mut LayerContext,
    now: Instant,
) -> Vec<Outbound> {
    let plan = ctx.batch.take();
    if plan.is_empty() {
        return Vec::new();
    }
    let layer = ctx.info.id;
    debug!("Layer {}: flushing {} edit(s)", layer, plan.len());

    let malformed = |e: SyncError| {
        warn!("Layer {}: not sent: {}", layer, e);
        let _ = notices.send(SyncNotice::Malformed {
            layer,
            details: e.to_string(),
        });
    };

    let mut to_insert = plan.inserts;
    let mut updates = Vec::new();
    let mut update_affected = Vec::new();
    for (local, feature) in plan.updates {
        let Some(remote) = ctx.identity.remote_of(&local) else {
            to_insert.push((local, feature));
            continue;
        };
        let parent = ctx.parents.get(&remote).copied();
        match convert::local_to_remote(&feature, &ctx.info, remote, parent) {
            Ok(row) => {
                let row = resolve_non_finite(host, ctx, local, &feature, row, now);
                ctx.echo.expect(EchoKey::Remote(remote), Operation::Update, now);
                updates.push(row);
                update_affected.push((local, remote));
            }
            Err(e) => malformed(e),
        }
    }

    to_insert.sort_by_key(|(local, _)| *local);
    let mut inserts = Vec::new();
    let mut insert_affected = Vec::new();
    for (local, feature) in to_insert {
        let remote = RemoteId::new();
        let row = match convert::local_to_remote(&feature, &ctx.info, remote, None) {
            Ok(row) => row,
            Err(e) => {
                malformed(e);
                continue;
            }
        };
        if let Err(e) = ctx.identity.bind(local, remote) {
            warn!("{}", e);
            let _ = notices.send(SyncNotice::Conflict { layer, local, remote });
            continue;
        }
        if let Err(e) = host.tag_feature(layer, local, Some(remote)) {
            warn!("Layer {}: failed to tag {}: {}", layer, local, e);
        }
        let row = resolve_non_finite(host, ctx, local, &feature, row, now);
        ctx.echo.expect(EchoKey::Remote(remote), Operation::Insert, now);
        inserts.push(row);
        insert_affected.push((local, remote));
    }

    let mut deletes = Vec::new();
    let mut delete_affected = Vec::new();
    // Bindings are released once the remote store confirms the delete
    for local in plan.deletes {
        let Some(remote) = ctx.identity.remote_of(&local) else {
            continue;
        };
        ctx.echo.expect(EchoKey::Remote(remote), Operation::Delete, now);
        deletes.push(remote);
        delete_affected.push((local, remote));
    }

    let mut outbound = Vec::new();
    if !inserts.is_empty() {
        outbound.push(ctx.outbound(RemoteRequest::InsertFeatures(inserts), insert_affected));
    }
    if !updates.is_empty() {
        outbound.push(ctx.outbound(RemoteRequest::UpdateFeatures(updates), update_affected));
    }
    if !deletes.is_empty() {
        outbound.push(ctx.outbound(RemoteRequest::DeleteFeatures(deletes), delete_affected));
    }
    outbound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use crate::models::{AttributeType, LayerAttribute, Point3};
    use serde_json::json;

    struct Fixture {
        router: EventRouter<MemoryHost>,
        host: MemoryHost,
        changes: mpsc::Receiver<LocalChange>,
        notices: mpsc::UnboundedReceiver<SyncNotice>,
        layer: LayerInfo,
    }

    fn layer() -> LayerInfo {
        LayerInfo::new("signs", 4326)
            .with_attribute(LayerAttribute::new("code", AttributeType::Text))
            .with_attribute(LayerAttribute::new("height", AttributeType::Float).with_default(1.5))
    }

    fn fixture() -> Fixture {
        let (host, changes) = MemoryHost::new(64);
        let (router, notices) = EventRouter::new(host.clone(), RouterSettings::default());
        Fixture {
            router,
            host,
            changes,
            notices,
            layer: layer(),
        }
    }

    fn row(layer: LayerId, x: f64, attributes: serde_json::Value) -> RemoteFeature {
        RemoteFeature {
            id: RemoteId::new(),
            layer_id: layer,
            geom: json!({"type": "Point", "coordinates": [x, 0.0, 0.0]}),
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            parent_id: None,
        }
    }

    /// Feed every pending host notification back into the router
    fn pump_local(f: &mut Fixture, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(change) = f.changes.try_recv() {
            out.extend(f.router.handle_local(change, now));
        }
        out
    }

    #[test]
    fn test_subscribe_loads_remote_rows() {
        let mut f = fixture();
        let now = Instant::now();
        let rows = vec![
            row(f.layer.id, 1.0, json!({"code": "a", "height": 2.0})),
            row(f.layer.id, 2.0, json!({"code": "b", "height": 3.0})),
        ];

        let out = f.router.subscribe(f.layer.clone(), rows.clone(), now).unwrap();
        assert!(out.is_empty());
        assert_eq!(f.host.features(f.layer.id).len(), 2);

        // Our own inserts come back from the host and are dropped
        assert!(pump_local(&mut f, now).is_empty());
        let stats = f.router.stats(f.layer.id).unwrap();
        assert_eq!(stats.bound, 2);
        assert_eq!(stats.pending_echoes, 0);
        assert_eq!(stats.pending_batch, 0);
        assert!(matches!(f.notices.try_recv().unwrap(), SyncNotice::LayerReady { features: 2, .. }));
    }

    #[test]
    fn test_local_insert_flushes_once() {
        let mut f = fixture();
        let start = Instant::now();
        f.router.subscribe(f.layer.clone(), Vec::new(), start).unwrap();

        let id = f
            .host
            .user_insert(f.layer.id, LocalFeature::new(Point3::new(1.0, 2.0, 3.0)).with_attribute("code", "x"))
            .unwrap();
        for i in 0..5 {
            f.host
                .user_update(f.layer.id, id, |feat| feat.geometry.x = 10.0 + i as f64)
                .unwrap();
        }
        assert!(pump_local(&mut f, start).is_empty());
        assert_eq!(f.router.next_deadline(), Some(start + DEFAULT_BATCH_WINDOW));

        let out = f.router.flush_due(start + DEFAULT_BATCH_WINDOW);
        assert_eq!(out.len(), 1);
        match &out[0].request {
            RemoteRequest::InsertFeatures(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].geom["coordinates"], json!([14.0, 2.0, 3.0]));
            }
            other => panic!("unexpected request {:?}", other),
        }

        let remote = out[0].affected[0].1;
        assert_eq!(f.host.feature(f.layer.id, id).unwrap().remote_id, Some(remote));
        let stats = f.router.stats(f.layer.id).unwrap();
        assert_eq!(stats.pending_echoes, 1);
        assert_eq!(stats.bound, 1);
    }

    #[test]
    fn test_insert_then_delete_sends_nothing() {
        let mut f = fixture();
        let now = Instant::now();
        f.router.subscribe(f.layer.clone(), Vec::new(), now).unwrap();

        let id = f
            .host
            .user_insert(f.layer.id, LocalFeature::new(Point3::new(0.0, 0.0, 0.0)))
            .unwrap();
        f.host.user_delete(f.layer.id, id).unwrap();
        pump_local(&mut f, now);

        assert!(f.router.flush_due(now + DEFAULT_BATCH_WINDOW).is_empty());
    }

    #[test]
    fn test_remote_echo_is_dropped() {
        let mut f = fixture();
        let now = Instant::now();
        f.router.subscribe(f.layer.clone(), Vec::new(), now).unwrap();
        f.host
            .user_insert(f.layer.id, LocalFeature::new(Point3::new(5.0, 5.0, 0.0)))
            .unwrap();
        pump_local(&mut f, now);
        let out = f.router.flush_due(now + DEFAULT_BATCH_WINDOW);

        let RemoteRequest::InsertFeatures(rows) = &out[0].request else {
            panic!("expected insert");
        };
        let echoed = RemoteChange::Insert(rows[0].clone());
        assert!(f.router.handle_remote(echoed, now).is_empty());
        assert_eq!(f.host.features(f.layer.id).len(), 1);
        assert_eq!(f.router.stats(f.layer.id).unwrap().pending_echoes, 0);
    }

    #[test]
    fn test_remote_insert_missing_attribute_backfills_once() {
        let mut f = fixture();
        let now = Instant::now();
        f.router.subscribe(f.layer.clone(), Vec::new(), now).unwrap();

        let incoming = row(f.layer.id, 1.0, json!({"code": "z"}));
        let out = f.router.handle_remote(RemoteChange::Insert(incoming.clone()), now);

        assert_eq!(out.len(), 1);
        match &out[0].request {
            RemoteRequest::UpdateFeatures(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].id, incoming.id);
                assert_eq!(rows[0].attributes["height"], json!(1.5));
            }
            other => panic!("unexpected request {:?}", other),
        }
        let local = f.host.find_by_remote(f.layer.id, incoming.id).unwrap();
        assert_eq!(local.attribute("height"), Some(&AttributeValue::Float(1.5)));

        // The corrective update's echo does not trigger another one
        let echo = RemoteFeature {
            attributes: json!({"code": "z", "height": 1.5}).as_object().cloned().unwrap(),
            ..incoming
        };
        assert!(f.router.handle_remote(RemoteChange::Update(echo), now).is_empty());
    }

    #[test]
    fn test_remote_delete_unknown_is_ignored() {
        let mut f = fixture();
        let now = Instant::now();
        f.router.subscribe(f.layer.clone(), Vec::new(), now).unwrap();
        let out = f
            .router
            .handle_remote(RemoteChange::Delete { id: RemoteId::new() }, now);
        assert!(out.is_empty());
    }

    #[test]
    fn test_remote_update_of_unbound_row_inserts() {
        let mut f = fixture();
        let now = Instant::now();
        f.router.subscribe(f.layer.clone(), Vec::new(), now).unwrap();

        let incoming = row(f.layer.id, 7.0, json!({"code": "u", "height": 1.0}));
        f.router.handle_remote(RemoteChange::Update(incoming.clone()), now);
        assert!(f.host.find_by_remote(f.layer.id, incoming.id).is_some());

        // Replayed insert becomes an update of the same feature
        let moved = RemoteFeature {
            geom: json!({"type": "Point", "coordinates": [8.0, 0.0, 0.0]}),
            ..incoming.clone()
        };
        f.router.handle_remote(RemoteChange::Insert(moved), now);
        assert_eq!(f.host.features(f.layer.id).len(), 1);
        let local = f.host.find_by_remote(f.layer.id, incoming.id).unwrap();
        assert_eq!(local.geometry.x, 8.0);
    }

    #[test]
    fn test_remote_delete_removes_local_feature() {
        let mut f = fixture();
        let now = Instant::now();
        let existing = row(f.layer.id, 1.0, json!({"code": "a", "height": 1.0}));
        f.router.subscribe(f.layer.clone(), vec![existing.clone()], now).unwrap();
        pump_local(&mut f, now);

        f.router.handle_remote(RemoteChange::Delete { id: existing.id }, now);
        assert!(f.host.features(f.layer.id).is_empty());
        // Host echo of that delete is swallowed
        assert!(pump_local(&mut f, now).is_empty());
        assert_eq!(f.router.stats(f.layer.id).unwrap().bound, 0);
    }

    #[test]
    fn test_failed_insert_is_unbound_and_retried_on_edit() {
        let mut f = fixture();
        let now = Instant::now();
        f.router.subscribe(f.layer.clone(), Vec::new(), now).unwrap();
        let id = f
            .host
            .user_insert(f.layer.id, LocalFeature::new(Point3::new(1.0, 1.0, 0.0)))
            .unwrap();
        pump_local(&mut f, now);
        let out = f.router.flush_due(now + DEFAULT_BATCH_WINDOW);
        let outbound = out.into_iter().next().unwrap();

        f.router.handle_response(RemoteResponse {
            outbound,
            result: Err(RemoteError::Status {
                status: 503,
                message: "unavailable".to_string(),
            }),
        }, now);

        assert_eq!(f.host.feature(f.layer.id, id).unwrap().remote_id, None);
        let stats = f.router.stats(f.layer.id).unwrap();
        assert_eq!(stats.bound, 0);
        assert_eq!(stats.pending_echoes, 0);
        while let Ok(notice) = f.notices.try_recv() {
            if let SyncNotice::SyncFailed { features, .. } = notice {
                assert_eq!(features, 1);
            }
        }

        // Manual retry: editing the feature sends it again as an insert
        let later = now + Duration::from_secs(1);
        f.host.user_update(f.layer.id, id, |feat| feat.geometry.y = 2.0).unwrap();
        pump_local(&mut f, later);
        let out = f.router.flush_due(later + DEFAULT_BATCH_WINDOW);
        assert!(matches!(out[0].request, RemoteRequest::InsertFeatures(_)));
    }

    #[test]
    fn test_stale_response_is_discarded() {
        let mut f = fixture();
        let now = Instant::now();
        f.router.subscribe(f.layer.clone(), Vec::new(), now).unwrap();
        f.host
            .user_insert(f.layer.id, LocalFeature::new(Point3::new(1.0, 1.0, 0.0)))
            .unwrap();
        pump_local(&mut f, now);
        let outbound = f.router.flush_due(now + DEFAULT_BATCH_WINDOW).remove(0);

        // Resubscribing starts a new generation
        f.router.subscribe(f.layer.clone(), Vec::new(), now).unwrap();
        f.router.handle_response(RemoteResponse {
            outbound,
            result: Err(RemoteError::Rejected("late".to_string())),
        }, now);
        while let Ok(notice) = f.notices.try_recv() {
            assert!(!matches!(notice, SyncNotice::SyncFailed { .. }));
        }
    }

    #[test]
    fn test_unsubscribe_discards_batch() {
        let mut f = fixture();
        let now = Instant::now();
        f.router.subscribe(f.layer.clone(), Vec::new(), now).unwrap();
        f.host
            .user_insert(f.layer.id, LocalFeature::new(Point3::new(1.0, 1.0, 0.0)))
            .unwrap();
        pump_local(&mut f, now);

        assert_eq!(f.router.unsubscribe(f.layer.id).unwrap(), 1);
        assert!(f.router.next_deadline().is_none());
        assert!(!f.host.is_open(f.layer.id));
        assert!(matches!(
            f.router.unsubscribe(f.layer.id),
            Err(SyncError::UnknownLayer(_))
        ));
    }

    #[test]
    fn test_schema_change_updates_remote_attributes() {
        let mut f = fixture();
        let now = Instant::now();
        f.router.subscribe(f.layer.clone(), Vec::new(), now).unwrap();

        let mut attributes = f.layer.attributes.clone();
        attributes.push(LayerAttribute::new("verified", AttributeType::Bool));
        f.host.user_change_schema(f.layer.id, attributes.clone()).unwrap();
        let out = pump_local(&mut f, now);

        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].request,
            RemoteRequest::UpdateLayerAttributes {
                layer: f.layer.id,
                attributes: attributes.clone(),
            }
        );
        assert_eq!(f.router.layer_info(f.layer.id).unwrap().attributes, attributes);
    }

    #[test]
    fn test_restart_rebuild_queues_unsynced() {
        let mut f = fixture();
        let now = Instant::now();
        let kept = row(f.layer.id, 1.0, json!({"code": "k", "height": 1.0}));
        f.host.load(
            f.layer.id,
            vec![
                LocalFeature::new(Point3::new(1.0, 0.0, 0.0))
                    .with_remote_id(kept.id)
                    .with_attribute("code", "k")
                    .with_attribute("height", 1.0),
                LocalFeature::new(Point3::new(9.0, 9.0, 0.0))
                    .with_attribute("code", "new")
                    .with_attribute("height", 2.0),
            ],
        );

        f.router.subscribe(f.layer.clone(), vec![kept], now).unwrap();
        let stats = f.router.stats(f.layer.id).unwrap();
        assert_eq!(stats.bound, 1);
        assert_eq!(stats.pending_batch, 1);
        // Matching content is not rewritten
        assert!(pump_local(&mut f, now).is_empty());
    }

    #[test]
    fn test_echo_expiry_notifies() {
        let mut f = fixture();
        let now = Instant::now();
        f.router.subscribe(f.layer.clone(), Vec::new(), now).unwrap();
        f.host
            .user_insert(f.layer.id, LocalFeature::new(Point3::new(1.0, 1.0, 0.0)))
            .unwrap();
        pump_local(&mut f, now);
        f.router.flush_due(now + DEFAULT_BATCH_WINDOW);

        assert_eq!(f.router.expire_echoes(now + Duration::from_secs(10)), 1);
        let expired = std::iter::from_fn(|| f.notices.try_recv().ok())
            .any(|n| matches!(n, SyncNotice::EchoExpired { .. }));
        assert!(expired);
    }

    /// Subscribe with one remote row and return its host id
    fn bound_fixture(now: Instant) -> (Fixture, RemoteFeature, LocalId) {
        let mut f = fixture();
        let existing = row(f.layer.id, 0.0, json!({"code": "a", "height": 1.0}));
        f.router.subscribe(f.layer.clone(), vec![existing.clone()], now).unwrap();
        pump_local(&mut f, now);
        let local = f
            .host
            .find_by_remote(f.layer.id, existing.id)
            .and_then(|feat| feat.local_id)
            .unwrap();
        (f, existing, local)
    }

    fn unavailable() -> RemoteError {
        RemoteError::Status {
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    fn sent_x(outbound: &Outbound) -> f64 {
        match &outbound.request {
            RemoteRequest::UpdateFeatures(rows) | RemoteRequest::InsertFeatures(rows) => {
                rows[0].geom["coordinates"][0].as_f64().unwrap()
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_failed_update_keeps_echoes_of_later_updates() {
        let start = Instant::now();
        let (mut f, _, local) = bound_fixture(start);
        let layer = f.layer.id;

        let t1 = start + Duration::from_secs(1);
        f.host.user_update(layer, local, |feat| feat.geometry.x = 1.0).unwrap();
        pump_local(&mut f, t1);
        let first = f.router.flush_due(t1 + DEFAULT_BATCH_WINDOW).remove(0);

        let t2 = start + Duration::from_secs(2);
        f.host.user_update(layer, local, |feat| feat.geometry.x = 2.0).unwrap();
        pump_local(&mut f, t2);
        let second = f.router.flush_due(t2 + DEFAULT_BATCH_WINDOW).remove(0);

        let t3 = start + Duration::from_secs(3);
        f.host.user_update(layer, local, |feat| feat.geometry.x = 3.0).unwrap();
        pump_local(&mut f, t3);
        assert_eq!(f.router.stats(layer).unwrap().pending_echoes, 2);

        f.router.handle_response(
            RemoteResponse {
                outbound: first,
                result: Err(unavailable()),
            },
            t3,
        );
        assert_eq!(f.router.stats(layer).unwrap().pending_echoes, 1);

        // The second update's own change is still recognized
        let RemoteRequest::UpdateFeatures(rows) = &second.request else {
            panic!("expected update");
        };
        assert!(f.router.handle_remote(RemoteChange::Update(rows[0].clone()), t3).is_empty());
        assert_eq!(f.host.feature(layer, local).unwrap().geometry.x, 3.0);

        let out = f.router.flush_due(t3 + DEFAULT_BATCH_WINDOW);
        assert_eq!(out.len(), 1);
        assert_eq!(sent_x(&out[0]), 3.0);
    }

    #[test]
    fn test_failed_delete_is_queued_again() {
        let start = Instant::now();
        let (mut f, existing, local) = bound_fixture(start);
        let layer = f.layer.id;

        f.host.user_delete(layer, local).unwrap();
        pump_local(&mut f, start);
        let first = f.router.flush_due(start + DEFAULT_BATCH_WINDOW).remove(0);
        assert_eq!(first.request, RemoteRequest::DeleteFeatures(vec![existing.id]));
        // Still bound until the remote store confirms
        assert_eq!(f.router.stats(layer).unwrap().bound, 1);

        let later = start + Duration::from_secs(1);
        f.router.handle_response(
            RemoteResponse {
                outbound: first,
                result: Err(unavailable()),
            },
            later,
        );
        let stats = f.router.stats(layer).unwrap();
        assert_eq!(stats.bound, 1);
        assert_eq!(stats.pending_batch, 1);
        assert_eq!(stats.pending_echoes, 0);

        let retry = f.router.flush_due(later + DEFAULT_BATCH_WINDOW).remove(0);
        assert_eq!(retry.request, RemoteRequest::DeleteFeatures(vec![existing.id]));
        f.router.handle_response(
            RemoteResponse {
                outbound: retry,
                result: Ok(()),
            },
            later,
        );
        assert_eq!(f.router.stats(layer).unwrap().bound, 0);
        assert!(f
            .router
            .handle_remote(RemoteChange::Delete { id: existing.id }, later)
            .is_empty());
    }

    #[test]
    fn test_rejected_delete_keeps_binding() {
        let start = Instant::now();
        let (mut f, _, local) = bound_fixture(start);
        let layer = f.layer.id;

        f.host.user_delete(layer, local).unwrap();
        pump_local(&mut f, start);
        let outbound = f.router.flush_due(start + DEFAULT_BATCH_WINDOW).remove(0);
        f.router.handle_response(
            RemoteResponse {
                outbound,
                result: Err(RemoteError::Rejected("permission denied".to_string())),
            },
            start,
        );

        let stats = f.router.stats(layer).unwrap();
        assert_eq!(stats.bound, 1);
        assert_eq!(stats.pending_batch, 0);
        assert!(f.router.next_deadline().is_none());
    }

    #[test]
    fn test_remote_update_supersedes_pending_local_update() {
        let start = Instant::now();
        let (mut f, existing, local) = bound_fixture(start);
        let layer = f.layer.id;

        f.host.user_update(layer, local, |feat| feat.geometry.x = 5.0).unwrap();
        pump_local(&mut f, start);
        assert_eq!(f.router.stats(layer).unwrap().pending_batch, 1);

        let moved = RemoteFeature {
            geom: json!({"type": "Point", "coordinates": [9.0, 0.0, 0.0]}),
            ..existing
        };
        assert!(f.router.handle_remote(RemoteChange::Update(moved), start).is_empty());
        assert!(pump_local(&mut f, start).is_empty());

        assert_eq!(f.host.feature(layer, local).unwrap().geometry.x, 9.0);
        assert_eq!(f.router.stats(layer).unwrap().pending_batch, 0);
        assert!(f.router.flush_due(start + DEFAULT_BATCH_WINDOW).is_empty());
    }

    #[test]
    fn test_pending_local_delete_wins_over_remote_update() {
        let start = Instant::now();
        let (mut f, existing, local) = bound_fixture(start);
        let layer = f.layer.id;

        f.host.user_delete(layer, local).unwrap();
        pump_local(&mut f, start);

        let moved = RemoteFeature {
            geom: json!({"type": "Point", "coordinates": [9.0, 0.0, 0.0]}),
            ..existing.clone()
        };
        assert!(f.router.handle_remote(RemoteChange::Update(moved), start).is_empty());
        assert!(f.host.feature(layer, local).is_none());

        let out = f.router.flush_due(start + DEFAULT_BATCH_WINDOW);
        assert_eq!(out[0].request, RemoteRequest::DeleteFeatures(vec![existing.id]));
    }

    #[test]
    fn test_non_finite_attribute_resolves_to_default_on_both_sides() {
        let mut f = fixture();
        let now = Instant::now();
        f.router.subscribe(f.layer.clone(), Vec::new(), now).unwrap();
        let id = f
            .host
            .user_insert(
                f.layer.id,
                LocalFeature::new(Point3::new(1.0, 1.0, 0.0))
                    .with_attribute("code", "n")
                    .with_attribute("height", f64::NAN),
            )
            .unwrap();
        pump_local(&mut f, now);

        let out = f.router.flush_due(now + DEFAULT_BATCH_WINDOW);
        let RemoteRequest::InsertFeatures(rows) = &out[0].request else {
            panic!("expected insert");
        };
        assert_eq!(rows[0].attributes["height"], json!(1.5));
        assert_eq!(rows[0].attributes["code"], json!("n"));

        let local = f.host.feature(f.layer.id, id).unwrap();
        assert_eq!(local.attribute("height"), Some(&AttributeValue::Float(1.5)));
        // The host rewrite is our own and is not sent again
        assert!(pump_local(&mut f, now).is_empty());
        assert_eq!(f.router.stats(f.layer.id).unwrap().pending_batch, 0);
        assert_eq!(f.router.stats(f.layer.id).unwrap().pending_echoes, 1);
    }
}
