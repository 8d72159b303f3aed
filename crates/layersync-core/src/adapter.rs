//! Synchronization reactor
//!
//! A single task owns the [`EventRouter`] and multiplexes everything that
//! can change state: commands from the [`AdapterHandle`], host changes,
//! realtime changes, completed remote requests, batch deadlines and a
//! periodic echo sweep. Remote I/O never runs on the reactor itself; each
//! subscribed layer has a worker task that executes its requests in order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{RemoteError, SyncError};
use crate::host::{HostStore, LocalChange};
use crate::models::{LayerId, LayerInfo, LocalId, RemoteFeature};
use crate::remote::{RemoteChange, RemoteRequest, RemoteStore};
use crate::router::{EventRouter, LayerStats, Outbound, RemoteResponse, RouterSettings, SyncNotice};
use crate::sublayer::{LayerRegistry, SubLayerManager};

/// Default capacity of the host and realtime change channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

const ECHO_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSettings {
    pub router: RouterSettings,
    /// Capacity callers should give the change channels they pass in
    pub channel_capacity: usize,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            router: RouterSettings::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum Command {
    Subscribe {
        layer: LayerId,
        reply: Reply<LayerStats>,
    },
    Unsubscribe {
        layer: LayerId,
        reply: Reply<usize>,
    },
    CreateSubLayer {
        parent: LayerId,
        name: String,
        selection: Vec<LocalId>,
        reply: Reply<LayerInfo>,
    },
    MergeSubLayer {
        layer: LayerId,
        reply: Reply<()>,
    },
    RefreshLayers {
        reply: Reply<Vec<LayerInfo>>,
    },
    Flush {
        layer: LayerId,
        reply: Reply<usize>,
    },
    Stats {
        layer: LayerId,
        reply: oneshot::Sender<Option<LayerStats>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Results of work spawned off the reactor
enum Internal {
    Response(RemoteResponse),
    Loaded {
        layer: LayerId,
        result: Result<(LayerInfo, Vec<RemoteFeature>), RemoteError>,
        reply: Option<Reply<LayerStats>>,
    },
    Created {
        parent: LayerId,
        features: usize,
        result: Result<LayerInfo, SyncError>,
        reply: Reply<LayerInfo>,
    },
    Merged {
        layer: LayerId,
        result: Result<(), SyncError>,
    },
    Listed {
        result: Result<Vec<LayerInfo>, RemoteError>,
        reply: Reply<Vec<LayerInfo>>,
    },
}

/// Remote changes seen while a layer's rows are being fetched
///
/// The fetched rows may predate these changes, so they are replayed once
/// the layer is subscribed.
#[derive(Default)]
struct Loading {
    in_flight: usize,
    buffered: Vec<RemoteChange>,
}

/// Ordered outbound queue of one layer
struct Pipeline {
    tx: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

fn spawn_pipeline(
    layer: LayerId,
    remote: Arc<dyn RemoteStore>,
    internal_tx: mpsc::UnboundedSender<Internal>,
) -> Pipeline {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            debug!("Layer {}: sending {}", layer, outbound.request);
            let result = outbound.request.execute(remote.as_ref()).await;
            let _ = internal_tx.send(Internal::Response(RemoteResponse { outbound, result }));
        }
    });
    Pipeline { tx, task }
}

pub struct Adapter;

impl Adapter {
    /// Start the reactor
    ///
    /// `local_rx` carries the host's change notifications and `remote_rx`
    /// the realtime stream. Both should be bounded with
    /// `settings.channel_capacity`.
    pub fn spawn<H: HostStore + 'static>(
        host: H,
        remote: Arc<dyn RemoteStore>,
        local_rx: mpsc::Receiver<LocalChange>,
        remote_rx: mpsc::Receiver<RemoteChange>,
        settings: AdapterSettings,
    ) -> AdapterHandle {
        let (router, notices) = EventRouter::new(host, settings.router);
        let (command_tx, command_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let reactor = Reactor {
            router,
            sublayers: SubLayerManager::new(remote.clone()),
            remote,
            registry: LayerRegistry::new(),
            pipelines: HashMap::new(),
            pending_merges: HashMap::new(),
            loading: HashMap::new(),
            internal_tx,
        };
        let task = tokio::spawn(reactor.run(command_rx, internal_rx, local_rx, remote_rx));

        AdapterHandle {
            commands: command_tx,
            notices,
            task,
        }
    }
}

/// Handle to control a running adapter
pub struct AdapterHandle {
    commands: mpsc::Sender<Command>,
    notices: mpsc::UnboundedReceiver<SyncNotice>,
    task: JoinHandle<()>,
}

impl AdapterHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SyncError::AdapterClosed)?;
        rx.await.map_err(|_| SyncError::AdapterClosed)
    }

    /// Load a layer and start synchronizing it
    pub async fn subscribe(&self, layer: LayerId) -> Result<LayerStats, SyncError> {
        self.request(|reply| Command::Subscribe { layer, reply }).await?
    }

    /// Stop synchronizing a layer, discarding unsent edits
    pub async fn unsubscribe(&self, layer: LayerId) -> Result<usize, SyncError> {
        self.request(|reply| Command::Unsubscribe { layer, reply }).await?
    }

    /// Copy selected features of a subscribed layer into a new sub-layer
    ///
    /// The new sub-layer is subscribed once created.
    pub async fn create_sub_layer(
        &self,
        parent: LayerId,
        name: &str,
        selection: Vec<LocalId>,
    ) -> Result<LayerInfo, SyncError> {
        let name = name.to_string();
        self.request(|reply| Command::CreateSubLayer {
            parent,
            name,
            selection,
            reply,
        })
        .await?
    }

    /// Merge a sub-layer into its parent; resolves once the merge finished
    pub async fn merge_sub_layer(&self, layer: LayerId) -> Result<(), SyncError> {
        self.request(|reply| Command::MergeSubLayer { layer, reply }).await?
    }

    /// Re-read the remote layer list
    pub async fn refresh_layers(&self) -> Result<Vec<LayerInfo>, SyncError> {
        self.request(|reply| Command::RefreshLayers { reply }).await?
    }

    /// Send a layer's pending edits now; returns how many requests went out
    pub async fn flush(&self, layer: LayerId) -> Result<usize, SyncError> {
        self.request(|reply| Command::Flush { layer, reply }).await?
    }

    pub async fn stats(&self, layer: LayerId) -> Result<Option<LayerStats>, SyncError> {
        self.request(|reply| Command::Stats { layer, reply }).await
    }

    /// Drain the notices emitted so far
    pub fn take_notices(&mut self) -> Vec<SyncNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }

    /// Wait for the next notice
    pub async fn next_notice(&mut self) -> Option<SyncNotice> {
        self.notices.recv().await
    }

    /// Flush pending edits, wait for outstanding requests and stop
    pub async fn shutdown(self) -> Result<(), SyncError> {
        self.request(|reply| Command::Shutdown { reply }).await?;
        self.task.await.map_err(|e| {
            warn!("Adapter task ended abnormally: {}", e);
            SyncError::AdapterClosed
        })
    }
}

struct Reactor<H: HostStore> {
    router: EventRouter<H>,
    remote: Arc<dyn RemoteStore>,
    sublayers: SubLayerManager,
    registry: LayerRegistry,
    pipelines: HashMap<LayerId, Pipeline>,
    pending_merges: HashMap<LayerId, Reply<()>>,
    loading: HashMap<LayerId, Loading>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<H: HostStore + 'static> Reactor<H> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut local_rx: mpsc::Receiver<LocalChange>,
        mut remote_rx: mpsc::Receiver<RemoteChange>,
    ) {
        let mut sweep = tokio::time::interval(ECHO_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut local_open = true;
        let mut remote_open = true;

        info!("Adapter started");
        loop {
            let deadline = self.router.next_deadline();

            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Shutdown { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }

                Some(msg) = internal.recv() => self.handle_internal(msg),

                change = local_rx.recv(), if local_open => {
                    match change {
                        Some(change) => {
                            let outbound = self.router.handle_local(change, Instant::now());
                            self.dispatch(outbound);
                        }
                        None => {
                            debug!("Host change channel closed");
                            local_open = false;
                        }
                    }
                }

                change = remote_rx.recv(), if remote_open => {
                    match change {
                        Some(change) => self.handle_remote(change),
                        None => {
                            debug!("Remote change channel closed");
                            remote_open = false;
                        }
                    }
                }

                _ = sleep_until_deadline(deadline) => {
                    let outbound = self.router.flush_due(Instant::now());
                    self.dispatch(outbound);
                }

                _ = sweep.tick() => {
                    self.router.expire_echoes(Instant::now());
                }
            }
        }
        info!("Adapter stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { layer, reply } => self.load(layer, Some(reply)),
            Command::Unsubscribe { layer, reply } => {
                let result = self.router.unsubscribe(layer);
                if result.is_ok() {
                    self.pipelines.remove(&layer);
                }
                let _ = reply.send(result);
            }
            Command::CreateSubLayer {
                parent,
                name,
                selection,
                reply,
            } => self.create_sub_layer(parent, name, selection, reply),
            Command::MergeSubLayer { layer, reply } => self.merge_sub_layer(layer, reply),
            Command::RefreshLayers { reply } => {
                let remote = self.remote.clone();
                let internal_tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = remote.list_layers().await;
                    let _ = internal_tx.send(Internal::Listed { result, reply });
                });
            }
            Command::Flush { layer, reply } => {
                let result = self.router.flush_layer(layer, Instant::now()).map(|outbound| {
                    let count = outbound.len();
                    self.dispatch(outbound);
                    count
                });
                let _ = reply.send(result);
            }
            Command::Stats { layer, reply } => {
                let _ = reply.send(self.router.stats(layer));
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Response(response) => {
                if let RemoteRequest::MergeSubLayer(layer) = response.outbound.request {
                    let result = response.result.map_err(SyncError::from);
                    if result.is_ok() && self.router.is_subscribed(layer) {
                        if let Err(e) = self.router.unsubscribe(layer) {
                            warn!("Failed to tear down merged sub-layer {}: {}", layer, e);
                        }
                        self.pipelines.remove(&layer);
                    }
                    self.finish_merge(layer, result);
                } else {
                    self.router.handle_response(response, Instant::now());
                }
            }
            Internal::Loaded {
                layer,
                result,
                reply,
            } => {
                let buffered = self.finish_load(layer);
                let subscribed = result.map_err(SyncError::from).and_then(|(info, rows)| {
                    self.registry.insert(info.clone());
                    let outbound = self.router.subscribe(info, rows, Instant::now())?;
                    self.dispatch(outbound);
                    Ok(())
                });
                // Replayed even after a failed fetch: an earlier subscription may be live
                if !buffered.is_empty() {
                    debug!(
                        "Layer {}: replaying {} change(s) seen while loading",
                        layer,
                        buffered.len()
                    );
                }
                for change in buffered {
                    self.handle_remote(change);
                }
                let result = subscribed.and_then(|()| {
                    self.router
                        .stats(layer)
                        .ok_or(SyncError::UnknownLayer(layer))
                });
                if let Err(e) = &result {
                    warn!("Failed to subscribe: {}", e);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Internal::Created {
                parent,
                features,
                result,
                reply,
            } => {
                if let Ok(info) = &result {
                    self.registry.insert(info.clone());
                    self.router.notify(SyncNotice::SubLayerCreated {
                        parent,
                        layer: info.id,
                        name: info.name.clone(),
                        features,
                    });
                    self.load(info.id, None);
                }
                let _ = reply.send(result);
            }
            Internal::Merged { layer, result } => self.finish_merge(layer, result),
            Internal::Listed { result, reply } => {
                let result = result.map_err(SyncError::from).map(|layers| {
                    self.registry.replace_all(layers.clone());
                    layers
                });
                let _ = reply.send(result);
            }
        }
    }

    fn handle_remote(&mut self, change: RemoteChange) {
        if !self.loading.is_empty() {
            match &change {
                RemoteChange::Insert(row) | RemoteChange::Update(row) => {
                    if let Some(loading) = self.loading.get_mut(&row.layer_id) {
                        loading.buffered.push(change);
                        return;
                    }
                }
                // A delete names no layer; any loading layer may own the row
                RemoteChange::Delete { .. } => {
                    for loading in self.loading.values_mut() {
                        loading.buffered.push(change.clone());
                    }
                }
            }
        }
        let outbound = self.router.handle_remote(change, Instant::now());
        self.dispatch(outbound);
    }

    /// Changes to replay after a fetch completes
    ///
    /// While another fetch of the same layer is running, nothing is
    /// replayed yet: the last one to complete replays everything.
    fn finish_load(&mut self, layer: LayerId) -> Vec<RemoteChange> {
        let Some(loading) = self.loading.get_mut(&layer) else {
            return Vec::new();
        };
        loading.in_flight = loading.in_flight.saturating_sub(1);
        if loading.in_flight > 0 {
            return Vec::new();
        }
        self.loading
            .remove(&layer)
            .map(|loading| loading.buffered)
            .unwrap_or_default()
    }

    /// Fetch a layer and its rows off the reactor, then subscribe
    ///
    /// Remote changes for the layer are held back until the rows arrive.
    fn load(&mut self, layer: LayerId, reply: Option<Reply<LayerStats>>) {
        self.loading.entry(layer).or_default().in_flight += 1;
        let remote = self.remote.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result: Result<_, RemoteError> = async {
                let info = remote.get_layer(layer).await?;
                let rows = remote.fetch_features(layer).await?;
                Ok((info, rows))
            }
            .await;
            let _ = internal_tx.send(Internal::Loaded {
                layer,
                result,
                reply,
            });
        });
    }

    fn create_sub_layer(
        &mut self,
        parent: LayerId,
        name: String,
        selection: Vec<LocalId>,
        reply: Reply<LayerInfo>,
    ) {
        let prepared = self.prepare_sub_layer(parent, &selection);
        let (info, rows) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let manager = self.sublayers.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let features = rows.len();
            let result = manager.create(&info, &name, rows).await;
            let _ = internal_tx.send(Internal::Created {
                parent,
                features,
                result,
                reply,
            });
        });
    }

    fn prepare_sub_layer(
        &self,
        parent: LayerId,
        selection: &[LocalId],
    ) -> Result<(LayerInfo, Vec<RemoteFeature>), SyncError> {
        let info = self
            .router
            .layer_info(parent)
            .cloned()
            .ok_or(SyncError::UnknownLayer(parent))?;
        if info.is_sub_layer() {
            return Err(SyncError::NestedSubLayer(parent));
        }
        if selection.is_empty() {
            return Err(SyncError::EmptySelection);
        }
        let rows = self.router.rows_for_selection(parent, selection)?;
        if rows.is_empty() {
            return Err(SyncError::EmptySelection);
        }
        Ok((info, rows))
    }

    fn merge_sub_layer(&mut self, layer: LayerId, reply: Reply<()>) {
        if let Err(e) = self.registry.begin_merge(layer) {
            let _ = reply.send(Err(e));
            return;
        }
        self.pending_merges.insert(layer, reply);

        if self.router.is_subscribed(layer) {
            // Pending edits go out first, on the same ordered pipeline
            let now = Instant::now();
            let mut outbound = match self.router.flush_layer(layer, now) {
                Ok(outbound) => outbound,
                Err(e) => return self.finish_merge(layer, Err(e)),
            };
            match self.router.merge_request(layer) {
                Ok(merge) => outbound.push(merge),
                Err(e) => {
                    self.dispatch(outbound);
                    return self.finish_merge(layer, Err(e));
                }
            }
            info!("Merging sub-layer {}", layer);
            self.dispatch(outbound);
        } else {
            let manager = self.sublayers.clone();
            let internal_tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let result = manager.merge(layer).await;
                let _ = internal_tx.send(Internal::Merged { layer, result });
            });
        }
    }

    fn finish_merge(&mut self, layer: LayerId, result: Result<(), SyncError>) {
        let parent = self.registry.get(layer).and_then(|info| info.parent_id);
        match &result {
            Ok(()) => {
                self.registry.finish_merge(layer, true);
                if let Some(parent) = parent {
                    info!("Sub-layer {} merged into {}", layer, parent);
                    self.router.notify(SyncNotice::SubLayerMerged { layer, parent });
                }
            }
            Err(e) => {
                self.registry.finish_merge(layer, false);
                warn!("Merge of sub-layer {} failed: {}", layer, e);
                self.router.notify(SyncNotice::SyncFailed {
                    layer,
                    request: RemoteRequest::MergeSubLayer(layer).to_string(),
                    error: e.to_string(),
                    features: 0,
                });
            }
        }
        if let Some(reply) = self.pending_merges.remove(&layer) {
            let _ = reply.send(result);
        }
    }

    fn dispatch(&mut self, outbound: Vec<Outbound>) {
        for request in outbound {
            let layer = request.layer;
            let remote = &self.remote;
            let internal_tx = &self.internal_tx;
            let pipeline = self
                .pipelines
                .entry(layer)
                .or_insert_with(|| spawn_pipeline(layer, remote.clone(), internal_tx.clone()));
            if let Err(e) = pipeline.tx.send(request) {
                warn!("Layer {}: pipeline closed, dropping {}", layer, e.0.request);
            }
        }
    }

    async fn shutdown(&mut self) {
        let now = Instant::now();
        for layer in self.router.subscribed() {
            match self.router.flush_layer(layer, now) {
                Ok(outbound) => self.dispatch(outbound),
                Err(e) => warn!("Layer {}: final flush failed: {}", layer, e),
            }
        }

        for (layer, pipeline) in self.pipelines.drain() {
            drop(pipeline.tx);
            if let Err(e) = pipeline.task.await {
                warn!("Layer {}: pipeline ended abnormally: {}", layer, e);
            }
        }
    }
}
