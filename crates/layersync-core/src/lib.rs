//! layersync core library
//!
//! Keeps a locally editable point-feature store and a remote feature store
//! consistent in both directions, one feature at a time, without echo loops
//! and without losing edits made faster than the remote round-trip.
//!
//! # Architecture
//!
//! - **Host**: the local feature store, behind [`HostStore`]
//! - **Remote**: the `layers`/`points` tables behind [`RemoteStore`], plus a
//!   realtime change stream
//! - **Router**: the synchronous state machine tying both together
//! - **Adapter**: the tokio task driving the router
//!
//! # Quick Start
//!
//! ```text
//! let (host, local_rx) = MemoryHost::new(1024);
//! let remote = Arc::new(RestClient::new(config.rest_config()?)?);
//! let (changes_tx, remote_rx) = mpsc::channel(1024);
//! let realtime = spawn_realtime(config.realtime_config()?, changes_tx);
//!
//! let adapter = Adapter::spawn(host, remote, local_rx, remote_rx, config.adapter_settings());
//! adapter.subscribe(layer_id).await?;
//! ```
//!
//! # Modules
//!
//! - `models`: layers, features, identifiers and attribute values
//! - `identity`: local/remote identifier bindings
//! - `echo`: suppression of self-caused change notifications
//! - `convert`: geometry and attribute conversion
//! - `batch`: coalescing of local edits
//! - `router`: per-event synchronization logic
//! - `sublayer`: sub-layer creation and merge
//! - `remote`: remote store contract, REST client, in-memory store
//! - `realtime`: realtime change stream client
//! - `host`: host store contract and in-memory host
//! - `adapter`: the reactor task and its handle
//! - `config`: application configuration

pub mod adapter;
pub mod batch;
pub mod config;
pub mod convert;
pub mod echo;
pub mod error;
pub mod host;
pub mod identity;
pub mod models;
pub mod realtime;
pub mod remote;
pub mod router;
pub mod sublayer;

pub use adapter::{Adapter, AdapterHandle, AdapterSettings};
pub use config::{Config, Target};
pub use error::{HostError, RemoteError, SyncError, SyncResult};
pub use host::{HostMutation, HostStore, LocalChange, LocalChangeKind, MemoryHost};
pub use models::{
    AttributeType, AttributeValue, LayerAttribute, LayerId, LayerInfo, LocalFeature, LocalId, Point3,
    RemoteFeature, RemoteId,
};
pub use realtime::{spawn_realtime, ConnectionStatus, RealtimeConfig, RealtimeHandle};
pub use remote::{MemoryRemote, RemoteChange, RemoteRequest, RemoteStore, RestClient, RestConfig};
pub use router::{EventRouter, LayerStats, RouterSettings, SyncNotice};
pub use sublayer::{LayerRegistry, SubLayerManager, SubLayerState};
