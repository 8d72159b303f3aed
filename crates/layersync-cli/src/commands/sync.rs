//! Synchronization command handlers
//!
//! Each of these runs an adapter against the local feature file for the
//! duration of the command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use layersync_core::{
    spawn_realtime, Adapter, AdapterHandle, Config, LayerId, LayerInfo, LocalId, RealtimeHandle,
    RemoteId, RemoteStore, SyncNotice,
};

use super::{open_host, remote_client, resolve_layer};
use crate::output::Output;
use crate::storage::{ChangeJournal, SqliteHost};

/// How long to wait for a new sub-layer to load
const SUB_LAYER_TIMEOUT: Duration = Duration::from_secs(30);

/// A running adapter with its journal and realtime feeds
struct Session {
    adapter: AdapterHandle,
    realtime: RealtimeHandle,
    journal: JoinHandle<()>,
}

impl Session {
    fn start(config: &Config, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        let path = config.features_path();
        let host = SqliteHost::open(&path)?;
        let journal = ChangeJournal::open(&path)?;
        let settings = config.adapter_settings();

        let (local_tx, local_rx) = mpsc::channel(settings.channel_capacity);
        let (remote_tx, remote_rx) = mpsc::channel(settings.channel_capacity);

        let realtime = spawn_realtime(config.realtime_config()?, remote_tx);
        let journal = journal.spawn(config.poll_interval(), local_tx);
        let adapter = Adapter::spawn(host, remote, local_rx, remote_rx, settings);

        info!("Session started on {:?}", path);
        Ok(Self {
            adapter,
            realtime,
            journal,
        })
    }

    async fn close(self) -> Result<()> {
        self.adapter
            .shutdown()
            .await
            .context("Failed to stop adapter")?;
        self.realtime.shutdown().await;
        // The journal stops once the adapter drops its receiver
        if let Err(e) = self.journal.await {
            warn!("Change journal ended abnormally: {}", e);
        }
        Ok(())
    }

    fn print_notices(&mut self, output: &Output) {
        for notice in self.adapter.take_notices() {
            output.notice(&notice);
        }
    }
}

/// Keep layers in sync until interrupted
pub async fn watch(config: &Config, layers: Vec<String>, output: &Output) -> Result<()> {
    if layers.is_empty() {
        bail!("Name at least one layer to watch");
    }

    let remote = remote_client(config)?;
    let available = remote
        .list_layers()
        .await
        .context("Failed to list remote layers")?;
    let targets = layers
        .iter()
        .map(|key| resolve_layer(&available, key).map(|l| l.id))
        .collect::<Result<Vec<LayerId>>>()?;

    let mut session = Session::start(config, remote)?;
    for layer in &targets {
        let stats = session
            .adapter
            .subscribe(*layer)
            .await
            .with_context(|| format!("Failed to subscribe to layer {}", layer))?;
        output.message(&format!(
            "Watching '{}' ({} feature(s))",
            stats.name, stats.bound
        ));
    }
    session.print_notices(output);
    output.message("Press Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = session.adapter.next_notice() => match notice {
                Some(notice) => output.notice(&notice),
                None => break,
            },
        }
    }

    if !output.is_quiet() {
        for layer in &targets {
            if let Ok(Some(stats)) = session.adapter.stats(*layer).await {
                output.print_stats(&stats);
            }
        }
    }

    output.message("Sending pending edits...");
    session.close().await?;
    output.success("Stopped");
    Ok(())
}

/// Resolve `--feature` arguments to local ids of the parent layer
///
/// Each argument is either a remote feature id or a local point id.
fn select_features(host: &SqliteHost, parent: LayerId, keys: &[String]) -> Result<Vec<LocalId>> {
    keys.iter()
        .map(|key| {
            let found = if let Ok(remote) = key.parse::<RemoteId>() {
                host.find_by_remote(parent, remote)?
            } else if let Ok(fid) = key.parse::<i64>() {
                host.feature(parent, LocalId(fid))?
            } else {
                bail!("Invalid feature '{}'. Use a remote id or a point id.", key);
            };
            found
                .and_then(|f| f.local_id)
                .ok_or_else(|| anyhow!("Feature '{}' not found in the parent layer", key))
        })
        .collect()
}

/// Copy selected features of a layer into a new sub-layer
pub async fn sub_layer(
    config: &Config,
    parent: String,
    name: String,
    features: Vec<String>,
    output: &Output,
) -> Result<()> {
    if name.trim().is_empty() {
        bail!("Sub-layer name cannot be empty");
    }

    let remote = remote_client(config)?;
    let available = remote.list_layers().await?;
    let parent = resolve_layer(&available, &parent)?.clone();

    let mut session = Session::start(config, remote)?;
    let result = create_and_wait(&mut session, &parent, &name, &features, config, output).await;
    session.print_notices(output);
    session.close().await?;

    let created = result?;
    if output.is_quiet() {
        println!("{}", created.id);
    }
    output.success(&format!(
        "Created sub-layer '{}' ({}) of '{}'",
        created.name, created.id, parent.name
    ));
    Ok(())
}

async fn create_and_wait(
    session: &mut Session,
    parent: &LayerInfo,
    name: &str,
    features: &[String],
    config: &Config,
    output: &Output,
) -> Result<LayerInfo> {
    session
        .adapter
        .subscribe(parent.id)
        .await
        .with_context(|| format!("Failed to load layer '{}'", parent.name))?;

    let selection = select_features(&open_host(config)?, parent.id, features)?;
    let created = session
        .adapter
        .create_sub_layer(parent.id, name, selection)
        .await
        .context("Failed to create sub-layer")?;

    // The new layer is loaded into the file once subscribed
    let ready = tokio::time::timeout(SUB_LAYER_TIMEOUT, async {
        while let Some(notice) = session.adapter.next_notice().await {
            let done = matches!(&notice, SyncNotice::LayerReady { layer, .. } if *layer == created.id);
            output.notice(&notice);
            if done {
                return true;
            }
        }
        false
    })
    .await;
    if !matches!(ready, Ok(true)) {
        warn!("Sub-layer {} was not ready in time", created.id);
    }

    Ok(created)
}

/// Merge a sub-layer into its parent
pub async fn merge(config: &Config, layer: String, output: &Output) -> Result<()> {
    let remote = remote_client(config)?;
    let mut session = Session::start(config, remote)?;

    let result = merge_in_session(&mut session, &layer, config).await;
    session.print_notices(output);
    session.close().await?;

    let (sub, parent) = result?;
    output.success(&format!("Merged '{}' into '{}'", sub.name, parent.name));
    Ok(())
}

async fn merge_in_session(
    session: &mut Session,
    key: &str,
    config: &Config,
) -> Result<(LayerInfo, LayerInfo)> {
    let layers = session
        .adapter
        .refresh_layers()
        .await
        .context("Failed to list remote layers")?;
    let sub = resolve_layer(&layers, key)?.clone();
    let Some(parent_id) = sub.parent_id else {
        bail!("Layer '{}' is not a sub-layer", sub.name);
    };
    let parent = layers
        .iter()
        .find(|l| l.id == parent_id)
        .cloned()
        .ok_or_else(|| anyhow!("Parent of '{}' no longer exists", sub.name))?;

    session
        .adapter
        .merge_sub_layer(sub.id)
        .await
        .with_context(|| format!("Failed to merge '{}'", sub.name))?;

    // The sub-layer is gone remotely; reload the parent if it is edited here
    let mut host = open_host(config)?;
    host.remove_layer(sub.id)?;
    if host.layer(parent.id)?.is_some() {
        session
            .adapter
            .subscribe(parent.id)
            .await
            .with_context(|| format!("Failed to reload '{}'", parent.name))?;
    }

    Ok((sub, parent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use layersync_core::{HostStore, LocalFeature, Point3};

    #[test]
    fn test_select_features_by_remote_or_local_id() {
        let mut host = SqliteHost::open_in_memory().unwrap();
        let layer = LayerInfo::new("signs", 4326);
        host.open_layer(&layer).unwrap();

        let remote = RemoteId::new();
        let bound = host
            .add_point(layer.id, &LocalFeature::new(Point3::new(0.0, 0.0, 0.0)))
            .unwrap();
        host.tag_feature(layer.id, bound, Some(remote)).unwrap();
        let other = host
            .add_point(layer.id, &LocalFeature::new(Point3::new(1.0, 1.0, 0.0)))
            .unwrap();

        let selected = select_features(
            &host,
            layer.id,
            &[remote.to_string(), other.0.to_string()],
        )
        .unwrap();
        assert_eq!(selected, vec![bound, other]);

        assert!(select_features(&host, layer.id, &["999".to_string()]).is_err());
        assert!(select_features(&host, layer.id, &[RemoteId::new().to_string()]).is_err());
        assert!(select_features(&host, layer.id, &["abc".to_string()]).is_err());
    }
}
