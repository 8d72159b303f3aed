//! Layer command handlers

use std::collections::HashSet;

use anyhow::{bail, Context, Result};

use layersync_core::{Config, RemoteStore};

use super::{confirm, open_host, remote_client, resolve_layer};
use crate::output::{LayerListing, Output};

/// List remote layers, marking those present in the feature file
pub async fn list(config: &Config, output: &Output) -> Result<()> {
    let remote = remote_client(config)?;
    let layers = remote
        .list_layers()
        .await
        .context("Failed to list remote layers")?;

    let local: HashSet<_> = open_host(config)?
        .layers()?
        .into_iter()
        .map(|l| l.id)
        .collect();

    let listings: Vec<_> = layers
        .into_iter()
        .map(|info| LayerListing {
            local: local.contains(&info.id),
            info,
        })
        .collect();
    output.print_layers(&listings);

    Ok(())
}

/// Rename a layer on the remote and in the feature file
pub async fn rename(config: &Config, layer: String, name: String, output: &Output) -> Result<()> {
    if name.trim().is_empty() {
        bail!("Layer name cannot be empty");
    }

    let remote = remote_client(config)?;
    let layers = remote.list_layers().await?;
    let target = resolve_layer(&layers, &layer)?;

    remote
        .rename_layer(target.id, &name)
        .await
        .context("Failed to rename layer")?;
    open_host(config)?.rename_layer(target.id, &name)?;

    output.success(&format!("Renamed '{}' to '{}'", target.name, name));
    Ok(())
}

/// Drop a layer from the remote and from the feature file
pub async fn drop_layer(config: &Config, layer: String, output: &Output) -> Result<()> {
    let remote = remote_client(config)?;
    let layers = remote.list_layers().await?;
    let target = resolve_layer(&layers, &layer)?;

    let subs: Vec<_> = layers
        .iter()
        .filter(|l| l.parent_id == Some(target.id))
        .collect();
    if !subs.is_empty() {
        bail!(
            "Layer '{}' has {} sub-layer(s). Merge or drop them first.",
            target.name,
            subs.len()
        );
    }

    if output.should_prompt() {
        println!(
            "Drop layer: {} - {}",
            &target.id.to_string()[..8],
            target.name
        );
        if !confirm("This deletes every feature of the layer. Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    remote
        .drop_layer(target.id)
        .await
        .context("Failed to drop layer")?;
    open_host(config)?.remove_layer(target.id)?;

    output.success(&format!("Dropped layer: {}", target.name));
    Ok(())
}
