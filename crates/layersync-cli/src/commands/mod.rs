//! Command handlers

pub mod attribute;
pub mod config;
pub mod layer;
pub mod point;
pub mod sync;

use std::io::{self, IsTerminal, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use layersync_core::{Config, LayerInfo, RestClient};

use crate::storage::SqliteHost;

/// REST client for the configured target
pub(crate) fn remote_client(config: &Config) -> Result<Arc<RestClient>> {
    let client = RestClient::new(config.rest_config()?).context("Failed to create REST client")?;
    Ok(Arc::new(client))
}

/// Open the local feature file
pub(crate) fn open_host(config: &Config) -> Result<SqliteHost> {
    SqliteHost::open(&config.features_path())
}

/// Find a layer by full id, id prefix, or exact name
pub(crate) fn resolve_layer<'a>(layers: &'a [LayerInfo], key: &str) -> Result<&'a LayerInfo> {
    if let Some(layer) = layers.iter().find(|l| l.id.to_string() == key) {
        return Ok(layer);
    }

    let by_name: Vec<_> = layers.iter().filter(|l| l.name == key).collect();
    let matches = if by_name.is_empty() {
        layers
            .iter()
            .filter(|l| l.id.to_string().starts_with(key))
            .collect()
    } else {
        by_name
    };

    match matches.len() {
        0 => bail!("No layer found matching: {}", key),
        1 => Ok(matches[0]),
        _ => {
            eprintln!("Multiple layers match '{}':", key);
            for layer in &matches {
                eprintln!("  {} - {}", layer.id, layer.name);
            }
            bail!("Ambiguous layer. Use the layer id.");
        }
    }
}

/// Ask a yes/no question; answers no when stdin is not a terminal
pub(crate) fn confirm(prompt: &str) -> Result<bool> {
    if !io::stdin().is_terminal() {
        return Ok(false);
    }

    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers() -> Vec<LayerInfo> {
        vec![
            LayerInfo::new("signs", 4326),
            LayerInfo::new("benches", 4326),
            LayerInfo::new("benches", 2949),
        ]
    }

    #[test]
    fn test_resolve_by_id_and_name() {
        let layers = layers();
        let id = layers[0].id.to_string();

        assert_eq!(resolve_layer(&layers, &id).unwrap().id, layers[0].id);
        assert_eq!(resolve_layer(&layers, &id[..8]).unwrap().id, layers[0].id);
        assert_eq!(resolve_layer(&layers, "signs").unwrap().id, layers[0].id);
    }

    #[test]
    fn test_resolve_rejects_ambiguous_and_unknown() {
        let layers = layers();
        assert!(resolve_layer(&layers, "benches").is_err());
        assert!(resolve_layer(&layers, "trees").is_err());
        assert!(resolve_layer(&[], "signs").is_err());
    }
}
