//! Point command handlers
//!
//! These edit the local feature file only. A running `layersync watch`
//! picks the edits up from the change journal and sends them.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use layersync_core::convert::coerce;
use layersync_core::{
    AttributeValue, Config, HostStore, LayerInfo, LocalFeature, LocalId, Point3,
};

use super::open_host;
use crate::output::Output;
use crate::storage::SqliteHost;

fn local_layer(host: &SqliteHost, layer: &str) -> Result<LayerInfo> {
    host.find_layer(layer)?.ok_or_else(|| {
        anyhow!(
            "Layer '{}' is not in the local feature file. Run `layersync watch {}` first.",
            layer,
            layer
        )
    })
}

/// Parse a `name=value` assignment against the layer schema
///
/// `null` clears the attribute; other values are converted to the
/// attribute's declared type.
pub(crate) fn parse_assignment(layer: &LayerInfo, raw: &str) -> Result<(String, AttributeValue)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid assignment '{}'. Use name=value.", raw))?;
    let name = name.trim();

    let attribute = layer
        .attribute(name)
        .ok_or_else(|| anyhow!("Layer '{}' has no attribute '{}'", layer.name, name))?;

    if value.eq_ignore_ascii_case("null") {
        return Ok((name.to_string(), AttributeValue::Null));
    }

    let parsed = coerce(&Value::String(value.to_string()), attribute.kind).ok_or_else(|| {
        anyhow!(
            "Invalid value '{}' for attribute '{}' of type {}",
            value,
            name,
            attribute.kind
        )
    })?;
    Ok((name.to_string(), parsed))
}

fn parse_assignments(layer: &LayerInfo, raw: &[String]) -> Result<Vec<(String, AttributeValue)>> {
    raw.iter().map(|r| parse_assignment(layer, r)).collect()
}

/// Add a point; schema attributes start at their defaults
pub fn add(
    config: &Config,
    layer: String,
    at: (f64, f64, f64),
    attributes: Vec<String>,
    output: &Output,
) -> Result<()> {
    let host = open_host(config)?;
    let info = local_layer(&host, &layer)?;
    let assignments = parse_assignments(&info, &attributes)?;

    let mut feature = LocalFeature::new(Point3::new(at.0, at.1, at.2));
    for attribute in &info.attributes {
        feature
            .attributes
            .insert(attribute.name.clone(), attribute.resolved_default());
    }
    feature.attributes.extend(assignments);

    let id = host
        .add_point(info.id, &feature)
        .context("Failed to add point")?;

    if output.is_quiet() {
        println!("{}", id.0);
    }
    output.success(&format!("Added point {} to '{}'", id, info.name));
    Ok(())
}

/// Move a point; a missing z keeps the current one
pub fn move_point(
    config: &Config,
    layer: String,
    id: i64,
    x: f64,
    y: f64,
    z: Option<f64>,
    output: &Output,
) -> Result<()> {
    let host = open_host(config)?;
    let info = local_layer(&host, &layer)?;

    let moved = host
        .edit_point(info.id, LocalId(id), |f| {
            f.geometry.x = x;
            f.geometry.y = y;
            if let Some(z) = z {
                f.geometry.z = z;
            }
        })
        .with_context(|| format!("Failed to move point {}", id))?;

    output.success(&format!(
        "Moved point {} to {}, {}, {}",
        LocalId(id),
        moved.geometry.x,
        moved.geometry.y,
        moved.geometry.z
    ));
    Ok(())
}

/// Set attributes of a point
pub fn set(
    config: &Config,
    layer: String,
    id: i64,
    attributes: Vec<String>,
    output: &Output,
) -> Result<()> {
    if attributes.is_empty() {
        bail!("Nothing to set. Use name=value.");
    }

    let host = open_host(config)?;
    let info = local_layer(&host, &layer)?;
    let assignments = parse_assignments(&info, &attributes)?;

    host.edit_point(info.id, LocalId(id), |f| f.attributes.extend(assignments))
        .with_context(|| format!("Failed to update point {}", id))?;

    output.success(&format!("Updated point {}", LocalId(id)));
    Ok(())
}

pub fn delete(config: &Config, layer: String, id: i64, output: &Output) -> Result<()> {
    let host = open_host(config)?;
    let info = local_layer(&host, &layer)?;

    host.delete_point(info.id, LocalId(id))
        .with_context(|| format!("Failed to delete point {}", id))?;

    output.success(&format!("Deleted point {}", LocalId(id)));
    Ok(())
}

pub fn list(config: &Config, layer: String, output: &Output) -> Result<()> {
    let host = open_host(config)?;
    let info = local_layer(&host, &layer)?;
    let features = host.current_features(info.id)?;
    output.print_points(&features);
    Ok(())
}
