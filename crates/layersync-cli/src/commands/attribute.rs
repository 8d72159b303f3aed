//! Attribute schema command handlers
//!
//! Schema edits land in the local feature file; a running watcher sends
//! the new schema to the remote layer.

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};

use layersync_core::convert::coerce;
use layersync_core::{AttributeType, AttributeValue, Config, LayerAttribute};

use super::open_host;
use crate::output::{Output, OutputFormat};

/// Resolve a `--default` argument for an attribute of type `kind`
///
/// `auto` picks the type's neutral value.
pub(crate) fn parse_default(kind: AttributeType, raw: &str) -> Result<AttributeValue> {
    if raw == "auto" {
        return Ok(kind.null_value());
    }
    coerce(&Value::String(raw.to_string()), kind)
        .ok_or_else(|| anyhow!("Invalid default '{}' for type {}", raw, kind))
}

pub fn list(config: &Config, layer: String, output: &Output) -> Result<()> {
    let host = open_host(config)?;
    let info = host
        .find_layer(&layer)?
        .ok_or_else(|| anyhow!("Layer '{}' is not in the local feature file", layer))?;

    match output.format {
        OutputFormat::Human => {
            if info.attributes.is_empty() {
                println!("Layer '{}' has no attributes.", info.name);
                return Ok(());
            }
            for attribute in &info.attributes {
                match &attribute.default {
                    Some(default) => {
                        println!("{} ({}) default {}", attribute.name, attribute.kind, default)
                    }
                    None => println!("{} ({})", attribute.name, attribute.kind),
                }
            }
        }
        OutputFormat::Json => println!("{}", json!(info.attributes)),
        OutputFormat::Quiet => {
            for attribute in &info.attributes {
                println!("{}", attribute.name);
            }
        }
    }
    Ok(())
}

pub fn add(
    config: &Config,
    layer: String,
    name: String,
    kind: AttributeType,
    default: Option<String>,
    output: &Output,
) -> Result<()> {
    let host = open_host(config)?;
    let info = host
        .find_layer(&layer)?
        .ok_or_else(|| anyhow!("Layer '{}' is not in the local feature file", layer))?;

    if info.attribute(&name).is_some() {
        bail!("Layer '{}' already has an attribute '{}'", info.name, name);
    }

    let mut attribute = LayerAttribute::new(name.clone(), kind);
    if let Some(raw) = default {
        attribute = attribute.with_default(parse_default(kind, &raw)?);
    }

    let mut attributes = info.attributes.clone();
    attributes.push(attribute);
    host.set_schema(info.id, &attributes)?;

    output.success(&format!("Added attribute '{}' ({}) to '{}'", name, kind, info.name));
    Ok(())
}

pub fn remove(config: &Config, layer: String, name: String, output: &Output) -> Result<()> {
    let host = open_host(config)?;
    let info = host
        .find_layer(&layer)?
        .ok_or_else(|| anyhow!("Layer '{}' is not in the local feature file", layer))?;

    let attributes: Vec<_> = info
        .attributes
        .iter()
        .filter(|a| a.name != name)
        .cloned()
        .collect();
    if attributes.len() == info.attributes.len() {
        bail!("Layer '{}' has no attribute '{}'", info.name, name);
    }
    host.set_schema(info.id, &attributes)?;

    output.success(&format!("Removed attribute '{}' from '{}'", name, info.name));
    Ok(())
}
