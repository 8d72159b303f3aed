//! layersync CLI
//!
//! Command-line interface for layersync - keeps a local point-feature file
//! in sync with a remote feature store.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use layersync_core::{AttributeType, Config};

mod commands;
mod output;
mod storage;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "layersync")]
#[command(about = "layersync - Bidirectional point-feature sync with a remote store")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List remote layers
    #[command(alias = "ls")]
    Layers,
    /// Keep layers in sync with the local feature file until interrupted
    Watch {
        /// Layer names or ids
        #[arg(required = true)]
        layers: Vec<String>,
    },
    /// Copy features of a layer into a new sub-layer
    SubLayer {
        /// Parent layer name or id
        parent: String,
        /// Name of the new sub-layer
        name: String,
        /// Feature to copy (remote id or point id); repeatable
        #[arg(short, long = "feature", required = true)]
        features: Vec<String>,
    },
    /// Merge a sub-layer back into its parent
    Merge {
        /// Sub-layer name or id
        layer: String,
    },
    /// Rename a layer
    Rename {
        /// Layer name or id
        layer: String,
        /// New name
        name: String,
    },
    /// Drop a layer and all of its features
    Drop {
        /// Layer name or id
        layer: String,
    },
    /// Edit points in the local feature file
    Point {
        #[command(subcommand)]
        command: PointCommands,
    },
    /// Edit a layer's attribute schema in the local feature file
    Attribute {
        #[command(subcommand)]
        command: AttributeCommands,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum PointCommands {
    /// Add a point
    #[command(allow_negative_numbers = true)]
    Add {
        /// Layer name or id
        layer: String,
        x: f64,
        y: f64,
        #[arg(default_value_t = 0.0)]
        z: f64,
        /// Attribute value as name=value; repeatable
        #[arg(short, long = "set")]
        attributes: Vec<String>,
    },
    /// Move a point
    #[command(allow_negative_numbers = true)]
    Move {
        layer: String,
        /// Point id
        id: i64,
        x: f64,
        y: f64,
        z: Option<f64>,
    },
    /// Set attribute values of a point
    Set {
        layer: String,
        /// Point id
        id: i64,
        /// Attribute values as name=value (`null` clears)
        #[arg(required = true)]
        attributes: Vec<String>,
    },
    /// Delete a point
    #[command(alias = "rm")]
    Delete {
        layer: String,
        /// Point id
        id: i64,
    },
    /// List the points of a layer
    #[command(alias = "ls")]
    List { layer: String },
}

#[derive(Subcommand)]
enum AttributeCommands {
    /// Add an attribute
    Add {
        layer: String,
        name: String,
        /// bool, int, float, str, date, time or datetime
        #[arg(value_name = "TYPE")]
        kind: AttributeType,
        /// Default value, or `auto` for the type's neutral value
        #[arg(short, long)]
        default: Option<String>,
    },
    /// Remove an attribute
    #[command(alias = "rm")]
    Remove { layer: String, name: String },
    /// List a layer's attributes
    #[command(alias = "ls")]
    List { layer: String },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (api_key, target, hosted_url, batch_window_ms, ...)
        key: String,
        /// Configuration value
        value: String,
    },
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work even when the config file is broken
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Layers => commands::layer::list(&config, &output).await,
        Commands::Watch { layers } => commands::sync::watch(&config, layers, &output).await,
        Commands::SubLayer {
            parent,
            name,
            features,
        } => commands::sync::sub_layer(&config, parent, name, features, &output).await,
        Commands::Merge { layer } => commands::sync::merge(&config, layer, &output).await,
        Commands::Rename { layer, name } => {
            commands::layer::rename(&config, layer, name, &output).await
        }
        Commands::Drop { layer } => commands::layer::drop_layer(&config, layer, &output).await,
        Commands::Point { command } => handle_point_command(command, &config, &output),
        Commands::Attribute { command } => handle_attribute_command(command, &config, &output),
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn handle_point_command(command: PointCommands, config: &Config, output: &Output) -> Result<()> {
    match command {
        PointCommands::Add {
            layer,
            x,
            y,
            z,
            attributes,
        } => commands::point::add(config, layer, (x, y, z), attributes, output),
        PointCommands::Move { layer, id, x, y, z } => {
            commands::point::move_point(config, layer, id, x, y, z, output)
        }
        PointCommands::Set {
            layer,
            id,
            attributes,
        } => commands::point::set(config, layer, id, attributes, output),
        PointCommands::Delete { layer, id } => commands::point::delete(config, layer, id, output),
        PointCommands::List { layer } => commands::point::list(config, layer, output),
    }
}

fn handle_attribute_command(
    command: AttributeCommands,
    config: &Config,
    output: &Output,
) -> Result<()> {
    match command {
        AttributeCommands::Add {
            layer,
            name,
            kind,
            default,
        } => commands::attribute::add(config, layer, name, kind, default, output),
        AttributeCommands::Remove { layer, name } => {
            commands::attribute::remove(config, layer, name, output)
        }
        AttributeCommands::List { layer } => commands::attribute::list(config, layer, output),
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
        Some(ConfigCommands::Path) => commands::config::path(config_path),
    }
}

/// Initialize logging
///
/// LAYERSYNC_LOG takes a full filter directive; otherwise `--verbose` or
/// `verbose = true` selects debug and the default is warnings only. Logs go
/// to `log_file` when configured, else to stderr.
fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose || config.verbose {
        "debug"
    } else {
        "warn"
    };
    let env_filter = EnvFilter::try_from_env("LAYERSYNC_LOG").unwrap_or_else(|_| {
        EnvFilter::new(format!("layersync_core={},layersync={}", level, level))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore the error if a subscriber is already installed
    match &config.log_file {
        Some(path) => {
            let log_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Could not open log file {:?}", path))?;
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(log_file))
                .try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }

    Ok(())
}
