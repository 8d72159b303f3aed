//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use chrono::Local;
use layersync_core::{LayerInfo, LayerStats, LocalFeature, SyncNotice};
use serde_json::json;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// A remote layer and whether the local feature file has it
#[derive(Debug, Clone)]
pub struct LayerListing {
    pub info: LayerInfo,
    pub local: bool,
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print layers, with sub-layers indented under their parent
    pub fn print_layers(&self, layers: &[LayerListing]) {
        match self.format {
            OutputFormat::Human => {
                if layers.is_empty() {
                    println!("No layers found.");
                    return;
                }
                for listing in layers.iter().filter(|l| !l.info.is_sub_layer()) {
                    println!("{}", layer_line(listing, ""));
                    for sub in layers
                        .iter()
                        .filter(|l| l.info.parent_id == Some(listing.info.id))
                    {
                        println!("{}", layer_line(sub, "  └ "));
                    }
                }
                // Sub-layers whose parent is not listed
                for orphan in layers.iter().filter(|l| {
                    l.info
                        .parent_id
                        .is_some_and(|p| !layers.iter().any(|other| other.info.id == p))
                }) {
                    println!("{}", layer_line(orphan, "  ? "));
                }
                println!("\n{} layer(s)", layers.len());
            }
            OutputFormat::Json => {
                let rows: Vec<_> = layers
                    .iter()
                    .map(|l| json!({"layer": l.info, "local": l.local}))
                    .collect();
                println!("{}", json!(rows));
            }
            OutputFormat::Quiet => {
                for listing in layers {
                    println!("{}", listing.info.id);
                }
            }
        }
    }

    /// Print the points of a layer
    pub fn print_points(&self, features: &[LocalFeature]) {
        match self.format {
            OutputFormat::Human => {
                if features.is_empty() {
                    println!("No points found.");
                    return;
                }
                for feature in features {
                    let id = feature
                        .local_id
                        .map(|id| id.0.to_string())
                        .unwrap_or_default();
                    let synced = feature
                        .remote_id
                        .map(|id| id.to_string()[..8].to_string())
                        .unwrap_or_else(|| "unsynced".to_string());
                    let attrs: Vec<String> = feature
                        .attributes
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect();
                    println!(
                        "{:>6} | {:<8} | {:.3}, {:.3}, {:.3} | {}",
                        id,
                        synced,
                        feature.geometry.x,
                        feature.geometry.y,
                        feature.geometry.z,
                        truncate(&attrs.join(" "), 50)
                    );
                }
                println!("\n{} point(s)", features.len());
            }
            OutputFormat::Json => {
                println!("{}", json!(features));
            }
            OutputFormat::Quiet => {
                for feature in features {
                    if let Some(id) = feature.local_id {
                        println!("{}", id.0);
                    }
                }
            }
        }
    }

    /// Print a layer's synchronization snapshot
    pub fn print_stats(&self, stats: &LayerStats) {
        match self.format {
            OutputFormat::Human => {
                println!("Layer:          {} ({})", stats.name, stats.layer);
                println!("Bound features: {}", stats.bound);
                println!("Pending echoes: {}", stats.pending_echoes);
                println!("Pending edits:  {}", stats.pending_batch);
                println!("Batch:          {}", stats.batch_state);
            }
            OutputFormat::Json => {
                println!("{}", json!(stats));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a notice emitted while synchronizing
    ///
    /// Notices go to stderr in human mode so piped output stays clean.
    pub fn notice(&self, notice: &SyncNotice) {
        match self.format {
            OutputFormat::Human => {
                eprintln!("[{}] {}", Local::now().format("%H:%M:%S"), notice)
            }
            OutputFormat::Json => println!("{}", json!({"notice": notice})),
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!("{}", json!({"status": "success", "message": message}));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn layer_line(listing: &LayerListing, prefix: &str) -> String {
    let info = &listing.info;
    let attrs: Vec<String> = info
        .attributes
        .iter()
        .map(|a| format!("{}:{}", a.name, a.kind))
        .collect();
    format!(
        "{}{} | {} | EPSG:{} | {}{}",
        prefix,
        &info.id.to_string()[..8],
        truncate(&info.name, 30),
        info.srid,
        truncate(&attrs.join(", "), 40),
        if listing.local { " [local]" } else { "" }
    )
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
