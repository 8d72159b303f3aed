//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use layersync_core::Config;

use crate::output::{Output, OutputFormat};

const KEYS: &str = "data_dir, target, hosted_url, rest_url, realtime_url, api_key, \
                    access_token, batch_window_ms, echo_ttl_ms, request_timeout_secs, \
                    channel_capacity, poll_interval_ms, log_file, verbose";

fn or_unset(value: Option<&str>) -> &str {
    value.unwrap_or("(not set)")
}

/// Mask a secret, keeping a short prefix for recognition
fn mask(secret: &str) -> String {
    if secret.is_empty() {
        "(not set)".to_string()
    } else {
        let prefix: String = secret.chars().take(6).collect();
        format!("{}…", prefix)
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            let mut value = serde_json::to_value(&config)?;
            // Secrets are never printed
            value["api_key"] = serde_json::json!(mask(&config.api_key));
            if let Some(token) = &config.access_token {
                value["access_token"] = serde_json::json!(mask(token));
            }
            println!("{}", value);
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:             {}", config.data_dir.display());
            println!("  target:               {}", config.target);
            println!("  hosted_url:           {}", or_unset(config.hosted_url.as_deref()));
            println!(
                "  rest endpoint:        {}",
                config
                    .rest_endpoint()
                    .unwrap_or_else(|e| format!("(invalid: {})", e))
            );
            println!(
                "  realtime endpoint:    {}",
                config
                    .realtime_endpoint()
                    .unwrap_or_else(|e| format!("(invalid: {})", e))
            );
            println!("  api_key:              {}", mask(&config.api_key));
            println!(
                "  access_token:         {}",
                config
                    .access_token
                    .as_deref()
                    .map(mask)
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!("  batch_window_ms:      {}", config.batch_window_ms);
            println!("  echo_ttl_ms:          {}", config.echo_ttl_ms);
            println!("  request_timeout_secs: {}", config.request_timeout_secs);
            println!("  channel_capacity:     {}", config.channel_capacity);
            println!("  poll_interval_ms:     {}", config.poll_interval_ms);
            println!(
                "  log_file:             {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!("  verbose:              {}", config.verbose);
            println!();
            println!("Config file:  {}", effective_path.display());
            println!("Feature file: {}", config.features_path().display());
        }
    }

    Ok(())
}

/// Print the path of the config file in use
pub fn path(config_path: Option<&PathBuf>) -> Result<()> {
    let path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    println!("{}", path.display());
    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match key.as_str() {
        "data_dir" => config.data_dir = value.clone().into(),
        "target" => config.target = value.parse()?,
        "hosted_url" => config.hosted_url = optional(&value),
        "rest_url" => config.rest_url = optional(&value),
        "realtime_url" => config.realtime_url = optional(&value),
        "api_key" => config.api_key = value.clone(),
        "access_token" => config.access_token = optional(&value),
        "batch_window_ms" => {
            config.batch_window_ms = value
                .parse()
                .context("Invalid value for batch_window_ms. Use milliseconds.")?;
        }
        "echo_ttl_ms" => {
            config.echo_ttl_ms = value
                .parse()
                .context("Invalid value for echo_ttl_ms. Use milliseconds.")?;
        }
        "request_timeout_secs" => {
            config.request_timeout_secs = value
                .parse()
                .context("Invalid value for request_timeout_secs. Use seconds.")?;
        }
        "channel_capacity" => {
            config.channel_capacity = value
                .parse()
                .context("Invalid value for channel_capacity. Use a positive number.")?;
        }
        "poll_interval_ms" => {
            config.poll_interval_ms = value
                .parse()
                .context("Invalid value for poll_interval_ms. Use milliseconds.")?;
        }
        "log_file" => config.log_file = optional(&value).map(PathBuf::from),
        "verbose" => {
            config.verbose = value
                .parse()
                .context("Invalid value for verbose. Use 'true' or 'false'.")?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                KEYS
            );
        }
    }

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "api_key" || key == "access_token" {
        mask(&value)
    } else {
        value
    };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mask() {
        assert_eq!(mask(""), "(not set)");
        assert_eq!(mask("eyJhbGciOiJIUzI1NiJ9"), "eyJhbG…");
        assert_eq!(mask("abc"), "abc…");
    }

    #[test]
    fn test_set_writes_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        std::fs::write(
            &path,
            format!("data_dir = '{}'\n", dir.path().join("data").display()),
        )
        .unwrap();

        set("batch_window_ms".to_string(), "500".to_string(), Some(&path), &output).unwrap();
        set("hosted_url".to_string(), "none".to_string(), Some(&path), &output).unwrap();

        let saved = Config::load_from_path(&path).unwrap();
        assert_eq!(saved.batch_window_ms, 500);
        assert!(saved.hosted_url.is_none());

        assert!(set("batch_window_ms".to_string(), "soon".to_string(), Some(&path), &output).is_err());
        assert!(set("colour".to_string(), "blue".to_string(), Some(&path), &output).is_err());
    }
}
