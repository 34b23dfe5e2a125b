//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use finishline_core::Config;

use crate::output::{Output, OutputFormat};

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(not set)".to_string())
}

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "relay_url": config.relay_url,
                    "store_path": config.history_store_path(),
                    "share_base_url": config.share_base_url,
                    "device_name": config.device_name,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:       {}", config.data_dir.display());
            println!(
                "  relay_url:      {}",
                config.relay_url.as_deref().unwrap_or("(not set, offline)")
            );
            println!("  store_path:     {}", config.history_store_path().display());
            println!(
                "  share_base_url: {}",
                config.share_base_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  device_name:    {}",
                config.device_name.as_deref().unwrap_or("(not set)")
            );
            println!("  log_file:       {}", display_path(&config.log_file));
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// `None` for an empty value or "none"
fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Apply `key = value` to a configuration
fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => {
            if value.is_empty() {
                bail!("data_dir cannot be empty");
            }
            config.data_dir = value.into();
        }
        "relay_url" => {
            if let Some(url) = optional(value) {
                if !url.starts_with("ws://") && !url.starts_with("wss://") {
                    bail!("relay_url must start with ws:// or wss://");
                }
            }
            config.relay_url = optional(value);
        }
        "store_path" => config.store_path = optional(value).map(PathBuf::from),
        "share_base_url" => config.share_base_url = optional(value),
        "device_name" => config.device_name = optional(value),
        "log_file" => config.log_file = optional(value).map(PathBuf::from),
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_dir, relay_url, store_path, share_base_url, device_name, log_file",
                key
            );
        }
    }
    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    apply(&mut config, &key, &value)?;
    config.save().context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_known_keys() {
        let mut config = Config::default();
        apply(&mut config, "relay_url", "wss://relay.example.org/hub").unwrap();
        apply(&mut config, "device_name", "Funnel 2").unwrap();
        apply(&mut config, "store_path", "/tmp/history.db").unwrap();

        assert_eq!(config.relay_url.as_deref(), Some("wss://relay.example.org/hub"));
        assert_eq!(config.device_name.as_deref(), Some("Funnel 2"));
        assert_eq!(config.history_store_path(), PathBuf::from("/tmp/history.db"));

        apply(&mut config, "relay_url", "none").unwrap();
        assert!(config.relay_url.is_none());
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(apply(&mut config, "relay_url", "http://relay").is_err());
        assert!(apply(&mut config, "data_dir", "").is_err());
        let err = apply(&mut config, "sync_url", "x").unwrap_err();
        assert!(err.to_string().contains("Valid keys"));
    }
}
