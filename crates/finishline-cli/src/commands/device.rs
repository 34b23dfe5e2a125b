//! Device command handlers

use anyhow::{Context, Result};

use finishline_core::{Config, Identity, SnapshotStore};

use crate::output::{Output, OutputFormat};
use crate::session::{load_current_state, Session};

/// First-time setup: device id and a first event
pub async fn init(config: Config, output: &Output) -> Result<()> {
    let identity = Identity::with_config(config.clone());
    let result = identity
        .initialize()
        .context("Failed to initialize device identity")?;

    let snapshots = SnapshotStore::new(config.snapshot_dir());
    let has_event = snapshots
        .current_event()
        .context("Failed to read current event")?
        .is_some();
    let state = load_current_state(&snapshots)?;
    if !has_event {
        snapshots
            .save(&mut state.to_snapshot())
            .context("Failed to save event snapshot")?;
        snapshots
            .set_current_event(&state.replica.event_id)
            .context("Failed to record current event")?;
    }

    match output.format {
        OutputFormat::Json => output.json(&serde_json::json!({
            "device_id": result.device_id,
            "is_new": result.is_new,
            "event_id": state.replica.event_id,
        })),
        OutputFormat::Quiet => println!("{}", result.device_id),
        OutputFormat::Human => {
            println!();
            if result.is_new {
                println!("Created device identity.");
            } else {
                println!("Already initialized.");
            }
            println!();
            println!("Device ID: {}", result.device_id);
            println!("Event:     {}", state.replica.event_id);
            println!();
            println!("Data is stored in: {}", identity.data_dir().display());
            if config.relay_url.is_none() {
                println!();
                println!("No relay configured. Other devices will see your work once you set one:");
                println!("  finishline config set relay_url wss://your-relay/hub");
            }
        }
    }

    Ok(())
}

/// Show the device id
pub fn show(config: Config, output: &Output) -> Result<()> {
    let identity = Identity::with_config(config.clone());
    let Some(device_id) = identity.load_device_id()? else {
        anyhow::bail!("Not initialized. Run `finishline init` first.");
    };

    match output.format {
        OutputFormat::Json => output.json(&serde_json::json!({
            "device_id": device_id,
            "device_name": config.device_name,
        })),
        OutputFormat::Quiet => println!("{}", device_id),
        OutputFormat::Human => {
            println!("Device ID:   {}", device_id);
            println!(
                "Device name: {}",
                config.device_name.as_deref().unwrap_or("(not set)")
            );
        }
    }

    Ok(())
}

/// Name this device, locally and in the history store
pub async fn name(mut config: Config, name: String, output: &Output) -> Result<()> {
    let name = name.trim().to_string();
    config.device_name = Some(name.clone());
    config.save().context("Failed to save configuration")?;

    let session = Session::open(config)?;
    session.engine.set_device_name(&name).await?;
    session.close().await?;

    output.success(&format!("Device name set to {}", name));
    Ok(())
}

/// Devices the history store has seen in the current event
pub async fn list(config: Config, output: &Output) -> Result<()> {
    let session = Session::open(config)?;
    let devices = session.engine.devices().await?;
    output.print_devices(&devices);
    Ok(())
}
