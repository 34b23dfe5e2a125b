//! Status command handler

use anyhow::Result;

use finishline_core::models::format_token;
use finishline_core::Config;

use crate::output::{Output, OutputFormat};
use crate::session::Session;

/// Show device, event and connection status
pub async fn show(config: Config, output: &Output) -> Result<()> {
    let mut session = Session::open(config)?;
    let online = session.connect(output).await?;

    let state = session.engine.state().await;
    let devices = match session.engine.devices().await {
        Ok(devices) => devices,
        Err(e) => {
            output.warn(&format!("Could not list devices: {}", e));
            Vec::new()
        }
    };
    let highest_stored = session.engine.highest_stored_token().await.unwrap_or(0);
    let session_identity = session.engine.session().clone();
    let connection_id = session.engine.connection_id();
    let config = session.config.clone();
    session.close().await?;

    let replica = &state.replica;
    match output.format {
        OutputFormat::Json => output.json(&serde_json::json!({
            "device_id": session_identity.device_id,
            "session_id": session_identity.session_id,
            "relay_url": config.relay_url,
            "online": online,
            "connection_id": connection_id,
            "event": replica,
            "assignments": state.register.len(),
            "highest_stored_token": highest_stored,
            "devices": devices.len(),
        })),
        OutputFormat::Quiet => println!("{}", if online { "online" } else { "offline" }),
        OutputFormat::Human => {
            println!("finishline Status");
            println!("=================");
            println!();
            println!("Device:");
            println!("  ID:      {}", session_identity.device_id);
            println!("  Session: {}", session_identity.session_id);
            println!();
            println!("Relay:");
            println!(
                "  Server: {}",
                config.relay_url.as_deref().unwrap_or("(not set)")
            );
            println!("  Status: {}", if online { "online" } else { "offline" });
            if let Some(id) = connection_id {
                println!("  Connection: {}", id);
            }
            println!();
            println!("Event:");
            println!("  ID:          {}", replica.event_id);
            println!("  Name:        {}", replica.name);
            println!("  Next token:  {}", format_token(replica.next_token));
            println!("  Assignments: {}", state.register.len());
            if highest_stored > 0 {
                println!("  Stored up to: {}", format_token(highest_stored));
            }
            println!("  Devices:     {}", devices.len());
            println!();
            println!("Storage:");
            println!("  History: {}", config.history_store_path().display());
        }
    }

    Ok(())
}
