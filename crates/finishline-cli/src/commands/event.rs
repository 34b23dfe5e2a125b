//! Event command handlers

use anyhow::{bail, Context, Result};

use finishline_core::models::{event_share_link, format_token, new_event_id, parse_event_link};
use finishline_core::{Config, DeviceState, SnapshotStore};

use super::confirm;
use crate::output::Output;
use crate::session::{load_state, Session};

/// Start a new event and switch to it
pub async fn new(
    config: Config,
    name: Option<String>,
    next: Option<i64>,
    output: &Output,
) -> Result<()> {
    let mut session = Session::open(config)?;
    session.connect(output).await?;

    let state = DeviceState::new(new_event_id());
    session.engine.switch_event(state).await?;
    if name.is_some() || next.is_some() {
        session
            .engine
            .set_event_details(name.as_deref(), next)
            .await?;
    }

    let replica = session.engine.replica().await;
    session.close().await?;

    output.print_replica(&replica, 0);
    Ok(())
}

/// Join an event by id or share link
pub async fn join(config: Config, event: String, output: &Output) -> Result<()> {
    let event_id = parse_event_link(&event)?;

    let mut session = Session::open(config)?;
    let state = load_state(session.snapshots(), &event_id)?;
    session.engine.switch_event(state).await?;
    let online = session.connect(output).await?;

    if online {
        output.message("Fetching event history...");
        if let Err(e) = session.engine.request_history().await {
            output.warn(&format!("History store unavailable: {}", e));
        }
        // Give peers a moment to answer with event details and history
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    }

    let state = session.engine.state().await;
    session.close().await?;

    output.print_replica(&state.replica, state.register.len());
    Ok(())
}

/// Show the current event
pub async fn show(config: Config, output: &Output) -> Result<()> {
    let session = Session::open(config)?;
    let state = session.engine.state().await;
    output.print_replica(&state.replica, state.register.len());
    Ok(())
}

/// Print the link other devices use to join
pub async fn link(config: Config, output: &Output) -> Result<()> {
    let Some(base_url) = config.share_base_url.clone() else {
        bail!(
            "Share URL not configured. Set it with:\n  \
             finishline config set share_base_url https://your-site/join"
        );
    };

    let session = Session::open(config)?;
    let event_id = session.engine.event_id().await;
    let link = event_share_link(&base_url, &event_id);

    if output.is_json() {
        output.json(&serde_json::json!({ "event_id": event_id, "link": link }));
    } else {
        println!("{}", link);
    }
    Ok(())
}

/// List events stored on this device
pub fn list(config: Config, output: &Output) -> Result<()> {
    let snapshots = SnapshotStore::new(config.snapshot_dir());
    let current = snapshots.current_event()?;
    let events = snapshots.list_events().context("Failed to list events")?;

    if output.is_json() {
        output.json(&serde_json::json!({ "current": current, "events": events }));
        return Ok(());
    }
    if events.is_empty() && !output.is_quiet() {
        println!("No events on this device.");
    }
    for id in &events {
        let marker = if current.as_deref() == Some(id.as_str()) {
            "*"
        } else {
            " "
        };
        if output.is_quiet() {
            println!("{}", id);
        } else {
            println!("{} {}", marker, id);
        }
    }
    Ok(())
}

/// Rename the current event
pub async fn rename(config: Config, name: String, output: &Output) -> Result<()> {
    let mut session = Session::open(config)?;
    session.connect(output).await?;

    let replica = session.engine.set_event_details(Some(&name), None).await?;
    session.close().await?;

    output.success(&format!("Event renamed to {}", replica.name));
    Ok(())
}

/// Move the shared next token
pub async fn set_next(config: Config, next: i64, yes: bool, output: &Output) -> Result<()> {
    let mut session = Session::open(config)?;
    let current = session.engine.replica().await;
    let question = format!(
        "Change the next token for every device from {} to {}?",
        format_token(current.next_token),
        next
    );
    confirm(output, &question, yes)?;

    session.connect(output).await?;
    let replica = session.engine.set_event_details(None, Some(next)).await?;
    session.close().await?;

    output.success(&format!("Next token is {}", format_token(replica.next_token)));
    Ok(())
}

/// Start the token sequence over on every device
pub async fn reset(config: Config, yes: bool, output: &Output) -> Result<()> {
    confirm(
        output,
        "Restart token numbering at P0001 on every device? Assignments are kept.",
        yes,
    )?;

    let mut session = Session::open(config)?;
    session.connect(output).await?;
    session.engine.reset_event().await?;
    session.close().await?;

    output.success("Event reset, next token is P0001");
    Ok(())
}
