//! Watch command handler

use anyhow::{bail, Result};

use finishline_core::models::format_token;
use finishline_core::sync::EngineEvent;
use finishline_core::Config;

use crate::output::{Output, OutputFormat};
use crate::session::Session;

/// Stay connected, print changes, and save after each one
pub async fn run(config: Config, output: &Output) -> Result<()> {
    let mut session = Session::open(config)?;
    if !session.connect(output).await? {
        bail!("Watching needs a reachable relay.");
    }

    let Some(mut events) = session.engine.take_events() else {
        bail!("Event stream already taken");
    };
    let mut status = session.engine.subscribe_status();
    output.message("Watching for changes, press Ctrl-C to stop.");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                output.message(&format!("Relay {:?}", current).to_lowercase());
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(output, &event);
                if let Err(e) = session.save().await {
                    output.warn(&format!("Failed to save snapshot: {:#}", e));
                }
            }
        }
    }

    session.close().await
}

fn describe(event: &EngineEvent) -> String {
    match event {
        EngineEvent::ReplicaChanged(replica) => format!(
            "{}: next token {}",
            replica.name,
            format_token(replica.next_token)
        ),
        EngineEvent::AssignmentsChanged { tokens } => {
            let labels: Vec<String> = tokens.iter().map(|t| format_token(*t)).collect();
            format!("Assignments updated: {}", labels.join(", "))
        }
        EngineEvent::TokenConflict { token, rival, won } => {
            if *won {
                format!("{} also claimed by {}, this device keeps it", format_token(*token), rival)
            } else {
                format!("{} taken by {}, claim a new token", format_token(*token), rival)
            }
        }
        EngineEvent::EventReset { origin_id } => format!("Event reset by {}", origin_id),
        EngineEvent::PeerJoined { origin_id } => format!("Device {} joined", origin_id),
        EngineEvent::HistoryMerged { received, changed } => {
            format!("History pulled: {} received, {} changed", received, changed)
        }
        EngineEvent::StoreFailed { operation, message } => {
            format!("History store failed to {}: {}", operation, message)
        }
    }
}

fn print_event(output: &Output, event: &EngineEvent) {
    match output.format {
        OutputFormat::Quiet => {}
        OutputFormat::Json => output.json(&serde_json::json!({ "event": describe(event) })),
        OutputFormat::Human => println!("{}", describe(event)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_conflicts() {
        let lost = EngineEvent::TokenConflict {
            token: 7,
            rival: "a1b2c3".to_string(),
            won: false,
        };
        assert_eq!(describe(&lost), "P0007 taken by a1b2c3, claim a new token");

        let changed = EngineEvent::AssignmentsChanged { tokens: vec![1, 12] };
        assert_eq!(describe(&changed), "Assignments updated: P0001, P0012");
    }
}
