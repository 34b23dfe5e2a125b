//! Token command handlers

use anyhow::Result;

use finishline_core::models::{format_token, parse_token_label};
use finishline_core::{Config, EntryMethod, SyncError};

use super::confirm;
use crate::output::Output;
use crate::session::Session;

/// Take the next token
pub async fn claim(config: Config, output: &Output) -> Result<()> {
    let mut session = Session::open(config)?;
    session.connect(output).await?;

    let token = session.engine.claim_token().await?;
    session.close().await?;

    if output.is_json() {
        output.json(&serde_json::json!({ "token": token, "label": format_token(token) }));
    } else {
        println!("{}", format_token(token));
    }
    Ok(())
}

/// Arguments of `finishline assign`
pub struct AssignRequest {
    pub token: String,
    pub barcode: String,
    pub name: Option<String>,
    pub method: Option<EntryMethod>,
    pub yes: bool,
}

/// Entry method used when none was given
fn default_method(barcode: &str, preferred: EntryMethod) -> EntryMethod {
    if barcode.trim().is_empty() {
        EntryMethod::Qr
    } else if preferred == EntryMethod::Qr {
        EntryMethod::Manual
    } else {
        preferred
    }
}

/// Record which athlete received a token
pub async fn assign(config: Config, request: AssignRequest, output: &Output) -> Result<()> {
    let token = parse_token_label(&request.token)?;

    let mut session = Session::open(config)?;
    let check = session
        .engine
        .check_assignment(i64::from(token), &request.barcode)
        .await?;

    if let Some(duplicate) = &check.duplicate {
        confirm(
            output,
            &format!(
                "{} already has {}. Give them {} as well?",
                check.athlete_barcode,
                duplicate.label(),
                format_token(token)
            ),
            request.yes,
        )?;
    }
    if let Some(existing) = &check.existing {
        if existing.athlete_barcode != check.athlete_barcode {
            confirm(
                output,
                &format!(
                    "{} is assigned to {}. Overwrite?",
                    existing.label(),
                    if existing.athlete_barcode.is_empty() {
                        "(no barcode)"
                    } else {
                        existing.athlete_barcode.as_str()
                    }
                ),
                request.yes,
            )?;
        }
    }

    let preferred = session.engine.state().await.preferred_method;
    let method = request
        .method
        .unwrap_or_else(|| default_method(&request.barcode, preferred));

    session.connect(output).await?;
    let result = session
        .engine
        .save_assignment(
            token,
            &request.barcode,
            request.name.as_deref().unwrap_or(""),
            method,
        )
        .await;

    let assignment = match result {
        Ok(assignment) => Some(assignment),
        Err(SyncError::Store(e)) => {
            output.warn(&format!(
                "Saved on this device and sent to peers, but the history store failed: {}",
                e
            ));
            if let Some(hint) = e.recovery_suggestion() {
                output.warn(hint);
            }
            None
        }
        Err(e) => return Err(e.into()),
    };
    session.close().await?;

    match assignment {
        Some(assignment) => output.print_assignment(&assignment),
        None => output.success(&format!("Assigned {}", format_token(token))),
    }
    Ok(())
}

/// Remove a token's assignment
pub async fn clear(config: Config, token: String, yes: bool, output: &Output) -> Result<()> {
    let token = parse_token_label(&token)?;
    confirm(
        output,
        &format!("Remove the assignment of {}?", format_token(token)),
        yes,
    )?;

    let session = Session::open(config)?;
    let removed = session.engine.clear_token(i64::from(token)).await;
    session.close().await?;

    match removed? {
        Some(_) => output.success(&format!("Cleared {}", format_token(token))),
        None => output.message(&format!("{} had no assignment", format_token(token))),
    }
    Ok(())
}
